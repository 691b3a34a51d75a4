use std::time::Duration;

/// Counters accumulated over collections. Reset by `harness_begin`.
#[derive(Clone, Debug, Default)]
pub struct HeapStatistics {
    pub collections: usize,
    pub nursery_collections: usize,
    pub emergency_collections: usize,
    pub total_pause: Duration,
    pub max_pause: Duration,
    /// Bytes flushed from mutators since the last reset.
    pub allocated_bytes: usize,
    pub freed_bytes: usize,
    /// Bytes in use after the last cycle.
    pub live_bytes: usize,
    pub heap_limit: usize,
}

impl HeapStatistics {
    pub(crate) fn record_pause(&mut self, pause: Duration) {
        self.collections += 1;
        self.total_pause += pause;
        self.max_pause = self.max_pause.max(pause);
    }
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Collections: {} ({} nursery, {} emergency)",
            self.collections, self.nursery_collections, self.emergency_collections
        )?;
        writeln!(
            f,
            "  Pause time: {:.2}ms total, {:.2}ms max",
            self.total_pause.as_secs_f64() * 1000.0,
            self.max_pause.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Memory allocated: {}",
            formatted_size(self.allocated_bytes)
        )?;
        writeln!(f, "  Memory freed: {}", formatted_size(self.freed_bytes))?;
        writeln!(
            f,
            "  Live after last collection: {}",
            formatted_size(self.live_bytes)
        )?;
        writeln!(f, "  Heap threshold: {}", formatted_size(self.heap_limit))?;
        Ok(())
    }
}
