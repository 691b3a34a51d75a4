use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap_controller::{HeapController, ReserveCap};
use crate::mmap::Mmap;
use crate::segregated_space::SweepResult;
use crate::space::{Region, SideMetadata, Space};
use crate::util::constants::BYTES_IN_PAGE;
use crate::util::{bytes_to_pages, pages_to_bytes, Address};

/// Page run backing one large object.
#[derive(Copy, Clone, Debug)]
struct PageRun {
    start: Address,
    pages: usize,
}

struct LargeSpaceInner {
    cursor: Address,
    /// Free runs keyed by start address, coalesced with their neighbours.
    free: BTreeMap<Address, usize>,
    /// Live allocations keyed by object address.
    live: BTreeMap<Address, PageRun>,
}

/// Space for objects above the size class cutoff. Each object gets its own run of pages, first
/// fit out of released runs and otherwise bumped off the end of the region.
pub struct LargeObjectSpace {
    region: Region,
    mmap: Arc<Mmap>,
    inner: Mutex<LargeSpaceInner>,
    high_water: AtomicUsize,
    reserved_pages: AtomicUsize,
}

impl LargeObjectSpace {
    pub fn new(region: Region, mmap: Arc<Mmap>) -> Self {
        Self {
            region,
            mmap,
            inner: Mutex::new(LargeSpaceInner {
                cursor: region.start,
                free: BTreeMap::new(),
                live: BTreeMap::new(),
            }),
            high_water: AtomicUsize::new(region.start.as_usize()),
            reserved_pages: AtomicUsize::new(0),
        }
    }

    pub fn alloc(
        &self,
        controller: &HeapController,
        size: usize,
        align: usize,
        offset: usize,
        cap: ReserveCap,
    ) -> Option<Address> {
        // Page-aligned runs satisfy the request unless it asks for more.
        let padding = if align <= BYTES_IN_PAGE && offset % align == 0 {
            0
        } else {
            align
        };
        let pages = bytes_to_pages(size + padding);
        if !controller.try_reserve_pages(pages, cap) {
            return None;
        }
        let mut inner = self.inner.lock();
        let start = match Self::take_free_run(&mut inner, pages) {
            Some(start) => start,
            None => {
                let end = inner.cursor.add(pages_to_bytes(pages));
                if end > self.region.end {
                    drop(inner);
                    controller.release_pages(pages);
                    log::debug!("large object space exhausted");
                    return None;
                }
                let start = inner.cursor;
                inner.cursor = end;
                self.high_water.fetch_max(end.as_usize(), Ordering::AcqRel);
                start
            }
        };
        let object = start.add(offset).align_up(align).sub(offset);
        inner.live.insert(object, PageRun { start, pages });
        self.reserved_pages.fetch_add(pages, Ordering::Relaxed);
        Some(object)
    }

    fn take_free_run(inner: &mut LargeSpaceInner, pages: usize) -> Option<Address> {
        let (&start, &available) = inner.free.iter().find(|&(_, &n)| n >= pages)?;
        inner.free.remove(&start);
        if available > pages {
            inner
                .free
                .insert(start.add(pages_to_bytes(pages)), available - pages);
        }
        Some(start)
    }

    /// Give a run back, merging it with adjacent free runs. Runs touching the cursor shrink it.
    fn release_run(&self, inner: &mut LargeSpaceInner, run: PageRun) {
        self.mmap.dontneed(run.start, pages_to_bytes(run.pages));
        let mut start = run.start;
        let mut pages = run.pages;
        if let Some((&prev, &prev_pages)) = inner.free.range(..start).next_back() {
            if prev.add(pages_to_bytes(prev_pages)) == start {
                inner.free.remove(&prev);
                start = prev;
                pages += prev_pages;
            }
        }
        let end = start.add(pages_to_bytes(pages));
        if let Some(next_pages) = inner.free.remove(&end) {
            pages += next_pages;
        }
        if start.add(pages_to_bytes(pages)) == inner.cursor {
            inner.cursor = start;
        } else {
            inner.free.insert(start, pages);
        }
    }

    pub fn prepare(&self, metadata: &SideMetadata, full_heap: bool) {
        if full_heap {
            metadata.mark.clear_range(self.region.start, self.high_water());
        }
    }

    /// Release every large object whose mark bit is clear.
    pub fn sweep(&self, metadata: &SideMetadata, controller: &HeapController) -> SweepResult {
        let mut result = SweepResult::default();
        let mut inner = self.inner.lock();
        let dead: Vec<(Address, PageRun)> = inner
            .live
            .iter()
            .filter(|&(&object, _)| !metadata.mark.test(object))
            .map(|(&object, &run)| (object, run))
            .collect();
        for (object, run) in dead {
            inner.live.remove(&object);
            metadata.clear_object(object);
            result.freed_bytes += pages_to_bytes(run.pages);
            self.release_run(&mut inner, run);
            self.reserved_pages.fetch_sub(run.pages, Ordering::Relaxed);
            controller.release_pages(run.pages);
        }
        result.live_bytes = inner
            .live
            .values()
            .map(|run| pages_to_bytes(run.pages))
            .sum();
        result
    }

    pub fn live_objects(&self) -> usize {
        self.inner.lock().live.len()
    }
}

impl Space for LargeObjectSpace {
    fn name(&self) -> &'static str {
        "los"
    }

    fn region(&self) -> Region {
        self.region
    }

    fn high_water(&self) -> Address {
        Address::from_usize(self.high_water.load(Ordering::Acquire))
    }

    fn reserved_pages(&self) -> usize {
        self.reserved_pages.load(Ordering::Relaxed)
    }
}
