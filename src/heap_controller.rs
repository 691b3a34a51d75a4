use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::options::Options;
use crate::util::{bytes_to_pages, pages_to_bytes};

/// How far a page reservation may grow the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReserveCap {
    /// Up to the current collection trigger.
    Limit,
    /// Up to the maximum heap size.
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapBounds {
    pub min: usize,
    pub max: usize,
}

/// Page accounting and the collection trigger.
///
/// Bounds only change under `bounds`, and reservations are checked against them under the same
/// lock. Releases and reads of the trigger limit stay lock free.
pub struct HeapController {
    bounds: Mutex<HeapBounds>,
    limit: AtomicUsize,
    reserved_pages: AtomicUsize,
    reservation: usize,
    growth_factor: f64,
    stress_factor: usize,
    allocated_since_gc: AtomicUsize,
}

impl HeapController {
    pub fn new(options: &Options) -> Self {
        let (min, max) = options.heap_bounds();
        Self {
            bounds: Mutex::new(HeapBounds { min, max }),
            limit: AtomicUsize::new(min),
            reserved_pages: AtomicUsize::new(0),
            reservation: options.heap_reservation,
            growth_factor: options.heap_growth_factor,
            stress_factor: options.stress_factor,
            allocated_since_gc: AtomicUsize::new(0),
        }
    }

    pub fn bounds(&self) -> HeapBounds {
        *self.bounds.lock()
    }

    /// Replace the heap bounds. Returns false and changes nothing when `min > max`, a bound is
    /// zero, `max` does not fit the reservation or the heap already uses more than `max`.
    pub fn set_heap_size(&self, min: usize, max: usize) -> bool {
        if min == 0 || min > max || max > self.reservation {
            return false;
        }
        let mut bounds = self.bounds.lock();
        if max < self.used_bytes() {
            return false;
        }
        *bounds = HeapBounds { min, max };
        let limit = if min == max {
            max
        } else {
            self.limit.load(Ordering::Relaxed).clamp(min, max)
        };
        self.limit.store(limit, Ordering::Release);
        log::debug!("heap size set to {}..{} (trigger at {})", min, max, limit);
        true
    }

    pub fn used_bytes(&self) -> usize {
        pages_to_bytes(self.reserved_pages.load(Ordering::Relaxed))
    }

    pub fn total_bytes(&self) -> usize {
        self.bounds.lock().max
    }

    pub fn free_bytes(&self) -> usize {
        self.total_bytes().saturating_sub(self.used_bytes())
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn reservation(&self) -> usize {
        self.reservation
    }

    /// Account for `pages` more pages if that stays within `cap`. Holds `bounds` so that a
    /// concurrent [`HeapController::set_heap_size`] sees either the reservation or the new cap.
    pub fn try_reserve_pages(&self, pages: usize, cap: ReserveCap) -> bool {
        let bounds = self.bounds.lock();
        let cap = bytes_to_pages(match cap {
            ReserveCap::Limit => self.limit.load(Ordering::Acquire).min(bounds.max),
            ReserveCap::Max => bounds.max,
        });
        let mut old = self.reserved_pages.load(Ordering::Relaxed);
        loop {
            let new = old + pages;
            if new > cap {
                return false;
            }
            match self.reserved_pages.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(x) => old = x,
            }
        }
    }

    pub fn release_pages(&self, pages: usize) {
        let previous = self.reserved_pages.fetch_sub(pages, Ordering::AcqRel);
        debug_assert!(previous >= pages, "released more pages than reserved");
    }

    /// Count bytes handed out since the last cycle. Returns true once the stress factor is hit.
    pub fn note_allocation(&self, bytes: usize) -> bool {
        if self.stress_factor == usize::MAX {
            return false;
        }
        self.allocated_since_gc.fetch_add(bytes, Ordering::Relaxed) + bytes >= self.stress_factor
    }

    /// Recompute the trigger from what survived the cycle.
    pub fn update_after_collection(&self) {
        let bounds = self.bounds.lock();
        let used = self.used_bytes();
        let limit = if bounds.min == bounds.max {
            bounds.max
        } else {
            ((used as f64 * self.growth_factor).ceil() as usize).clamp(bounds.min, bounds.max)
        };
        self.limit.store(limit, Ordering::Release);
        self.allocated_since_gc.store(0, Ordering::Relaxed);
        log::trace!("used {} bytes after collection, next trigger at {}", used, limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(trigger: &str) -> HeapController {
        let mut options = Options::default();
        options
            .process_bulk(&format!("heap_reservation=64M gc_trigger={}", trigger))
            .unwrap();
        HeapController::new(&options)
    }

    #[test]
    fn set_heap_size_rejects_inverted_bounds() {
        let controller = controller("DynamicHeapSize:4M,32M");
        assert!(!controller.set_heap_size(16 << 20, 8 << 20));
        assert_eq!(controller.bounds(), HeapBounds { min: 4 << 20, max: 32 << 20 });
        assert!(!controller.set_heap_size(0, 8 << 20));
        assert!(!controller.set_heap_size(4 << 20, 128 << 20));
        assert!(controller.set_heap_size(8 << 20, 16 << 20));
        assert_eq!(controller.total_bytes(), 16 << 20);
        assert_eq!(controller.limit(), 8 << 20);
    }

    #[test]
    fn max_below_usage_is_rejected() {
        let controller = controller("FixedHeapSize:8M");
        assert!(controller.try_reserve_pages(1024, ReserveCap::Max));
        assert!(!controller.set_heap_size(1 << 20, 2 << 20));
        assert_eq!(controller.used_bytes(), 4 << 20);
        assert_eq!(controller.free_bytes(), 4 << 20);
    }

    #[test]
    fn reservations_respect_caps() {
        let controller = controller("DynamicHeapSize:1M,4M");
        assert!(controller.try_reserve_pages(256, ReserveCap::Limit));
        assert!(!controller.try_reserve_pages(1, ReserveCap::Limit));
        assert!(controller.try_reserve_pages(768, ReserveCap::Max));
        assert!(!controller.try_reserve_pages(1, ReserveCap::Max));
        controller.release_pages(512);
        controller.update_after_collection();
        // 2M live grown by 1.5 stays below the 4M maximum.
        assert_eq!(controller.limit(), 3 << 20);
    }

    #[test]
    fn shrinking_races_with_reservations() {
        for _ in 0..50 {
            let controller = std::sync::Arc::new(controller("DynamicHeapSize:1M,8M"));
            let reservers: Vec<_> = (0..3)
                .map(|_| {
                    let controller = controller.clone();
                    std::thread::spawn(move || {
                        while controller.try_reserve_pages(1, ReserveCap::Max) {}
                    })
                })
                .collect();
            let shrunk = controller.set_heap_size(1 << 20, 4 << 20);
            for reserver in reservers {
                reserver.join().unwrap();
            }
            let max = controller.bounds().max;
            assert_eq!(max, if shrunk { 4 << 20 } else { 8 << 20 });
            assert!(controller.used_bytes() <= max);
        }
    }
}
