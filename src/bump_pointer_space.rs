use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap_controller::{HeapController, ReserveCap};
use crate::space::{Region, Space};
use crate::util::constants::BYTES_IN_PAGE;
use crate::util::{bytes_to_pages, Address};

/// Space for objects that are never reclaimed. Mutators bump-allocate out of chunks carved off
/// the front of the region; chunks are never handed back.
pub struct ImmortalSpace {
    region: Region,
    cursor: AtomicUsize,
    reserved_pages: AtomicUsize,
}

impl ImmortalSpace {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            cursor: AtomicUsize::new(region.start.as_usize()),
            reserved_pages: AtomicUsize::new(0),
        }
    }

    /// Carve a chunk of at least `bytes` off the region, accounting its pages against `cap`.
    pub fn acquire_chunk(
        &self,
        controller: &HeapController,
        bytes: usize,
        cap: ReserveCap,
    ) -> Option<Address> {
        let bytes = crate::util::align_up(bytes, BYTES_IN_PAGE);
        let pages = bytes_to_pages(bytes);
        if !controller.try_reserve_pages(pages, cap) {
            return None;
        }
        let mut old = self.cursor.load(Ordering::Relaxed);
        loop {
            let new = old + bytes;
            if new > self.region.end.as_usize() {
                controller.release_pages(pages);
                log::debug!("immortal space exhausted");
                return None;
            }
            match self
                .cursor
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
        self.reserved_pages.fetch_add(pages, Ordering::Relaxed);
        Some(Address::from_usize(old))
    }
}

impl Space for ImmortalSpace {
    fn name(&self) -> &'static str {
        "immortal"
    }

    fn region(&self) -> Region {
        self.region
    }

    fn high_water(&self) -> Address {
        Address::from_usize(self.cursor.load(Ordering::Acquire))
    }

    fn reserved_pages(&self) -> usize {
        self.reserved_pages.load(Ordering::Relaxed)
    }
}
