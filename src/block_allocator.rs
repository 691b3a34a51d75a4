use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mmap::Mmap;
use crate::space::Region;
use crate::util::constants::BLOCK_SIZE;
use crate::util::Address;

/// Hands out `BLOCK_SIZE` aligned blocks from one region of the reservation.
pub struct BlockAllocator {
    region: Region,
    /// First block that was never handed out.
    data: AtomicUsize,
    free_blocks: Mutex<Vec<Address>>,
    mmap: Arc<Mmap>,
}

impl BlockAllocator {
    pub fn new(region: Region, mmap: Arc<Mmap>) -> Self {
        debug_assert!(region.start.is_aligned_to(BLOCK_SIZE));
        Self {
            region,
            data: AtomicUsize::new(region.start.as_usize()),
            free_blocks: Mutex::new(Vec::new()),
            mmap,
        }
    }

    /// Get a new block aligned to `BLOCK_SIZE`. Its memory reads as zero.
    pub fn get_block(&self) -> Option<Address> {
        if let Some(block) = self.free_blocks.lock().pop() {
            self.mmap.commit(block, BLOCK_SIZE);
            return Some(block);
        }
        self.build_block()
    }

    fn build_block(&self) -> Option<Address> {
        let mut old = self.data.load(Ordering::Relaxed);
        loop {
            let new = old + BLOCK_SIZE;
            if new > self.region.end.as_usize() {
                return None;
            }
            match self
                .data
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
        debug_assert!(old % BLOCK_SIZE == 0, "block is not aligned for block_size");
        let block = Address::from_usize(old);
        self.mmap.commit(block, BLOCK_SIZE);
        Some(block)
    }

    /// Return a collection of blocks.
    pub fn return_blocks(&self, blocks: impl IntoIterator<Item = Address>) {
        let mut free = self.free_blocks.lock();
        for block in blocks {
            self.mmap.dontneed(block, BLOCK_SIZE);
            free.push(block);
        }
    }

    /// End of the blocks handed out so far.
    pub fn high_water(&self) -> Address {
        Address::from_usize(self.data.load(Ordering::Acquire))
    }
}
