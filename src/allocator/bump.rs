use crate::heap::Heap;
use crate::heap_controller::ReserveCap;
use crate::util::constants::{BUMP_CHUNK_SIZE, BYTES_IN_PAGE};
use crate::util::{align_up, Address};

use super::align_allocation;

/// Thread local bump allocation buffer. Takes 32KB chunks from the immortal space, or a chunk
/// sized to the request when it does not fit in one.
pub struct BumpAllocator {
    cursor: Address,
    limit: Address,
}

impl BumpAllocator {
    pub fn new() -> Self {
        Self {
            cursor: Address::ZERO,
            limit: Address::ZERO,
        }
    }

    #[inline]
    pub fn alloc_fast(&mut self, size: usize, align: usize, offset: usize) -> Option<Address> {
        if self.cursor.is_zero() {
            return None;
        }
        let result = align_allocation(self.cursor, align, offset);
        let new_cursor = result.add(size);
        if new_cursor > self.limit {
            return None;
        }
        self.cursor = new_cursor;
        Some(result)
    }

    /// Take a fresh chunk and allocate from it.
    pub fn refill(
        &mut self,
        heap: &Heap,
        size: usize,
        align: usize,
        offset: usize,
        cap: ReserveCap,
    ) -> Option<Address> {
        let bytes = BUMP_CHUNK_SIZE.max(align_up(size + align + offset, BYTES_IN_PAGE));
        let chunk = heap.immortal.acquire_chunk(&heap.controller, bytes, cap)?;
        self.cursor = chunk;
        self.limit = chunk.add(bytes);
        self.alloc_fast(size, align, offset)
    }

    pub fn reset(&mut self) {
        self.cursor = Address::ZERO;
        self.limit = Address::ZERO;
    }
}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}
