use crate::heap::Heap;
use crate::heap_controller::ReserveCap;
use crate::util::Address;

/// Thread local view of a mark-sweep space: one free list per size class, each taken from a
/// single block. Popping a cell needs no synchronisation.
pub struct FreeListAllocator {
    space: u8,
    heads: Vec<Address>,
}

impl FreeListAllocator {
    pub fn new(space: u8, classes: usize) -> Self {
        Self {
            space,
            heads: vec![Address::ZERO; classes],
        }
    }

    pub fn space(&self) -> u8 {
        self.space
    }

    /// Pop a cell of `class`. The cell is zeroed before it is returned.
    #[inline]
    pub fn alloc_fast(&mut self, class: usize, cell_size: usize) -> Option<Address> {
        let head = self.heads[class];
        if head.is_zero() {
            return None;
        }
        unsafe {
            self.heads[class] = head.load::<Address>();
            head.zero(cell_size);
        }
        Some(head)
    }

    /// Take the free list of another block of `class` and allocate from it.
    pub fn refill(
        &mut self,
        heap: &Heap,
        class: usize,
        cell_size: usize,
        cap: ReserveCap,
    ) -> Option<Address> {
        let space = heap.mark_sweep_space(self.space);
        self.heads[class] = space.acquire_block(class, &heap.controller, cap)?;
        self.alloc_fast(class, cell_size)
    }

    /// Drop every local list. Cells left on them are found again by the next sweep.
    pub fn reset(&mut self) {
        self.heads.iter_mut().for_each(|head| *head = Address::ZERO);
    }
}
