use crate::heap::Heap;
use crate::heap_controller::ReserveCap;
use crate::util::Address;

/// Large objects have no thread local fast path; every request takes its own page run.
#[derive(Default)]
pub struct LargeObjectAllocator {
    objects: usize,
}

impl LargeObjectAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        heap: &Heap,
        size: usize,
        align: usize,
        offset: usize,
        cap: ReserveCap,
    ) -> Option<Address> {
        let result = heap.los.alloc(&heap.controller, size, align, offset, cap)?;
        self.objects += 1;
        Some(result)
    }

    /// Large objects this mutator allocated.
    pub fn objects(&self) -> usize {
        self.objects
    }
}
