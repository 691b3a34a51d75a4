use std::io;

use crate::internal::space_bitmap::SpaceBitmap;
use crate::util::constants::MIN_ALIGNMENT;
use crate::util::{Address, ObjectReference};

/// A contiguous range of the reservation owned by one space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    pub fn new(start: Address, size: usize) -> Self {
        Self {
            start,
            end: start.add(size),
        }
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn size(&self) -> usize {
        self.end.diff(self.start)
    }
}

/// Common view of the spaces the heap is made of.
pub trait Space: Send + Sync {
    fn name(&self) -> &'static str;

    fn region(&self) -> Region;

    /// End of the part of the region that has ever been handed out.
    fn high_water(&self) -> Address;

    fn reserved_pages(&self) -> usize;

    #[inline]
    fn contains(&self, addr: Address) -> bool {
        self.region().contains(addr)
    }

    fn is_mapped(&self, addr: Address) -> bool {
        addr >= self.region().start && addr < self.high_water()
    }

    /// None of the spaces relocate objects.
    fn is_movable(&self) -> bool {
        false
    }
}

/// Per-object bits kept outside the objects, one bit per word of the reservation.
pub struct SideMetadata {
    /// Set for every allocated object, cleared when the object is reclaimed.
    pub alloc: SpaceBitmap<MIN_ALIGNMENT>,
    /// Set by tracing. Cleared before full-heap cycles only.
    pub mark: SpaceBitmap<MIN_ALIGNMENT>,
    /// Set for old objects whose next reference store has to be remembered.
    pub unlog: SpaceBitmap<MIN_ALIGNMENT>,
}

impl SideMetadata {
    pub fn new(heap: Region) -> io::Result<Self> {
        Ok(Self {
            alloc: SpaceBitmap::create("alloc", heap.start, heap.size())?,
            mark: SpaceBitmap::create("mark", heap.start, heap.size())?,
            unlog: SpaceBitmap::create("unlog", heap.start, heap.size())?,
        })
    }

    #[inline]
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        self.mark.test(object.to_raw_address())
    }

    /// Forget everything about a reclaimed object.
    #[inline]
    pub fn clear_object(&self, addr: Address) {
        self.alloc.clear(addr);
        self.mark.clear(addr);
        self.unlog.clear(addr);
    }
}
