//! Allocation semantics, the allocator selector and the mutator-local allocators.
pub mod bump;
pub mod free_list;
pub mod large_object;

use modular_bitfield::prelude::*;
use thiserror::Error;

use crate::options::PlanSelector;
use crate::util::Address;

pub use self::bump::BumpAllocator;
pub use self::free_list::FreeListAllocator;
pub use self::large_object::LargeObjectAllocator;

/// What the host needs from the memory it asks for.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AllocationSemantics {
    Default = 0,
    Immortal = 1,
    Los = 2,
    NonMoving = 3,
}

impl AllocationSemantics {
    pub const ALL: [AllocationSemantics; 4] = [
        AllocationSemantics::Default,
        AllocationSemantics::Immortal,
        AllocationSemantics::Los,
        AllocationSemantics::NonMoving,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// Which mutator-local allocator serves a request, and which instance of it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorSelector {
    BumpPointer(u8),
    FreeList(u8),
    LargeObject(u8),
    None,
}

/// One-byte encoding of an [`AllocatorSelector`] for the C boundary.
#[bitfield]
#[derive(Copy, Clone, Debug)]
pub struct PackedSelector {
    pub kind: B4,
    pub index: B4,
}

impl AllocatorSelector {
    const KIND_NONE: u8 = 0;
    const KIND_BUMP_POINTER: u8 = 1;
    const KIND_FREE_LIST: u8 = 2;
    const KIND_LARGE_OBJECT: u8 = 3;

    pub fn pack(self) -> u8 {
        let (kind, index) = match self {
            Self::None => (Self::KIND_NONE, 0),
            Self::BumpPointer(index) => (Self::KIND_BUMP_POINTER, index),
            Self::FreeList(index) => (Self::KIND_FREE_LIST, index),
            Self::LargeObject(index) => (Self::KIND_LARGE_OBJECT, index),
        };
        PackedSelector::new()
            .with_kind(kind)
            .with_index(index)
            .into_bytes()[0]
    }

    pub fn unpack(raw: u8) -> Self {
        let packed = PackedSelector::from_bytes([raw]);
        match packed.kind() {
            Self::KIND_BUMP_POINTER => Self::BumpPointer(packed.index()),
            Self::KIND_FREE_LIST => Self::FreeList(packed.index()),
            Self::KIND_LARGE_OBJECT => Self::LargeObject(packed.index()),
            _ => Self::None,
        }
    }
}

/// Semantics to allocator table, fixed for the lifetime of an engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocatorMapping {
    table: [AllocatorSelector; 4],
}

impl AllocatorMapping {
    /// Index of the default mark-sweep space among the free-list allocators.
    pub const DEFAULT_SPACE: u8 = 0;
    /// Index of the non-moving mark-sweep space among the free-list allocators.
    pub const NON_MOVING_SPACE: u8 = 1;

    pub fn for_plan(plan: PlanSelector) -> Self {
        use AllocationSemantics as S;
        let mut table = [AllocatorSelector::None; 4];
        for semantics in S::ALL {
            table[semantics as usize] = match (plan, semantics) {
                (_, S::Los) => AllocatorSelector::LargeObject(0),
                (_, S::Immortal) | (PlanSelector::NoGC, _) => AllocatorSelector::BumpPointer(0),
                (_, S::Default) => AllocatorSelector::FreeList(Self::DEFAULT_SPACE),
                (_, S::NonMoving) => AllocatorSelector::FreeList(Self::NON_MOVING_SPACE),
            };
        }
        Self { table }
    }

    #[inline]
    pub fn get(&self, semantics: AllocationSemantics) -> AllocatorSelector {
        self.table[semantics as usize]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of memory allocating {size} bytes with {semantics:?} semantics")]
    OutOfMemory {
        size: usize,
        semantics: AllocationSemantics,
    },
}

/// First address at or after `start` such that `result + offset` is aligned to `align`.
#[inline(always)]
pub fn align_allocation(start: Address, align: usize, offset: usize) -> Address {
    start.add(offset).align_up(align).sub(offset)
}
