//! Embeddable tracing garbage collector.
//!
//! The host runtime owns object layout, thread stacks and compiled code; the engine owns the
//! heap. A host builds one [`Heap`] with an [`EngineBuilder`], binds a [`Mutator`] per thread,
//! allocates through it and reports reference stores through its barrier hooks. Collections are
//! stop-the-world and run on threads the host spawns for the engine.
#[macro_use]
mod util;

/// Log at info level when `$cond` holds, at debug level otherwise.
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        } else {
            log::debug!($($t)*);
        }
    };
}

pub mod allocator;
pub mod barrier;
pub mod block_allocator;
pub mod bump_pointer_space;
pub mod c_api;
pub mod collector;
pub mod finalizer;
pub mod heap;
pub mod heap_controller;
pub mod internal;
pub mod large_space;
pub mod marking;
pub mod mmap;
pub mod mutator;
pub mod options;
pub mod reference_processor;
pub mod roots;
pub mod safepoint;
pub mod segregated_space;
pub mod space;
pub mod statistics;
pub mod sweeper;
pub mod task_scheduler;
pub mod vm;


pub use crate::allocator::{AllocError, AllocationSemantics, AllocatorSelector};
pub use crate::heap::{EngineBuilder, EngineError, Heap, Phase};
pub use crate::mutator::{Mutator, SafeRegion, ThreadState};
pub use crate::options::{BarrierSelector, GcTriggerSelector, OptionError, Options, PlanSelector};
pub use crate::util::{constants, Address, ObjectReference, VMThread};
pub use crate::vm::{Host, RootVisitor, SlotVisitor};
