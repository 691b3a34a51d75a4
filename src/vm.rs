//! What the engine needs from the runtime embedding it.
use crate::allocator::AllocError;
use crate::collector::GcThreadContext;
use crate::heap::Heap;
use crate::safepoint::StoppedWorld;
use crate::util::{Address, ObjectReference, VMThread};

/// Receives root slots and root objects from [`Host::scan_roots`].
pub trait RootVisitor {
    fn visit_slots(&mut self, slots: &[Address]);

    fn visit_objects(&mut self, objects: &[ObjectReference]);
}

/// Receives the reference slots of one object from [`Host::scan_object`].
pub trait SlotVisitor {
    fn visit_slot(&mut self, slot: Address);
}

impl<F: FnMut(Address)> SlotVisitor for F {
    fn visit_slot(&mut self, slot: Address) {
        self(slot)
    }
}

/// The host side of the boundary.
///
/// Object layout stays with the host: the engine only ever asks it for the reference slots of an
/// object and for the referent of a reference object.
pub trait Host: Send + Sync + 'static {
    /// Report every strong root.
    fn scan_roots(&self, roots: &mut dyn RootVisitor);

    /// Report the reference slots of `object`. The referent slot of a reference object must not
    /// be reported.
    fn scan_object(&self, object: ObjectReference, slots: &mut dyn SlotVisitor);

    fn get_referent(&self, reference: ObjectReference) -> Option<ObjectReference>;

    fn set_referent(&self, reference: ObjectReference, referent: Option<ObjectReference>);

    /// References whose referents were cleared during the last cycle.
    fn enqueue_references(&self, references: &[ObjectReference]) {
        let _ = references;
    }

    /// Bring every bound mutator to a halt. The default parks them at their next safepoint poll.
    fn stop_all_mutators(&self, tls: VMThread, world: &StoppedWorld<'_>) {
        let _ = tls;
        world.stop_cooperatively();
    }

    fn resume_mutators(&self, tls: VMThread, world: &StoppedWorld<'_>) {
        let _ = tls;
        world.resume_cooperatively();
    }

    /// Run `context` on a new thread. The default spawns a named std thread.
    fn spawn_gc_thread(&self, tls: VMThread, context: GcThreadContext) {
        spawn_std_thread(tls, context);
    }

    /// Called before an allocation fails with `error`.
    fn out_of_memory(&self, tls: VMThread, error: &AllocError) {
        log::error!("{:?}: {}", tls, error);
    }

    fn harness_begin(&self, tls: VMThread, heap: &Heap) {
        heap.harness_begin_impl(tls);
    }

    fn harness_end(&self, tls: VMThread, heap: &Heap) {
        heap.harness_end_impl(tls);
    }
}

/// Run `context` on a new named std thread.
pub fn spawn_std_thread(tls: VMThread, context: GcThreadContext) {
    let name = context.thread_name();
    if let Err(err) = std::thread::Builder::new()
        .name(name)
        .spawn(move || context.run(tls))
    {
        fatal!("failed to spawn collector thread: {}", err);
    }
}
