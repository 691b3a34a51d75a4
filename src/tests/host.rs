//! A tiny host runtime for scenario tests.
//!
//! Objects are a header word followed by reference fields. The header holds the field count
//! in its low half and the object kind in its high half. A reference object keeps its referent
//! in field 0, which is never reported to the engine.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::AllocationSemantics;
use crate::heap::{EngineBuilder, Heap};
use crate::mutator::Mutator;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::{Address, ObjectReference, VMThread};
use crate::vm::{Host, RootVisitor, SlotVisitor};

pub const ROOTS: usize = 64;
pub const PLAIN: usize = 0;
pub const REFERENCE: usize = 1;

pub struct HostState {
    roots: Box<[AtomicUsize]>,
    pub enqueued: Mutex<Vec<ObjectReference>>,
    pub out_of_memory: AtomicUsize,
}

impl HostState {
    fn new() -> Self {
        Self {
            roots: (0..ROOTS).map(|_| AtomicUsize::new(0)).collect(),
            enqueued: Mutex::new(Vec::new()),
            out_of_memory: AtomicUsize::new(0),
        }
    }

    pub fn set_root(&self, index: usize, object: Option<ObjectReference>) {
        self.roots[index].store(object.map_or(0, |o| o.as_usize()), Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> Vec<ObjectReference> {
        self.enqueued.lock().clone()
    }
}

pub struct TestHost(pub Arc<HostState>);

fn header(object: ObjectReference) -> (usize, usize) {
    let header = unsafe { object.to_raw_address().load::<usize>() };
    (header & 0xffff_ffff, header >> 32)
}

impl Host for TestHost {
    fn scan_roots(&self, roots: &mut dyn RootVisitor) {
        let slots: Vec<Address> = self
            .0
            .roots
            .iter()
            .map(|root| Address::from_ptr(root as *const AtomicUsize))
            .collect();
        roots.visit_slots(&slots);
    }

    fn scan_object(&self, object: ObjectReference, slots: &mut dyn SlotVisitor) {
        let (fields, kind) = header(object);
        let first = if kind == REFERENCE { 1 } else { 0 };
        for field in first..fields {
            slots.visit_slot(field_slot(object, field));
        }
    }

    fn get_referent(&self, reference: ObjectReference) -> Option<ObjectReference> {
        read_field(reference, 0)
    }

    fn set_referent(&self, reference: ObjectReference, referent: Option<ObjectReference>) {
        store_field(reference, 0, referent);
    }

    fn enqueue_references(&self, references: &[ObjectReference]) {
        self.0.enqueued.lock().extend_from_slice(references);
    }

    fn out_of_memory(&self, _tls: VMThread, _error: &crate::allocator::AllocError) {
        self.0.out_of_memory.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tls(id: usize) -> VMThread {
    VMThread(Address::from_usize(id))
}

/// Build an engine over a 64M reservation. `options` are applied on top of the defaults.
pub fn engine_without_collection(options: &str) -> (Arc<Heap>, Arc<HostState>) {
    init_logging();
    let state = Arc::new(HostState::new());
    let mut builder = EngineBuilder::new();
    assert!(builder.set_options_bulk(&format!(
        "heap_reservation=64M gc_trigger=DynamicHeapSize:4M,32M threads=2 {}",
        options
    )));
    let heap = builder.build(TestHost(state.clone())).unwrap();
    (heap, state)
}

pub fn engine(options: &str) -> (Arc<Heap>, Arc<HostState>) {
    let (heap, state) = engine_without_collection(options);
    heap.initialize_collection(tls(0));
    (heap, state)
}

pub fn new_object_with(
    mutator: &mut Mutator,
    fields: usize,
    kind: usize,
    semantics: AllocationSemantics,
) -> ObjectReference {
    let size = (fields + 1) * BYTES_IN_WORD;
    let addr = mutator.alloc(size, 8, 0, semantics).unwrap();
    unsafe { addr.store::<usize>(fields | kind << 32) };
    let object = ObjectReference::from_raw_address(addr).unwrap();
    mutator.post_alloc(object, size, semantics);
    object
}

pub fn new_object(mutator: &mut Mutator, fields: usize) -> ObjectReference {
    new_object_with(mutator, fields, PLAIN, AllocationSemantics::Default)
}

pub fn new_reference(mutator: &mut Mutator, referent: ObjectReference) -> ObjectReference {
    let reference = new_object_with(mutator, 1, REFERENCE, AllocationSemantics::Default);
    store_field(reference, 0, Some(referent));
    reference
}

pub fn field_slot(object: ObjectReference, field: usize) -> Address {
    object.to_raw_address().add((field + 1) * BYTES_IN_WORD)
}

pub fn read_field(object: ObjectReference, field: usize) -> Option<ObjectReference> {
    unsafe { field_slot(object, field).load_slot() }
}

/// Raw store, no barrier.
pub fn store_field(object: ObjectReference, field: usize, value: Option<ObjectReference>) {
    unsafe {
        field_slot(object, field).store::<usize>(value.map_or(0, |v| v.as_usize()));
    }
}

/// Store through the barrier hooks the way compiled host code would.
pub fn write_field(
    mutator: &mut Mutator,
    object: ObjectReference,
    field: usize,
    value: Option<ObjectReference>,
) {
    let slot = field_slot(object, field);
    mutator.object_reference_write_pre(object, slot, value);
    store_field(object, field, value);
    mutator.object_reference_write_post(object, slot, value);
}

/// Collect and wait, counting the calling thread's mutator as stopped.
pub fn collect(heap: &Heap) {
    heap.handle_user_collection_request(tls(0));
}
