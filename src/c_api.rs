//! C entry points. One engine per process, created by [`comet_gc_init`].
//!
//! Options set through [`comet_process`] and friends before initialisation go into a builder;
//! afterwards they are rejected. Mutator handles are raw `Box<Mutator>` pointers.
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::allocator::{AllocationSemantics, AllocatorSelector};
use crate::collector::GcThreadContext;
use crate::heap::{EngineBuilder, Heap};
use crate::mutator::Mutator;
use crate::options::BarrierSelector;
use crate::safepoint::StoppedWorld;
use crate::util::constants::MIN_ALIGNMENT;
use crate::util::{Address, ObjectReference, VMThread};
use crate::vm::{spawn_std_thread, Host, RootVisitor, SlotVisitor};

/// Slots the host can report before it has to ask for a fresh buffer.
pub const SLOTS_BUFFER_CAPACITY: usize = 4096;

/// A buffer handed to the host for reporting slots.
#[repr(C)]
pub struct NewBuffer {
    pub buf: *mut Address,
    pub cap: usize,
}

/// Reports `size` slots filled into `buf` and returns an empty buffer for the next batch.
/// Calling it with a null `buf` only hands out a buffer.
#[repr(C)]
pub struct SlotsClosure {
    pub func: extern "C" fn(buf: *mut Address, size: usize, cap: usize, data: *mut c_void) -> NewBuffer,
    pub data: *mut c_void,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcThreadKind {
    Controller = 0,
    Worker = 1,
}

/// Functions the host provides. Optional entries fall back to the engine's own behaviour.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CometUpcalls {
    pub scan_roots: extern "C" fn(closure: SlotsClosure),
    pub scan_object: extern "C" fn(object: ObjectReference, closure: SlotsClosure),
    pub get_referent: extern "C" fn(reference: ObjectReference) -> Option<ObjectReference>,
    pub set_referent: extern "C" fn(reference: ObjectReference, referent: Option<ObjectReference>),
    pub enqueue_references: Option<extern "C" fn(references: *const ObjectReference, len: usize)>,
    /// Called once every mutator is parked.
    pub stop_all_mutators: Option<extern "C" fn(tls: VMThread)>,
    /// Called right before the mutators are released.
    pub resume_mutators: Option<extern "C" fn(tls: VMThread)>,
    /// Start a thread that passes `context` to [`comet_start_control_collector`] or
    /// [`comet_start_worker`], depending on `kind`.
    pub spawn_gc_thread: Option<extern "C" fn(tls: VMThread, kind: GcThreadKind, context: *mut c_void)>,
    pub out_of_memory: Option<extern "C" fn(tls: VMThread, size: usize)>,
    /// When set, expected to call [`comet_harness_begin_impl`] itself.
    pub harness_begin: Option<extern "C" fn(tls: VMThread)>,
    pub harness_end: Option<extern "C" fn(tls: VMThread)>,
}

struct UpcallHost {
    upcalls: CometUpcalls,
}

struct RootSink<'a> {
    visitor: &'a mut dyn RootVisitor,
}

struct SlotSink<'a> {
    visitor: &'a mut dyn SlotVisitor,
}

fn new_buffer() -> NewBuffer {
    let mut buf = Vec::<Address>::with_capacity(SLOTS_BUFFER_CAPACITY);
    let cap = buf.capacity();
    let ptr = buf.as_mut_ptr();
    std::mem::forget(buf);
    NewBuffer { buf: ptr, cap }
}

/// # Safety
/// `buf` must be null or a buffer returned by [`new_buffer`] with `size <= cap`.
unsafe fn take_buffer(buf: *mut Address, size: usize, cap: usize) -> Vec<Address> {
    if buf.is_null() {
        Vec::new()
    } else {
        Vec::from_raw_parts(buf, size, cap)
    }
}

extern "C" fn report_root_slots(
    buf: *mut Address,
    size: usize,
    cap: usize,
    data: *mut c_void,
) -> NewBuffer {
    let slots = unsafe { take_buffer(buf, size, cap) };
    if !slots.is_empty() {
        let sink = unsafe { &mut *(data as *mut RootSink) };
        sink.visitor.visit_slots(&slots);
    }
    new_buffer()
}

extern "C" fn report_object_slots(
    buf: *mut Address,
    size: usize,
    cap: usize,
    data: *mut c_void,
) -> NewBuffer {
    let slots = unsafe { take_buffer(buf, size, cap) };
    let sink = unsafe { &mut *(data as *mut SlotSink) };
    for &slot in slots.iter() {
        sink.visitor.visit_slot(slot);
    }
    new_buffer()
}

impl Host for UpcallHost {
    fn scan_roots(&self, roots: &mut dyn RootVisitor) {
        let mut sink = RootSink { visitor: roots };
        (self.upcalls.scan_roots)(SlotsClosure {
            func: report_root_slots,
            data: &mut sink as *mut RootSink as *mut c_void,
        });
    }

    fn scan_object(&self, object: ObjectReference, slots: &mut dyn SlotVisitor) {
        let mut sink = SlotSink { visitor: slots };
        (self.upcalls.scan_object)(
            object,
            SlotsClosure {
                func: report_object_slots,
                data: &mut sink as *mut SlotSink as *mut c_void,
            },
        );
    }

    fn get_referent(&self, reference: ObjectReference) -> Option<ObjectReference> {
        (self.upcalls.get_referent)(reference)
    }

    fn set_referent(&self, reference: ObjectReference, referent: Option<ObjectReference>) {
        (self.upcalls.set_referent)(reference, referent)
    }

    fn enqueue_references(&self, references: &[ObjectReference]) {
        if let Some(enqueue) = self.upcalls.enqueue_references {
            enqueue(references.as_ptr(), references.len());
        }
    }

    fn stop_all_mutators(&self, tls: VMThread, world: &StoppedWorld<'_>) {
        world.stop_cooperatively();
        if let Some(stop) = self.upcalls.stop_all_mutators {
            stop(tls);
        }
    }

    fn resume_mutators(&self, tls: VMThread, world: &StoppedWorld<'_>) {
        if let Some(resume) = self.upcalls.resume_mutators {
            resume(tls);
        }
        world.resume_cooperatively();
    }

    fn spawn_gc_thread(&self, tls: VMThread, context: GcThreadContext) {
        match self.upcalls.spawn_gc_thread {
            Some(spawn) => {
                let kind = match context {
                    GcThreadContext::Controller(_) => GcThreadKind::Controller,
                    GcThreadContext::Worker(_) => GcThreadKind::Worker,
                };
                spawn(tls, kind, Box::into_raw(Box::new(context)) as *mut c_void);
            }
            None => spawn_std_thread(tls, context),
        }
    }

    fn out_of_memory(&self, tls: VMThread, error: &crate::allocator::AllocError) {
        log::error!("{:?}: {}", tls, error);
        if let Some(oom) = self.upcalls.out_of_memory {
            let crate::allocator::AllocError::OutOfMemory { size, .. } = *error;
            oom(tls, size);
        }
    }

    fn harness_begin(&self, tls: VMThread, heap: &Heap) {
        match self.upcalls.harness_begin {
            Some(begin) => begin(tls),
            None => heap.harness_begin_impl(tls),
        }
    }

    fn harness_end(&self, tls: VMThread, heap: &Heap) {
        match self.upcalls.harness_end {
            Some(end) => end(tls),
            None => heap.harness_end_impl(tls),
        }
    }
}

static ENGINE: OnceLock<Arc<Heap>> = OnceLock::new();

fn builder() -> &'static Mutex<EngineBuilder> {
    static BUILDER: OnceLock<Mutex<EngineBuilder>> = OnceLock::new();
    BUILDER.get_or_init(|| {
        let mut builder = EngineBuilder::new();
        builder.read_env_var_settings();
        Mutex::new(builder)
    })
}

fn engine() -> &'static Arc<Heap> {
    match ENGINE.get() {
        Some(heap) => heap,
        None => fatal!("comet engine used before comet_gc_init"),
    }
}

fn mutator<'a>(mutator: *mut Mutator) -> &'a mut Mutator {
    match unsafe { mutator.as_mut() } {
        Some(mutator) => mutator,
        None => fatal!("null mutator handle"),
    }
}

fn semantics(raw: u8) -> AllocationSemantics {
    match AllocationSemantics::from_raw(raw) {
        Some(semantics) => semantics,
        None => fatal!("unknown allocation semantics {}", raw),
    }
}

fn c_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

/// Create the engine. Returns false if it exists already or the reservation fails.
#[no_mangle]
pub extern "C" fn comet_gc_init(upcalls: *const CometUpcalls) -> bool {
    let upcalls = match unsafe { upcalls.as_ref() } {
        Some(upcalls) => *upcalls,
        None => return false,
    };
    if ENGINE.get().is_some() {
        log::warn!("comet_gc_init called twice");
        return false;
    }
    let options = builder().lock().options().clone();
    match Heap::new(options, Box::new(UpcallHost { upcalls })) {
        Ok(heap) => ENGINE.set(heap).is_ok(),
        Err(err) => {
            log::error!("{}", err);
            false
        }
    }
}

#[no_mangle]
pub extern "C" fn comet_is_gc_initialized() -> bool {
    ENGINE.get().is_some()
}

#[no_mangle]
pub extern "C" fn comet_process(name: *const c_char, value: *const c_char) -> bool {
    if ENGINE.get().is_some() {
        log::warn!("options are frozen once the engine exists");
        return false;
    }
    match (c_str(name), c_str(value)) {
        (Some(name), Some(value)) => builder().lock().set_option(name, value),
        _ => false,
    }
}

#[no_mangle]
pub extern "C" fn comet_process_bulk(options: *const c_char) -> bool {
    if ENGINE.get().is_some() {
        log::warn!("options are frozen once the engine exists");
        return false;
    }
    match c_str(options) {
        Some(options) => builder().lock().set_options_bulk(options),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn comet_set_heap_size(min: usize, max: usize) -> bool {
    match ENGINE.get() {
        Some(heap) => heap.set_heap_size(min, max),
        None => builder().lock().set_heap_size(min, max),
    }
}

/// Null if the engine does not exist yet.
#[no_mangle]
pub extern "C" fn comet_bind_mutator(tls: VMThread) -> *mut Mutator {
    match ENGINE.get() {
        Some(heap) => Box::into_raw(heap.bind_mutator(tls)),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn comet_destroy_mutator(mutator: *mut Mutator) {
    if mutator.is_null() || !engine().safepoint.is_registered(mutator) {
        fatal!("destroying unknown mutator {:p}", mutator);
    }
    engine().destroy_mutator(unsafe { Box::from_raw(mutator) });
}

#[no_mangle]
pub extern "C" fn comet_flush_mutator(mutator: *mut Mutator) {
    self::mutator(mutator).flush();
}

/// Allocate with default semantics. Null when the heap is exhausted.
#[no_mangle]
pub extern "C" fn comet_alloc(mutator: *mut Mutator, size: usize, align: usize, offset: isize) -> Address {
    comet_alloc_with_semantics(mutator, size, align, offset, AllocationSemantics::Default as u8)
}

#[no_mangle]
pub extern "C" fn comet_alloc_with_semantics(
    mutator: *mut Mutator,
    size: usize,
    align: usize,
    offset: isize,
    semantics: u8,
) -> Address {
    self::mutator(mutator)
        .alloc(size, align.max(MIN_ALIGNMENT), offset, self::semantics(semantics))
        .unwrap_or(Address::ZERO)
}

#[no_mangle]
pub extern "C" fn comet_post_alloc(
    mutator: *mut Mutator,
    object: ObjectReference,
    bytes: usize,
    semantics: u8,
) {
    self::mutator(mutator).post_alloc(object, bytes, self::semantics(semantics));
}

/// The allocator serving `semantics`, packed as `kind << 4 | index`.
#[no_mangle]
pub extern "C" fn comet_get_allocator_mapping(semantics: u8) -> u8 {
    engine()
        .get_allocator_mapping(self::semantics(semantics))
        .pack()
}

#[no_mangle]
pub extern "C" fn comet_unpack_allocator_kind(packed: u8) -> u8 {
    match AllocatorSelector::unpack(packed) {
        AllocatorSelector::None => 0,
        AllocatorSelector::BumpPointer(_) => 1,
        AllocatorSelector::FreeList(_) => 2,
        AllocatorSelector::LargeObject(_) => 3,
    }
}

#[no_mangle]
pub extern "C" fn comet_get_max_non_los_default_alloc_bytes() -> usize {
    engine().get_max_non_los_default_alloc_bytes()
}

#[no_mangle]
pub extern "C" fn comet_will_never_move(object: ObjectReference) -> bool {
    engine().will_never_move(object)
}

#[no_mangle]
pub extern "C" fn comet_initialize_collection(tls: VMThread) {
    engine().initialize_collection(tls);
}

fn take_context(context: *mut c_void) -> GcThreadContext {
    if context.is_null() {
        fatal!("null collector thread context");
    }
    *unsafe { Box::from_raw(context as *mut GcThreadContext) }
}

#[no_mangle]
pub extern "C" fn comet_start_control_collector(tls: VMThread, context: *mut c_void) {
    match take_context(context) {
        GcThreadContext::Controller(controller) => engine().start_control_collector(tls, controller),
        GcThreadContext::Worker(_) => fatal!("worker context passed to comet_start_control_collector"),
    }
}

#[no_mangle]
pub extern "C" fn comet_start_worker(tls: VMThread, context: *mut c_void) {
    match take_context(context) {
        GcThreadContext::Worker(worker) => engine().start_worker(tls, worker),
        GcThreadContext::Controller(_) => fatal!("controller context passed to comet_start_worker"),
    }
}

#[no_mangle]
pub extern "C" fn comet_used_bytes() -> usize {
    engine().used_bytes()
}

#[no_mangle]
pub extern "C" fn comet_free_bytes() -> usize {
    engine().free_bytes()
}

#[no_mangle]
pub extern "C" fn comet_total_bytes() -> usize {
    engine().total_bytes()
}

#[no_mangle]
pub extern "C" fn comet_is_live_object(object: Option<ObjectReference>) -> bool {
    object.map_or(false, |object| engine().is_live_object(object))
}

#[no_mangle]
pub extern "C" fn comet_is_mmtk_object(addr: Address) -> bool {
    engine().is_mmtk_object(addr)
}

#[no_mangle]
pub extern "C" fn comet_is_in_spaces(addr: Address) -> bool {
    engine().is_in_spaces(addr)
}

#[no_mangle]
pub extern "C" fn comet_is_mapped_address(addr: Address) -> bool {
    engine().is_mapped_address(addr)
}

#[no_mangle]
pub extern "C" fn comet_modify_check(object: ObjectReference) {
    engine().modify_check(object);
}

#[no_mangle]
pub extern "C" fn comet_handle_user_collection_request(tls: VMThread) {
    engine().handle_user_collection_request(tls);
}

#[no_mangle]
pub extern "C" fn comet_add_weak_candidate(reference: ObjectReference) {
    engine().add_weak_candidate(reference);
}

#[no_mangle]
pub extern "C" fn comet_add_soft_candidate(reference: ObjectReference) {
    engine().add_soft_candidate(reference);
}

#[no_mangle]
pub extern "C" fn comet_add_phantom_candidate(reference: ObjectReference) {
    engine().add_phantom_candidate(reference);
}

#[no_mangle]
pub extern "C" fn comet_add_finalizer(object: ObjectReference) {
    engine().add_finalizer(object);
}

/// Null when no finalizable object is waiting.
#[no_mangle]
pub extern "C" fn comet_get_finalized_object() -> Option<ObjectReference> {
    engine().get_finalized_object()
}

#[no_mangle]
pub extern "C" fn comet_harness_begin(tls: VMThread) {
    engine().harness_begin(tls);
}

#[no_mangle]
pub extern "C" fn comet_harness_end(tls: VMThread) {
    engine().harness_end(tls);
}

#[no_mangle]
pub extern "C" fn comet_harness_begin_impl(tls: VMThread) {
    engine().harness_begin_impl(tls);
}

#[no_mangle]
pub extern "C" fn comet_harness_end_impl(tls: VMThread) {
    engine().harness_end_impl(tls);
}

#[no_mangle]
pub extern "C" fn comet_starting_heap_address() -> Address {
    engine().starting_heap_address()
}

#[no_mangle]
pub extern "C" fn comet_last_heap_address() -> Address {
    engine().last_heap_address()
}

#[no_mangle]
pub extern "C" fn comet_active_barrier() -> *const c_char {
    let name: &'static [u8] = match engine().barrier_selector() {
        BarrierSelector::NoBarrier => b"NoBarrier\0",
        BarrierSelector::ObjectBarrier => b"ObjectBarrier\0",
        BarrierSelector::SATBBarrier => b"SATBBarrier\0",
    };
    name.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn comet_object_reference_write_pre(
    mutator: *mut Mutator,
    src: ObjectReference,
    slot: Address,
    target: Option<ObjectReference>,
) {
    self::mutator(mutator).object_reference_write_pre(src, slot, target);
}

#[no_mangle]
pub extern "C" fn comet_object_reference_write_post(
    mutator: *mut Mutator,
    src: ObjectReference,
    slot: Address,
    target: Option<ObjectReference>,
) {
    self::mutator(mutator).object_reference_write_post(src, slot, target);
}

#[no_mangle]
pub extern "C" fn comet_object_reference_write_slow(
    mutator: *mut Mutator,
    src: ObjectReference,
    slot: Address,
    target: Option<ObjectReference>,
) {
    self::mutator(mutator).object_reference_write_slow(src, slot, target);
}

#[no_mangle]
pub extern "C" fn comet_array_copy_pre(mutator: *mut Mutator, src: Address, dst: Address, count: usize) {
    self::mutator(mutator).array_copy_pre(src, dst, count);
}

#[no_mangle]
pub extern "C" fn comet_array_copy_post(mutator: *mut Mutator, src: Address, dst: Address, count: usize) {
    self::mutator(mutator).array_copy_post(src, dst, count);
}

#[no_mangle]
pub extern "C" fn comet_add_nmethod_oop(slot: Address) {
    engine().add_nmethod_oop(slot);
}

#[no_mangle]
pub extern "C" fn comet_register_nmethod(method: Address) {
    engine().register_nmethod(method);
}

#[no_mangle]
pub extern "C" fn comet_unregister_nmethod(method: Address) {
    engine().unregister_nmethod(method);
}

/// Free the last buffer a [`SlotsClosure`] returned.
#[no_mangle]
pub extern "C" fn comet_release_buffer(buf: *mut Address, cap: usize) {
    drop(unsafe { take_buffer(buf, 0, cap) });
}

#[no_mangle]
pub extern "C" fn comet_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectRoots {
        slots: Vec<Address>,
    }

    impl RootVisitor for CollectRoots {
        fn visit_slots(&mut self, slots: &[Address]) {
            self.slots.extend_from_slice(slots);
        }

        fn visit_objects(&mut self, _: &[ObjectReference]) {}
    }

    /// Fill buffers the way a host does: ask for one, fill it, hand it back, release the last.
    fn report(closure: &SlotsClosure, slots: &[Address]) {
        let mut buffer = (closure.func)(std::ptr::null_mut(), 0, 0, closure.data);
        let mut size = 0;
        for &slot in slots {
            if size == buffer.cap {
                buffer = (closure.func)(buffer.buf, size, buffer.cap, closure.data);
                size = 0;
            }
            unsafe { buffer.buf.add(size).write(slot) };
            size += 1;
        }
        let last = (closure.func)(buffer.buf, size, buffer.cap, closure.data);
        comet_release_buffer(last.buf, last.cap);
    }

    #[test]
    fn slots_closure_renews_buffers() {
        let mut visitor = CollectRoots::default();
        let mut sink = RootSink {
            visitor: &mut visitor,
        };
        let closure = SlotsClosure {
            func: report_root_slots,
            data: &mut sink as *mut RootSink as *mut c_void,
        };
        let slots: Vec<Address> = (0..SLOTS_BUFFER_CAPACITY + 10)
            .map(|i| Address::from_usize(0x1000 + i * 8))
            .collect();
        report(&closure, &slots);
        assert_eq!(visitor.slots, slots);
    }

    #[test]
    fn object_slots_reach_the_visitor() {
        let mut seen = Vec::new();
        let mut visit = |slot: Address| seen.push(slot);
        let mut sink = SlotSink {
            visitor: &mut visit,
        };
        let closure = SlotsClosure {
            func: report_object_slots,
            data: &mut sink as *mut SlotSink as *mut c_void,
        };
        report(&closure, &[Address::from_usize(0x10), Address::from_usize(0x18)]);
        assert_eq!(seen, vec![Address::from_usize(0x10), Address::from_usize(0x18)]);
    }

    #[test]
    fn version_is_nul_terminated() {
        let version = unsafe { CStr::from_ptr(comet_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
