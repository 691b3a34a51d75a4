use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use atomic::{Atomic, Ordering};

use crate::allocator::{
    AllocError, AllocationSemantics, AllocatorMapping, AllocatorSelector, BumpAllocator,
    FreeListAllocator, LargeObjectAllocator,
};
use crate::barrier::BarrierBuffers;
use crate::heap::Heap;
use crate::heap_controller::ReserveCap;
use crate::internal::collection_barrier::GcRequest;
use crate::util::constants::{
    BYTES_IN_PAGE, LOCAL_BUFFER_CAPACITY, MAX_NON_LOS_ALLOC_BYTES, MIN_ALIGNMENT,
};
use crate::util::{align_down, Address, ObjectReference, VMThread};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing host code that may touch the heap.
    Running = 0,
    /// In a region that promises not to touch the heap.
    Parked = 1,
    /// Blocked at a safepoint or waiting for a collection.
    Waiting = 2,
}

impl ThreadState {
    pub fn safe_for_safepoint(self) -> bool {
        matches!(self, Self::Parked | Self::Waiting)
    }
}

thread_local! {
    static CURRENT_MUTATOR: Cell<*const Mutator> = const { Cell::new(std::ptr::null()) };
}

/// Where a request is served from, resolved once per allocation.
#[derive(Copy, Clone, Debug)]
enum Route {
    Bump,
    /// `displacement` is where the object starts inside its cell.
    FreeList {
        space: usize,
        class: usize,
        cell_size: usize,
        displacement: usize,
    },
    Large,
}

/// Weak, soft, phantom and finalizer registrations made by this thread and not yet flushed.
#[derive(Default)]
pub(crate) struct CandidateBuffers {
    pub(crate) weak: Vec<ObjectReference>,
    pub(crate) soft: Vec<ObjectReference>,
    pub(crate) phantom: Vec<ObjectReference>,
    pub(crate) finalizers: Vec<ObjectReference>,
}

/// Allocation buffers and staged records of one thread.
pub(crate) struct LocalBuffers {
    pub(crate) bump: BumpAllocator,
    pub(crate) free_lists: [FreeListAllocator; 2],
    pub(crate) los: LargeObjectAllocator,
    pub(crate) barrier: BarrierBuffers,
    pub(crate) candidates: CandidateBuffers,
    allocated_bytes: usize,
}

impl LocalBuffers {
    /// Hand every staged record to the engine. Calling it twice is harmless.
    fn flush(&mut self, heap: &Heap) {
        let candidates = &mut self.candidates;
        heap.weak_refs.add_candidates(std::mem::take(&mut candidates.weak));
        heap.soft_refs.add_candidates(std::mem::take(&mut candidates.soft));
        heap.phantom_refs
            .add_candidates(std::mem::take(&mut candidates.phantom));
        heap.finalizers
            .add_candidates(std::mem::take(&mut candidates.finalizers));
        self.barrier.flush_into(&heap.remembered);
        heap.stats.lock().allocated_bytes += std::mem::take(&mut self.allocated_bytes);
    }

    /// Forget every local allocation buffer. Cells left on free lists are found again by the
    /// next sweep.
    fn reset_allocators(&mut self) {
        self.bump.reset();
        for allocator in self.free_lists.iter_mut() {
            allocator.reset();
        }
    }
}

/// The part of a mutator the safepoint and the collector see.
///
/// `local` belongs to the owning thread while it runs. The collector drains it only while that
/// thread is stopped, and the owner never keeps a borrow of it across a point where it stops.
pub(crate) struct MutatorContext {
    tls: VMThread,
    state: Atomic<ThreadState>,
    local: UnsafeCell<LocalBuffers>,
}

unsafe impl Sync for MutatorContext {}

impl MutatorContext {
    pub(crate) fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst)
    }

    /// # Safety
    /// The owning thread must be stopped at a safepoint and stay stopped until the world is
    /// resumed.
    pub(crate) unsafe fn prepare_for_collection(&self, heap: &Heap) {
        let local = &mut *self.local.get();
        local.flush(heap);
        local.reset_allocators();
        log::trace!("mutator {:?} prepared for collection", self.tls);
    }
}

/// Per-thread engine state. Created by [`Heap::bind_mutator`], detached when dropped.
///
/// Allocation fast paths and barrier recording only touch this thread's buffers; global state
/// is reached on refills, buffer spills and [`Mutator::flush`].
pub struct Mutator {
    pub(crate) heap: Arc<Heap>,
    pub(crate) context: Arc<MutatorContext>,
    safepoint_cond: *const AtomicU32,
    mapping: AllocatorMapping,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, tls: VMThread) -> Mutator {
        let classes = heap.mark_sweep_space(0).size_classes().len();
        let local = LocalBuffers {
            bump: BumpAllocator::new(),
            free_lists: [
                FreeListAllocator::new(AllocatorMapping::DEFAULT_SPACE, classes),
                FreeListAllocator::new(AllocatorMapping::NON_MOVING_SPACE, classes),
            ],
            los: LargeObjectAllocator::new(),
            barrier: BarrierBuffers::default(),
            candidates: CandidateBuffers::default(),
            allocated_bytes: 0,
        };
        Mutator {
            safepoint_cond: &heap.safepoint.gc_running,
            mapping: heap.allocator_mapping(),
            context: Arc::new(MutatorContext {
                tls,
                state: Atomic::new(ThreadState::Running),
                local: UnsafeCell::new(local),
            }),
            heap,
        }
    }

    /// The heap and this thread's buffers. The buffers must not be held across a safepoint.
    #[inline(always)]
    pub(crate) fn parts(&mut self) -> (&Heap, &mut LocalBuffers) {
        (&self.heap, unsafe { &mut *self.context.local.get() })
    }

    #[inline(always)]
    pub(crate) fn local(&mut self) -> &mut LocalBuffers {
        self.parts().1
    }

    pub(crate) fn make_current(&self) {
        CURRENT_MUTATOR.with(|current| current.set(self as *const Self));
    }

    /// The mutator bound on the calling thread, if any.
    pub(crate) fn current() -> Option<NonNull<Mutator>> {
        CURRENT_MUTATOR.with(|current| NonNull::new(current.get() as *mut Mutator))
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn tls(&self) -> VMThread {
        self.context.tls
    }

    pub fn state(&self) -> ThreadState {
        self.context.state()
    }

    pub fn allocator_mapping(&self) -> AllocatorMapping {
        self.mapping
    }

    /// Bytes handed out by this mutator since its last flush.
    pub fn allocated_bytes(&mut self) -> usize {
        self.local().allocated_bytes
    }

    #[inline(always)]
    fn gc_flag(&self) -> &AtomicU32 {
        unsafe { &*self.safepoint_cond }
    }

    /// Poll for a pending stop. Returns true if this thread was parked for a collection.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        if self.gc_flag().load(Ordering::Relaxed) != 0 {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn safepoint_slow(&self) {
        self.set_gc_and_wait();
    }

    /// Park until the world resumes. The state is published before the flag is re-checked, so a
    /// cycle that starts right after the resume either sees this thread running or is seen here.
    pub(crate) fn set_gc_and_wait(&self) {
        let state = self.context.state.load(Ordering::Relaxed);
        loop {
            self.context.state.store(ThreadState::Waiting, Ordering::SeqCst);
            self.heap.safepoint.wait_resume();
            self.context.state.store(state, Ordering::SeqCst);
            if self.gc_flag().load(Ordering::SeqCst) == 0 {
                break;
            }
        }
    }

    pub(crate) fn state_set(&self, state: ThreadState, old_state: ThreadState) -> ThreadState {
        self.context.state.store(state, Ordering::SeqCst);
        if old_state.safe_for_safepoint()
            && !state.safe_for_safepoint()
            && self.gc_flag().load(Ordering::SeqCst) != 0
        {
            self.set_gc_and_wait();
        }
        old_state
    }

    pub(crate) fn state_save_and_set(&self, state: ThreadState) -> ThreadState {
        self.state_set(state, self.context.state.load(Ordering::Relaxed))
    }

    /// Promise not to touch the heap until the guard is dropped. Collections may run meanwhile.
    pub fn enter_safe(&self) -> SafeRegion<'_> {
        let state = self.state_save_and_set(ThreadState::Parked);
        SafeRegion {
            mutator: self,
            gc_state: state,
        }
    }

    /// Request a cycle and wait for it with this thread counted as stopped.
    ///
    /// Cycles cannot finish while this thread runs, so one that finishes after `seen` was read
    /// started after the need for it arose.
    pub(crate) fn block_for_gc(&self, request: GcRequest) {
        let barrier = &self.heap.collection_barrier;
        let seen = barrier.completed_cycles();
        let old = self.state_save_and_set(ThreadState::Waiting);
        let target = barrier.request_gc(request, seen);
        barrier.wait_for_completion(target);
        self.state_set(old, ThreadState::Waiting);
    }

    /// Allocate `size` bytes such that `result + offset` is aligned to `align`.
    ///
    /// The memory is zeroed and belongs to the caller alone. May block for a collection.
    pub fn alloc(
        &mut self,
        size: usize,
        align: usize,
        offset: isize,
        semantics: AllocationSemantics,
    ) -> Result<Address, AllocError> {
        self.safepoint();
        if !align.is_power_of_two()
            || !(MIN_ALIGNMENT..=BYTES_IN_PAGE).contains(&align)
            || offset.rem_euclid(MIN_ALIGNMENT as isize) != 0
        {
            fatal!(
                "unsupported allocation request: size={} align={} offset={}",
                size,
                align,
                offset
            );
        }
        // Only the bias below `align` matters from here on.
        let offset = offset.rem_euclid(align as isize) as usize;
        let requested = size;
        let size = match size.max(MIN_ALIGNMENT).checked_add(MIN_ALIGNMENT - 1) {
            Some(padded) if padded <= self.heap.controller.reservation() => {
                align_down(padded, MIN_ALIGNMENT)
            }
            _ => return Err(self.out_of_memory(requested, semantics)),
        };
        if self.heap.controller.note_allocation(size) && self.heap.collection_enabled() {
            self.block_for_gc(GcRequest::NORMAL);
        }
        let route = self.route(size, align, offset, semantics);
        let result = match self.alloc_fast(route, size, align, offset) {
            Some(result) => result,
            None => self.alloc_slow(route, size, align, offset, semantics)?,
        };
        let (heap, local) = self.parts();
        heap.metadata.alloc.set(result);
        local.allocated_bytes += size;
        Ok(result)
    }

    fn route(
        &self,
        size: usize,
        align: usize,
        offset: usize,
        semantics: AllocationSemantics,
    ) -> Route {
        match self.mapping.get(semantics) {
            AllocatorSelector::BumpPointer(_)
                if size <= MAX_NON_LOS_ALLOC_BYTES || semantics == AllocationSemantics::Immortal =>
            {
                Route::Bump
            }
            AllocatorSelector::FreeList(space) => {
                // Cells are aligned to `align`, a biased object starts that far into its cell.
                let displacement = (align - offset) % align;
                let classes = self.heap.mark_sweep_space(space).size_classes();
                match classes.class_for(size + displacement, align) {
                    Some(class) => Route::FreeList {
                        space: space as usize,
                        class,
                        cell_size: classes.cell_size(class),
                        displacement,
                    },
                    None => Route::Large,
                }
            }
            AllocatorSelector::None => {
                fatal!("no allocator for {:?} semantics", semantics)
            }
            _ => Route::Large,
        }
    }

    #[inline(always)]
    fn alloc_fast(
        &mut self,
        route: Route,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Option<Address> {
        let local = self.local();
        match route {
            Route::Bump => local.bump.alloc_fast(size, align, offset),
            Route::FreeList {
                space,
                class,
                cell_size,
                displacement,
            } => local.free_lists[space]
                .alloc_fast(class, cell_size)
                .map(|cell| cell.add(displacement)),
            Route::Large => None,
        }
    }

    fn refill(
        &mut self,
        route: Route,
        size: usize,
        align: usize,
        offset: usize,
        cap: ReserveCap,
    ) -> Option<Address> {
        let (heap, local) = self.parts();
        match route {
            Route::Bump => local.bump.refill(heap, size, align, offset, cap),
            Route::FreeList {
                space,
                class,
                cell_size,
                displacement,
            } => local.free_lists[space]
                .refill(heap, class, cell_size, cap)
                .map(|cell| cell.add(displacement)),
            Route::Large => local.los.alloc(heap, size, align, offset, cap),
        }
    }

    /// Grow within the trigger, then collect; grow to the maximum heap, then collect as an
    /// emergency; after that the request fails.
    #[cold]
    fn alloc_slow(
        &mut self,
        route: Route,
        size: usize,
        align: usize,
        offset: usize,
        semantics: AllocationSemantics,
    ) -> Result<Address, AllocError> {
        const EMERGENCY: GcRequest = GcRequest {
            full: true,
            emergency: true,
        };
        let attempts: &[(ReserveCap, Option<GcRequest>)] = if self.heap.collection_enabled() {
            &[
                (ReserveCap::Limit, Some(GcRequest::NORMAL)),
                (ReserveCap::Max, Some(EMERGENCY)),
                (ReserveCap::Max, None),
            ]
        } else {
            &[(ReserveCap::Max, None)]
        };
        for &(cap, on_failure) in attempts {
            if let Some(result) = self.refill(route, size, align, offset, cap) {
                return Ok(result);
            }
            if let Some(request) = on_failure {
                log::debug!(
                    "allocation of {} bytes ({:?}) exhausted {:?}, requesting collection",
                    size,
                    semantics,
                    cap
                );
                self.block_for_gc(request);
            }
        }
        Err(self.out_of_memory(size, semantics))
    }

    #[cold]
    fn out_of_memory(&self, size: usize, semantics: AllocationSemantics) -> AllocError {
        let error = AllocError::OutOfMemory { size, semantics };
        self.heap.host.out_of_memory(self.tls(), &error);
        error
    }

    /// Record engine metadata for a freshly initialised object.
    pub fn post_alloc(&mut self, object: ObjectReference, bytes: usize, semantics: AllocationSemantics) {
        let addr = object.to_raw_address();
        if !self.heap.in_reservation(addr) {
            fatal!(
                "post_alloc of {:?} ({} bytes, {:?}) outside the heap",
                object,
                bytes,
                semantics
            );
        }
        self.heap.metadata.alloc.set(addr);
    }

    pub fn add_weak_candidate(&mut self, reference: ObjectReference) {
        let (heap, local) = self.parts();
        stage(&mut local.candidates.weak, reference, |refs| {
            heap.weak_refs.add_candidates(refs)
        });
    }

    pub fn add_soft_candidate(&mut self, reference: ObjectReference) {
        let (heap, local) = self.parts();
        stage(&mut local.candidates.soft, reference, |refs| {
            heap.soft_refs.add_candidates(refs)
        });
    }

    pub fn add_phantom_candidate(&mut self, reference: ObjectReference) {
        let (heap, local) = self.parts();
        stage(&mut local.candidates.phantom, reference, |refs| {
            heap.phantom_refs.add_candidates(refs)
        });
    }

    pub fn add_finalizer(&mut self, object: ObjectReference) {
        let (heap, local) = self.parts();
        if heap.options().no_finalizer {
            return;
        }
        stage(&mut local.candidates.finalizers, object, |objects| {
            heap.finalizers.add_candidates(objects)
        });
    }

    /// Hand every thread-local buffer to the engine. Calling it twice is harmless.
    pub fn flush(&mut self) {
        let (heap, local) = self.parts();
        local.flush(heap);
    }

    pub fn handle_user_collection_request(&self) {
        self.heap.handle_user_collection_request(self.tls());
    }
}

/// Push into a staging buffer and spill it through `flush` once it is full.
#[inline]
fn stage(
    buffer: &mut Vec<ObjectReference>,
    object: ObjectReference,
    flush: impl FnOnce(Vec<ObjectReference>),
) {
    buffer.push(object);
    if buffer.len() >= LOCAL_BUFFER_CAPACITY {
        flush(std::mem::take(buffer));
    }
}

/// Guard returned by [`Mutator::enter_safe`].
pub struct SafeRegion<'a> {
    mutator: &'a Mutator,
    gc_state: ThreadState,
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.mutator.state_save_and_set(self.gc_state);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.context.state.store(ThreadState::Parked, Ordering::SeqCst);
        let heap = self.heap.clone();
        let mut world = heap.safepoint.lock_registry();
        self.flush();
        if !world.remove(self as *const Self) {
            fatal!("destroying a mutator that is not bound");
        }
        drop(world);
        CURRENT_MUTATOR.with(|current| {
            if current.get() == self as *const Self {
                current.set(std::ptr::null());
            }
        });
        log::trace!("mutator {:?} detached", self.tls());
    }
}
