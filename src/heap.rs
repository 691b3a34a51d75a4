//! The engine object shared by every mutator and collector thread.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic::Atomic;
use parking_lot::Mutex;
use thiserror::Error;

use crate::allocator::{AllocationSemantics, AllocatorMapping, AllocatorSelector};
use crate::barrier::RememberedSet;
use crate::bump_pointer_space::ImmortalSpace;
use crate::collector::{GcController, GcThreadContext, GcWorker};
use crate::finalizer::FinalizerQueue;
use crate::heap_controller::HeapController;
use crate::internal::collection_barrier::{CollectionBarrier, GcRequest};
use crate::large_space::LargeObjectSpace;
use crate::mmap::Mmap;
use crate::mutator::Mutator;
use crate::options::{BarrierSelector, OptionError, Options, PlanSelector};
use crate::reference_processor::{ReferenceKind, ReferenceProcessor};
use crate::roots::CodeCacheRoots;
use crate::safepoint::GlobalSafepoint;
use crate::segregated_space::{MarkSweepSpace, SweepResult};
use crate::space::{Region, SideMetadata, Space};
use crate::statistics::HeapStatistics;
use crate::task_scheduler::WorkScheduler;
use crate::util::constants::{BLOCK_SIZE, MAX_NON_LOS_ALLOC_BYTES, MIN_ALIGNMENT};
use crate::util::{align_down, Address, ObjectReference, VMThread};
use crate::vm::Host;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Options(#[from] OptionError),
    #[error("failed to reserve {size} bytes of address space")]
    Reservation {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to map side metadata")]
    Metadata(#[source] io::Error),
}

/// Where the collector is in the current cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    RootScan = 1,
    Tracing = 2,
    Sweep = 3,
    ReferenceProcessing = 4,
}

/// Collects options before the engine exists. Options are frozen by [`EngineBuilder::build`].
#[derive(Clone, Debug, Default)]
pub struct EngineBuilder {
    options: Options,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Set one option. Returns false and changes nothing if it is rejected.
    pub fn set_option(&mut self, key: &str, value: &str) -> bool {
        match self.options.process(key, value) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("{}", err);
                false
            }
        }
    }

    /// Set whitespace separated `key=value` pairs, all or nothing.
    pub fn set_options_bulk(&mut self, options: &str) -> bool {
        match self.options.process_bulk(options) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("{}", err);
                false
            }
        }
    }

    pub fn set_heap_size(&mut self, min: usize, max: usize) -> bool {
        let trigger = crate::options::GcTriggerSelector::from_bounds(min, max);
        self.set_option("gc_trigger", &trigger.to_string())
    }

    pub fn read_env_var_settings(&mut self) -> &mut Self {
        self.options.read_env_var_settings();
        self
    }

    pub fn build(self, host: impl Host) -> Result<Arc<Heap>, EngineError> {
        Heap::new(self.options, Box::new(host))
    }
}

pub struct Heap {
    options: Options,
    region: Region,
    _mmap: Arc<Mmap>,
    mapping: AllocatorMapping,
    barrier: BarrierSelector,
    pub(crate) host: Box<dyn Host>,
    pub(crate) controller: HeapController,
    pub(crate) metadata: SideMetadata,
    pub(crate) immortal: ImmortalSpace,
    /// Default and non-moving mark-sweep spaces, indexed by `FreeList(n)`.
    mark_sweep: [MarkSweepSpace; 2],
    pub(crate) los: LargeObjectSpace,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) collection_barrier: CollectionBarrier,
    pub(crate) scheduler: WorkScheduler,
    pub(crate) weak_refs: ReferenceProcessor,
    pub(crate) soft_refs: ReferenceProcessor,
    pub(crate) phantom_refs: ReferenceProcessor,
    pub(crate) finalizers: FinalizerQueue,
    pub(crate) code_cache: CodeCacheRoots,
    pub(crate) remembered: Mutex<RememberedSet>,
    pub(crate) stats: Mutex<HeapStatistics>,
    sweep_result: Mutex<SweepResult>,
    phase: Atomic<Phase>,
    collection_initialized: AtomicBool,
    collection_enabled: AtomicBool,
    next_gc_full: AtomicBool,
}

impl Heap {
    /// Reserve the heap and set up every space. Collection stays off until
    /// [`Heap::initialize_collection`].
    pub fn new(options: Options, host: Box<dyn Host>) -> Result<Arc<Heap>, EngineError> {
        options.validate()?;
        let size = options.heap_reservation;
        let mmap = Arc::new(
            Mmap::new(size + BLOCK_SIZE).map_err(|source| EngineError::Reservation { size, source })?,
        );
        let start = mmap.aligned(BLOCK_SIZE);
        let region = Region::new(start, size);
        let unit = align_down(size / 8, BLOCK_SIZE);
        let immortal = Region::new(start, unit);
        let default = Region::new(immortal.end, 3 * unit);
        let non_moving = Region::new(default.end, unit);
        let large = Region::new(non_moving.end, size - 5 * unit);
        let metadata = SideMetadata::new(region).map_err(EngineError::Metadata)?;

        let heap = Heap {
            mapping: AllocatorMapping::for_plan(options.plan),
            barrier: options.effective_barrier(),
            controller: HeapController::new(&options),
            metadata,
            immortal: ImmortalSpace::new(immortal),
            mark_sweep: [
                MarkSweepSpace::new("default", default, mmap.clone()),
                MarkSweepSpace::new("non-moving", non_moving, mmap.clone()),
            ],
            los: LargeObjectSpace::new(large, mmap.clone()),
            safepoint: GlobalSafepoint::new(),
            collection_barrier: CollectionBarrier::new(),
            scheduler: WorkScheduler::new(),
            weak_refs: ReferenceProcessor::new(ReferenceKind::Weak),
            soft_refs: ReferenceProcessor::new(ReferenceKind::Soft),
            phantom_refs: ReferenceProcessor::new(ReferenceKind::Phantom),
            finalizers: FinalizerQueue::new(),
            code_cache: CodeCacheRoots::new(),
            remembered: Mutex::new(RememberedSet::default()),
            stats: Mutex::new(HeapStatistics::default()),
            sweep_result: Mutex::new(SweepResult::default()),
            phase: Atomic::new(Phase::Idle),
            collection_initialized: AtomicBool::new(false),
            collection_enabled: AtomicBool::new(false),
            next_gc_full: AtomicBool::new(false),
            host,
            region,
            _mmap: mmap,
            options,
        };
        logln_if!(
            heap.options.verbose,
            "heap reserved at {}..{} ({:?}, {}, trigger {})",
            heap.region.start,
            heap.region.end,
            heap.options.plan,
            heap.barrier.name(),
            heap.options.gc_trigger
        );
        Ok(Arc::new(heap))
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn phase(&self) -> Phase {
        self.phase.load(Ordering::SeqCst)
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        log::trace!("phase {:?}", phase);
        self.phase.store(phase, Ordering::SeqCst);
    }

    pub(crate) fn is_sticky(&self) -> bool {
        self.options.plan == PlanSelector::StickyMarkSweep
    }

    pub(crate) fn take_next_gc_full(&self) -> bool {
        self.next_gc_full.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn request_next_gc_full(&self) {
        self.next_gc_full.store(true, Ordering::Relaxed);
    }

    pub(crate) fn mark_sweep_space(&self, index: u8) -> &MarkSweepSpace {
        &self.mark_sweep[index as usize]
    }

    fn spaces(&self) -> [&dyn Space; 4] {
        [
            &self.immortal,
            &self.mark_sweep[0],
            &self.mark_sweep[1],
            &self.los,
        ]
    }

    /// Bind a mutator for the calling host thread.
    pub fn bind_mutator(self: &Arc<Self>, tls: VMThread) -> Box<Mutator> {
        let mutator = Box::new(Mutator::new(self.clone(), tls));
        self.safepoint
            .register(&*mutator as *const Mutator, mutator.context.clone());
        mutator.make_current();
        log::trace!("mutator bound for {:?}", tls);
        mutator
    }

    /// Flush and detach `mutator`.
    pub fn destroy_mutator(&self, mutator: Box<Mutator>) {
        drop(mutator);
    }

    pub(crate) fn allocator_mapping(&self) -> AllocatorMapping {
        self.mapping
    }

    pub fn get_allocator_mapping(&self, semantics: AllocationSemantics) -> AllocatorSelector {
        self.mapping.get(semantics)
    }

    pub fn get_max_non_los_default_alloc_bytes(&self) -> usize {
        MAX_NON_LOS_ALLOC_BYTES
    }

    pub(crate) fn barrier_selector(&self) -> BarrierSelector {
        self.barrier
    }

    pub fn active_barrier(&self) -> &'static str {
        self.barrier.name()
    }

    /// Spawn the controller and the workers through the host. Collections can run afterwards.
    pub fn initialize_collection(self: &Arc<Self>, tls: VMThread) {
        if self.collection_initialized.swap(true, Ordering::SeqCst) {
            log::warn!("collection already initialized");
            return;
        }
        if self.options.plan == PlanSelector::NoGC {
            log::debug!("NoGC plan: no collector threads");
            return;
        }
        self.host.spawn_gc_thread(
            tls,
            GcThreadContext::Controller(Box::new(GcController::new(self.clone()))),
        );
        for ordinal in 0..self.options.threads {
            self.host.spawn_gc_thread(
                tls,
                GcThreadContext::Worker(Box::new(GcWorker::new(self.clone(), ordinal))),
            );
        }
        self.collection_enabled.store(true, Ordering::SeqCst);
        logln_if!(
            self.options.verbose,
            "collection initialized with {} workers",
            self.options.threads
        );
    }

    pub fn start_control_collector(&self, tls: VMThread, controller: Box<GcController>) {
        controller.run(tls);
    }

    pub fn start_worker(&self, tls: VMThread, mut worker: Box<GcWorker>) {
        worker.run(tls);
    }

    pub fn is_collection_initialized(&self) -> bool {
        self.collection_initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn collection_enabled(&self) -> bool {
        self.collection_enabled.load(Ordering::SeqCst)
    }

    /// Stop every collector thread. Threads blocked on a collection are released.
    pub fn shutdown(&self) {
        self.collection_enabled.store(false, Ordering::SeqCst);
        self.collection_barrier.notify_shutdown_requested();
        self.scheduler.shutdown();
        log::debug!("engine shut down");
    }

    /// Request a cycle and block until it is done. The calling thread's mutator, if it has
    /// one, counts as stopped meanwhile.
    pub(crate) fn collect_and_wait(&self, request: GcRequest) {
        if !self.collection_enabled() {
            log::debug!("collection requested before it was initialized");
            return;
        }
        if let Some(mutator) = Mutator::current() {
            let mutator = unsafe { mutator.as_ref() };
            if std::ptr::eq(Arc::as_ptr(&mutator.heap), self) {
                mutator.block_for_gc(request);
                return;
            }
        }
        let seen = self.collection_barrier.completed_cycles();
        let target = self.collection_barrier.request_gc(request, seen);
        self.collection_barrier.wait_for_completion(target);
    }

    /// Explicit collection request from the host, e.g. `System.gc()`.
    pub fn handle_user_collection_request(&self, tls: VMThread) {
        if self.options.ignore_system_gc {
            log::debug!("{:?}: user collection request ignored", tls);
            return;
        }
        self.collect_and_wait(GcRequest {
            full: self.options.full_heap_system_gc,
            emergency: false,
        });
    }

    pub fn completed_collections(&self) -> usize {
        self.collection_barrier.completed_cycles()
    }

    pub fn harness_begin(&self, tls: VMThread) {
        self.host.harness_begin(tls, self);
    }

    pub fn harness_end(&self, tls: VMThread) {
        self.host.harness_end(tls, self);
    }

    /// Collect the whole heap and start a fresh statistics window.
    pub fn harness_begin_impl(&self, tls: VMThread) {
        log::info!("harness begin ({:?})", tls);
        self.collect_and_wait(GcRequest {
            full: true,
            emergency: false,
        });
        *self.stats.lock() = HeapStatistics::default();
    }

    pub fn harness_end_impl(&self, tls: VMThread) {
        let stats = self.statistics();
        log::info!("harness end ({:?})\n{}", tls, stats);
    }

    pub fn statistics(&self) -> HeapStatistics {
        self.stats.lock().clone()
    }

    pub fn set_heap_size(&self, min: usize, max: usize) -> bool {
        self.controller.set_heap_size(min, max)
    }

    pub fn used_bytes(&self) -> usize {
        self.controller.used_bytes()
    }

    pub fn free_bytes(&self) -> usize {
        self.controller.free_bytes()
    }

    pub fn total_bytes(&self) -> usize {
        self.controller.total_bytes()
    }

    pub fn starting_heap_address(&self) -> Address {
        self.region.start
    }

    pub fn last_heap_address(&self) -> Address {
        self.region.end
    }

    pub(crate) fn in_reservation(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    /// True if `addr` falls in the region of one of the spaces.
    pub fn is_in_spaces(&self, addr: Address) -> bool {
        self.spaces().iter().any(|space| space.contains(addr))
    }

    /// True if `addr` lies in a part of a space that has been handed out at some point.
    pub fn is_mapped_address(&self, addr: Address) -> bool {
        self.spaces().iter().any(|space| space.is_mapped(addr))
    }

    /// True if an object was allocated at `addr` and has not been reclaimed.
    pub fn is_mmtk_object(&self, addr: Address) -> bool {
        self.is_in_spaces(addr) && addr.is_aligned_to(MIN_ALIGNMENT) && self.metadata.alloc.test(addr)
    }

    /// Between cycles every allocated object is live; while a cycle runs only marked ones are.
    pub fn is_live_object(&self, object: ObjectReference) -> bool {
        if !self.is_mmtk_object(object.to_raw_address()) {
            return false;
        }
        self.phase() == Phase::Idle || self.is_marked(object)
    }

    pub(crate) fn is_marked(&self, object: ObjectReference) -> bool {
        self.metadata.is_marked(object)
    }

    pub fn will_never_move(&self, object: ObjectReference) -> bool {
        self.spaces()
            .iter()
            .find(|space| space.contains(object.to_raw_address()))
            .map_or(true, |space| !space.is_movable())
    }

    /// Abort if `object` is not a heap object or a cycle is running.
    pub fn modify_check(&self, object: ObjectReference) {
        if self.phase() != Phase::Idle {
            fatal!("{:?} modified during {:?}", object, self.phase());
        }
        if !self.is_mmtk_object(object.to_raw_address()) {
            fatal!("{:?} modified but is not a heap object", object);
        }
    }

    pub fn add_weak_candidate(&self, reference: ObjectReference) {
        self.weak_refs.add_candidate(reference);
    }

    pub fn add_soft_candidate(&self, reference: ObjectReference) {
        self.soft_refs.add_candidate(reference);
    }

    pub fn add_phantom_candidate(&self, reference: ObjectReference) {
        self.phantom_refs.add_candidate(reference);
    }

    pub fn add_finalizer(&self, object: ObjectReference) {
        if !self.options.no_finalizer {
            self.finalizers.add_candidate(object);
        }
    }

    /// Next object found unreachable with a finalizer registered, if any.
    pub fn get_finalized_object(&self) -> Option<ObjectReference> {
        self.finalizers.pop_ready()
    }

    pub fn add_nmethod_oop(&self, slot: Address) {
        self.code_cache.add_nmethod_oop(slot);
    }

    pub fn register_nmethod(&self, method: Address) {
        self.code_cache.register_nmethod(method);
    }

    pub fn unregister_nmethod(&self, method: Address) {
        self.code_cache.unregister_nmethod(method);
    }

    pub(crate) fn prepare_spaces(&self, full_heap: bool) {
        for space in self.mark_sweep.iter() {
            space.prepare(&self.metadata, full_heap);
        }
        self.los.prepare(&self.metadata, full_heap);
        if full_heap {
            self.metadata
                .mark
                .clear_range(self.immortal.region().start, self.immortal.high_water());
        }
    }

    pub(crate) fn reset_sweep_result(&self) {
        *self.sweep_result.lock() = SweepResult::default();
    }

    pub(crate) fn record_sweep(&self, result: SweepResult) {
        self.sweep_result.lock().merge(result);
    }

    pub(crate) fn take_sweep_result(&self) -> SweepResult {
        std::mem::take(&mut *self.sweep_result.lock())
    }
}
