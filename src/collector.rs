//! The collector threads and the cycle they run.
//!
//! One controller thread sleeps on the collection barrier and drives every cycle through its
//! phases. Worker threads execute the work packets the controller opens stage by stage.
use std::sync::Arc;
use std::time::Instant;

use crate::barrier::RememberedSet;
use crate::heap::{Heap, Phase};
use crate::internal::collection_barrier::GcRequest;
use crate::marking::{ScanHostRoots, TraceWork};
use crate::sweeper::{schedule_space, unswept_live_bytes, SweepLargeObjects};
use crate::task_scheduler::WorkStage;
use crate::util::constants::{BYTES_IN_WORD, TRACE_PACKET_CAPACITY};
use crate::util::{Address, ObjectReference, VMThread};

/// Thread context handed to [`Host::spawn_gc_thread`](crate::vm::Host::spawn_gc_thread).
pub enum GcThreadContext {
    Controller(Box<GcController>),
    Worker(Box<GcWorker>),
}

impl GcThreadContext {
    pub fn thread_name(&self) -> String {
        match self {
            Self::Controller(_) => "comet-gc-controller".to_string(),
            Self::Worker(worker) => format!("comet-gc-worker-{}", worker.ordinal),
        }
    }

    /// Run the context on the calling thread until the engine shuts down.
    pub fn run(self, tls: VMThread) {
        match self {
            Self::Controller(controller) => controller.run(tls),
            Self::Worker(mut worker) => worker.run(tls),
        }
    }
}

pub struct GcWorker {
    heap: Arc<Heap>,
    ordinal: usize,
}

impl GcWorker {
    pub(crate) fn new(heap: Arc<Heap>, ordinal: usize) -> Self {
        Self { heap, ordinal }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn run(&mut self, tls: VMThread) {
        let heap = self.heap.clone();
        log::debug!("collector worker {} started on {:?}", self.ordinal, tls);
        while let Some(mut work) = heap.scheduler.poll() {
            work.do_work(self);
            heap.scheduler.work_done();
        }
        log::debug!("collector worker {} exiting", self.ordinal);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CycleKind {
    Full,
    Nursery,
}

pub struct GcController {
    heap: Arc<Heap>,
}

impl GcController {
    pub(crate) fn new(heap: Arc<Heap>) -> Self {
        Self { heap }
    }

    pub fn run(&self, tls: VMThread) {
        log::debug!("collector controller started on {:?}", tls);
        while let Some(request) = self.heap.collection_barrier.wait_for_request() {
            self.collect(tls, request);
            self.heap.collection_barrier.resume_threads_awaiting_collection();
        }
        log::debug!("collector controller exiting");
    }

    fn cycle_kind(&self, request: GcRequest) -> CycleKind {
        let heap = &*self.heap;
        let full = !heap.is_sticky()
            || request.full
            || request.emergency
            || heap.take_next_gc_full();
        if full {
            CycleKind::Full
        } else {
            CycleKind::Nursery
        }
    }

    fn collect(&self, tls: VMThread, request: GcRequest) {
        let heap = &*self.heap;
        let start = Instant::now();
        let world = heap.safepoint.lock_registry();
        heap.host.stop_all_mutators(tls, &world);

        let kind = self.cycle_kind(request);
        logln_if!(
            heap.options().verbose,
            "[GC] {:?} collection started ({} mutators, {} used)",
            kind,
            world.mutator_count(),
            heap.used_bytes()
        );

        heap.set_phase(Phase::RootScan);
        unsafe {
            world.prepare_mutators(heap);
        }
        heap.prepare_spaces(kind == CycleKind::Full);
        let remembered = heap.remembered.lock().take();
        self.schedule_roots(kind, &remembered);
        heap.scheduler.run_stage(WorkStage::RootScan);

        heap.set_phase(Phase::Tracing);
        heap.scheduler.run_stage(WorkStage::Closure);
        let cleared = self.process_references(request);
        heap.code_cache.end_scan();

        heap.set_phase(Phase::Sweep);
        heap.reset_sweep_result();
        for space in 0..2u8 {
            schedule_space(
                &heap.scheduler,
                space,
                heap.mark_sweep_space(space).built_blocks(),
            );
        }
        heap.scheduler.add(WorkStage::Sweep, SweepLargeObjects);
        heap.scheduler.run_stage(WorkStage::Sweep);
        let mut swept = heap.take_sweep_result();
        swept.merge(unswept_live_bytes(&heap.immortal));

        heap.set_phase(Phase::ReferenceProcessing);
        if !cleared.is_empty() {
            heap.host.enqueue_references(&cleared);
        }
        let finalizable = heap.finalizers.publish();
        if kind == CycleKind::Nursery {
            for object in remembered.objects.iter() {
                heap.metadata.unlog.set(object.to_raw_address());
            }
        }
        heap.controller.update_after_collection();
        if kind == CycleKind::Nursery
            && heap.controller.used_bytes() > heap.controller.limit() / 10 * 9
        {
            heap.request_next_gc_full();
        }

        heap.set_phase(Phase::Idle);
        heap.host.resume_mutators(tls, &world);
        drop(world);

        let pause = start.elapsed();
        let mut stats = heap.stats.lock();
        stats.record_pause(pause);
        if kind == CycleKind::Nursery {
            stats.nursery_collections += 1;
        }
        if request.emergency {
            stats.emergency_collections += 1;
        }
        stats.freed_bytes += swept.freed_bytes;
        stats.live_bytes = heap.controller.used_bytes();
        stats.heap_limit = heap.controller.limit();
        logln_if!(
            heap.options().verbose,
            "[GC] {:?} collection finished in {:.2}ms: freed {} bytes, {} references cleared, \
             {} objects finalizable, next trigger at {}",
            kind,
            pause.as_secs_f64() * 1000.0,
            swept.freed_bytes,
            cleared.len(),
            finalizable,
            stats.heap_limit
        );
    }

    fn schedule_roots(&self, kind: CycleKind, remembered: &RememberedSet) {
        let heap = &*self.heap;
        heap.scheduler.add(WorkStage::RootScan, ScanHostRoots);
        add_slot_packets(heap, heap.code_cache.begin_scan());
        add_object_packets(heap, heap.finalizers.ready_objects(), TraceWork::from_objects);
        add_object_packets(heap, remembered.satb.clone(), TraceWork::from_objects);
        if kind == CycleKind::Nursery {
            add_object_packets(heap, remembered.objects.clone(), TraceWork::scan);
            let slots = remembered
                .regions
                .iter()
                .flat_map(|&(start, count)| {
                    (0..count).map(move |i| start.add(i * BYTES_IN_WORD))
                })
                .collect();
            add_slot_packets(heap, slots);
        }
    }

    /// Classify references after the strong closure. Returns the references whose referents
    /// were cleared.
    fn process_references(&self, request: GcRequest) -> Vec<ObjectReference> {
        let heap = &*self.heap;
        let strong_references = heap.options().no_reference_types;
        let mut cleared = Vec::new();

        if strong_references {
            self.trace_to_fixpoint(|| {
                let mut referents = heap.soft_refs.unmarked_referents(heap);
                referents.extend(heap.weak_refs.unmarked_referents(heap));
                referents.extend(heap.phantom_refs.unmarked_referents(heap));
                referents
            });
        } else if !request.emergency {
            self.trace_to_fixpoint(|| heap.soft_refs.unmarked_referents(heap));
        }
        if !strong_references {
            heap.soft_refs.scan(heap, &mut cleared);
            heap.weak_refs.scan(heap, &mut cleared);
        }

        let found = heap.finalizers.scan(heap);
        if !found.is_empty() {
            add_object_packets(heap, found, TraceWork::from_objects);
            heap.scheduler.run_stage(WorkStage::Closure);
        }

        if !strong_references {
            heap.phantom_refs.scan(heap, &mut cleared);
        }
        cleared
    }

    /// Trace whatever `roots` returns until it returns nothing.
    fn trace_to_fixpoint(&self, mut roots: impl FnMut() -> Vec<ObjectReference>) {
        loop {
            let objects = roots();
            if objects.is_empty() {
                return;
            }
            add_object_packets(&self.heap, objects, TraceWork::from_objects);
            self.heap.scheduler.run_stage(WorkStage::Closure);
        }
    }
}

fn add_slot_packets(heap: &Heap, slots: Vec<Address>) {
    for chunk in slots.chunks(TRACE_PACKET_CAPACITY) {
        heap.scheduler
            .add(WorkStage::Closure, TraceWork::from_slots(chunk.to_vec()));
    }
}

fn add_object_packets(
    heap: &Heap,
    objects: Vec<ObjectReference>,
    packet: fn(Vec<ObjectReference>) -> TraceWork,
) {
    for chunk in objects.chunks(TRACE_PACKET_CAPACITY) {
        heap.scheduler
            .add(WorkStage::Closure, packet(chunk.to_vec()));
    }
}
