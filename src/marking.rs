//! Transitive closure over the object graph.
use crate::collector::GcWorker;
use crate::heap::Heap;
use crate::task_scheduler::{GcWork, WorkStage};
use crate::util::constants::TRACE_PACKET_CAPACITY;
use crate::util::{Address, ObjectReference};
use crate::vm::RootVisitor;

/// Mark `object`. Returns true if this call marked it and the caller has to scan it.
///
/// Tracing a reference that does not name an allocated object is fatal: the host reported a
/// slot holding garbage.
#[inline]
pub fn trace_object(heap: &Heap, object: ObjectReference) -> bool {
    let addr = object.to_raw_address();
    if !heap.is_in_spaces(addr) {
        fatal!("traced {:?} which is outside the heap", object);
    }
    if !heap.metadata.alloc.test(addr) {
        fatal!("traced {:?} which is not an allocated object", object);
    }
    if heap.metadata.mark.atomic_test_and_set(addr) {
        return false;
    }
    if heap.is_sticky() {
        heap.metadata.unlog.set(addr);
    }
    true
}

/// One packet of tracing work: root slots to load, and objects to mark and scan.
#[derive(Default)]
pub struct TraceWork {
    slots: Vec<Address>,
    objects: Vec<ObjectReference>,
    /// `objects` were marked by whoever created the packet and only need scanning.
    scan_only: bool,
}

impl TraceWork {
    pub fn from_slots(slots: Vec<Address>) -> Self {
        Self {
            slots,
            ..Self::default()
        }
    }

    pub fn from_objects(objects: Vec<ObjectReference>) -> Self {
        Self {
            objects,
            ..Self::default()
        }
    }

    /// Objects that are already marked, or that must be scanned whether marked or not.
    pub fn scan(objects: Vec<ObjectReference>) -> Self {
        Self {
            objects,
            scan_only: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.objects.is_empty()
    }

    /// Trace everything reachable from this packet on the calling thread.
    pub fn trace(self, heap: &Heap) {
        self.run(heap, |heap, overflow| {
            heap.scheduler.add(WorkStage::Closure, TraceWork::scan(overflow))
        });
    }


    fn run(self, heap: &Heap, mut split: impl FnMut(&Heap, Vec<ObjectReference>)) {
        let mut stack = Vec::with_capacity(self.objects.len());
        for slot in self.slots {
            if let Some(object) = unsafe { slot.load_slot() } {
                if trace_object(heap, object) {
                    stack.push(object);
                }
            }
        }
        for object in self.objects {
            if self.scan_only || trace_object(heap, object) {
                stack.push(object);
            }
        }
        while let Some(object) = stack.pop() {
            heap.host.scan_object(object, &mut |slot: Address| {
                if let Some(child) = unsafe { slot.load_slot() } {
                    if trace_object(heap, child) {
                        stack.push(child);
                    }
                }
            });
            if stack.len() > TRACE_PACKET_CAPACITY {
                let half = stack.split_off(stack.len() / 2);
                split(heap, half);
            }
        }
    }
}

impl GcWork for TraceWork {
    fn do_work(&mut self, worker: &mut GcWorker) {
        std::mem::take(self).trace(worker.heap());
    }
}

/// Collects what the host reports from [`Host::scan_roots`](crate::vm::Host::scan_roots) into
/// trace packets.
pub struct RootCollector<'a> {
    heap: &'a Heap,
    packets: usize,
}

impl<'a> RootCollector<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap, packets: 0 }
    }

    pub fn packets(&self) -> usize {
        self.packets
    }
}

impl RootVisitor for RootCollector<'_> {
    fn visit_slots(&mut self, slots: &[Address]) {
        for chunk in slots.chunks(TRACE_PACKET_CAPACITY) {
            self.heap
                .scheduler
                .add(WorkStage::Closure, TraceWork::from_slots(chunk.to_vec()));
            self.packets += 1;
        }
    }

    fn visit_objects(&mut self, objects: &[ObjectReference]) {
        for chunk in objects.chunks(TRACE_PACKET_CAPACITY) {
            self.heap
                .scheduler
                .add(WorkStage::Closure, TraceWork::from_objects(chunk.to_vec()));
            self.packets += 1;
        }
    }
}

/// Asks the host for its roots. Runs in the root scan stage.
pub struct ScanHostRoots;

impl GcWork for ScanHostRoots {
    fn do_work(&mut self, worker: &mut GcWorker) {
        let heap = worker.heap();
        let mut collector = RootCollector::new(heap);
        heap.host.scan_roots(&mut collector);
        log::trace!("host reported {} root packets", collector.packets());
    }
}
