use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::heap::Heap;
use crate::util::ObjectReference;

/// Objects registered for finalization.
///
/// A candidate found unreachable moves to the ready queue and is kept alive until the host takes
/// it with [`FinalizerQueue::pop_ready`]. Every registration is delivered at most once.
#[derive(Default)]
pub struct FinalizerQueue {
    candidates: Mutex<Vec<ObjectReference>>,
    /// Found unreachable by the running cycle, published when it ends.
    pending: Mutex<Vec<ObjectReference>>,
    ready: Mutex<VecDeque<ObjectReference>>,
}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&self, object: ObjectReference) {
        self.candidates.lock().push(object);
    }

    pub fn add_candidates(&self, mut objects: Vec<ObjectReference>) {
        if objects.is_empty() {
            return;
        }
        self.candidates.lock().append(&mut objects);
    }

    /// Ready objects not yet taken by the host. They are roots.
    pub fn ready_objects(&self) -> Vec<ObjectReference> {
        self.ready.lock().iter().copied().collect()
    }

    /// Move unmarked candidates to the pending list and return them. The caller traces them.
    pub fn scan(&self, heap: &Heap) -> Vec<ObjectReference> {
        let mut candidates = self.candidates.lock();
        candidates.sort_unstable();
        candidates.dedup();
        let mut found = Vec::new();
        candidates.retain(|&object| {
            if heap.is_marked(object) {
                true
            } else {
                found.push(object);
                false
            }
        });
        self.pending.lock().extend_from_slice(&found);
        found
    }

    /// Make the objects found by the last scan available to the host.
    pub fn publish(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        self.ready.lock().extend(pending);
        count
    }

    pub fn pop_ready(&self) -> Option<ObjectReference> {
        self.ready.lock().pop_front()
    }
}
