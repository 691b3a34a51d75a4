//! Soft, weak and phantom reference candidates.
//!
//! A candidate is a reference object registered by the host. The engine never looks inside it;
//! the referent is read and cleared through [`Host::get_referent`] and [`Host::set_referent`].
//!
//! [`Host::get_referent`]: crate::vm::Host::get_referent
//! [`Host::set_referent`]: crate::vm::Host::set_referent
use parking_lot::Mutex;

use crate::heap::Heap;
use crate::util::ObjectReference;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

pub struct ReferenceProcessor {
    kind: ReferenceKind,
    candidates: Mutex<Vec<ObjectReference>>,
}

impl ReferenceProcessor {
    pub fn new(kind: ReferenceKind) -> Self {
        Self {
            kind,
            candidates: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn add_candidate(&self, reference: ObjectReference) {
        self.candidates.lock().push(reference);
    }

    pub fn add_candidates(&self, mut references: Vec<ObjectReference>) {
        if references.is_empty() {
            return;
        }
        self.candidates.lock().append(&mut references);
    }

    pub fn len(&self) -> usize {
        self.candidates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Referents of live candidates that are not marked yet. Tracing them keeps them alive
    /// for this cycle.
    pub fn unmarked_referents(&self, heap: &Heap) -> Vec<ObjectReference> {
        self.candidates
            .lock()
            .iter()
            .filter(|&&reference| heap.is_marked(reference))
            .filter_map(|&reference| heap.host.get_referent(reference))
            .filter(|&referent| heap.is_in_spaces(referent.to_raw_address()))
            .filter(|&referent| !heap.is_marked(referent))
            .collect()
    }

    /// Classify every candidate after the strong closure.
    ///
    /// Candidates whose reference object died are dropped. If the referent is unmarked it is
    /// cleared and the reference is appended to `cleared`; otherwise the candidate stays
    /// registered for the next cycle.
    pub fn scan(&self, heap: &Heap, cleared: &mut Vec<ObjectReference>) {
        let mut candidates = self.candidates.lock();
        candidates.sort_unstable();
        candidates.dedup();
        let before = candidates.len();
        candidates.retain(|&reference| {
            if !heap.is_marked(reference) {
                return false;
            }
            let referent = match heap.host.get_referent(reference) {
                Some(referent) => referent,
                None => return false,
            };
            if !heap.is_in_spaces(referent.to_raw_address()) || heap.is_marked(referent) {
                return true;
            }
            heap.host.set_referent(reference, None);
            cleared.push(reference);
            false
        });
        log::trace!(
            "{:?} references: {} candidates, {} retained",
            self.kind,
            before,
            candidates.len()
        );
    }
}
