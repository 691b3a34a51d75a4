use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::heap::Heap;
use crate::mutator::{Mutator, MutatorContext};

/// A bound mutator. `owner` identifies the `Mutator` box and is never dereferenced.
pub(crate) struct Registered {
    owner: usize,
    context: Arc<MutatorContext>,
}

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
pub struct GlobalSafepoint {
    mutators: Mutex<Vec<Registered>>,
    /// Polled by every mutator. Non-zero while the world is being stopped or is stopped.
    pub(crate) gc_running: AtomicU32,
    barrier: Barrier,
}

struct Barrier {
    mutex: Mutex<()>,
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            mutators: Mutex::new(Vec::new()),
            gc_running: AtomicU32::new(0),
            barrier: Barrier {
                mutex: Mutex::new(()),
                cv_resume: Condvar::new(),
            },
        }
    }

    pub(crate) fn register(&self, owner: *const Mutator, context: Arc<MutatorContext>) {
        self.mutators.lock().push(Registered {
            owner: owner as usize,
            context,
        });
    }

    pub(crate) fn is_registered(&self, owner: *const Mutator) -> bool {
        self.mutators
            .lock()
            .iter()
            .any(|m| m.owner == owner as usize)
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Lock the mutator registry. No mutator can bind or detach while the guard lives.
    pub fn lock_registry(&self) -> StoppedWorld<'_> {
        StoppedWorld {
            safepoint: self,
            mutators: self.mutators.lock(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.gc_running.load(Ordering::SeqCst) != 0
    }

    fn arm(&self) {
        let guard = self.barrier.mutex.lock();
        debug_assert!(!self.is_armed());
        self.gc_running.store(1, Ordering::SeqCst);
        drop(guard);
    }

    fn disarm(&self) {
        let guard = self.barrier.mutex.lock();
        self.gc_running.store(0, Ordering::SeqCst);
        self.barrier.cv_resume.notify_all();
        drop(guard);
    }

    /// Block the calling mutator until the world is resumed.
    pub(crate) fn wait_resume(&self) {
        let mut guard = self.barrier.mutex.lock();
        while self.gc_running.load(Ordering::SeqCst) != 0 {
            self.barrier.cv_resume.wait(&mut guard);
        }
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the set of bound mutators for the duration of a cycle.
pub struct StoppedWorld<'a> {
    safepoint: &'a GlobalSafepoint,
    mutators: MutexGuard<'a, Vec<Registered>>,
}

impl<'a> StoppedWorld<'a> {
    /// Arm the safepoint and wait until every mutator is parked or blocked.
    pub fn stop_cooperatively(&self) {
        self.safepoint.arm();
        let backoff = Backoff::new();
        while !self.all_stopped() {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        log::trace!("{} mutators stopped", self.mutators.len());
    }

    pub fn resume_cooperatively(&self) {
        self.safepoint.disarm();
    }

    fn all_stopped(&self) -> bool {
        self.mutators
            .iter()
            .all(|m| m.context.state().safe_for_safepoint())
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.len()
    }

    /// Flush the buffers of every mutator into the heap and drop their allocation buffers.
    ///
    /// # Safety
    /// Every mutator must be stopped and stay stopped until the world is resumed.
    pub(crate) unsafe fn prepare_mutators(&self, heap: &Heap) {
        for m in self.mutators.iter() {
            m.context.prepare_for_collection(heap);
        }
    }

    pub(crate) fn remove(&mut self, owner: *const Mutator) -> bool {
        let before = self.mutators.len();
        self.mutators.retain(|m| m.owner != owner as usize);
        before != self.mutators.len()
    }
}
