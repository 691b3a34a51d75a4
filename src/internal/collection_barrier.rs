use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// What a requester needs from the next cycle. Requests that coalesce are merged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GcRequest {
    /// Collect the whole heap even when a nursery collection would do.
    pub full: bool,
    /// The previous attempt to satisfy an allocation failed; clear soft references too.
    pub emergency: bool,
}

impl GcRequest {
    pub const NORMAL: Self = GcRequest {
        full: false,
        emergency: false,
    };

    fn merge(self, other: Self) -> Self {
        GcRequest {
            full: self.full || other.full,
            emergency: self.emergency || other.emergency,
        }
    }

    /// A cycle run for `self` does everything a cycle run for `other` would.
    pub fn covers(self, other: Self) -> bool {
        (self.full || !other.full) && (self.emergency || !other.emergency)
    }
}

struct BarrierState {
    requested: Option<GcRequest>,
    /// What the running cycle was started for.
    running: Option<GcRequest>,
    /// What the last finished cycle was started for.
    last: GcRequest,
    completed: usize,
    shutdown_requested: bool,
}

/// This structure parks the controller between cycles and the threads waiting for a cycle to
/// finish. Any number of requests made before or during a cycle are satisfied by that cycle,
/// unless they ask for more than the running cycle does.
pub struct CollectionBarrier {
    state: Mutex<BarrierState>,
    cv_wakeup: Condvar,
    cv_completed: Condvar,
    collection_requested: AtomicBool,
    completed: AtomicUsize,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                requested: None,
                running: None,
                last: GcRequest::NORMAL,
                completed: 0,
                shutdown_requested: false,
            }),
            cv_wakeup: Condvar::new(),
            cv_completed: Condvar::new(),
            collection_requested: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn was_gc_requested(&self) -> bool {
        self.collection_requested.load(Ordering::Relaxed)
    }

    pub fn completed_cycles(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Request a cycle and return the cycle count the caller has to wait for.
    ///
    /// `seen` is the cycle count the caller observed when it decided it needs a cycle. A cycle
    /// that finished since then, or the running one, absorbs the request if it covers it.
    pub fn request_gc(&self, request: GcRequest, seen: usize) -> usize {
        let mut state = self.state.lock();
        if state.completed > seen && state.last.covers(request) {
            return state.completed;
        }
        let after = match state.running {
            Some(running) if running.covers(request) => return state.completed + 1,
            Some(_) => 2,
            None => 1,
        };
        let was_already_requested = state.requested.is_some();
        state.requested = Some(match state.requested {
            Some(pending) => pending.merge(request),
            None => request,
        });
        self.collection_requested.store(true, Ordering::Release);
        if !was_already_requested {
            log::trace!("collection requested: {:?}", request);
            self.cv_wakeup.notify_all();
        }
        state.completed + after
    }

    /// Block until cycle `target` has finished or the engine shuts down.
    pub fn wait_for_completion(&self, target: usize) {
        let mut state = self.state.lock();
        while state.completed < target && !state.shutdown_requested {
            self.cv_completed.wait(&mut state);
        }
    }

    /// Controller side: sleep until a cycle is requested. `None` means shut down.
    pub fn wait_for_request(&self) -> Option<GcRequest> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown_requested {
                return None;
            }
            if let Some(request) = state.requested.take() {
                state.running = Some(request);
                self.collection_requested.store(false, Ordering::Release);
                return Some(request);
            }
            self.cv_wakeup.wait(&mut state);
        }
    }

    pub fn resume_threads_awaiting_collection(&self) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.take() {
            state.last = running;
        }
        state.completed += 1;
        self.completed.store(state.completed, Ordering::Release);
        if state.requested.is_some() {
            self.collection_requested.store(true, Ordering::Release);
        }
        self.cv_completed.notify_all();
    }

    pub fn notify_shutdown_requested(&self) {
        let mut state = self.state.lock();
        state.shutdown_requested = true;
        self.cv_wakeup.notify_all();
        self.cv_completed.notify_all();
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const EMERGENCY: GcRequest = GcRequest {
        full: true,
        emergency: true,
    };

    #[test]
    fn requests_before_a_cycle_coalesce() {
        let barrier = CollectionBarrier::new();
        let a = barrier.request_gc(GcRequest::NORMAL, 0);
        let b = barrier.request_gc(
            GcRequest {
                full: true,
                emergency: false,
            },
            0,
        );
        assert_eq!(a, b);
        let merged = barrier.wait_for_request().unwrap();
        assert!(merged.full);
        assert!(!merged.emergency);
        // Joins the running cycle.
        assert_eq!(barrier.request_gc(GcRequest::NORMAL, 0), a);
        barrier.resume_threads_awaiting_collection();
        assert_eq!(barrier.completed_cycles(), 1);
        assert!(!barrier.was_gc_requested());
    }

    #[test]
    fn escalation_during_a_cycle_gets_its_own_cycle() {
        let barrier = CollectionBarrier::new();
        assert_eq!(barrier.request_gc(GcRequest::NORMAL, 0), 1);
        assert_eq!(barrier.wait_for_request(), Some(GcRequest::NORMAL));

        let target = barrier.request_gc(EMERGENCY, 0);
        assert_eq!(target, 2);
        assert_eq!(barrier.request_gc(GcRequest::NORMAL, 0), 1);
        barrier.resume_threads_awaiting_collection();
        assert_eq!(barrier.completed_cycles(), 1);
        assert!(barrier.was_gc_requested());

        assert_eq!(barrier.wait_for_request(), Some(EMERGENCY));
        barrier.resume_threads_awaiting_collection();
        assert_eq!(barrier.completed_cycles(), target);
    }

    #[test]
    fn cycle_finished_since_the_need_absorbs_the_request() {
        let barrier = CollectionBarrier::new();
        barrier.request_gc(GcRequest::NORMAL, 0);
        barrier.wait_for_request();
        barrier.resume_threads_awaiting_collection();

        // Observed zero cycles, one finished meanwhile.
        assert_eq!(barrier.request_gc(GcRequest::NORMAL, 0), 1);
        assert!(!barrier.was_gc_requested());
        // A normal cycle does not satisfy an emergency.
        assert_eq!(barrier.request_gc(EMERGENCY, 0), 2);
        assert!(barrier.was_gc_requested());
    }

    #[test]
    fn waiters_wake_on_completion() {
        let barrier = Arc::new(CollectionBarrier::new());
        let target = barrier.request_gc(GcRequest::NORMAL, 0);
        let waiter = {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.wait_for_completion(target))
        };
        assert!(barrier.wait_for_request().is_some());
        barrier.resume_threads_awaiting_collection();
        waiter.join().unwrap();
        barrier.notify_shutdown_requested();
        assert!(barrier.wait_for_request().is_none());
    }
}
