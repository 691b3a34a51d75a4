use parking_lot::{Condvar, Mutex};

use crate::collector::GcWorker;

/// Groups of work packets. The controller opens one stage at a time; packets of a closed stage
/// wait in their bucket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum WorkStage {
    RootScan = 0,
    Closure = 1,
    Sweep = 2,
}

const STAGES: usize = 3;

pub trait GcWork: Send {
    fn do_work(&mut self, worker: &mut GcWorker);
}

struct SchedulerState {
    buckets: [Vec<Box<dyn GcWork>>; STAGES],
    open: Option<WorkStage>,
    /// Packets taken by workers and not finished yet.
    active: usize,
    shutdown: bool,
}

impl SchedulerState {
    fn open_bucket_is_empty(&self) -> bool {
        match self.open {
            Some(stage) => self.buckets[stage as usize].is_empty(),
            None => true,
        }
    }
}

pub struct WorkScheduler {
    state: Mutex<SchedulerState>,
    cv_work: Condvar,
    cv_done: Condvar,
}

impl WorkScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                buckets: [Vec::new(), Vec::new(), Vec::new()],
                open: None,
                active: 0,
                shutdown: false,
            }),
            cv_work: Condvar::new(),
            cv_done: Condvar::new(),
        }
    }

    pub fn add(&self, stage: WorkStage, work: impl GcWork + 'static) {
        self.add_boxed(stage, Box::new(work));
    }

    pub fn add_boxed(&self, stage: WorkStage, work: Box<dyn GcWork>) {
        let mut state = self.state.lock();
        state.buckets[stage as usize].push(work);
        if state.open == Some(stage) {
            self.cv_work.notify_one();
        }
    }

    /// Open `stage` and block until its bucket is drained and no packet is running. Packets may
    /// add more packets to the open stage while it runs.
    pub fn run_stage(&self, stage: WorkStage) {
        let mut state = self.state.lock();
        debug_assert!(state.open.is_none());
        state.open = Some(stage);
        self.cv_work.notify_all();
        while !(state.open_bucket_is_empty() && state.active == 0) {
            self.cv_done.wait(&mut state);
        }
        state.open = None;
    }

    /// Next packet of the open stage. Blocks while there is none; `None` once shut down.
    pub(crate) fn poll(&self) -> Option<Box<dyn GcWork>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(stage) = state.open {
                if let Some(work) = state.buckets[stage as usize].pop() {
                    state.active += 1;
                    return Some(work);
                }
            }
            self.cv_work.wait(&mut state);
        }
    }

    pub(crate) fn work_done(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active == 0 && state.open_bucket_is_empty() {
            self.cv_done.notify_all();
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cv_work.notify_all();
    }
}

impl Default for WorkScheduler {
    fn default() -> Self {
        Self::new()
    }
}
