use std::sync::{Arc, Condvar, Mutex};

use crate::internal::common::resources::ResourceDescription;

/// Completion signal for a capacity reduction that could not be honored
/// immediately. Completed by a later `release_resource` on the same worker.
#[derive(Debug, Clone)]
pub struct WaitHandle {
    inner: Arc<WaitShared>,
}

#[derive(Debug)]
struct WaitShared {
    done: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    pub(crate) fn new() -> Self {
        WaitHandle {
            inner: Arc::new(WaitShared {
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn complete(&self) {
        let mut done = self.inner.done.lock().unwrap();
        *done = true;
        self.inner.cond.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock().unwrap()
    }

    /// Blocks until the reduction has been committed. Bounded by "all running
    /// tasks eventually finish"; never called on the scheduling path.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap();
        while !*done {
            done = self.inner.cond.wait(done).unwrap();
        }
    }
}

/// Result of a capacity reduction request.
#[derive(Debug)]
pub enum ReductionOutcome {
    /// Enough idle capacity; the reduction was committed synchronously.
    Completed,
    /// Running tasks still hold part of the withdrawn capacity; the handle
    /// completes once releases have accumulated the pending amount.
    Pending(WaitHandle),
}

impl ReductionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReductionOutcome::Completed)
    }
}

/// A requested capacity withdrawal waiting for running tasks to release the
/// resources being removed.
#[derive(Debug)]
pub(crate) struct PendingReduction {
    pub remaining: ResourceDescription,
    pub handle: WaitHandle,
}
