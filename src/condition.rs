//! Stopping conditions for [`Connection::wait_until`](crate::Connection::wait_until).
//!
//! A condition is polled after every completion the waiting thread observes, and once before the
//! thread blocks for the first time. It may keep state between polls; it is dropped when the wait
//! returns.
use crate::response::RemoteResponse;

/// Progress of a single `wait_until` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitProgress {
    /// Completions observed (and closures run) by this call so far.
    pub completed: usize,
    /// Requests of the calling thread still waiting for a reply or deadline.
    pub pending: usize,
}

pub trait StoppingCondition {
    fn should_stop(&mut self, progress: &WaitProgress) -> bool;
}

impl<F> StoppingCondition for F
where
    F: FnMut(&WaitProgress) -> bool,
{
    fn should_stop(&mut self, progress: &WaitProgress) -> bool {
        self(progress)
    }
}

/// Stops after `n` completions.
#[derive(Debug, Clone, Copy)]
pub struct Completions(pub usize);

impl StoppingCondition for Completions {
    fn should_stop(&mut self, progress: &WaitProgress) -> bool {
        progress.completed >= self.0
    }
}

/// Stops after the first completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyCompletion;

impl StoppingCondition for AnyCompletion {
    fn should_stop(&mut self, progress: &WaitProgress) -> bool {
        progress.completed >= 1
    }
}

/// Stops once nothing is pending on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPending;

impl StoppingCondition for AllPending {
    fn should_stop(&mut self, progress: &WaitProgress) -> bool {
        progress.pending == 0
    }
}

/// Stops once a specific response reaches a terminal status.
#[derive(Debug, Clone)]
pub struct ResponseDone(pub RemoteResponse);

impl StoppingCondition for ResponseDone {
    fn should_stop(&mut self, _progress: &WaitProgress) -> bool {
        self.0.status().is_terminal()
    }
}
