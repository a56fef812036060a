//! Per-request result records.
//!
//! A [`RemoteResponse`] is created by the caller before a request is sent and is filled in by the
//! calling thread's controller once the request resolves. The record is a cheap handle: clone it
//! into a completion [`Closure`] to inspect the outcome from inside the callback.
//!
//! # Lifecycle
//!
//! ```text
//! Inactive --send--> Active --reply----> Done
//!                           --deadline-> DeadlineExceeded
//!                           --shutdown-> Cancelled
//! ```
//!
//! Terminal states are final for that request. A terminal response may be sent again, which
//! starts a new cycle; sending a response that is still `Active` is rejected.
//!
//! Once its manager has stopped, reading an `Active` response settles it: the owning thread's
//! leftover completions are applied, so the record reports `Cancelled` even if that thread never
//! waits again.
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use crate::transport::Frame;

/// Single-use completion callback. Runs on the thread that sent the request, from inside
/// [`Connection::wait_until`](crate::Connection::wait_until) (or a read of a response after the
/// manager stopped), and is dropped right after.
pub type Closure = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    /// Constructed, never sent.
    #[default]
    Inactive,
    /// Sent, awaiting a reply or the deadline.
    Active,
    /// A reply arrived.
    Done,
    /// The deadline passed before a reply arrived.
    DeadlineExceeded,
    /// The manager stopped before the request resolved.
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Done | Status::DeadlineExceeded | Status::Cancelled
        )
    }
}

/// Whatever holds the pending entry of an active response.
pub(crate) trait Settle {
    /// Applies completions that can no longer arrive through a wait.
    fn settle(&self);
}

#[derive(Default)]
struct State {
    status: Status,
    reply: Vec<Frame>,
    owner: Option<Weak<dyn Settle>>,
}

/// Status and reply payload of one request. Bound to the thread that created it.
#[derive(Clone, Default)]
pub struct RemoteResponse {
    inner: Rc<RefCell<State>>,
}

impl fmt::Debug for RemoteResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("RemoteResponse")
            .field("status", &state.status)
            .field("reply", &state.reply)
            .finish()
    }
}

impl RemoteResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.settle();
        self.inner.borrow().status
    }

    /// Copy of the reply frames. Empty unless the status is [`Status::Done`].
    pub fn reply(&self) -> Vec<Frame> {
        self.settle();
        self.inner.borrow().reply.clone()
    }

    /// Moves the reply frames out, leaving the response with an empty payload.
    pub fn take_reply(&self) -> Vec<Frame> {
        self.settle();
        std::mem::take(&mut self.inner.borrow_mut().reply)
    }

    pub fn with_reply<R>(&self, f: impl FnOnce(&[Frame]) -> R) -> R {
        self.settle();
        f(&self.inner.borrow().reply)
    }

    /// Returns true if both handles refer to the same record.
    pub fn same_as(&self, other: &RemoteResponse) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Lets the owner of an active record apply completions it is still holding. The borrow is
    /// released first, since settling may resolve this very record.
    fn settle(&self) {
        let owner = {
            let state = self.inner.borrow();
            if state.status != Status::Active {
                return;
            }
            state.owner.as_ref().and_then(Weak::upgrade)
        };
        if let Some(owner) = owner {
            owner.settle();
        }
    }

    /// Marks the response as in flight. Fails if it already is.
    pub(crate) fn activate(&self) -> bool {
        let mut state = self.inner.borrow_mut();
        if state.status == Status::Active {
            return false;
        }
        state.status = Status::Active;
        state.reply.clear();
        true
    }

    pub(crate) fn set_owner(&self, owner: Weak<dyn Settle>) {
        self.inner.borrow_mut().owner = Some(owner);
    }

    /// Undoes [`activate`](Self::activate) for a request that was never accepted.
    pub(crate) fn deactivate(&self) {
        let mut state = self.inner.borrow_mut();
        if state.status == Status::Active {
            state.status = Status::Inactive;
            state.owner = None;
        }
    }

    /// Moves an active response into a terminal state. Returns false, leaving the record alone,
    /// if it was not active.
    pub(crate) fn resolve(&self, status: Status, reply: Vec<Frame>) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.inner.borrow_mut();
        if state.status != Status::Active {
            return false;
        }
        state.status = status;
        state.reply = reply;
        state.owner = None;
        true
    }
}
