//! Per-thread routing endpoint.
//!
//! Each application thread that talks through a manager gets one [`Controller`], created on the
//! thread's first request and kept in a thread-local table keyed by manager. The controller owns
//! the thread's pending-request table, so completing a request never takes a lock: completions
//! arrive over the controller's own inbox channel and are applied on the owning thread.
//!
//! Every active response keeps a weak link back to its controller. After the manager stops, a
//! read of such a response drains the inbox, which ends in cancelling whatever the stopped
//! fabric never answered.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    time::{Duration, Instant},
};

use log::{debug, trace};

use crate::{
    condition::{StoppingCondition, WaitProgress},
    response::{Closure, RemoteResponse, Settle, Status},
    shutdown::ShutdownToken,
    transport::Frame,
};

use super::{
    SendError, Shared,
    fabric::{BrokerCommand, Completion, ControllerId, EndpointId, ManagerId, Outcome, Request, RequestId},
};

thread_local! {
    static CONTROLLERS: RefCell<HashMap<ManagerId, Rc<Controller>>> = RefCell::new(HashMap::new());
}

struct Pending {
    response: RemoteResponse,
    closure: Option<Closure>,
}

pub(crate) struct Controller {
    id: ControllerId,
    me: Weak<Controller>,
    broker: Sender<BrokerCommand>,
    inbox: Receiver<Completion>,
    token: ShutdownToken,
    pending: RefCell<HashMap<RequestId, Pending>>,
    next_request: Cell<RequestId>,
}

impl Controller {
    fn new(shared: &Shared) -> Rc<Self> {
        let id = shared.next_controller();
        let (tx, inbox) = mpsc::channel();
        if shared
            .broker
            .send(BrokerCommand::Register {
                controller: id,
                inbox: tx,
            })
            .is_err()
        {
            debug!("controller {id} created after its manager stopped");
        }

        Rc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            broker: shared.broker.clone(),
            inbox,
            token: shared.token.clone(),
            pending: RefCell::new(HashMap::new()),
            next_request: Cell::new(0),
        })
    }

    /// The calling thread's controller for `shared`, created on first use.
    pub fn current(shared: &Shared) -> Rc<Controller> {
        CONTROLLERS.with(|controllers| {
            let mut controllers = controllers.borrow_mut();
            // Controllers of stopped managers with nothing left to deliver are dead weight.
            controllers.retain(|_, c| !(c.token.is_triggered() && c.pending_len() == 0));
            controllers
                .entry(shared.id)
                .or_insert_with(|| Controller::new(shared))
                .clone()
        })
    }

    /// The calling thread's controller for `manager`, if it has one.
    pub fn existing(manager: ManagerId) -> Option<Rc<Controller>> {
        CONTROLLERS.with(|controllers| controllers.borrow().get(&manager).cloned())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn send(
        &self,
        endpoint: EndpointId,
        frames: Vec<Frame>,
        response: &RemoteResponse,
        deadline_ms: i64,
        closure: Option<Closure>,
    ) -> Result<(), SendError> {
        if self.token.is_triggered() {
            return Err(SendError::Stopped);
        }
        if !response.activate() {
            return Err(SendError::ResponseInUse);
        }
        let owner: Weak<dyn Settle> = self.me.clone();
        response.set_owner(owner);

        let request = self.next_request.get();
        self.next_request.set(request.wrapping_add(1));
        let deadline = u64::try_from(deadline_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        self.pending.borrow_mut().insert(
            request,
            Pending {
                response: response.clone(),
                closure,
            },
        );
        trace!("controller {} sending request {request}", self.id);

        let forwarded = self.broker.send(BrokerCommand::Forward(Request {
            controller: self.id,
            request,
            endpoint,
            deadline,
            frames,
        }));
        if forwarded.is_err() {
            // Rejected like a send after shutdown: the record is untouched and the closure dropped.
            self.pending.borrow_mut().remove(&request);
            response.deactivate();
            return Err(SendError::Stopped);
        }
        Ok(())
    }

    /// Blocks until `condition` is met or nothing is pending, running closures as requests
    /// resolve. Returns the number of completions observed.
    pub fn wait_until(&self, condition: &mut dyn StoppingCondition) -> usize {
        let mut progress = WaitProgress {
            completed: 0,
            pending: self.pending_len(),
        };

        while !condition.should_stop(&progress) && progress.pending > 0 {
            match self.inbox.recv() {
                Ok(completion) => {
                    if self.complete(completion) {
                        progress.completed += 1;
                    }
                }
                Err(_) => progress.completed += self.cancel_pending(),
            }
            progress.pending = self.pending_len();
        }
        progress.completed
    }

    /// Applies every completion that has already arrived, without blocking.
    pub fn dispatch_ready(&self) -> usize {
        let mut completed = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(completion) => {
                    if self.complete(completion) {
                        completed += 1;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    completed += self.cancel_pending();
                    break;
                }
            }
        }
        completed
    }

    fn complete(&self, completion: Completion) -> bool {
        let entry = self.pending.borrow_mut().remove(&completion.request);
        let Some(Pending { response, closure }) = entry else {
            debug!(
                "controller {} got a completion for unknown request {}",
                self.id, completion.request
            );
            return false;
        };

        let (status, reply) = match completion.outcome {
            Outcome::Reply(reply) => (Status::Done, reply),
            Outcome::DeadlineExceeded => (Status::DeadlineExceeded, Vec::new()),
            Outcome::Cancelled => (Status::Cancelled, Vec::new()),
        };
        trace!(
            "controller {} request {} resolved as {status:?}",
            self.id, completion.request
        );
        response.resolve(status, reply);
        drop(response);

        if let Some(closure) = closure {
            closure();
        }
        true
    }

    /// Resolves every pending request as cancelled. Used once the broker is gone.
    fn cancel_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let count = pending.len();
        for (_, Pending { response, closure }) in pending {
            response.resolve(Status::Cancelled, Vec::new());
            if let Some(closure) = closure {
                closure();
            }
        }
        count
    }
}

impl Settle for Controller {
    fn settle(&self) {
        if self.token.is_triggered() {
            self.dispatch_ready();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self
            .broker
            .send(BrokerCommand::Unregister { controller: self.id });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, mpsc::channel};

    use crate::condition::{AnyCompletion, Completions};

    use super::*;

    fn shared() -> (Arc<Shared>, Receiver<BrokerCommand>) {
        let (broker, rx) = channel();
        (Arc::new(Shared::new(broker, ShutdownToken::new())), rx)
    }

    /// Pulls the forwarded requests and the controller's inbox out of the broker channel.
    fn forwarded(rx: &Receiver<BrokerCommand>) -> (Option<Sender<Completion>>, Vec<Request>) {
        let mut inbox = None;
        let mut requests = Vec::new();
        for command in rx.try_iter() {
            match command {
                BrokerCommand::Register { inbox: tx, .. } => inbox = Some(tx),
                BrokerCommand::Forward(request) => requests.push(request),
                _ => {}
            }
        }
        (inbox, requests)
    }

    #[test]
    fn one_controller_per_thread() {
        let (shared, _rx) = shared();
        let a = Controller::current(&shared);
        let b = Controller::current(&shared);
        assert!(Rc::ptr_eq(&a, &b));

        let other = std::thread::spawn({
            let shared = Arc::clone(&shared);
            move || Controller::current(&shared).id
        })
        .join()
        .unwrap();
        assert_ne!(a.id, other);
    }

    #[test]
    fn send_forwards_and_tracks_request() {
        let (shared, rx) = shared();
        let controller = Controller::new(&shared);
        let response = RemoteResponse::new();

        controller
            .send(2, vec![b"req".to_vec()], &response, 100, None)
            .unwrap();

        let (inbox, requests) = forwarded(&rx);
        assert!(inbox.is_some());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].endpoint, 2);
        assert!(requests[0].deadline.is_some());
        assert_eq!(controller.pending_len(), 1);
        assert_eq!(response.status(), Status::Active);
    }

    #[test]
    fn negative_deadline_is_unbounded() {
        let (shared, rx) = shared();
        let controller = Controller::new(&shared);
        controller
            .send(0, vec![], &RemoteResponse::new(), -1, None)
            .unwrap();

        let (_, requests) = forwarded(&rx);
        assert!(requests[0].deadline.is_none());
    }

    #[test]
    fn active_response_is_rejected() {
        let (shared, _rx) = shared();
        let controller = Controller::new(&shared);
        let response = RemoteResponse::new();

        controller.send(0, vec![], &response, -1, None).unwrap();
        assert!(matches!(
            controller.send(0, vec![], &response, -1, None),
            Err(SendError::ResponseInUse)
        ));
        assert_eq!(controller.pending_len(), 1);
    }

    #[test]
    fn wait_runs_closures_and_fills_responses() {
        let (shared, rx) = shared();
        let controller = Controller::new(&shared);
        let responses = [RemoteResponse::new(), RemoteResponse::new()];
        let fired = Rc::new(Cell::new(0));

        for response in &responses {
            let fired = Rc::clone(&fired);
            let handle = response.clone();
            controller
                .send(
                    0,
                    vec![],
                    response,
                    -1,
                    Some(Box::new(move || {
                        assert!(handle.status().is_terminal());
                        fired.set(fired.get() + 1);
                    })),
                )
                .unwrap();
        }

        let (inbox, mut requests) = forwarded(&rx);
        let inbox = inbox.unwrap();
        let second = requests.pop().unwrap();
        let first = requests.pop().unwrap();
        inbox
            .send(first.resolve(Outcome::Reply(vec![b"one".to_vec()])))
            .unwrap();
        inbox.send(second.resolve(Outcome::DeadlineExceeded)).unwrap();

        assert_eq!(controller.wait_until(&mut AnyCompletion), 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(responses[0].status(), Status::Done);
        assert_eq!(responses[0].reply(), vec![b"one".to_vec()]);

        assert_eq!(controller.wait_until(&mut Completions(5)), 1);
        assert_eq!(fired.get(), 2);
        assert_eq!(responses[1].status(), Status::DeadlineExceeded);
        assert_eq!(controller.pending_len(), 0);
    }

    #[test]
    fn wait_without_pending_returns_immediately() {
        let (shared, _rx) = shared();
        let controller = Controller::new(&shared);
        assert_eq!(controller.wait_until(&mut Completions(3)), 0);
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let (shared, rx) = shared();
        let controller = Controller::new(&shared);
        let response = RemoteResponse::new();
        controller.send(0, vec![], &response, -1, None).unwrap();

        let (inbox, mut requests) = forwarded(&rx);
        let inbox = inbox.unwrap();
        let request = requests.pop().unwrap();
        let (controller_id, request_id) = (request.controller, request.request);
        inbox.send(request.resolve(Outcome::DeadlineExceeded)).unwrap();
        inbox
            .send(Completion {
                controller: controller_id,
                request: request_id,
                outcome: Outcome::Reply(vec![]),
            })
            .unwrap();

        assert_eq!(controller.dispatch_ready(), 1);
        assert_eq!(response.status(), Status::DeadlineExceeded);
    }

    #[test]
    fn lost_broker_cancels_pending() {
        let (shared, rx) = shared();
        let controller = Controller::new(&shared);
        let response = RemoteResponse::new();
        controller.send(0, vec![], &response, -1, None).unwrap();

        // dropping the registered inbox sender disconnects the controller
        drop(forwarded(&rx));
        assert_eq!(controller.wait_until(&mut Completions(1)), 1);
        assert_eq!(response.status(), Status::Cancelled);
    }

    #[test]
    fn stopped_manager_rejects_sends() {
        let (shared, rx) = shared();
        drop(rx);
        let controller = Controller::new(&shared);
        let response = RemoteResponse::new();

        let fired = Rc::new(Cell::new(false));
        let closure = {
            let fired = Rc::clone(&fired);
            Box::new(move || fired.set(true))
        };
        assert!(matches!(
            controller.send(0, vec![], &response, -1, Some(closure)),
            Err(SendError::Stopped)
        ));
        assert_eq!(response.status(), Status::Inactive);
        assert_eq!(controller.pending_len(), 0);
        assert!(!fired.get());

        shared.token.trigger();
        assert!(matches!(
            controller.send(0, vec![], &response, -1, None),
            Err(SendError::Stopped)
        ));
        assert_eq!(response.status(), Status::Inactive);
    }

    #[test]
    fn stopped_manager_settles_on_read() {
        let (shared, rx) = shared();
        let controller = Controller::new(&shared);
        let response = RemoteResponse::new();
        controller.send(0, vec![], &response, -1, None).unwrap();

        // still running: a read does not touch the inbox
        assert_eq!(response.status(), Status::Active);

        shared.token.trigger();
        drop(forwarded(&rx));
        assert_eq!(response.status(), Status::Cancelled);
        assert_eq!(controller.pending_len(), 0);
    }
}
