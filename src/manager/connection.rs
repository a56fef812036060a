use std::{fmt, rc::Rc, sync::Arc};

use crate::{
    condition::{ResponseDone, StoppingCondition},
    response::{Closure, RemoteResponse, Status},
    transport::Frame,
};

use super::{RpcError, SendError, Shared, controller::Controller, fabric::EndpointId};

/// A handle to one remote endpoint, usable from any thread.
///
/// Cloning is cheap; all clones address the same endpoint through the same manager. Requests are
/// tracked per calling thread, so a thread only ever waits for, and runs closures of, its own
/// requests.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    endpoint: EndpointId,
    address: Arc<str>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>, endpoint: EndpointId, address: &str) -> Self {
        Self {
            shared,
            endpoint,
            address: Arc::from(address),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.address
    }

    /// Sends `request` without blocking.
    ///
    /// `reply` receives the outcome. A negative `deadline_ms` never expires; otherwise the request
    /// resolves as [`Status::DeadlineExceeded`] once that many milliseconds have passed without a
    /// reply. `closure` runs exactly once, from [`wait_until`](Self::wait_until) on this thread,
    /// whether a reply arrived or not; check `reply.status()` inside it. Once the manager has
    /// stopped, reading an outstanding response on this thread runs due closures as well.
    ///
    /// A request rejected with `SendError::Stopped` leaves `reply` inactive and drops `closure`
    /// without running it.
    pub fn send_request(
        &self,
        request: Vec<Frame>,
        reply: &RemoteResponse,
        deadline_ms: i64,
        closure: Option<Closure>,
    ) -> Result<(), SendError> {
        Controller::current(&self.shared).send(self.endpoint, request, reply, deadline_ms, closure)
    }

    /// Blocks until `condition` holds or the calling thread has nothing pending, running due
    /// closures along the way. Returns the number of completions observed.
    pub fn wait_until(&self, condition: &mut dyn StoppingCondition) -> usize {
        match Controller::existing(self.shared.id) {
            Some(controller) => controller.wait_until(condition),
            None => 0,
        }
    }

    /// Requests of the calling thread, on any endpoint of this manager, still unresolved.
    pub fn pending(&self) -> usize {
        Controller::existing(self.shared.id).map_or(0, |c| c.pending_len())
    }

    /// Creates a channel bound to the calling thread.
    pub fn make_channel(&self) -> RpcChannel {
        RpcChannel {
            connection: self.clone(),
            controller: Controller::current(&self.shared),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("manager", &self.shared.id)
            .field("endpoint", &self.address)
            .finish()
    }
}

/// A thread-bound view of a [`Connection`] for building request stubs on top of.
pub struct RpcChannel {
    connection: Connection,
    controller: Rc<Controller>,
}

impl RpcChannel {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Sends `request` and blocks until it resolves. Closures of other requests that resolve in
    /// the meantime run as usual.
    pub fn call(&self, request: Vec<Frame>, deadline_ms: i64) -> Result<Vec<Frame>, RpcError> {
        let response = RemoteResponse::new();
        self.call_async(request, &response, deadline_ms, None)?;
        self.controller
            .wait_until(&mut ResponseDone(response.clone()));

        match response.status() {
            Status::Done => Ok(response.take_reply()),
            Status::DeadlineExceeded => Err(RpcError::DeadlineExceeded),
            _ => Err(RpcError::Cancelled),
        }
    }

    pub fn call_async(
        &self,
        request: Vec<Frame>,
        reply: &RemoteResponse,
        deadline_ms: i64,
        closure: Option<Closure>,
    ) -> Result<(), SendError> {
        self.controller.send(
            self.connection.endpoint,
            request,
            reply,
            deadline_ms,
            closure,
        )
    }
}
