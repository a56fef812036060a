//! Messages exchanged between controllers, the broker, the broadcast thread and workers.
use std::{
    sync::mpsc::{Sender, SyncSender},
    time::Instant,
};

use crate::transport::{Frame, TransportError};

pub(crate) type ManagerId = u64;
pub(crate) type ControllerId = u64;
pub(crate) type RequestId = u64;
pub(crate) type EndpointId = usize;

/// A request on its way from a controller to a worker socket.
#[derive(Debug)]
pub(crate) struct Request {
    pub controller: ControllerId,
    pub request: RequestId,
    pub endpoint: EndpointId,
    pub deadline: Option<Instant>,
    pub frames: Vec<Frame>,
}

impl Request {
    pub fn resolve(self, outcome: Outcome) -> Completion {
        Completion {
            controller: self.controller,
            request: self.request,
            outcome,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Reply(Vec<Frame>),
    DeadlineExceeded,
    Cancelled,
}

/// A resolved request on its way back to the controller that sent it.
#[derive(Debug)]
pub(crate) struct Completion {
    pub controller: ControllerId,
    pub request: RequestId,
    pub outcome: Outcome,
}

pub(crate) enum BrokerCommand {
    /// A controller announces where its completions go.
    Register {
        controller: ControllerId,
        inbox: Sender<Completion>,
    },
    Unregister {
        controller: ControllerId,
    },
    Forward(Request),
    Complete(Completion),
    /// Stop forwarding to workers; requests received from now on are cancelled right away.
    Drain {
        ack: Sender<()>,
    },
    Stop,
}

pub(crate) enum WorkerCommand {
    Request(Request),
    Connect {
        endpoint: EndpointId,
        address: String,
        ack: Sender<ConnectAck>,
    },
    Disconnect {
        endpoint: EndpointId,
    },
    Shutdown,
}

pub(crate) type ConnectAck = (usize, Result<(), TransportError>);

/// Control events fanned out to every worker by the broadcast thread.
pub(crate) enum ControlEvent {
    Connect {
        endpoint: EndpointId,
        address: String,
        ack: Sender<ConnectAck>,
    },
    Disconnect {
        endpoint: EndpointId,
    },
    Shutdown,
}

pub(crate) type WorkerSender = SyncSender<WorkerCommand>;
