//! The broker thread.
//!
//! Every controller pushes its requests into one unbounded channel read by the broker, which hands
//! them to workers round-robin. Workers push completions into the same channel and the broker
//! forwards each one to the inbox of the controller that sent the request. The routing table is
//! owned by this thread alone.
use std::{
    collections::HashMap,
    sync::mpsc::{Receiver, Sender, TrySendError},
};

use log::{debug, info, trace};

use super::fabric::{
    BrokerCommand, Completion, ControllerId, Outcome, Request, WorkerCommand, WorkerSender,
};

pub(crate) struct Broker {
    inbox: Receiver<BrokerCommand>,
    workers: Vec<WorkerSender>,
    controllers: HashMap<ControllerId, Sender<Completion>>,
    next_worker: usize,
    draining: bool,
}

impl Broker {
    pub fn new(inbox: Receiver<BrokerCommand>, workers: Vec<WorkerSender>) -> Self {
        Self {
            inbox,
            workers,
            controllers: HashMap::new(),
            next_worker: 0,
            draining: false,
        }
    }

    pub fn run(mut self, ready: Sender<()>) {
        let _ = ready.send(());
        drop(ready);

        while let Ok(command) = self.inbox.recv() {
            if !self.handle(command) {
                break;
            }
        }
        info!(
            "broker stopped with {} registered controllers",
            self.controllers.len()
        );
    }

    fn handle(&mut self, command: BrokerCommand) -> bool {
        match command {
            BrokerCommand::Register { controller, inbox } => {
                debug!("controller {controller} registered");
                self.controllers.insert(controller, inbox);
            }
            BrokerCommand::Unregister { controller } => {
                debug!("controller {controller} unregistered");
                self.controllers.remove(&controller);
            }
            BrokerCommand::Forward(request) => self.dispatch(request),
            BrokerCommand::Complete(completion) => self.route(completion),
            BrokerCommand::Drain { ack } => {
                debug!("broker draining");
                self.draining = true;
                // Dropping the senders lets workers see a disconnected inbox once they stop.
                self.workers.clear();
                let _ = ack.send(());
            }
            BrokerCommand::Stop => return false,
        }
        true
    }

    /// Hands a request to the next worker in round-robin order.
    fn dispatch(&mut self, request: Request) {
        if self.draining || self.workers.is_empty() {
            self.route(request.resolve(Outcome::Cancelled));
            return;
        }

        let index = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        trace!(
            "request {}/{} to worker {index}",
            request.controller, request.request
        );

        let command = match self.workers[index].try_send(WorkerCommand::Request(request)) {
            Ok(()) => return,
            Err(TrySendError::Full(command)) => {
                trace!("worker {index} queue full, waiting");
                command
            }
            Err(TrySendError::Disconnected(command)) => {
                self.cancel(command);
                return;
            }
        };
        if let Err(e) = self.workers[index].send(command) {
            self.cancel(e.0);
        }
    }

    fn cancel(&mut self, command: WorkerCommand) {
        if let WorkerCommand::Request(request) = command {
            self.route(request.resolve(Outcome::Cancelled));
        }
    }

    fn route(&mut self, completion: Completion) {
        let controller = completion.controller;
        let Some(inbox) = self.controllers.get(&controller) else {
            debug!(
                "dropping completion for request {} of departed controller {controller}",
                completion.request
            );
            return;
        };
        if inbox.send(completion).is_err() {
            self.controllers.remove(&controller);
        }
    }
}
