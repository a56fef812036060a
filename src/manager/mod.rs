//! Client-side connection sharing.
//!
//! Transport sockets must not be shared between threads, yet opening one socket per application
//! thread per endpoint does not scale. A [`ConnectionManager`] resolves this by owning a small,
//! fixed pool of I/O worker threads that hold the real sockets, and giving every application
//! thread apparent direct access to them through a [`Connection`].
//!
//! # Overview
//!
//! ```text
//!  app thread --> Controller --\                      /--> worker 0 [socket per endpoint]
//!  app thread --> Controller ----> broker (round-robin) --> worker 1 [socket per endpoint]
//!  app thread --> Controller --/        ^                \--> ...
//!        ^                              |  completions        |
//!        \------- controller inbox <----+---------------------/
//!
//!  broadcast thread --> every worker (connect, disconnect, shutdown)
//! ```
//!
//! - Each application thread gets a private controller holding its pending-request table. Nothing
//!   else ever touches that table.
//! - The broker thread owns the controller routing table and picks a worker for every request.
//! - Workers send requests, match replies by routing frame, and fire deadlines.
//! - The broadcast thread fans control events out to all workers.
//!
//! Every hand-off is a channel send; there is no lock on the request path.
//!
//! # Example
//! ```rust,no_run
//! use rpcmux::{Completions, ConnectionManager, RemoteResponse, Status};
//!
//! let manager = ConnectionManager::new(2).unwrap();
//! let connection = manager.connect("tcp://localhost:5557").unwrap();
//!
//! let response = RemoteResponse::new();
//! connection
//!     .send_request(vec![b"ping".to_vec()], &response, 1000, None)
//!     .unwrap();
//! connection.wait_until(&mut Completions(1));
//!
//! if response.status() == Status::Done {
//!     println!("{:?}", response.reply());
//! }
//! ```
//!
//! # Ordering
//!
//! Requests are spread over workers round-robin, so two requests from the same thread to the same
//! endpoint may complete in either order. Each request completes exactly once.
mod broadcast;
mod broker;
mod connection;
mod controller;
mod fabric;
mod worker;

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Sender},
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::ManagerConfig,
    shutdown::ShutdownToken,
    transport::{Context, TcpContext, TransportError},
};

use broadcast::Broadcast;
use broker::Broker;
use controller::Controller;
use fabric::{BrokerCommand, ControlEvent, EndpointId, ManagerId, WorkerSender};
use worker::Worker;

pub use connection::{Connection, RpcChannel};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("a connection manager needs at least one worker thread")]
    NoWorkers,
    #[error("failed to start manager thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("failed to connect to '{endpoint}': {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: TransportError,
    },
    #[error("connection manager has stopped")]
    Stopped,
}

/// Reasons a request was not accepted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("response is still attached to an active request")]
    ResponseInUse,
    #[error("connection manager has stopped")]
    Stopped,
}

/// Outcome of a blocking [`RpcChannel::call`] that produced no reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("request cancelled by manager shutdown")]
    Cancelled,
    #[error(transparent)]
    Send(#[from] SendError),
}

static NEXT_MANAGER: AtomicU64 = AtomicU64::new(0);

/// State every [`Connection`] and controller needs to reach the dispatch fabric.
pub(crate) struct Shared {
    id: ManagerId,
    broker: Sender<BrokerCommand>,
    token: ShutdownToken,
    next_controller: AtomicU64,
}

impl Shared {
    fn new(broker: Sender<BrokerCommand>, token: ShutdownToken) -> Self {
        Self {
            id: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
            broker,
            token,
            next_controller: AtomicU64::new(0),
        }
    }

    fn next_controller(&self) -> u64 {
        self.next_controller.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Connection>,
    next_endpoint: EndpointId,
}

/// Owns the worker pool and the dispatch fabric. See the [module docs](self).
pub struct ConnectionManager {
    shared: Arc<Shared>,
    config: ManagerConfig,
    control: Sender<ControlEvent>,
    registry: Mutex<Registry>,
    workers: Vec<JoinHandle<()>>,
    broker: Option<JoinHandle<()>>,
    broadcast: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Starts `threads` workers over a TCP context owned by the manager. All threads are running
    /// when this returns.
    pub fn new(threads: usize) -> Result<Self, ManagerError> {
        Self::with_config(ManagerConfig::default().with_threads(threads))
    }

    pub fn with_config(config: ManagerConfig) -> Result<Self, ManagerError> {
        Self::with_token(config, ShutdownToken::new())
    }

    /// Like [`with_config`](Self::with_config), stopping when `token` is triggered.
    pub fn with_token(config: ManagerConfig, token: ShutdownToken) -> Result<Self, ManagerError> {
        let context = Arc::new(TcpContext::new(config.connect_timeout));
        Self::start(context, config, token)
    }

    /// Starts `threads` workers over an externally supplied context. The manager only keeps a
    /// reference; the context outlives it if the caller holds on to it.
    pub fn with_context(context: Arc<dyn Context>, threads: usize) -> Result<Self, ManagerError> {
        Self::with_context_config(context, ManagerConfig::default().with_threads(threads))
    }

    pub fn with_context_config(
        context: Arc<dyn Context>,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        Self::start(context, config, ShutdownToken::new())
    }

    fn start(
        context: Arc<dyn Context>,
        config: ManagerConfig,
        token: ShutdownToken,
    ) -> Result<Self, ManagerError> {
        if config.threads == 0 {
            return Err(ManagerError::NoWorkers);
        }

        let (broker_tx, broker_rx) = mpsc::channel();
        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::new(Shared::new(broker_tx.clone(), token.clone()));
        let id = shared.id;

        let mut manager = Self {
            shared,
            config: config.clone(),
            control: control_tx,
            registry: Mutex::new(Registry::default()),
            workers: Vec::with_capacity(config.threads),
            broker: None,
            broadcast: None,
        };

        let mut senders: Vec<WorkerSender> = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let (tx, rx) = mpsc::sync_channel(config.worker_queue_depth.max(1));
            let worker = Worker::new(
                index,
                rx,
                broker_tx.clone(),
                Arc::clone(&context),
                config.poll_interval,
            );
            let ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("rpcmux-{id}-worker-{index}"))
                .spawn(move || worker.run(ready))?;
            manager.workers.push(handle);
            senders.push(tx);
        }

        let broker = Broker::new(broker_rx, senders.clone());
        let ready = ready_tx.clone();
        manager.broker = Some(
            thread::Builder::new()
                .name(format!("rpcmux-{id}-broker"))
                .spawn(move || broker.run(ready))?,
        );

        let broadcast = Broadcast::new(control_rx, senders, broker_tx, token);
        let ready = ready_tx;
        manager.broadcast = Some(
            thread::Builder::new()
                .name(format!("rpcmux-{id}-broadcast"))
                .spawn(move || broadcast.run(ready))?,
        );

        for _ in 0..config.threads + 2 {
            ready_rx.recv().map_err(|_| ManagerError::Stopped)?;
        }

        info!(
            "connection manager {id} started with {} workers",
            config.threads
        );
        Ok(manager)
    }

    /// Number of worker threads, not counting the broker and broadcast threads.
    pub fn thread_count(&self) -> usize {
        self.config.threads
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Token that stops this manager when triggered.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shared.token.clone()
    }

    /// Connects every worker to `endpoint`. Connecting to an endpoint twice returns the existing
    /// connection. On failure nothing is registered and workers that did connect drop the socket.
    pub fn connect(&self, endpoint: &str) -> Result<Connection, ManagerError> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| ManagerError::Stopped)?;
        if let Some(connection) = registry.connections.get(endpoint) {
            return Ok(connection.clone());
        }
        if self.shared.token.should_stop() {
            return Err(ManagerError::Stopped);
        }

        let id = registry.next_endpoint;
        let (ack, acks) = mpsc::channel();
        self.control
            .send(ControlEvent::Connect {
                endpoint: id,
                address: endpoint.to_string(),
                ack,
            })
            .map_err(|_| ManagerError::Stopped)?;

        let mut failure = None;
        let mut answered = 0;
        while answered < self.config.threads {
            match acks.recv() {
                Ok((_, Ok(()))) => {}
                Ok((worker, Err(e))) => {
                    debug!("worker {worker} failed to connect to {endpoint}: {e}");
                    failure.get_or_insert(e);
                }
                Err(_) => break,
            }
            answered += 1;
        }

        if failure.is_some() || answered < self.config.threads {
            let _ = self.control.send(ControlEvent::Disconnect { endpoint: id });
            warn!("failed to connect to {endpoint}");
            return Err(match failure {
                Some(source) => ManagerError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                },
                None => ManagerError::Stopped,
            });
        }

        registry.next_endpoint += 1;
        let connection = Connection::new(Arc::clone(&self.shared), id, endpoint);
        registry
            .connections
            .insert(endpoint.to_string(), connection.clone());
        info!("connected {} workers to {endpoint}", self.config.threads);
        Ok(connection)
    }

    /// Endpoints with an established connection.
    pub fn endpoints(&self) -> Vec<String> {
        self.registry
            .lock()
            .map(|registry| registry.connections.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_stopped(&self) -> bool {
        self.broker.is_none() || self.shared.token.should_stop()
    }

    /// Stops every thread and resolves all outstanding requests as cancelled. Requests of the
    /// calling thread are resolved (and their closures run) before this returns. Requests of
    /// other threads are already queued as cancelled and settle the next time their thread waits
    /// or reads one of their responses.
    pub fn stop(&mut self) {
        let Some(broker) = self.broker.take() else {
            return;
        };
        info!("stopping connection manager {}", self.shared.id);

        self.shared.token.trigger();
        let _ = self.control.send(ControlEvent::Shutdown);
        match self.broadcast.take() {
            Some(broadcast) => {
                let _ = broadcast.join();
            }
            None => {
                // Startup failed before the broadcast thread ran; drain the broker directly so
                // workers see their queues close.
                let (ack, drained) = mpsc::channel();
                if self.shared.broker.send(BrokerCommand::Drain { ack }).is_ok() {
                    let _ = drained.recv();
                }
            }
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        // Workers are gone, so every completion they produced is already queued ahead of this.
        let _ = self.shared.broker.send(BrokerCommand::Stop);
        let _ = broker.join();

        if let Some(controller) = Controller::existing(self.shared.id) {
            let resolved = controller.dispatch_ready();
            debug!("resolved {resolved} requests of the stopping thread");
        }
        info!("connection manager {} stopped", self.shared.id);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}
