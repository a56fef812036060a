//! I/O worker event loop.
//!
//! A worker owns one socket per connected endpoint. It sends the requests the broker hands it,
//! matches replies to requests by the routing frame it put in front of each one, and enforces
//! request deadlines with a min-heap of timers.
//!
//! A lost socket never stalls the loop. Reconnects run on short-lived helper threads and report
//! back over a channel; meanwhile the endpoint's requests wait in a backlog and are written once
//! the socket is back. Requests that were already written to the lost socket go back into the
//! backlog too, since their replies can no longer arrive.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::transport::{Context, Frame, Socket, TransportError, split_envelope};

use super::fabric::{
    BrokerCommand, Completion, ControllerId, EndpointId, Outcome, Request, RequestId,
    WorkerCommand,
};

type RouteId = u64;

/// Delay before the first reconnect retry; doubles per failure up to the cap.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

enum Link {
    Up(Box<dyn Socket>),
    /// A helper thread is opening a new socket.
    Connecting,
    Down { retry_at: Instant },
}

struct Endpoint {
    address: String,
    link: Link,
    /// Failed reconnect attempts since the socket was last up.
    failures: u32,
    /// Routes waiting for the socket, oldest first.
    backlog: Vec<RouteId>,
}

struct Reconnected {
    endpoint: EndpointId,
    result: Result<Box<dyn Socket>, TransportError>,
}

struct InFlight {
    controller: ControllerId,
    request: RequestId,
    endpoint: EndpointId,
    message: Vec<Frame>,
}

impl InFlight {
    fn resolve(self, outcome: Outcome) -> Completion {
        Completion {
            controller: self.controller,
            request: self.request,
            outcome,
        }
    }
}

pub(crate) struct Worker {
    index: usize,
    inbox: Receiver<WorkerCommand>,
    broker: Sender<BrokerCommand>,
    context: Arc<dyn Context>,
    poll_interval: Duration,
    endpoints: HashMap<EndpointId, Endpoint>,
    in_flight: HashMap<RouteId, InFlight>,
    deadlines: BinaryHeap<Reverse<(Instant, RouteId)>>,
    next_route: RouteId,
    reconnected_tx: Sender<Reconnected>,
    reconnected: Receiver<Reconnected>,
}

impl Worker {
    pub fn new(
        index: usize,
        inbox: Receiver<WorkerCommand>,
        broker: Sender<BrokerCommand>,
        context: Arc<dyn Context>,
        poll_interval: Duration,
    ) -> Self {
        let (reconnected_tx, reconnected) = mpsc::channel();
        Self {
            index,
            inbox,
            broker,
            context,
            poll_interval,
            endpoints: HashMap::new(),
            in_flight: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_route: 0,
            reconnected_tx,
            reconnected,
        }
    }

    pub fn run(mut self, ready: Sender<()>) {
        let _ = ready.send(());
        drop(ready);
        debug!("worker {} running", self.index);

        let mut running = true;
        while running {
            match self.inbox.recv_timeout(self.next_wake(Instant::now())) {
                Ok(command) => running = self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => running = false,
            }
            while running {
                match self.inbox.try_recv() {
                    Ok(command) => running = self.handle(command),
                    Err(_) => break,
                }
            }

            self.poll_sockets();
            let now = Instant::now();
            self.expire(now);
            self.finish_reconnects(now);
            self.start_reconnects(now);
        }

        self.cancel_all();
        info!("worker {} stopped", self.index);
    }

    /// Applies one command. Returns false once the worker should stop.
    fn handle(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Request(request) => self.send(request),
            WorkerCommand::Connect {
                endpoint,
                address,
                ack,
            } => {
                let result = self.connect(endpoint, address);
                let _ = ack.send((self.index, result));
            }
            WorkerCommand::Disconnect { endpoint } => self.disconnect(endpoint),
            WorkerCommand::Shutdown => return false,
        }
        true
    }

    fn connect(&mut self, endpoint: EndpointId, address: String) -> Result<(), TransportError> {
        let socket = self.context.connect(&address)?;
        debug!("worker {} connected to {address}", self.index);
        self.endpoints.insert(
            endpoint,
            Endpoint {
                address,
                link: Link::Up(socket),
                failures: 0,
                backlog: Vec::new(),
            },
        );
        Ok(())
    }

    fn disconnect(&mut self, endpoint: EndpointId) {
        let Some(ep) = self.endpoints.remove(&endpoint) else {
            return;
        };
        debug!("worker {} dropped {}", self.index, ep.address);
        for route in self.routes_to(endpoint) {
            if let Some(in_flight) = self.in_flight.remove(&route) {
                self.complete(in_flight.resolve(Outcome::Cancelled));
            }
        }
    }

    fn send(&mut self, request: Request) {
        let now = Instant::now();
        if request.deadline.is_some_and(|deadline| deadline <= now) {
            self.complete(request.resolve(Outcome::DeadlineExceeded));
            return;
        }

        if !self.endpoints.contains_key(&request.endpoint) {
            warn!(
                "worker {} has no socket for endpoint {}",
                self.index, request.endpoint
            );
            self.complete(request.resolve(Outcome::Cancelled));
            return;
        }

        let route = self.next_route;
        self.next_route += 1;

        let mut message = Vec::with_capacity(request.frames.len() + 2);
        message.push(route.to_be_bytes().to_vec());
        message.push(Frame::new());
        message.extend(request.frames);

        trace!(
            "worker {} sending request {}/{} as route {route}",
            self.index, request.controller, request.request
        );
        self.in_flight.insert(
            route,
            InFlight {
                controller: request.controller,
                request: request.request,
                endpoint: request.endpoint,
                message,
            },
        );
        if let Some(deadline) = request.deadline {
            self.deadlines.push(Reverse((deadline, route)));
        }
        self.transmit(request.endpoint, route);
    }

    /// Writes an in-flight route to its endpoint, or parks it until the socket is back.
    fn transmit(&mut self, endpoint: EndpointId, route: RouteId) {
        let (Some(ep), Some(in_flight)) =
            (self.endpoints.get_mut(&endpoint), self.in_flight.get(&route))
        else {
            return;
        };
        let Link::Up(socket) = &mut ep.link else {
            ep.backlog.push(route);
            return;
        };
        if let Err(e) = socket.send(&in_flight.message) {
            warn!("worker {} send to {} failed: {e}", self.index, ep.address);
            self.link_lost(endpoint);
        }
    }

    /// Drops the endpoint's socket and queues every route still waiting on it for a resend.
    fn link_lost(&mut self, endpoint: EndpointId) {
        let routes = self.routes_to(endpoint);
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        ep.link = Link::Down {
            retry_at: Instant::now(),
        };
        ep.backlog = routes;
    }

    fn routes_to(&self, endpoint: EndpointId) -> Vec<RouteId> {
        let mut routes = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.endpoint == endpoint)
            .map(|(route, _)| *route)
            .collect::<Vec<_>>();
        routes.sort_unstable();
        routes
    }

    /// Starts a reconnect for every down endpoint that has work waiting and is due a retry.
    fn start_reconnects(&mut self, now: Instant) {
        let due = self
            .endpoints
            .iter()
            .filter(|(_, ep)| !ep.backlog.is_empty())
            .filter(|(_, ep)| matches!(ep.link, Link::Down { retry_at } if retry_at <= now))
            .map(|(id, ep)| (*id, ep.address.clone()))
            .collect::<Vec<_>>();

        for (endpoint, address) in due {
            let context = Arc::clone(&self.context);
            let reconnected = self.reconnected_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("rpcmux-worker-{}-reconnect", self.index))
                .spawn(move || {
                    let result = context.connect(&address);
                    let _ = reconnected.send(Reconnected { endpoint, result });
                });

            match spawned {
                Ok(_) => {
                    if let Some(ep) = self.endpoints.get_mut(&endpoint) {
                        ep.link = Link::Connecting;
                    }
                }
                Err(e) => {
                    warn!("worker {} could not start a reconnect: {e}", self.index);
                    self.back_off(endpoint, now);
                }
            }
        }
    }

    fn finish_reconnects(&mut self, now: Instant) {
        while let Ok(Reconnected { endpoint, result }) = self.reconnected.try_recv() {
            let Some(ep) = self.endpoints.get_mut(&endpoint) else {
                continue;
            };
            if !matches!(ep.link, Link::Connecting) {
                continue;
            }
            match result {
                Ok(socket) => {
                    info!("worker {} reconnected to {}", self.index, ep.address);
                    ep.link = Link::Up(socket);
                    ep.failures = 0;
                    self.flush(endpoint);
                }
                Err(e) => {
                    warn!(
                        "worker {} failed to reconnect to {}: {e}",
                        self.index, ep.address
                    );
                    self.back_off(endpoint, now);
                }
            }
        }
    }

    fn back_off(&mut self, endpoint: EndpointId, now: Instant) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        let delay = RECONNECT_BACKOFF
            .saturating_mul(1 << ep.failures.min(6))
            .min(MAX_RECONNECT_BACKOFF);
        ep.failures += 1;
        ep.link = Link::Down {
            retry_at: now + delay,
        };
    }

    /// Writes the backlog of a freshly reconnected endpoint.
    fn flush(&mut self, endpoint: EndpointId) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        let backlog = std::mem::take(&mut ep.backlog);
        let Link::Up(socket) = &mut ep.link else {
            ep.backlog = backlog;
            return;
        };

        let mut failed = None;
        // Routes resolved while parked are gone from the in-flight table.
        for in_flight in backlog.iter().filter_map(|route| self.in_flight.get(route)) {
            if let Err(e) = socket.send(&in_flight.message) {
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            warn!("worker {} resend to {} failed: {e}", self.index, ep.address);
            self.link_lost(endpoint);
        }
    }

    fn poll_sockets(&mut self) {
        let mut replies = Vec::new();
        let mut lost = Vec::new();

        for (id, endpoint) in self.endpoints.iter_mut() {
            let Link::Up(socket) = &mut endpoint.link else {
                continue;
            };
            loop {
                match socket.poll_recv() {
                    Ok(Some(message)) => replies.push(message),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(
                            "worker {} lost connection to {}: {e}",
                            self.index, endpoint.address
                        );
                        lost.push(*id);
                        break;
                    }
                }
            }
        }

        for reply in replies {
            self.deliver(reply);
        }
        for endpoint in lost {
            self.link_lost(endpoint);
        }
    }

    fn deliver(&mut self, message: Vec<Frame>) {
        let Some((envelope, payload)) = split_envelope(message) else {
            warn!("worker {} dropped a reply without an envelope", self.index);
            return;
        };
        let route = match envelope.first().map(|frame| <[u8; 8]>::try_from(frame.as_slice())) {
            Some(Ok(bytes)) => RouteId::from_be_bytes(bytes),
            _ => {
                warn!("worker {} dropped a reply with a malformed envelope", self.index);
                return;
            }
        };

        match self.in_flight.remove(&route) {
            Some(in_flight) => self.complete(in_flight.resolve(Outcome::Reply(payload))),
            None => debug!("worker {} ignored late reply for route {route}", self.index),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(Reverse((deadline, route))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(in_flight) = self.in_flight.remove(&route) {
                trace!("worker {} route {route} exceeded its deadline", self.index);
                self.complete(in_flight.resolve(Outcome::DeadlineExceeded));
            }
        }
    }

    fn next_wake(&self, now: Instant) -> Duration {
        match self.deadlines.peek() {
            Some(Reverse((deadline, _))) => deadline
                .saturating_duration_since(now)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    /// Resolves everything still queued or in flight as cancelled.
    fn cancel_all(&mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                WorkerCommand::Request(request) => {
                    self.complete(request.resolve(Outcome::Cancelled))
                }
                WorkerCommand::Connect { ack, .. } => {
                    let _ = ack.send((self.index, Err(TransportError::Closed)));
                }
                WorkerCommand::Disconnect { .. } | WorkerCommand::Shutdown => {}
            }
        }

        let cancelled = self.in_flight.len();
        let drained: Vec<InFlight> = self.in_flight.drain().map(|(_, f)| f).collect();
        for in_flight in drained {
            self.complete(in_flight.resolve(Outcome::Cancelled));
        }
        self.deadlines.clear();
        if cancelled > 0 {
            info!("worker {} cancelled {cancelled} in-flight requests", self.index);
        }
    }

    fn complete(&self, completion: Completion) {
        if self.broker.send(BrokerCommand::Complete(completion)).is_err() {
            debug!("worker {} completion dropped, broker is gone", self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
    };

    use super::*;

    /// Socket that answers every request immediately by echoing it.
    struct Loopback {
        replies: VecDeque<Vec<Frame>>,
        silent: bool,
    }

    impl Socket for Loopback {
        fn send(&mut self, message: &[Frame]) -> Result<(), TransportError> {
            if !self.silent {
                self.replies.push_back(message.to_vec());
            }
            Ok(())
        }

        fn poll_recv(&mut self) -> Result<Option<Vec<Frame>>, TransportError> {
            Ok(self.replies.pop_front())
        }

        fn endpoint(&self) -> &str {
            "loop://"
        }
    }

    #[derive(Default)]
    struct LoopbackContext {
        silent: bool,
        refuse: AtomicBool,
        stall: AtomicBool,
    }

    impl Context for LoopbackContext {
        fn connect(&self, endpoint: &str) -> Result<Box<dyn Socket>, TransportError> {
            if self.stall.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(500));
            }
            if endpoint == "bad" || self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            Ok(Box::new(Loopback {
                replies: VecDeque::new(),
                silent: self.silent,
            }))
        }
    }

    fn worker(silent: bool) -> (Worker, mpsc::Receiver<BrokerCommand>) {
        let (worker, rx, _) = worker_with(silent);
        (worker, rx)
    }

    fn worker_with(
        silent: bool,
    ) -> (Worker, mpsc::Receiver<BrokerCommand>, Arc<LoopbackContext>) {
        let (_tx, inbox) = mpsc::sync_channel(4);
        let (broker, broker_rx) = mpsc::channel();
        let context = Arc::new(LoopbackContext {
            silent,
            ..Default::default()
        });
        let worker = Worker::new(
            0,
            inbox,
            broker,
            Arc::clone(&context) as Arc<dyn Context>,
            Duration::from_millis(1),
        );
        (worker, broker_rx, context)
    }

    fn wait_reconnect(worker: &mut Worker, endpoint: EndpointId) {
        let started = Instant::now();
        while matches!(worker.endpoints[&endpoint].link, Link::Connecting) {
            assert!(started.elapsed() < Duration::from_secs(5), "reconnect never finished");
            thread::sleep(Duration::from_millis(1));
            worker.finish_reconnects(Instant::now());
        }
    }

    fn request(id: RequestId, deadline: Option<Instant>) -> Request {
        Request {
            controller: 7,
            request: id,
            endpoint: 0,
            deadline,
            frames: vec![id.to_be_bytes().to_vec()],
        }
    }

    fn completions(rx: &mpsc::Receiver<BrokerCommand>) -> Vec<Completion> {
        rx.try_iter()
            .filter_map(|command| match command {
                BrokerCommand::Complete(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn routes_reply_to_request() {
        let (mut worker, rx) = worker(false);
        worker.connect(0, "loop".to_string()).unwrap();

        worker.send(request(1, None));
        worker.send(request(2, None));
        worker.poll_sockets();

        let done = completions(&rx);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].request, 1);
        assert_eq!(done[0].outcome, Outcome::Reply(vec![1u64.to_be_bytes().to_vec()]));
        assert_eq!(done[1].controller, 7);
        assert!(worker.in_flight.is_empty());
    }

    #[test]
    fn expired_deadline_wins_once() {
        let (mut worker, rx) = worker(true);
        worker.connect(0, "loop".to_string()).unwrap();

        let deadline = Instant::now() + Duration::from_millis(5);
        worker.send(request(3, Some(deadline)));
        worker.expire(deadline - Duration::from_millis(1));
        assert!(completions(&rx).is_empty());

        worker.expire(deadline);
        worker.expire(deadline + Duration::from_secs(1));
        let done = completions(&rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, Outcome::DeadlineExceeded);
    }

    #[test]
    fn late_reply_is_ignored() {
        let (mut worker, rx) = worker(false);
        worker.connect(0, "loop".to_string()).unwrap();

        let deadline = Instant::now() + Duration::from_millis(5);
        worker.send(request(4, Some(deadline)));
        worker.expire(deadline);
        worker.poll_sockets();

        let done = completions(&rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, Outcome::DeadlineExceeded);
    }

    #[test]
    fn past_deadline_never_sent() {
        let (mut worker, rx) = worker(false);
        worker.connect(0, "loop".to_string()).unwrap();

        worker.send(request(5, Some(Instant::now())));
        assert_eq!(completions(&rx)[0].outcome, Outcome::DeadlineExceeded);
        worker.poll_sockets();
        assert!(completions(&rx).is_empty());
    }

    #[test]
    fn unknown_endpoint_is_cancelled() {
        let (mut worker, rx) = worker(false);
        worker.send(request(6, None));
        assert_eq!(completions(&rx)[0].outcome, Outcome::Cancelled);
    }

    #[test]
    fn connect_failure_registers_nothing() {
        let (mut worker, _rx) = worker(false);
        assert!(worker.connect(0, "bad".to_string()).is_err());
        assert!(worker.endpoints.is_empty());
    }

    #[test]
    fn shutdown_cancels_in_flight() {
        let (mut worker, rx) = worker(true);
        worker.connect(0, "loop".to_string()).unwrap();
        worker.send(request(8, None));
        worker.send(request(9, Some(Instant::now() + Duration::from_secs(60))));

        worker.cancel_all();
        let done = completions(&rx);
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.outcome == Outcome::Cancelled));
        assert!(worker.deadlines.is_empty());
    }

    #[test]
    fn lost_socket_resends_after_reconnect() {
        let (mut worker, rx) = worker(false);
        worker.connect(0, "loop".to_string()).unwrap();
        worker.send(request(11, None));

        // the echo queued on the old socket goes down with it
        worker.link_lost(0);
        assert_eq!(worker.endpoints[&0].backlog.len(), 1);
        worker.poll_sockets();
        assert!(completions(&rx).is_empty());

        worker.start_reconnects(Instant::now());
        assert!(matches!(worker.endpoints[&0].link, Link::Connecting));
        wait_reconnect(&mut worker, 0);
        assert!(matches!(worker.endpoints[&0].link, Link::Up(_)));
        assert!(worker.endpoints[&0].backlog.is_empty());

        worker.poll_sockets();
        let done = completions(&rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].request, 11);
        assert_eq!(done[0].outcome, Outcome::Reply(vec![11u64.to_be_bytes().to_vec()]));
    }

    #[test]
    fn idle_endpoint_reconnects_on_next_request() {
        let (mut worker, rx) = worker(false);
        worker.connect(0, "loop".to_string()).unwrap();
        worker.link_lost(0);

        worker.start_reconnects(Instant::now());
        assert!(matches!(worker.endpoints[&0].link, Link::Down { .. }));

        worker.send(request(12, None));
        assert_eq!(worker.endpoints[&0].backlog.len(), 1);
        worker.start_reconnects(Instant::now());
        wait_reconnect(&mut worker, 0);

        worker.poll_sockets();
        assert_eq!(completions(&rx)[0].request, 12);
    }

    #[test]
    fn failed_reconnect_backs_off_and_deadline_still_fires() {
        let (mut worker, rx, context) = worker_with(true);
        worker.connect(0, "loop".to_string()).unwrap();
        context.refuse.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_millis(30);
        worker.send(request(13, Some(deadline)));
        worker.link_lost(0);
        let now = Instant::now();
        worker.start_reconnects(now);
        wait_reconnect(&mut worker, 0);

        let ep = &worker.endpoints[&0];
        assert_eq!(ep.failures, 1);
        assert!(matches!(ep.link, Link::Down { retry_at } if retry_at >= now + RECONNECT_BACKOFF));
        assert_eq!(ep.backlog.len(), 1);

        worker.expire(deadline);
        let done = completions(&rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, Outcome::DeadlineExceeded);
    }

    #[test]
    fn backoff_is_capped() {
        let (mut worker, _rx) = worker(true);
        worker.connect(0, "loop".to_string()).unwrap();
        let now = Instant::now();
        for _ in 0..20 {
            worker.back_off(0, now);
        }
        assert!(matches!(
            worker.endpoints[&0].link,
            Link::Down { retry_at } if retry_at == now + MAX_RECONNECT_BACKOFF
        ));
    }

    #[test]
    fn slow_reconnect_does_not_block_other_endpoints() {
        let (mut worker, rx, context) = worker_with(true);
        worker.connect(0, "quiet".to_string()).unwrap();
        worker.connect(1, "flaky".to_string()).unwrap();
        context.stall.store(true, Ordering::SeqCst);

        worker.link_lost(1);
        worker.send(Request {
            endpoint: 1,
            ..request(14, None)
        });
        let started = Instant::now();
        worker.start_reconnects(started);
        assert!(started.elapsed() < Duration::from_millis(100));

        let deadline = Instant::now() + Duration::from_millis(20);
        worker.send(request(15, Some(deadline)));
        worker.expire(deadline);
        let done = completions(&rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].request, 15);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn disconnect_cancels_its_routes() {
        let (mut worker, rx) = worker(true);
        worker.connect(0, "loop".to_string()).unwrap();
        worker.send(request(16, None));

        worker.disconnect(0);
        let done = completions(&rx);
        assert_eq!(done[0].outcome, Outcome::Cancelled);
        assert!(worker.in_flight.is_empty());
    }

    #[test]
    fn next_wake_respects_deadlines() {
        let (mut worker, _rx) = worker(true);
        worker.poll_interval = Duration::from_secs(1);
        worker.connect(0, "loop".to_string()).unwrap();
        let now = Instant::now();
        worker.send(request(10, Some(now + Duration::from_millis(20))));

        assert!(worker.next_wake(now) <= Duration::from_millis(20));
    }
}
