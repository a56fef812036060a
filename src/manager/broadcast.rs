//! The broadcast thread.
//!
//! Fans control events out to every worker: connect and disconnect requests from the manager,
//! and the shutdown sequence. Shutdown is started either by the manager or by the process-wide
//! signal token, and always runs in the same order: the broker stops forwarding, then every
//! worker is told to stop and cancel what it still holds.
use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use log::{debug, info};

use crate::shutdown::ShutdownToken;

use super::fabric::{BrokerCommand, ControlEvent, WorkerCommand, WorkerSender};

/// How often the process-wide shutdown token is checked.
const SIGNAL_POLL: Duration = Duration::from_millis(20);

pub(crate) struct Broadcast {
    control: Receiver<ControlEvent>,
    workers: Vec<WorkerSender>,
    broker: Sender<BrokerCommand>,
    token: ShutdownToken,
}

impl Broadcast {
    pub fn new(
        control: Receiver<ControlEvent>,
        workers: Vec<WorkerSender>,
        broker: Sender<BrokerCommand>,
        token: ShutdownToken,
    ) -> Self {
        Self {
            control,
            workers,
            broker,
            token,
        }
    }

    pub fn run(self, ready: Sender<()>) {
        let _ = ready.send(());
        drop(ready);

        loop {
            match self.control.recv_timeout(SIGNAL_POLL) {
                Ok(ControlEvent::Connect {
                    endpoint,
                    address,
                    ack,
                }) => {
                    for worker in &self.workers {
                        let _ = worker.send(WorkerCommand::Connect {
                            endpoint,
                            address: address.clone(),
                            ack: ack.clone(),
                        });
                    }
                }
                Ok(ControlEvent::Disconnect { endpoint }) => {
                    for worker in &self.workers {
                        let _ = worker.send(WorkerCommand::Disconnect { endpoint });
                    }
                }
                Ok(ControlEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.should_stop() {
                        info!("shutdown token triggered");
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(self) {
        self.token.trigger();

        let (ack, drained) = mpsc::channel();
        if self.broker.send(BrokerCommand::Drain { ack }).is_ok() {
            let _ = drained.recv();
        }

        for worker in &self.workers {
            let _ = worker.send(WorkerCommand::Shutdown);
        }
        debug!("shutdown sent to {} workers", self.workers.len());
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use super::*;

    #[test]
    fn connect_reaches_every_worker() {
        let (control_tx, control_rx) = mpsc::channel();
        let (broker_tx, broker_rx) = mpsc::channel();
        let (w0, r0) = mpsc::sync_channel(4);
        let (w1, r1) = mpsc::sync_channel(4);
        let broadcast = Broadcast::new(control_rx, vec![w0, w1], broker_tx, ShutdownToken::new());
        let (ack, _acks) = mpsc::channel();

        control_tx
            .send(ControlEvent::Connect {
                endpoint: 4,
                address: "tcp://127.0.0.1:1".to_string(),
                ack,
            })
            .unwrap();
        drop(control_tx);
        let (ready, _) = mpsc::channel();
        thread::spawn(move || {
            // answer the drain request
            if let Ok(BrokerCommand::Drain { ack }) = broker_rx.recv() {
                let _ = ack.send(());
            }
        });
        broadcast.run(ready);

        for rx in [r0, r1] {
            assert!(matches!(
                rx.try_recv(),
                Ok(WorkerCommand::Connect { endpoint: 4, .. })
            ));
            assert!(matches!(rx.try_recv(), Ok(WorkerCommand::Shutdown)));
        }
    }

    #[test]
    fn token_triggers_shutdown() {
        let (_control_tx, control_rx) = mpsc::channel();
        let (broker_tx, broker_rx) = mpsc::channel();
        let (w0, r0) = mpsc::sync_channel(4);
        let token = ShutdownToken::new();
        let broadcast = Broadcast::new(control_rx, vec![w0], broker_tx, token.clone());

        let handle = thread::spawn(move || {
            let (ready, _) = mpsc::channel();
            broadcast.run(ready);
        });
        token.trigger();

        match broker_rx.recv().unwrap() {
            BrokerCommand::Drain { ack } => ack.send(()).unwrap(),
            _ => panic!("expected a drain request"),
        }
        handle.join().unwrap();
        assert!(matches!(r0.try_recv(), Ok(WorkerCommand::Shutdown)));
    }
}
