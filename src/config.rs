//! Connection manager configuration.
use std::time::Duration;

/// Tunables for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Number of I/O worker threads. Each one holds a socket per connected endpoint.
    pub threads: usize,
    /// Longest a worker sleeps before polling its sockets and timers again.
    pub poll_interval: Duration,
    /// Capacity of each worker's inbound request queue. The broker blocks when it is full.
    pub worker_queue_depth: usize,
    /// Connect timeout for the default TCP context.
    pub connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            poll_interval: Duration::from_millis(1),
            worker_queue_depth: 1024,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl ManagerConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_queue_depth(mut self, depth: usize) -> Self {
        self.worker_queue_depth = depth;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
