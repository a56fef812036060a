//! Cooperative shutdown.
//!
//! Every [`ConnectionManager`](crate::ConnectionManager) and [`Server`](crate::Server) watches
//! two tokens: its own, and the process-wide token tripped by the signal handler installed with
//! [`install_signal_handler`].
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use log::info;

/// A clonable stop flag. All clones observe the same state; once triggered it stays triggered.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// True if this token or the process-wide token has been triggered.
    pub fn should_stop(&self) -> bool {
        self.is_triggered() || process_token().is_triggered()
    }
}

static PROCESS_TOKEN: OnceLock<ShutdownToken> = OnceLock::new();
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// The token tripped by SIGINT/SIGTERM once [`install_signal_handler`] has run.
pub fn process_token() -> &'static ShutdownToken {
    PROCESS_TOKEN.get_or_init(ShutdownToken::new)
}

/// Installs SIGINT and SIGTERM handlers that make every manager and server in the process wind
/// down. Calling it more than once is a no-op.
pub fn install_signal_handler() -> Result<(), ctrlc::Error> {
    if HANDLER_INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let token = process_token().clone();
    ctrlc::set_handler(move || {
        info!("termination signal received, shutting down");
        token.trigger();
    })
    .inspect_err(|_| HANDLER_INSTALLED.store(false, Ordering::Release))
}
