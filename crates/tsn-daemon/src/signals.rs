//! Signal handling for graceful daemon shutdown.
//!
//! SIGINT and SIGTERM only record the signal number in an atomic; the main
//! thread polls it and clears the shared run flag. The cyclic tasks notice
//! the cleared flag after their next wake-up.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use tsn_runtime::shutdown::ShutdownSignal;

/// Last signal number received, 0 if none.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    PENDING_SIGNAL.store(signal, Ordering::Relaxed);
}

/// Signal types that stop the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl SignalKind {
    fn from_raw(signal: i32) -> Option<Self> {
        match signal {
            libc::SIGTERM => Some(SignalKind::Terminate),
            libc::SIGINT => Some(SignalKind::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Bridges process signals into a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct SignalHandler {
    shutdown: ShutdownSignal,
}

impl SignalHandler {
    /// Install the SIGINT and SIGTERM handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if `sigaction` fails.
    pub fn install(shutdown: ShutdownSignal) -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only performs an atomic store, which is
            // async-signal-safe.
            unsafe { sigaction(signal, &action) }?;
        }
        debug!("Unix signal handlers registered");
        Ok(Self { shutdown })
    }

    /// Take the pending signal, if any.
    pub fn take_signal(&self) -> Option<SignalKind> {
        SignalKind::from_raw(PENDING_SIGNAL.swap(0, Ordering::Relaxed))
    }

    /// Forward a pending signal to the run flag. Returns `true` if one was
    /// pending.
    pub fn poll(&self) -> bool {
        match self.take_signal() {
            Some(kind) => {
                info!(signal = %kind, "Shutdown signal received");
                self.shutdown.request_shutdown(&kind.to_string());
                true
            }
            None => false,
        }
    }

    /// Block until the run flag is cleared by a signal or by any task.
    pub fn wait_for_shutdown(&self, poll_interval: Duration) {
        while self.shutdown.is_running() {
            if self.poll() {
                break;
            }
            std::thread::sleep(poll_interval);
        }
    }
}
