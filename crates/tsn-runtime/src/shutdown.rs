//! Process-wide run flag shared by every cyclic task.
//!
//! Tasks poll [`ShutdownSignal::is_running`] once per iteration, right
//! after their absolute-time wait returns. There is no mid-wait
//! cancellation, so shutdown latency is bounded by one cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Cloneable handle to the shared running flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    running: Arc<AtomicBool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Create a signal in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the run should continue.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Clear the running flag. Returns `true` if this call performed the
    /// transition.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        let was_running = self.running.swap(false, Ordering::Relaxed);
        if was_running {
            info!(reason, "Shutdown requested");
        }
        was_running
    }
}
