//! Boundary between the real-time core and the pub/sub protocol engine.
//!
//! The engine owns frame encoding, decoding and the network transport. The
//! core only hands it control once per cycle through [`CycleHandler`] and,
//! for the publisher, the transport parameters for the frame it is about to
//! send.

use std::fmt;
use tsn_common::time::AbsoluteWakeTime;

/// Identifier of a writer or reader group inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a cyclic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskRole {
    /// Encodes and transmits the writer group's frame.
    Publisher,
    /// Receives and decodes the reader group's frame.
    Subscriber,
    /// Updates the publisher-facing values and records measurements.
    UserApplication,
}

impl TaskRole {
    /// Short thread-name friendly label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskRole::Publisher => "publisher",
            TaskRole::Subscriber => "subscriber",
            TaskRole::UserApplication => "user-app",
        }
    }
}

impl fmt::Display for TaskRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-frame transport settings written by the publisher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportParams {
    /// Whether the transport should attach `SO_TXTIME` to the frame.
    pub txtime_enabled: bool,
    /// Absolute egress time in nanoseconds on the cycle clock.
    pub transmission_time_ns: u64,
}

/// What the core passes to the engine on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleParams {
    /// Zero-based tick index of the calling loop.
    pub cycle: u64,
    /// Target wake time of this tick.
    pub wake_time: AbsoluteWakeTime,
    /// Transport parameters; present only for publisher ticks.
    pub transport: Option<TransportParams>,
}

/// Work the engine performs once per publisher or subscriber tick.
///
/// Failures inside the engine are the engine's own concern; the core keeps
/// ticking regardless.
pub trait CycleHandler: Send {
    /// Run one cycle.
    fn run_cycle(&mut self, params: &CycleParams);
}

impl<F> CycleHandler for F
where
    F: FnMut(&CycleParams) + Send,
{
    fn run_cycle(&mut self, params: &CycleParams) {
        self(params);
    }
}
