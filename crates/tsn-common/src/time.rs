//! Clock and phase arithmetic for the cyclic tasks.
//!
//! Wake times are absolute `(seconds, nanoseconds)` pairs. Every loop keeps
//! one of these and advances it by exactly one cycle per tick, so the
//! sequence of wake times is anchored to a fixed origin and never
//! accumulates the drift of a relative sleep.

use std::fmt;
use std::time::Duration;

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds in one millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Delay between startup and the first tick, so every task reaches its
/// wait point before the first cycle fires.
pub const DEFAULT_STARTUP_GUARD: Duration = Duration::from_secs(5);

/// An absolute point in time on the cycle clock.
///
/// After [`normalize`] the nanosecond field is always in `[0, 1e9)`.
/// Ordering is only meaningful between normalized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AbsoluteWakeTime {
    /// Whole seconds since the clock epoch.
    pub secs: u64,
    /// Nanoseconds past `secs`.
    pub nanos: u64,
}

impl AbsoluteWakeTime {
    /// Create a wake time, folding any nanosecond overflow into seconds.
    #[must_use]
    pub fn new(secs: u64, nanos: u64) -> Self {
        normalize(Self { secs, nanos })
    }

    /// Build a wake time from a nanosecond count since the clock epoch.
    #[must_use]
    pub fn from_nanos(total: u64) -> Self {
        Self {
            secs: total / NANOS_PER_SEC,
            nanos: total % NANOS_PER_SEC,
        }
    }

    /// Total nanoseconds since the clock epoch.
    #[must_use]
    pub fn as_nanos(&self) -> u64 {
        self.secs * NANOS_PER_SEC + self.nanos
    }

    /// Nanoseconds elapsed since `earlier`, or zero if `earlier` is later.
    #[must_use]
    pub fn nanos_since(&self, earlier: &AbsoluteWakeTime) -> u64 {
        self.as_nanos().saturating_sub(earlier.as_nanos())
    }

    /// Return this time with its sub-second part dropped.
    #[must_use]
    pub fn truncate_to_second(&self) -> Self {
        Self {
            secs: self.secs,
            nanos: 0,
        }
    }
}

impl fmt::Display for AbsoluteWakeTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Fold nanoseconds beyond one second into the seconds field.
///
/// Preserves the total elapsed time and is idempotent on normalized input.
#[must_use]
pub fn normalize(time: AbsoluteWakeTime) -> AbsoluteWakeTime {
    if time.nanos < NANOS_PER_SEC {
        return time;
    }
    AbsoluteWakeTime {
        secs: time.secs + time.nanos / NANOS_PER_SEC,
        nanos: time.nanos % NANOS_PER_SEC,
    }
}

/// Convert a cycle length in milliseconds to whole nanoseconds.
///
/// Negative or NaN input yields zero; callers validate the cycle beforehand.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn cycle_ms_to_ns(cycle_ms: f64) -> u64 {
    if cycle_ms.is_nan() || cycle_ms <= 0.0 {
        return 0;
    }
    (cycle_ms * NANOS_PER_MILLI as f64).round() as u64
}

/// Offset of a phase fraction within a cycle, in nanoseconds.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn phase_offset_ns(cycle_ns: u64, phase_fraction: f64) -> u64 {
    if phase_fraction.is_nan() || phase_fraction <= 0.0 {
        return 0;
    }
    (cycle_ns as f64 * phase_fraction).round() as u64
}

/// First wake time of a task, using [`DEFAULT_STARTUP_GUARD`].
#[must_use]
pub fn initial_phase_wake(
    base: AbsoluteWakeTime,
    cycle_ns: u64,
    phase_fraction: f64,
) -> AbsoluteWakeTime {
    initial_phase_wake_with_guard(base, cycle_ns, phase_fraction, DEFAULT_STARTUP_GUARD)
}

/// First wake time of a task: `base` truncated to its whole second, plus the
/// startup guard, plus the phase offset.
///
/// Dropping the sub-second part of `base` puts every task computed from the
/// same base second on one common cycle grid.
#[must_use]
pub fn initial_phase_wake_with_guard(
    base: AbsoluteWakeTime,
    cycle_ns: u64,
    phase_fraction: f64,
    guard: Duration,
) -> AbsoluteWakeTime {
    let origin = base.truncate_to_second();
    normalize(AbsoluteWakeTime {
        secs: origin.secs.saturating_add(guard.as_secs()),
        nanos: u64::from(guard.subsec_nanos()) + phase_offset_ns(cycle_ns, phase_fraction),
    })
}

/// Advance a wake time by exactly one cycle.
#[must_use]
pub fn advance_by_cycle(time: AbsoluteWakeTime, cycle_ns: u64) -> AbsoluteWakeTime {
    normalize(AbsoluteWakeTime {
        secs: time.secs,
        nanos: time.nanos + cycle_ns,
    })
}

/// Earliest tick on the grid `first + k * cycle` that lies strictly after `now`.
///
/// Returns `first` unchanged when it is still in the future.
#[must_use]
pub fn first_future_tick(
    first: AbsoluteWakeTime,
    now: AbsoluteWakeTime,
    cycle_ns: u64,
) -> AbsoluteWakeTime {
    if first > now || cycle_ns == 0 {
        return first;
    }
    let missed = now.nanos_since(&first) / cycle_ns + 1;
    AbsoluteWakeTime::from_nanos(first.as_nanos() + missed * cycle_ns)
}
