//! Phase-staggered cyclic loops.
//!
//! All loops share one cycle length and one time origin and differ only in
//! the fraction of the cycle at which they wake:
//!
//! | Loop             | Default phase | Work per tick                          |
//! |------------------|---------------|----------------------------------------|
//! | subscriber       | 0.0           | engine receives and decodes a frame    |
//! | user application | 0.3           | update publisher counters, measure     |
//! | publisher        | 0.6           | stamp egress time, engine sends frame  |
//!
//! Each loop blocks only in an absolute-time wait, then checks the shared
//! [`ShutdownSignal`], does its work and advances its wake time by exactly
//! one cycle.

use crate::clock::CycleClock;
use crate::engine::{CycleHandler, CycleParams};
use crate::measurement::MeasurementLogger;
use crate::metrics::{WakeLatencyStats, DEFAULT_LATENCY_WINDOW};
use crate::shutdown::ShutdownSignal;
use crate::slots::CounterSlots;
use crate::txtime::TxTimeStamper;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use tsn_common::config::{OverrunPolicy, TsnConfig};
use tsn_common::error::{TsnError, TsnResult};
use tsn_common::time::{
    advance_by_cycle, first_future_tick, initial_phase_wake_with_guard, AbsoluteWakeTime,
};

/// Common time grid of all cyclic tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimeline {
    clock: CycleClock,
    base: AbsoluteWakeTime,
    cycle_ns: u64,
    startup_guard: Duration,
}

impl CycleTimeline {
    /// Create a timeline anchored at `base`.
    #[must_use]
    pub fn new(clock: CycleClock, base: AbsoluteWakeTime, cycle_ns: u64, startup_guard: Duration) -> Self {
        Self {
            clock,
            base,
            cycle_ns,
            startup_guard,
        }
    }

    /// Create a timeline anchored at the current time of the configured clock.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Clock`] if the clock cannot be read.
    pub fn starting_now(config: &TsnConfig) -> TsnResult<Self> {
        let clock = CycleClock::new(config.clock);
        let base = clock.now()?;
        Ok(Self::new(clock, base, config.cycle_ns(), config.startup_guard))
    }

    /// The clock driving the timeline.
    #[must_use]
    pub fn clock(&self) -> CycleClock {
        self.clock
    }

    /// Cycle length in nanoseconds.
    #[must_use]
    pub fn cycle_ns(&self) -> u64 {
        self.cycle_ns
    }

    /// First wake time of a task at `phase_fraction`.
    ///
    /// A task started after its nominal first tick has passed joins the grid
    /// at the next future tick instead of running a burst of late cycles.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Clock`] if the clock cannot be read.
    pub fn first_wake(&self, phase_fraction: f64) -> TsnResult<AbsoluteWakeTime> {
        let nominal =
            initial_phase_wake_with_guard(self.base, self.cycle_ns, phase_fraction, self.startup_guard);
        let now = self.clock.now()?;
        Ok(first_future_tick(nominal, now, self.cycle_ns))
    }
}

/// Shared state every cyclic loop needs.
#[derive(Debug, Clone)]
pub struct LoopContext {
    timeline: CycleTimeline,
    shutdown: ShutdownSignal,
    deadline_miss: OverrunPolicy,
}

impl LoopContext {
    /// Bundle the timeline, run flag and deadline-miss policy.
    #[must_use]
    pub fn new(timeline: CycleTimeline, shutdown: ShutdownSignal, deadline_miss: OverrunPolicy) -> Self {
        Self {
            timeline,
            shutdown,
            deadline_miss,
        }
    }

    /// The shared time grid.
    #[must_use]
    pub fn timeline(&self) -> &CycleTimeline {
        &self.timeline
    }

    /// The shared run flag.
    #[must_use]
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

/// Drive `tick` on the grid at `phase_fraction` until shutdown.
///
/// Any error clears the run flag so the other tasks stop as well.
fn run_cyclic<F>(task: &str, ctx: &LoopContext, phase_fraction: f64, tick: F) -> TsnResult<WakeLatencyStats>
where
    F: FnMut(u64, AbsoluteWakeTime) -> TsnResult<()>,
{
    let result = drive(task, ctx, phase_fraction, tick);
    if let Err(e) = &result {
        error!(task, error = %e, "Cyclic loop failed");
        ctx.shutdown.request_shutdown("cyclic task failure");
    }
    result
}

fn drive<F>(task: &str, ctx: &LoopContext, phase_fraction: f64, mut tick: F) -> TsnResult<WakeLatencyStats>
where
    F: FnMut(u64, AbsoluteWakeTime) -> TsnResult<()>,
{
    let clock = ctx.timeline.clock();
    let cycle_ns = ctx.timeline.cycle_ns();
    let mut stats = WakeLatencyStats::new(cycle_ns, DEFAULT_LATENCY_WINDOW);
    let mut wake = ctx.timeline.first_wake(phase_fraction)?;
    let mut cycle: u64 = 0;

    info!(task, phase = phase_fraction, first_wake = %wake, cycle_ns, "Cyclic loop starting");

    while ctx.shutdown.is_running() {
        clock.sleep_until(wake)?;
        if !ctx.shutdown.is_running() {
            break;
        }

        let late_ns = clock.now()?.nanos_since(&wake);
        if stats.record(late_ns) {
            handle_deadline_miss(task, ctx, cycle, cycle_ns, late_ns)?;
        }

        tick(cycle, wake)?;
        trace!(task, cycle, late_ns, "Tick complete");

        wake = advance_by_cycle(wake, cycle_ns);
        cycle += 1;
    }

    stats.log_summary(task);
    Ok(stats)
}

fn handle_deadline_miss(
    task: &str,
    ctx: &LoopContext,
    cycle: u64,
    cycle_ns: u64,
    late_ns: u64,
) -> TsnResult<()> {
    match ctx.deadline_miss {
        OverrunPolicy::Fault => Err(TsnError::DeadlineMiss {
            expected_ns: cycle_ns,
            actual_ns: late_ns,
        }),
        OverrunPolicy::Warn => {
            warn!(task, cycle, late_ns, cycle_ns, "Deadline miss");
            Ok(())
        }
        OverrunPolicy::Ignore => Ok(()),
    }
}

/// Publisher loop: stamp the egress time, then let the engine send.
///
/// # Errors
///
/// Returns an error if the clock fails or, under [`OverrunPolicy::Fault`],
/// on the first deadline miss. Either way the run flag is cleared.
pub fn run_publisher_loop<H>(
    ctx: &LoopContext,
    phase_fraction: f64,
    stamper: TxTimeStamper,
    handler: &mut H,
) -> TsnResult<WakeLatencyStats>
where
    H: CycleHandler + ?Sized,
{
    run_cyclic("publisher", ctx, phase_fraction, |cycle, wake_time| {
        let params = CycleParams {
            cycle,
            wake_time,
            transport: Some(stamper.transport_params(wake_time)),
        };
        handler.run_cycle(&params);
        Ok(())
    })
}

/// Subscriber loop: let the engine receive and decode into the slots.
///
/// # Errors
///
/// See [`run_publisher_loop`].
pub fn run_subscriber_loop<H>(ctx: &LoopContext, phase_fraction: f64, handler: &mut H) -> TsnResult<WakeLatencyStats>
where
    H: CycleHandler + ?Sized,
{
    run_cyclic("subscriber", ctx, phase_fraction, |cycle, wake_time| {
        handler.run_cycle(&CycleParams {
            cycle,
            wake_time,
            transport: None,
        });
        Ok(())
    })
}

/// Per-tick work of the user-application task.
#[derive(Debug)]
pub struct UserApplication {
    slots: CounterSlots,
    clock: CycleClock,
    logger: Option<MeasurementLogger>,
}

impl UserApplication {
    /// Create the application. Pass a logger to record measurements.
    #[must_use]
    pub fn new(slots: CounterSlots, clock: CycleClock, logger: Option<MeasurementLogger>) -> Self {
        Self {
            slots,
            clock,
            logger,
        }
    }

    /// Advance the publisher counters and record measurements.
    ///
    /// The subscribe log only receives a sample once the subscriber counter
    /// has seen a non-zero value.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Clock`] if a timestamp cannot be taken.
    pub fn tick(&mut self) -> TsnResult<()> {
        let published = self.slots.increment_publisher();
        let modified_at = self.clock.now()?;
        let received_at = self.clock.now()?;

        if let Some(logger) = self.logger.as_mut() {
            logger.record_publish(modified_at, published);
            let received = self.slots.subscriber_counter().load();
            if received > 0 {
                logger.record_subscribe(received_at, received);
            }
        }
        Ok(())
    }

    /// Counter slots driven by this application.
    #[must_use]
    pub fn slots(&self) -> &CounterSlots {
        &self.slots
    }

    /// Consume the application and return its measurement logger.
    #[must_use]
    pub fn into_logger(self) -> Option<MeasurementLogger> {
        self.logger
    }
}

/// User-application loop.
///
/// Resets the publisher counters to their start values before the first
/// tick.
///
/// # Errors
///
/// See [`run_publisher_loop`].
pub fn run_user_application_loop(
    ctx: &LoopContext,
    phase_fraction: f64,
    app: &mut UserApplication,
) -> TsnResult<WakeLatencyStats> {
    app.slots.reset_publisher();
    debug!("Publisher counters reset");
    run_cyclic("user-app", ctx, phase_fraction, |_, _| app.tick())
}
