//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Checking real-time prerequisites (privileges, PREEMPT_RT)
//! - Building configurations that run on unprivileged CI
//! - Setting up a shared loop context

#![allow(dead_code)] // Not every test module uses every helper

use std::fs;
use std::time::Duration;
use tsn_common::config::{ClockSource, OverrunPolicy, SchedPolicy, TsnConfig};
use tsn_runtime::clock::CycleClock;
use tsn_runtime::executor::{CycleTimeline, LoopContext};
use tsn_runtime::realtime::{current_thread_affinity, set_current_thread_scheduler};
use tsn_runtime::shutdown::ShutdownSignal;

/// Check if the system has PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    if let Ok(version) = fs::read_to_string("/proc/version") {
        version.contains("PREEMPT_RT") || version.contains("PREEMPT RT")
    } else {
        false
    }
}

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Whether this process may actually switch a thread to SCHED_FIFO.
///
/// Root alone is not enough inside containers without CAP_SYS_NICE, so the
/// check is done on a throwaway thread.
pub fn can_use_fifo() -> bool {
    if !is_root() {
        return false;
    }
    std::thread::spawn(|| set_current_thread_scheduler(SchedPolicy::Fifo, 1).is_ok())
        .join()
        .unwrap_or(false)
}

/// First CPU core this process may run on.
pub fn first_allowed_core() -> usize {
    current_thread_affinity().expect("affinity readable")[0]
}

/// A 1 ms configuration that runs without privileges.
pub fn test_config() -> TsnConfig {
    let core = first_allowed_core();
    let mut config = TsnConfig {
        cycle_time_ms: 1.0,
        clock: ClockSource::Monotonic,
        deadline_miss: OverrunPolicy::Warn,
        startup_guard: Duration::ZERO,
        ..TsnConfig::default()
    };
    config.transport.interface = Some("lo".into());
    config.realtime.policy = SchedPolicy::Other;
    config.realtime.lock_memory = false;
    config.realtime.publisher.core = core;
    config.realtime.subscriber.core = core;
    config.realtime.user_application.core = core;
    config
}

/// Loop context anchored at the current time of the configured clock.
pub fn loop_context(config: &TsnConfig, shutdown: &ShutdownSignal) -> LoopContext {
    let clock = CycleClock::new(config.clock);
    let timeline = CycleTimeline::new(
        clock,
        clock.now().expect("clock readable"),
        config.cycle_ns(),
        config.startup_guard,
    );
    LoopContext::new(timeline, shutdown.clone(), config.deadline_miss)
}
