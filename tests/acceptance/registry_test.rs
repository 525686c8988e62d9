//! Engine cycle registration acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Registering the writer group starts exactly one publisher thread
//!   pinned to the configured core with the configured priority
//! - Removing a cycle stops and joins its thread without error
//! - Writer, reader and user-application tasks together carry the counter
//!   from the publisher slots to the subscriber slots

#![cfg(target_os = "linux")]

use super::common::{can_use_fifo, loop_context, test_config};
use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tsn_common::config::SchedPolicy;
use tsn_runtime::clock::CycleClock;
use tsn_runtime::engine::{CycleHandler, CycleParams, GroupId, TaskRole};
use tsn_runtime::executor::{run_user_application_loop, UserApplication};
use tsn_runtime::measurement::MeasurementLogger;
use tsn_runtime::registry::{CycleHooks, CycleRegistry};
use tsn_runtime::runner::{spawn_rt_task, RtTaskSpec};
use tsn_runtime::shutdown::ShutdownSignal;
use tsn_runtime::slots::CounterSlots;

/// CPU list the kernel reports for one thread of this process.
fn thread_cpus_allowed(tid: i32) -> String {
    let status = fs::read_to_string(format!("/proc/self/task/{tid}/status")).unwrap();
    status
        .lines()
        .find_map(|line| line.strip_prefix("Cpus_allowed_list:"))
        .map(|list| list.trim().to_string())
        .expect("Cpus_allowed_list present")
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn test_writer_group_gets_pinned_publisher_thread() {
    let mut config = test_config();
    let fifo = can_use_fifo();
    if fifo {
        config.realtime.policy = SchedPolicy::Fifo;
    } else {
        eprintln!("SCHED_FIFO not permitted; checking placement with SCHED_OTHER");
    }
    let core = config.realtime.publisher.core;
    let priority = config.realtime.publisher.priority;

    let shutdown = ShutdownSignal::new();
    let registry = CycleRegistry::new(config.clone(), loop_context(&config, &shutdown));

    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let handler: Box<dyn CycleHandler> = Box::new(move |params: &CycleParams| {
        assert!(params.transport.is_some());
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let handle = registry
        .add_cycle(GroupId(config.transport.writer_group_id), handler, config.cycle_time_ms)
        .unwrap();
    assert_eq!(registry.len(), 1);

    let (role, status) = registry.status(handle).unwrap();
    assert_eq!(role, TaskRole::Publisher);
    assert_eq!(status.core, core);
    assert!(status.tid > 0);
    assert_eq!(thread_cpus_allowed(status.tid), core.to_string());
    if fifo {
        assert_eq!(status.priority, Some(priority));
    } else {
        assert_eq!(status.priority, None);
    }

    assert!(wait_for(|| ticks.load(Ordering::Relaxed) >= 3, Duration::from_secs(2)));

    registry.stop_cycle(handle).unwrap();
    assert!(registry.is_empty());
    assert!(!shutdown.is_running());
}

#[test]
fn test_failed_writer_leaves_no_running_cycles() {
    let mut config = test_config();
    config.realtime.publisher.core = 4096;

    let shutdown = ShutdownSignal::new();
    let registry = CycleRegistry::new(config.clone(), loop_context(&config, &shutdown));

    let reader = registry
        .add_cycle(
            GroupId(config.transport.reader_group_id),
            Box::new(|_: &CycleParams| {}),
            config.cycle_time_ms,
        )
        .unwrap();
    let writer = registry.add_cycle(
        GroupId(config.transport.writer_group_id),
        Box::new(|_: &CycleParams| {}),
        config.cycle_time_ms,
    );
    assert!(writer.is_err());

    registry.remove_cycle(reader);
    assert!(registry.is_empty());
}

#[test]
fn test_counter_flows_from_publisher_to_subscriber() {
    let config = test_config();
    let shutdown = ShutdownSignal::new();
    let ctx = loop_context(&config, &shutdown);
    let registry = CycleRegistry::new(config.clone(), ctx.clone());
    let slots = CounterSlots::allocate().unwrap();

    // Stand-in for the network: the last counter value on the wire
    let wire = Arc::new(AtomicU64::new(0));

    let rx_slots = slots.clone();
    let rx_wire = Arc::clone(&wire);
    let reader = registry
        .add_cycle(
            GroupId(config.transport.reader_group_id),
            Box::new(move |_: &CycleParams| {
                let value = rx_wire.load(Ordering::Acquire);
                if value > 0 {
                    rx_slots.subscriber_counter().store(value);
                }
            }),
            config.cycle_time_ms,
        )
        .unwrap();

    let tx_slots = slots.clone();
    let tx_wire = Arc::clone(&wire);
    let writer = registry
        .add_cycle(
            GroupId(config.transport.writer_group_id),
            Box::new(move |_: &CycleParams| {
                tx_wire.store(tx_slots.publisher_counter().load(), Ordering::Release);
            }),
            config.cycle_time_ms,
        )
        .unwrap();

    let capacity = 200;
    let logger = MeasurementLogger::new(capacity, shutdown.clone()).unwrap();
    let mut app = UserApplication::new(slots.clone(), CycleClock::new(config.clock), Some(logger));
    let phase = config.phases.user_application;
    let spec = RtTaskSpec::from_config(
        "tsn-user-app",
        config.realtime.policy,
        &config.realtime.user_application,
    );
    let user_app = spawn_rt_task(spec, move || {
        run_user_application_loop(&ctx, phase, &mut app)?;
        Ok(app.into_logger())
    })
    .unwrap();

    // The publish log fills after `capacity` ticks and ends the run
    let logger = user_app.join().unwrap().expect("logger returned");
    assert!(!shutdown.is_running());
    registry.stop_cycle(reader).unwrap();
    registry.stop_cycle(writer).unwrap();

    assert_eq!(logger.publish().len(), capacity);
    let received: Vec<u64> = logger.subscribe().samples().iter().map(|s| s.value).collect();
    assert!(!received.is_empty(), "no frame reached the subscriber");
    assert!(received.windows(2).all(|w| w[0] <= w[1]));
    assert!(received.iter().all(|&v| v >= 1 && v <= capacity as u64));
    assert!(slots.subscriber_counter().load() <= slots.publisher_counter().load());
}
