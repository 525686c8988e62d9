//! Measurement capture acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A run with log capacity N stops by itself after N user-application ticks
//! - Both CSV files contain exactly N `value,secs.nanos` rows
//! - Published values count up from 1 without gaps
//! - No subscribe sample is taken while the subscriber counter is still zero

use super::common::{loop_context, test_config};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tsn_runtime::clock::CycleClock;
use tsn_runtime::executor::{run_user_application_loop, UserApplication};
use tsn_runtime::measurement::MeasurementLogger;
use tsn_runtime::runner::{spawn_rt_task, RtTaskSpec};
use tsn_runtime::shutdown::ShutdownSignal;
use tsn_runtime::slots::CounterSlots;

const CAPACITY: usize = 5;

fn read_rows(path: &Path) -> Vec<(u64, String)> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let (value, stamp) = line.split_once(',').expect("two columns");
            (value.parse().unwrap(), stamp.to_string())
        })
        .collect()
}

fn assert_timestamp_format(stamp: &str) {
    let (secs, nanos) = stamp.split_once('.').expect("secs.nanos");
    assert!(secs.parse::<u64>().is_ok(), "bad seconds in {stamp}");
    assert_eq!(nanos.len(), 9, "nanoseconds not zero-padded in {stamp}");
    assert!(nanos.parse::<u64>().is_ok(), "bad nanoseconds in {stamp}");
}

#[test]
fn test_log_exhaustion_stops_run_and_writes_csv() {
    let config = test_config();
    let shutdown = ShutdownSignal::new();
    let ctx = loop_context(&config, &shutdown);

    let slots = CounterSlots::allocate().unwrap();
    // As if the subscriber had already decoded a frame
    slots.subscriber_counter().store(3);

    let logger = MeasurementLogger::new(CAPACITY, shutdown.clone()).unwrap();
    let mut app = UserApplication::new(slots.clone(), CycleClock::new(config.clock), Some(logger));
    let phase = config.phases.user_application;

    let spec = RtTaskSpec::from_config(
        "tsn-user-app",
        config.realtime.policy,
        &config.realtime.user_application,
    );
    let task = spawn_rt_task(spec, move || {
        let stats = run_user_application_loop(&ctx, phase, &mut app)?;
        Ok((stats.ticks(), app.into_logger()))
    })
    .unwrap();

    let (ticks, logger) = task.join().unwrap();
    let logger = logger.expect("logger returned");

    assert!(!shutdown.is_running(), "log exhaustion must clear the run flag");
    assert_eq!(ticks, CAPACITY as u64);
    assert_eq!(slots.publisher_counter().load(), CAPACITY as u64);
    assert!(logger.publish().is_full());
    assert!(logger.subscribe().is_full());

    let dir = tempfile::tempdir().unwrap();
    let pub_path = dir.path().join("publisher_counter.csv");
    let sub_path = dir.path().join("subscriber_counter.csv");
    logger.write_csv_files(&pub_path, &sub_path).unwrap();

    let published = read_rows(&pub_path);
    assert_eq!(published.len(), CAPACITY);
    for (i, (value, stamp)) in published.iter().enumerate() {
        assert_eq!(*value, i as u64 + 1);
        assert_timestamp_format(stamp);
    }

    let received = read_rows(&sub_path);
    assert_eq!(received.len(), CAPACITY);
    assert!(received.iter().all(|(value, _)| *value == 3));
    for (_, stamp) in &received {
        assert_timestamp_format(stamp);
    }
}

#[test]
fn test_no_subscribe_samples_before_first_frame() {
    let config = test_config();
    let shutdown = ShutdownSignal::new();
    let ctx = loop_context(&config, &shutdown);

    let slots = CounterSlots::allocate().unwrap();
    let logger = MeasurementLogger::new(CAPACITY, shutdown.clone()).unwrap();
    let mut app = UserApplication::new(slots, CycleClock::new(config.clock), Some(logger));
    let phase = config.phases.user_application;

    let spec = RtTaskSpec::from_config(
        "tsn-user-app",
        config.realtime.policy,
        &config.realtime.user_application,
    );
    let task = spawn_rt_task(spec, move || {
        run_user_application_loop(&ctx, phase, &mut app)?;
        Ok(app.into_logger())
    })
    .unwrap();

    // The publish log fills and stops the run on its own
    let logger = task.join().unwrap().expect("logger returned");
    assert_eq!(logger.publish().len(), CAPACITY);
    assert!(logger.subscribe().is_empty());
}

#[test]
fn test_external_shutdown_keeps_partial_log() {
    let config = test_config();
    let shutdown = ShutdownSignal::new();
    let ctx = loop_context(&config, &shutdown);

    let slots = CounterSlots::allocate().unwrap();
    let logger = MeasurementLogger::new(1_000_000, shutdown.clone()).unwrap();
    let mut app = UserApplication::new(slots, CycleClock::new(config.clock), Some(logger));
    let phase = config.phases.user_application;

    let spec = RtTaskSpec::from_config(
        "tsn-user-app",
        config.realtime.policy,
        &config.realtime.user_application,
    );
    let task = spawn_rt_task(spec, move || {
        run_user_application_loop(&ctx, phase, &mut app)?;
        Ok(app.into_logger())
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    shutdown.request_shutdown("test");
    let logger = task.join().unwrap().expect("logger returned");

    assert!(!logger.publish().is_empty());
    assert!(!logger.publish().is_full());

    let dir = tempfile::tempdir().unwrap();
    let pub_path = dir.path().join("pub.csv");
    let sub_path = dir.path().join("sub.csv");
    logger.write_csv_files(&pub_path, &sub_path).unwrap();
    assert_eq!(read_rows(&pub_path).len(), logger.publish().len());
    assert_eq!(fs::read_to_string(&sub_path).unwrap(), "");
}
