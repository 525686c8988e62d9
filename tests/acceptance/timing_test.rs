//! Wake-time arithmetic and phase ordering acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Normalized times keep nanoseconds in [0, 1e9) and preserve elapsed time
//! - Wake times of a task form an arithmetic sequence with difference C
//! - subscriber < user application < publisher within every supported cycle
//! - Cycles of zero, negative or below 0.125 ms are rejected at startup
//! - A 0.25 ms publisher at phase 0.6 with 125 ns Qbv offset stamps
//!   wake + 100 µs + 125 ns

use tsn_common::config::{TsnConfig, MIN_CYCLE_TIME_MS};
use tsn_common::time::{
    advance_by_cycle, cycle_ms_to_ns, initial_phase_wake, normalize, phase_offset_ns,
    AbsoluteWakeTime, NANOS_PER_SEC,
};
use tsn_runtime::txtime::TxTimeStamper;

#[test]
fn test_normalize_preserves_elapsed_time() {
    for (secs, nanos) in [(0, 0), (5, 999_999_999), (7, 1_000_000_000), (1, 12_345_678_901)] {
        let raw_total = secs * NANOS_PER_SEC + nanos;
        let once = normalize(AbsoluteWakeTime { secs, nanos });
        assert!(once.nanos < NANOS_PER_SEC);
        assert_eq!(once.as_nanos(), raw_total);
        assert_eq!(normalize(once), once);
    }
}

#[test]
fn test_wake_sequence_is_arithmetic() {
    let cycle_ns = cycle_ms_to_ns(0.25);
    let base = AbsoluteWakeTime::new(1_700_000_000, 123_456_789);
    let mut wake = initial_phase_wake(base, cycle_ns, 0.6);

    // 5 s guard on the truncated second, then the 150 µs phase offset
    assert_eq!(wake, AbsoluteWakeTime::new(1_700_000_005, 150_000));

    // Eight seconds of ticks crosses several second boundaries
    for _ in 0..32_000 {
        let next = advance_by_cycle(wake, cycle_ns);
        assert!(next > wake);
        assert!(next.nanos < NANOS_PER_SEC);
        assert_eq!(next.nanos_since(&wake), cycle_ns);
        wake = next;
    }
    assert_eq!(wake, AbsoluteWakeTime::new(1_700_000_013, 150_000));
}

#[test]
fn test_default_phases_are_ordered_for_all_cycle_lengths() {
    let mut config = TsnConfig::default();
    config.transport.interface = Some("lo".into());

    for cycle_ms in [MIN_CYCLE_TIME_MS, 0.25, 0.5, 1.0, 10.0] {
        config.cycle_time_ms = cycle_ms;
        config.validate().unwrap();

        let cycle_ns = config.cycle_ns();
        let sub = phase_offset_ns(cycle_ns, config.phases.subscriber);
        let app = phase_offset_ns(cycle_ns, config.phases.user_application);
        let publ = phase_offset_ns(cycle_ns, config.phases.publisher);
        assert!(sub < app && app < publ, "cycle {cycle_ms} ms");
        assert!(publ + config.qbv_offset_ns <= cycle_ns, "cycle {cycle_ms} ms");
    }
}

#[test]
fn test_invalid_cycle_times_rejected() {
    let mut config = TsnConfig::default();
    for cycle_ms in [0.0, -1.0, 0.1, f64::NAN, f64::INFINITY, 1e300] {
        config.cycle_time_ms = cycle_ms;
        assert!(config.validate().is_err(), "cycle {cycle_ms} ms accepted");
    }
}

#[test]
fn test_reordered_phases_rejected() {
    let mut config = TsnConfig::default();
    config.phases.user_application = 0.7;
    assert!(config.validate().is_err());
}

#[test]
fn test_transmission_time_quarter_millisecond_cycle() {
    let cycle_ns = cycle_ms_to_ns(0.25);
    let wake0 = initial_phase_wake(AbsoluteWakeTime::new(100, 0), cycle_ns, 0.6);
    let stamper = TxTimeStamper::new(cycle_ns, 0.6, 125, true);

    assert_eq!(stamper.stamp(wake0), wake0.as_nanos() + 100_000 + 125);

    // The frame is released 125 ns into the next cycle
    let next_cycle_start = AbsoluteWakeTime::new(105, cycle_ns);
    assert_eq!(stamper.stamp(wake0), next_cycle_start.as_nanos() + 125);
}
