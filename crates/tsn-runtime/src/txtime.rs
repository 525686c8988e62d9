//! Egress timestamps for time-aware (Qbv / ETF) transmission.
//!
//! The publisher wakes at `phase * cycle` into each cycle. Its frame is
//! released at the start of the next cycle plus a fixed Qbv offset, which
//! lines the frame up with the open gate of the next transmission window:
//!
//! ```text
//! tx = wake + cycle * (1 - phase) + qbv_offset
//! ```

use crate::engine::TransportParams;
use tsn_common::time::{phase_offset_ns, AbsoluteWakeTime};

/// Computes the transmission time for each publisher tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTimeStamper {
    /// Distance from the wake time to the next cycle start.
    lead_ns: u64,
    qbv_offset_ns: u64,
    txtime_enabled: bool,
}

impl TxTimeStamper {
    /// Create a stamper for a publisher at `phase_fraction` of `cycle_ns`.
    #[must_use]
    pub fn new(cycle_ns: u64, phase_fraction: f64, qbv_offset_ns: u64, txtime_enabled: bool) -> Self {
        Self {
            lead_ns: cycle_ns.saturating_sub(phase_offset_ns(cycle_ns, phase_fraction)),
            qbv_offset_ns,
            txtime_enabled,
        }
    }

    /// Transmission time in nanoseconds for a tick woken at `wake`.
    #[inline]
    #[must_use]
    pub fn stamp(&self, wake: AbsoluteWakeTime) -> u64 {
        wake.as_nanos() + self.lead_ns + self.qbv_offset_ns
    }

    /// Transport parameters for a tick woken at `wake`.
    #[inline]
    #[must_use]
    pub fn transport_params(&self, wake: AbsoluteWakeTime) -> TransportParams {
        TransportParams {
            txtime_enabled: self.txtime_enabled,
            transmission_time_ns: self.stamp(wake),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsn_common::time::cycle_ms_to_ns;

    #[test]
    fn test_stamp_quarter_millisecond_cycle() {
        let cycle_ns = cycle_ms_to_ns(0.25);
        let stamper = TxTimeStamper::new(cycle_ns, 0.6, 125, true);
        let wake = AbsoluteWakeTime::new(1_700_000_005, 150_000);

        // 0.4 * 250µs = 100µs to the next cycle start, then the Qbv offset
        assert_eq!(stamper.stamp(wake), wake.as_nanos() + 100_000 + 125);
    }

    #[test]
    fn test_stamp_crosses_second_boundary() {
        let stamper = TxTimeStamper::new(1_000_000, 0.6, 0, true);
        let wake = AbsoluteWakeTime::new(10, 999_600_000);
        assert_eq!(
            AbsoluteWakeTime::from_nanos(stamper.stamp(wake)),
            AbsoluteWakeTime::new(11, 0)
        );
    }

    #[test]
    fn test_stamp_tracks_each_tick() {
        let cycle_ns = 250_000;
        let stamper = TxTimeStamper::new(cycle_ns, 0.6, 125, true);
        let first = AbsoluteWakeTime::new(5, 150_000);
        let second = tsn_common::time::advance_by_cycle(first, cycle_ns);
        assert_eq!(stamper.stamp(second) - stamper.stamp(first), cycle_ns);
    }

    #[test]
    fn test_transport_params_carry_txtime_flag() {
        let stamper = TxTimeStamper::new(250_000, 0.6, 125, false);
        let params = stamper.transport_params(AbsoluteWakeTime::new(1, 0));
        assert!(!params.txtime_enabled);
        assert_eq!(params.transmission_time_ns, 1_000_000_000 + 100_125);
    }
}
