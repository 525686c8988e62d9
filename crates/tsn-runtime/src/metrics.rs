//! Wake-up latency statistics for the cyclic tasks.
//!
//! Each loop records how far behind its target wake time it actually
//! resumed. Recording is allocation-free; the recent-sample window is
//! allocated once when the stats are created.

use std::time::Duration;
use tracing::info;

/// Number of recent samples retained for percentile queries.
pub const DEFAULT_LATENCY_WINDOW: usize = 4096;

/// Running wake-up latency statistics of one task.
#[derive(Debug, Clone)]
pub struct WakeLatencyStats {
    window: Box<[u64]>,
    next: usize,
    filled: usize,
    ticks: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u128,
    deadline_misses: u64,
    cycle_ns: u64,
}

impl WakeLatencyStats {
    /// Create stats for a task with the given cycle length.
    ///
    /// Wakes later than one full cycle count as deadline misses.
    #[must_use]
    pub fn new(cycle_ns: u64, window: usize) -> Self {
        Self {
            window: vec![0; window.max(1)].into_boxed_slice(),
            next: 0,
            filled: 0,
            ticks: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            deadline_misses: 0,
            cycle_ns,
        }
    }

    /// Record one wake-up. Returns `true` if it was a deadline miss.
    #[inline]
    pub fn record(&mut self, late_ns: u64) -> bool {
        self.window[self.next] = late_ns;
        self.next = (self.next + 1) % self.window.len();
        self.filled = (self.filled + 1).min(self.window.len());

        self.ticks += 1;
        self.min_ns = self.min_ns.min(late_ns);
        self.max_ns = self.max_ns.max(late_ns);
        self.sum_ns += u128::from(late_ns);

        let missed = late_ns > self.cycle_ns;
        if missed {
            self.deadline_misses += 1;
        }
        missed
    }

    /// Number of recorded wake-ups.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Wake-ups later than one cycle.
    #[must_use]
    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }

    /// Smallest observed lateness.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.ticks > 0).then(|| Duration::from_nanos(self.min_ns))
    }

    /// Largest observed lateness.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.ticks > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Mean lateness over all ticks.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn mean(&self) -> Option<Duration> {
        (self.ticks > 0).then(|| Duration::from_nanos((self.sum_ns / u128::from(self.ticks)) as u64))
    }

    /// Percentile (0..=100) over the recent-sample window.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.filled == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }
        let mut sorted = self.window[..self.filled].to_vec();
        sorted.sort_unstable();
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Log a one-line summary for `task`.
    pub fn log_summary(&self, task: &str) {
        info!(
            task,
            ticks = self.ticks,
            min_us = self.min().map(|d| d.as_micros()),
            mean_us = self.mean().map(|d| d.as_micros()),
            p99_us = self.percentile(99.0).map(|d| d.as_micros()),
            max_us = self.max().map(|d| d.as_micros()),
            deadline_misses = self.deadline_misses,
            "Wake latency summary"
        );
    }
}
