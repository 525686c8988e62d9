//! Configuration structures for the TSN pub/sub core.
//!
//! Supports TOML deserialization with the defaults of the reference
//! deployment (250 µs cycle, publisher at 60 %, user application at 30 %,
//! subscriber at the cycle start). The configuration is built once at
//! startup and is read-only afterwards.

use crate::time::{cycle_ms_to_ns, phase_offset_ns, DEFAULT_STARTUP_GUARD};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest supported cycle length in milliseconds.
pub const MIN_CYCLE_TIME_MS: f64 = 0.125;

/// Largest supported cycle length in milliseconds. Keeps one cycle below a
/// second so advancing a normalized wake time cannot overflow.
pub const MAX_CYCLE_TIME_MS: f64 = 1000.0;

/// Longest accepted delay before the first tick.
pub const MAX_STARTUP_GUARD: Duration = Duration::from_secs(3600);

/// Number of extra counters carried per direction next to the main counter.
pub const REPEATED_COUNTERS: usize = 2;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsnConfig {
    /// Cycle length in milliseconds.
    pub cycle_time_ms: f64,

    /// Guard band added to the publisher's transmission time, in nanoseconds.
    pub qbv_offset_ns: u64,

    /// Delay before the first tick of every task.
    #[serde(with = "humantime_serde")]
    pub startup_guard: Duration,

    /// Clock used for wake times and timestamps.
    pub clock: ClockSource,

    /// What to do when a task wakes more than one cycle late.
    pub deadline_miss: OverrunPolicy,

    /// Wake-up phase fractions.
    pub phases: PhaseConfig,

    /// Real-time scheduling configuration.
    pub realtime: RealtimeConfig,

    /// Network transport parameters handed to the engine.
    pub transport: TransportConfig,

    /// Measurement logging configuration.
    pub measurement: MeasurementConfig,
}

impl Default for TsnConfig {
    fn default() -> Self {
        Self {
            cycle_time_ms: 0.25,
            qbv_offset_ns: 125,
            startup_guard: DEFAULT_STARTUP_GUARD,
            clock: ClockSource::Tai,
            deadline_miss: OverrunPolicy::Fault,
            phases: PhaseConfig::default(),
            realtime: RealtimeConfig::default(),
            transport: TransportConfig::default(),
            measurement: MeasurementConfig::default(),
        }
    }
}

/// Clock used for absolute-time waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// CLOCK_TAI, the clock used by the ETF qdisc.
    #[default]
    Tai,
    /// CLOCK_MONOTONIC.
    Monotonic,
    /// CLOCK_REALTIME.
    Realtime,
}

/// Policy for handling a task that wakes more than one cycle late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Stop the run and fail the task (strictest).
    #[default]
    Fault,
    /// Log a warning but continue.
    Warn,
    /// Count silently.
    Ignore,
}

/// Wake-up points of the three tasks as fractions of the cycle.
///
/// The tasks share external value slots without locks. That is only sound
/// while `subscriber < user_application < publisher` and the windows do not
/// overlap, which [`TsnConfig::validate`] enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Publisher wake fraction.
    pub publisher: f64,
    /// Subscriber wake fraction.
    pub subscriber: f64,
    /// User application wake fraction.
    pub user_application: f64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            publisher: 0.6,
            subscriber: 0.0,
            user_application: 0.3,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT, development only).
    Other,
}

/// Priority and core for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSchedConfig {
    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,
    /// CPU core the task is pinned to.
    pub core: usize,
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Scheduler policy applied to every cyclic task.
    pub policy: SchedPolicy,

    /// Lock all memory pages (mlockall) at startup.
    pub lock_memory: bool,

    /// Publisher task scheduling.
    pub publisher: TaskSchedConfig,

    /// Subscriber task scheduling.
    pub subscriber: TaskSchedConfig,

    /// User application task scheduling.
    pub user_application: TaskSchedConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            lock_memory: true,
            publisher: TaskSchedConfig {
                priority: 78,
                core: 2,
            },
            subscriber: TaskSchedConfig {
                priority: 81,
                core: 2,
            },
            user_application: TaskSchedConfig {
                priority: 75,
                core: 3,
            },
        }
    }
}

/// Transport parameters forwarded to the pub/sub engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Network interface name (e.g., "enp3s0").
    /// Must be explicitly configured - no default to avoid using wrong interface.
    pub interface: Option<String>,

    /// SO_PRIORITY of the publisher socket.
    pub socket_priority: i32,

    /// Publisher address, `opc.eth://<MAC>:<VLAN>.<PCP>`.
    pub publish_address: String,

    /// Subscriber address, `opc.eth://<MAC>:<VLAN>.<PCP>`.
    pub subscribe_address: String,

    /// Request launch-time transmission (SO_TXTIME).
    pub so_txtime: bool,

    /// Group identifier the engine uses when registering the publisher cycle.
    pub writer_group_id: u32,

    /// Group identifier the engine uses when registering the subscriber cycle.
    pub reader_group_id: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interface: None,
            socket_priority: 3,
            publish_address: String::from("opc.eth://01-00-5E-7F-00-01:8.3"),
            subscribe_address: String::from("opc.eth://01-00-5E-00-00-01:8.3"),
            so_txtime: true,
            writer_group_id: 101,
            reader_group_id: 100,
        }
    }
}

/// Measurement log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Record (timestamp, counter) samples and write them as CSV at shutdown.
    pub enabled: bool,

    /// Maximum samples per direction; reaching it ends the run.
    pub capacity: usize,

    /// Directory the CSV files are written to.
    pub output_dir: PathBuf,

    /// File name of the publish-side log.
    pub publisher_file: String,

    /// File name of the subscribe-side log.
    pub subscriber_file: String,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 10_000_000,
            output_dir: PathBuf::from("."),
            publisher_file: String::from("publisher_T1.csv"),
            subscriber_file: String::from("subscriber_T8.csv"),
        }
    }
}

impl MeasurementConfig {
    /// Full path of the publish-side CSV.
    #[must_use]
    pub fn publisher_path(&self) -> PathBuf {
        self.output_dir.join(&self.publisher_file)
    }

    /// Full path of the subscribe-side CSV.
    #[must_use]
    pub fn subscriber_path(&self) -> PathBuf {
        self.output_dir.join(&self.subscriber_file)
    }
}

impl TsnConfig {
    /// Cycle length in nanoseconds.
    #[must_use]
    pub fn cycle_ns(&self) -> u64 {
        cycle_ms_to_ns(self.cycle_time_ms)
    }

    /// Check the phase and timing invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the cycle is not a finite value
    /// in the supported range, the startup guard is too long, a phase
    /// fraction is outside `[0, 1)`, the phases are not strictly ordered
    /// subscriber < user application < publisher, or the publisher's
    /// offset plus the Qbv guard band does not fit in one cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cycle_time_ms.is_finite()
            || !(MIN_CYCLE_TIME_MS..=MAX_CYCLE_TIME_MS).contains(&self.cycle_time_ms)
        {
            return Err(ConfigError::Invalid(format!(
                "cycle time {} ms must be within {MIN_CYCLE_TIME_MS}..={MAX_CYCLE_TIME_MS} ms",
                self.cycle_time_ms
            )));
        }

        if self.startup_guard > MAX_STARTUP_GUARD {
            return Err(ConfigError::Invalid(format!(
                "startup guard {} exceeds the maximum of {}",
                humantime::format_duration(self.startup_guard),
                humantime::format_duration(MAX_STARTUP_GUARD)
            )));
        }

        let phases = [
            ("subscriber", self.phases.subscriber),
            ("user_application", self.phases.user_application),
            ("publisher", self.phases.publisher),
        ];
        for (name, fraction) in phases {
            if !(0.0..1.0).contains(&fraction) {
                return Err(ConfigError::Invalid(format!(
                    "{name} phase {fraction} must be in [0, 1)"
                )));
            }
        }

        let cycle_ns = self.cycle_ns();
        let sub_ns = phase_offset_ns(cycle_ns, self.phases.subscriber);
        let app_ns = phase_offset_ns(cycle_ns, self.phases.user_application);
        let pub_ns = phase_offset_ns(cycle_ns, self.phases.publisher);
        if !(sub_ns < app_ns && app_ns < pub_ns) {
            return Err(ConfigError::Invalid(format!(
                "phase windows must be strictly ordered subscriber < user_application < publisher \
                 (got {sub_ns}ns, {app_ns}ns, {pub_ns}ns in a {cycle_ns}ns cycle)"
            )));
        }

        if pub_ns
            .checked_add(self.qbv_offset_ns)
            .map_or(true, |end| end > cycle_ns)
        {
            return Err(ConfigError::Invalid(format!(
                "publisher offset {pub_ns}ns plus qbv offset {}ns exceeds the {cycle_ns}ns cycle",
                self.qbv_offset_ns
            )));
        }

        if self.realtime.policy != SchedPolicy::Other {
            for (name, task) in [
                ("publisher", self.realtime.publisher),
                ("subscriber", self.realtime.subscriber),
                ("user_application", self.realtime.user_application),
            ] {
                if !(1..=99).contains(&task.priority) {
                    return Err(ConfigError::Invalid(format!(
                        "{name} priority {} must be in 1..=99 for real-time policies",
                        task.priority
                    )));
                }
            }
        }

        if self.transport.writer_group_id == self.transport.reader_group_id {
            return Err(ConfigError::Invalid(format!(
                "writer and reader group ids must differ (both {})",
                self.transport.writer_group_id
            )));
        }

        if self.measurement.capacity == 0 {
            return Err(ConfigError::Invalid(
                "measurement capacity must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "Configuration file parsed");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values parse but violate a timing or phase invariant.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::error::TsnError {
    fn from(err: ConfigError) -> Self {
        crate::error::TsnError::Config(err.to_string())
    }
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
