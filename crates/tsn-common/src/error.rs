use thiserror::Error;

/// Error types for cycle setup, real-time scheduling and measurement output.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TsnError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested real-time scheduling class could not be applied.
    #[error("real-time scheduling error: {0}")]
    Realtime(String),

    /// The thread could not be pinned to its CPU core.
    #[error("CPU affinity error: {0}")]
    Affinity(String),

    /// Reading the clock or arming an absolute-time wait failed.
    #[error("clock error: {0}")]
    Clock(String),

    /// External value slots could not be allocated.
    #[error("slot allocation failed: {0}")]
    SlotAllocation(String),

    /// A cyclic task woke later than one full cycle after its target time.
    #[error("deadline miss: expected wake within {expected_ns}ns, woke {actual_ns}ns late")]
    DeadlineMiss {
        /// Cycle length in nanoseconds.
        expected_ns: u64,
        /// Observed wake-up lateness in nanoseconds.
        actual_ns: u64,
    },

    /// The operating system refused to create a thread.
    #[error("failed to spawn task {task}: {reason}")]
    TaskSpawn {
        /// Human-readable task name.
        task: String,
        /// Underlying reason.
        reason: String,
    },

    /// A task thread panicked or could not be joined.
    #[error("failed to join task {task}: {reason}")]
    TaskJoin {
        /// Human-readable task name.
        task: String,
        /// Underlying reason.
        reason: String,
    },

    /// A cycle handle does not refer to a registered cycle.
    #[error("unknown cycle handle {0}")]
    UnknownCycle(u64),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience type alias for core operations.
pub type TsnResult<T> = Result<T, TsnError>;
