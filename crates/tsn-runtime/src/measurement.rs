//! Capacity-bounded measurement logs and their CSV dump.
//!
//! The user-application task appends one `(timestamp, counter)` sample per
//! tick. Storage is reserved up front so appending never allocates inside
//! the real-time loop. When either log fills up the run is stopped through
//! the shared [`ShutdownSignal`]. The output files are opened with
//! [`MeasurementFiles::create`] before any task starts, so an unwritable
//! destination fails the start-up instead of the end of a long run; the
//! logs are written into them after all tasks have been joined.

use crate::shutdown::ShutdownSignal;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tsn_common::error::{TsnError, TsnResult};
use tsn_common::time::AbsoluteWakeTime;

/// One recorded counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Clock reading taken right after the counter was updated or observed.
    pub timestamp: AbsoluteWakeTime,
    /// Counter value.
    pub value: u64,
}

/// Append-only sample buffer with a fixed capacity.
#[derive(Debug)]
pub struct MeasurementLog {
    name: &'static str,
    samples: Vec<Sample>,
    capacity: usize,
}

impl MeasurementLog {
    /// Reserve storage for `capacity` samples.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Config`] if the capacity is zero or the storage
    /// cannot be reserved.
    pub fn with_capacity(name: &'static str, capacity: usize) -> TsnResult<Self> {
        if capacity == 0 {
            return Err(TsnError::Config(format!("{name} log capacity must be > 0")));
        }
        let mut samples = Vec::new();
        samples.try_reserve_exact(capacity).map_err(|e| {
            TsnError::Config(format!("cannot reserve {name} log of {capacity} samples: {e}"))
        })?;
        Ok(Self {
            name,
            samples,
            capacity,
        })
    }

    /// Log name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a sample. Returns `false` without storing it if the log is full.
    #[inline]
    pub fn push(&mut self, sample: Sample) -> bool {
        if self.is_full() {
            return false;
        }
        self.samples.push(sample);
        true
    }

    /// Whether no further samples fit.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Number of stored samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored samples in append order.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Write all samples as `value,secs.nanos` rows without a header.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Io`] if writing fails.
    pub fn write_csv<W: Write>(&self, writer: W) -> TsnResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        for sample in &self.samples {
            writer
                .write_record([sample.value.to_string(), sample.timestamp.to_string()])
                .map_err(|e| TsnError::Io(format!("{} log: {e}", self.name)))?;
        }
        writer
            .flush()
            .map_err(|e| TsnError::Io(format!("{} log: {e}", self.name)))
    }

    /// Write all samples to a file at `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Io`] if the file cannot be created or written.
    pub fn write_csv_file(&self, path: &Path) -> TsnResult<()> {
        let file = File::create(path)
            .map_err(|e| TsnError::Io(format!("failed to create {}: {e}", path.display())))?;
        self.write_csv(file)?;
        info!(log = self.name, rows = self.len(), path = %path.display(), "Measurement log written");
        Ok(())
    }
}

/// Publish and subscribe logs owned by the user-application task.
#[derive(Debug)]
pub struct MeasurementLogger {
    publish: MeasurementLog,
    subscribe: MeasurementLog,
    shutdown: ShutdownSignal,
}

impl MeasurementLogger {
    /// Reserve both logs with the same capacity.
    ///
    /// # Errors
    ///
    /// See [`MeasurementLog::with_capacity`].
    pub fn new(capacity: usize, shutdown: ShutdownSignal) -> TsnResult<Self> {
        Ok(Self {
            publish: MeasurementLog::with_capacity("publish", capacity)?,
            subscribe: MeasurementLog::with_capacity("subscribe", capacity)?,
            shutdown,
        })
    }

    /// Record a published counter value.
    pub fn record_publish(&mut self, timestamp: AbsoluteWakeTime, value: u64) {
        Self::record(&mut self.publish, &self.shutdown, timestamp, value);
    }

    /// Record a received counter value.
    pub fn record_subscribe(&mut self, timestamp: AbsoluteWakeTime, value: u64) {
        Self::record(&mut self.subscribe, &self.shutdown, timestamp, value);
    }

    fn record(
        log: &mut MeasurementLog,
        shutdown: &ShutdownSignal,
        timestamp: AbsoluteWakeTime,
        value: u64,
    ) {
        if !log.push(Sample { timestamp, value }) {
            return;
        }
        if log.is_full() {
            warn!(
                log = log.name(),
                capacity = log.capacity(),
                "Measurement log exhausted, stopping the run"
            );
            shutdown.request_shutdown("measurement log capacity reached");
        }
    }

    /// The publish log.
    #[must_use]
    pub fn publish(&self) -> &MeasurementLog {
        &self.publish
    }

    /// The subscribe log.
    #[must_use]
    pub fn subscribe(&self) -> &MeasurementLog {
        &self.subscribe
    }

    /// Write both logs into files opened earlier.
    ///
    /// # Errors
    ///
    /// Returns the first write error; the second file is still attempted.
    pub fn write_to(&self, files: MeasurementFiles) -> TsnResult<()> {
        let MeasurementFiles {
            publish,
            subscribe,
        } = files;
        let publish = Self::write_into(&self.publish, publish);
        let subscribe = Self::write_into(&self.subscribe, subscribe);
        publish.and(subscribe)
    }

    fn write_into(log: &MeasurementLog, (path, file): (PathBuf, File)) -> TsnResult<()> {
        log.write_csv(file)?;
        info!(log = log.name(), rows = log.len(), path = %path.display(), "Measurement log written");
        Ok(())
    }

    /// Write both logs to CSV files.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Io`] if a file cannot be created or written.
    pub fn write_csv_files(&self, publish_path: &Path, subscribe_path: &Path) -> TsnResult<()> {
        self.write_to(MeasurementFiles::create(publish_path, subscribe_path)?)
    }
}

/// Publish and subscribe CSV files, created and truncated ahead of the run.
#[derive(Debug)]
pub struct MeasurementFiles {
    publish: (PathBuf, File),
    subscribe: (PathBuf, File),
}

impl MeasurementFiles {
    /// Create missing parent directories and open both files for writing.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Io`] if a directory or file cannot be created.
    pub fn create(publish_path: &Path, subscribe_path: &Path) -> TsnResult<Self> {
        Ok(Self {
            publish: Self::open(publish_path)?,
            subscribe: Self::open(subscribe_path)?,
        })
    }

    fn open(path: &Path) -> TsnResult<(PathBuf, File)> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                TsnError::Io(format!("failed to create directory {}: {e}", dir.display()))
            })?;
        }
        let file = File::create(path)
            .map_err(|e| TsnError::Io(format!("failed to create {}: {e}", path.display())))?;
        Ok((path.to_path_buf(), file))
    }

    /// Paths of the publish and subscribe files.
    #[must_use]
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.publish.0, &self.subscribe.0)
    }
}
