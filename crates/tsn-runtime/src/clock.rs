//! Absolute-time clock access.
//!
//! Every cyclic task blocks in [`CycleClock::sleep_until`], which maps to
//! `clock_nanosleep` with `TIMER_ABSTIME`. Waiting for an absolute deadline
//! instead of sleeping for a duration keeps the tick sequence free of drift.

use tsn_common::config::ClockSource;
use tsn_common::error::{TsnError, TsnResult};
use tsn_common::time::AbsoluteWakeTime;

/// Handle to the clock that drives wake times and measurement timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    source: ClockSource,
}

impl CycleClock {
    /// Create a clock handle for the given source.
    #[must_use]
    pub fn new(source: ClockSource) -> Self {
        Self { source }
    }

    /// The configured clock source.
    #[must_use]
    pub fn source(&self) -> ClockSource {
        self.source
    }

    fn clock_id(self) -> libc::clockid_t {
        match self.source {
            #[cfg(target_os = "linux")]
            ClockSource::Tai => libc::CLOCK_TAI,
            #[cfg(not(target_os = "linux"))]
            ClockSource::Tai => libc::CLOCK_REALTIME,
            ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
            ClockSource::Realtime => libc::CLOCK_REALTIME,
        }
    }

    /// Read the current time.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Clock`] if `clock_gettime` fails.
    #[allow(clippy::cast_sign_loss)]
    pub fn now(&self) -> TsnResult<AbsoluteWakeTime> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer.
        let rc = unsafe { libc::clock_gettime(self.clock_id(), &mut ts) };
        if rc != 0 {
            return Err(TsnError::Clock(format!(
                "clock_gettime({:?}) failed: {}",
                self.source,
                std::io::Error::last_os_error()
            )));
        }
        Ok(AbsoluteWakeTime::new(ts.tv_sec as u64, ts.tv_nsec as u64))
    }

    /// Block until the clock reaches `deadline`.
    ///
    /// Returns immediately if the deadline has already passed.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Clock`] if the wait cannot be armed.
    #[cfg(target_os = "linux")]
    #[allow(clippy::cast_possible_wrap)]
    pub fn sleep_until(&self, deadline: AbsoluteWakeTime) -> TsnResult<()> {
        let ts = libc::timespec {
            tv_sec: deadline.secs as libc::time_t,
            tv_nsec: deadline.nanos as libc::c_long,
        };
        loop {
            // SAFETY: `ts` is valid for the call; the remainder pointer is unused
            // with TIMER_ABSTIME and may be null.
            let rc = unsafe {
                libc::clock_nanosleep(
                    self.clock_id(),
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            match rc {
                0 => return Ok(()),
                // A signal woke us early; the deadline is absolute so just re-arm.
                libc::EINTR => continue,
                err => {
                    return Err(TsnError::Clock(format!(
                        "clock_nanosleep({:?}, {deadline}) failed: {}",
                        self.source,
                        std::io::Error::from_raw_os_error(err)
                    )))
                }
            }
        }
    }

    /// Block until the clock reaches `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::Clock`] if the clock cannot be read.
    #[cfg(not(target_os = "linux"))]
    pub fn sleep_until(&self, deadline: AbsoluteWakeTime) -> TsnResult<()> {
        let now = self.now()?;
        let remaining = deadline.nanos_since(&now);
        if remaining > 0 {
            std::thread::sleep(std::time::Duration::from_nanos(remaining));
        }
        Ok(())
    }
}

impl Default for CycleClock {
    fn default() -> Self {
        Self::new(ClockSource::default())
    }
}
