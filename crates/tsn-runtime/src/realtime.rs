//! Real-time scheduling and memory locking utilities.
//!
//! Provides platform-specific glue for deterministic execution:
//! - Memory locking (mlockall) to prevent page faults
//! - Per-thread real-time scheduling (SCHED_FIFO/SCHED_RR)
//! - Per-thread CPU affinity pinning
//!
//! Unlike memory locking, a failed scheduling or affinity request is an
//! error: the phase-staggered tasks rely on never being preempted by
//! non-real-time work on their core.

use tsn_common::config::{RealtimeConfig, SchedPolicy};
use tsn_common::error::{TsnError, TsnResult};
use tracing::{info, warn};
#[cfg(target_os = "linux")]
use tracing::{debug, error};

/// Pin all current and future pages of the process in RAM.
///
/// Returns `Ok(false)` if the kernel refuses with `EPERM`. The run goes on
/// but a page fault inside a cycle can then cost more than the cycle itself.
///
/// # Errors
///
/// Returns [`TsnError::Realtime`] for any other `mlockall` failure.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> TsnResult<bool> {
    use nix::errno::Errno;
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Process memory locked");
            Ok(true)
        }
        Err(Errno::EPERM) => {
            warn!("mlockall refused (EPERM); continuing with pageable memory");
            Ok(false)
        }
        Err(e) => Err(TsnError::Realtime(format!("mlockall failed: {e}"))),
    }
}

/// Pin all current and future pages of the process in RAM.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> TsnResult<bool> {
    warn!("Memory locking is not supported on this platform");
    Ok(false)
}

/// Apply a scheduling policy and priority to the calling thread.
///
/// Returns the priority actually applied, or `None` for `SchedPolicy::Other`.
///
/// # Errors
///
/// Returns [`TsnError::Realtime`] if the priority is outside 1..=99 or the
/// kernel refuses the request (typically `EPERM` without `CAP_SYS_NICE`).
#[cfg(target_os = "linux")]
pub fn set_current_thread_scheduler(policy: SchedPolicy, priority: u8) -> TsnResult<Option<u8>> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => {
            debug!("Using SCHED_OTHER (non-RT) scheduling");
            return Ok(None);
        }
    };

    if !(1..=99).contains(&priority) {
        return Err(TsnError::Realtime(format!(
            "priority {priority} outside the real-time range 1..=99"
        )));
    }

    let param = libc::sched_param {
        sched_priority: i32::from(priority),
    };

    // SAFETY: pthread_self() is always a valid handle for the calling thread
    // and `param` outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), linux_policy, &param) };
    if rc != 0 {
        let err = std::io::Error::from_raw_os_error(rc);
        if rc == libc::EPERM {
            error!(
                ?policy,
                priority,
                "pthread_setschedparam failed with EPERM - grant CAP_SYS_NICE or run as root"
            );
        }
        return Err(TsnError::Realtime(format!(
            "pthread_setschedparam({policy:?}, {priority}) failed: {err}"
        )));
    }

    debug!(?policy, priority, "Real-time scheduler configured");
    Ok(Some(priority))
}

/// Apply a scheduling policy and priority to the calling thread.
///
/// # Errors
///
/// Real-time policies are not available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn set_current_thread_scheduler(policy: SchedPolicy, priority: u8) -> TsnResult<Option<u8>> {
    match policy {
        SchedPolicy::Other => Ok(None),
        _ => Err(TsnError::Realtime(format!(
            "real-time scheduling ({policy:?}, {priority}) not available on this platform"
        ))),
    }
}

/// Restrict the calling thread to exactly one CPU core.
///
/// # Errors
///
/// Returns [`TsnError::Affinity`] if the core index is out of range or the
/// kernel rejects the CPU set.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> TsnResult<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .map_err(|e| TsnError::Affinity(format!("invalid CPU index {core}: {e}")))?;

    // Pid 0 addresses the calling thread.
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| TsnError::Affinity(format!("sched_setaffinity(core {core}) failed: {e}")))?;

    debug!(core, "CPU affinity set");
    Ok(())
}

/// Restrict the calling thread to exactly one CPU core.
///
/// # Errors
///
/// CPU affinity is not available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(core: usize) -> TsnResult<()> {
    Err(TsnError::Affinity(format!(
        "CPU affinity (core {core}) not available on this platform"
    )))
}

/// CPU cores the calling thread may run on.
///
/// # Errors
///
/// Returns [`TsnError::Affinity`] if the affinity mask cannot be read.
#[cfg(target_os = "linux")]
pub fn current_thread_affinity() -> TsnResult<Vec<usize>> {
    use nix::sched::{sched_getaffinity, CpuSet};
    use nix::unistd::Pid;

    let set = sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| TsnError::Affinity(format!("sched_getaffinity failed: {e}")))?;
    Ok((0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect())
}

/// CPU cores the calling thread may run on.
///
/// # Errors
///
/// CPU affinity is not available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn current_thread_affinity() -> TsnResult<Vec<usize>> {
    Err(TsnError::Affinity(
        "CPU affinity not available on this platform".into(),
    ))
}

/// Scheduling policy and priority of the calling thread.
///
/// # Errors
///
/// Returns [`TsnError::Realtime`] if the parameters cannot be read.
#[cfg(target_os = "linux")]
pub fn current_thread_scheduler() -> TsnResult<(SchedPolicy, i32)> {
    let mut policy: libc::c_int = 0;
    let mut param = libc::sched_param { sched_priority: 0 };
    // SAFETY: both out-pointers reference live locals.
    let rc = unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) };
    if rc != 0 {
        return Err(TsnError::Realtime(format!(
            "pthread_getschedparam failed: {}",
            std::io::Error::from_raw_os_error(rc)
        )));
    }
    let policy = match policy {
        libc::SCHED_FIFO => SchedPolicy::Fifo,
        libc::SCHED_RR => SchedPolicy::Rr,
        _ => SchedPolicy::Other,
    };
    Ok((policy, param.sched_priority))
}

#[cfg(target_os = "linux")]
fn soft_limit(resource: nix::sys::resource::Resource) -> Option<u64> {
    nix::sys::resource::getrlimit(resource).ok().map(|(soft, _)| u64::from(soft))
}

/// Probe what the process is allowed to do before any task starts.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities {
        // SAFETY: geteuid has no preconditions.
        is_root: unsafe { libc::geteuid() } == 0,
        rtprio_limit: soft_limit(nix::sys::resource::Resource::RLIMIT_RTPRIO),
        memlock_limit: soft_limit(nix::sys::resource::Resource::RLIMIT_MEMLOCK),
        preempt_rt: std::fs::read_to_string("/proc/version")
            .is_ok_and(|v| v.contains("PREEMPT_RT") || v.contains("PREEMPT RT")),
    }
}

/// Probe what the process is allowed to do before any task starts.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Privileges and kernel features relevant to the cyclic tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtCapabilities {
    /// Effective uid is 0.
    pub is_root: bool,
    /// Soft `RLIMIT_RTPRIO`.
    pub rtprio_limit: Option<u64>,
    /// Soft `RLIMIT_MEMLOCK` in bytes.
    pub memlock_limit: Option<u64>,
    /// Kernel built with PREEMPT_RT.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Whether a thread may be given `priority` under a real-time policy.
    #[must_use]
    pub fn allows_priority(&self, priority: u8) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|limit| limit >= u64::from(priority))
    }

    /// Whether `mlockall` over the whole address space should succeed.
    #[must_use]
    pub fn allows_full_memlock(&self) -> bool {
        #[cfg(target_os = "linux")]
        let unlimited = self.memlock_limit == Some(libc::RLIM_INFINITY);
        #[cfg(not(target_os = "linux"))]
        let unlimited = false;
        self.is_root || unlimited
    }

    /// Log the probe result and warn about every request of `config` that
    /// the kernel is likely to refuse.
    pub fn report(&self, config: &RealtimeConfig) {
        info!(
            is_root = self.is_root,
            rtprio_limit = ?self.rtprio_limit,
            memlock_limit = ?self.memlock_limit,
            preempt_rt = self.preempt_rt,
            "Real-time capabilities"
        );
        if !self.preempt_rt {
            warn!("Kernel is not PREEMPT_RT; wake-up jitter may exceed short cycles");
        }
        if config.lock_memory && !self.allows_full_memlock() {
            warn!("RLIMIT_MEMLOCK is finite; mlockall will probably be refused");
        }
        if config.policy == SchedPolicy::Other {
            return;
        }
        for (task, sched) in [
            ("publisher", config.publisher),
            ("subscriber", config.subscriber),
            ("user-app", config.user_application),
        ] {
            if !self.allows_priority(sched.priority) {
                warn!(
                    task,
                    policy = ?config.policy,
                    priority = sched.priority,
                    "Priority above RLIMIT_RTPRIO; task start will fail without CAP_SYS_NICE"
                );
            }
        }
    }
}
