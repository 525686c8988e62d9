//! Real-time task runner.
//!
//! Spawns an OS thread that configures itself before doing any work:
//!
//! 1. request the real-time scheduling class at the task's priority
//! 2. pin itself to exactly one CPU core
//! 3. run the entry routine
//!
//! Steps 1 and 2 happen on the new thread because both apply to the calling
//! thread only. The spawner blocks until they have completed, so a failed
//! setup is reported by [`spawn_rt_task`] itself rather than surfacing later
//! at join time.

use crate::realtime::{pin_current_thread, set_current_thread_scheduler};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};
use tsn_common::config::{SchedPolicy, TaskSchedConfig};
use tsn_common::error::{TsnError, TsnResult};

/// Scheduling parameters of one real-time task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtTaskSpec {
    /// Thread name.
    pub name: String,
    /// Scheduling class.
    pub policy: SchedPolicy,
    /// Priority within the class (ignored for `SchedPolicy::Other`).
    pub priority: u8,
    /// CPU core the thread is pinned to.
    pub core: usize,
}

impl RtTaskSpec {
    /// Build a spec from a task's configuration section.
    #[must_use]
    pub fn from_config(name: impl Into<String>, policy: SchedPolicy, sched: &TaskSchedConfig) -> Self {
        Self {
            name: name.into(),
            policy,
            priority: sched.priority,
            core: sched.core,
        }
    }
}

/// Scheduling state a task reported after configuring itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtTaskStatus {
    /// Kernel thread id.
    pub tid: i32,
    /// Applied scheduling class.
    pub policy: SchedPolicy,
    /// Applied priority, `None` for `SchedPolicy::Other`.
    pub priority: Option<u8>,
    /// Core the thread is pinned to.
    pub core: usize,
}

/// A running real-time task.
#[derive(Debug)]
pub struct RtTask<T> {
    name: String,
    status: RtTaskStatus,
    handle: JoinHandle<TsnResult<T>>,
}

impl<T> RtTask<T> {
    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduling state reported by the thread at startup.
    #[must_use]
    pub fn status(&self) -> RtTaskStatus {
        self.status
    }

    /// Whether the entry routine has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task and return the entry routine's result.
    ///
    /// # Errors
    ///
    /// Returns the routine's own error, or [`TsnError::TaskJoin`] if the
    /// thread panicked.
    pub fn join(self) -> TsnResult<T> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => Err(TsnError::TaskJoin {
                task: self.name,
                reason: panic_message(panic.as_ref()),
            }),
        }
    }
}

/// Spawn a thread with real-time scheduling and CPU affinity.
///
/// # Errors
///
/// Returns [`TsnError::TaskSpawn`] if the thread cannot be created, or the
/// [`TsnError::Realtime`] / [`TsnError::Affinity`] error raised while the
/// thread configured itself. In the latter case the thread has already
/// exited without running `entry`.
pub fn spawn_rt_task<T, F>(spec: RtTaskSpec, entry: F) -> TsnResult<RtTask<T>>
where
    T: Send + 'static,
    F: FnOnce() -> TsnResult<T> + Send + 'static,
{
    let (status_tx, status_rx) = mpsc::sync_channel::<TsnResult<RtTaskStatus>>(1);
    let thread_spec = spec.clone();

    let handle = thread::Builder::new()
        .name(spec.name.clone())
        .spawn(move || {
            let status = configure_current_thread(&thread_spec);
            let failed = status.as_ref().err().cloned();
            // The spawner is blocked on the receiver, so this cannot fail
            // unless it has already given up.
            let _ = status_tx.send(status);
            match failed {
                Some(err) => Err(err),
                None => entry(),
            }
        })
        .map_err(|e| TsnError::TaskSpawn {
            task: spec.name.clone(),
            reason: e.to_string(),
        })?;

    match status_rx.recv() {
        Ok(Ok(status)) => {
            info!(
                task = %spec.name,
                tid = status.tid,
                policy = ?status.policy,
                priority = ?status.priority,
                core = status.core,
                "Real-time task started"
            );
            Ok(RtTask {
                name: spec.name,
                status,
                handle,
            })
        }
        Ok(Err(err)) => {
            error!(task = %spec.name, error = %err, "Real-time task setup failed");
            let _ = handle.join();
            Err(err)
        }
        Err(_) => {
            let reason = match handle.join() {
                Err(panic) => panic_message(panic.as_ref()),
                Ok(_) => "thread exited before reporting its status".into(),
            };
            Err(TsnError::TaskSpawn {
                task: spec.name,
                reason,
            })
        }
    }
}

fn configure_current_thread(spec: &RtTaskSpec) -> TsnResult<RtTaskStatus> {
    let priority = set_current_thread_scheduler(spec.policy, spec.priority)?;
    pin_current_thread(spec.core)?;
    let status = RtTaskStatus {
        tid: current_tid(),
        policy: spec.policy,
        priority,
        core: spec.core,
    };
    debug!(task = %spec.name, ?status, "Thread configured");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn current_tid() -> i32 {
    nix::unistd::gettid().as_raw()
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i32 {
    0
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".into()
    }
}
