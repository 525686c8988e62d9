//! Cycle registration hooks used by the pub/sub engine.
//!
//! Instead of running its own timers the engine asks the core to create a
//! periodic execution context per writer or reader group. The role of the
//! new task follows from the group id: the configured writer group gets a
//! publisher task, the configured reader group a subscriber task.

use crate::engine::{CycleHandler, GroupId, TaskRole};
use crate::executor::{run_publisher_loop, run_subscriber_loop, LoopContext};
use crate::metrics::WakeLatencyStats;
use crate::runner::{spawn_rt_task, RtTask, RtTaskSpec, RtTaskStatus};
use crate::txtime::TxTimeStamper;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use tsn_common::config::TsnConfig;
use tsn_common::error::{TsnError, TsnResult};

/// Opaque identifier of a registered cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CycleHandle(u64);

impl CycleHandle {
    /// Raw id.
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CycleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle#{}", self.0)
    }
}

/// Hooks through which the engine delegates its cyclic callbacks.
pub trait CycleHooks: Send + Sync {
    /// Start a periodic task for `group` that calls `handler` once per cycle.
    ///
    /// # Errors
    ///
    /// Fails if the group has no role or the task cannot be started with its
    /// scheduling class and CPU core.
    fn add_cycle(
        &self,
        group: GroupId,
        handler: Box<dyn CycleHandler>,
        interval_ms: f64,
    ) -> TsnResult<CycleHandle>;

    /// Request a new interval for a running cycle.
    ///
    /// # Errors
    ///
    /// Fails if `handle` is unknown.
    fn change_interval(&self, handle: CycleHandle, interval_ms: f64) -> TsnResult<()>;

    /// Stop and join a cycle. Failures are logged, not returned.
    ///
    /// Cyclic loops only exit through the process-wide run flag, so removing
    /// a cycle that is still running clears that flag and thereby ends every
    /// other task as well. Removal is a teardown operation, not a way to
    /// retire one group while the rest keep running.
    fn remove_cycle(&self, handle: CycleHandle);
}

struct RegisteredCycle {
    group: GroupId,
    role: TaskRole,
    task: RtTask<WakeLatencyStats>,
}

/// [`CycleHooks`] implementation backed by real-time threads.
pub struct CycleRegistry {
    config: TsnConfig,
    ctx: LoopContext,
    next_id: AtomicU64,
    cycles: Mutex<HashMap<CycleHandle, RegisteredCycle>>,
}

impl fmt::Debug for CycleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleRegistry")
            .field("cycles", &self.len())
            .finish_non_exhaustive()
    }
}

impl CycleRegistry {
    /// Create an empty registry whose tasks share `ctx`.
    #[must_use]
    pub fn new(config: TsnConfig, ctx: LoopContext) -> Self {
        Self {
            config,
            ctx,
            next_id: AtomicU64::new(1),
            cycles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CycleHandle, RegisteredCycle>> {
        self.cycles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Task role implied by a group id.
    #[must_use]
    pub fn role_for(&self, group: GroupId) -> Option<TaskRole> {
        if group.0 == self.config.transport.writer_group_id {
            Some(TaskRole::Publisher)
        } else if group.0 == self.config.transport.reader_group_id {
            Some(TaskRole::Subscriber)
        } else {
            None
        }
    }

    /// Number of registered cycles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no cycles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Role and scheduling status of a registered cycle.
    #[must_use]
    pub fn status(&self, handle: CycleHandle) -> Option<(TaskRole, RtTaskStatus)> {
        self.lock()
            .get(&handle)
            .map(|cycle| (cycle.role, cycle.task.status()))
    }

    /// Remove every registered cycle.
    pub fn remove_all(&self) {
        let handles: Vec<CycleHandle> = self.lock().keys().copied().collect();
        for handle in handles {
            self.remove_cycle(handle);
        }
    }

    /// Stop and join a cycle.
    ///
    /// Stopping a running cycle clears the shared run flag, which stops
    /// every other registered cycle and the user-application task too.
    ///
    /// A task thread that cannot be joined is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::UnknownCycle`] for an unknown handle, or the error
    /// the cyclic loop itself ended with.
    pub fn stop_cycle(&self, handle: CycleHandle) -> TsnResult<()> {
        let cycle = self
            .lock()
            .remove(&handle)
            .ok_or(TsnError::UnknownCycle(handle.0))?;

        if !cycle.task.is_finished() {
            // Loops only exit on the shared flag.
            self.ctx.shutdown().request_shutdown("cycle removed");
        }

        match cycle.task.join() {
            Ok(stats) => {
                info!(%handle, role = %cycle.role, ticks = stats.ticks(), "Cycle removed");
                Ok(())
            }
            Err(e @ TsnError::TaskJoin { .. }) => {
                warn!(%handle, role = %cycle.role, error = %e, "Cycle task did not join cleanly");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn(&self, role: TaskRole, mut handler: Box<dyn CycleHandler>) -> TsnResult<RtTask<WakeLatencyStats>> {
        let rt = &self.config.realtime;
        let ctx = self.ctx.clone();
        match role {
            TaskRole::Publisher => {
                let phase = self.config.phases.publisher;
                let stamper = TxTimeStamper::new(
                    self.config.cycle_ns(),
                    phase,
                    self.config.qbv_offset_ns,
                    self.config.transport.so_txtime,
                );
                let spec = RtTaskSpec::from_config("tsn-publisher", rt.policy, &rt.publisher);
                spawn_rt_task(spec, move || {
                    run_publisher_loop(&ctx, phase, stamper, handler.as_mut())
                })
            }
            TaskRole::Subscriber => {
                let phase = self.config.phases.subscriber;
                let spec = RtTaskSpec::from_config("tsn-subscriber", rt.policy, &rt.subscriber);
                spawn_rt_task(spec, move || run_subscriber_loop(&ctx, phase, handler.as_mut()))
            }
            TaskRole::UserApplication => Err(TsnError::Config(
                "the user application is not driven through the engine".into(),
            )),
        }
    }
}

impl CycleHooks for CycleRegistry {
    fn add_cycle(
        &self,
        group: GroupId,
        handler: Box<dyn CycleHandler>,
        interval_ms: f64,
    ) -> TsnResult<CycleHandle> {
        let role = self.role_for(group).ok_or_else(|| {
            TsnError::Config(format!(
                "group {group} is neither the writer group ({}) nor the reader group ({})",
                self.config.transport.writer_group_id, self.config.transport.reader_group_id
            ))
        })?;

        if (interval_ms - self.config.cycle_time_ms).abs() > f64::EPSILON {
            warn!(
                %group,
                interval_ms,
                cycle_time_ms = self.config.cycle_time_ms,
                "Engine interval differs from the configured cycle; using the configured cycle"
            );
        }

        let task = self.spawn(role, handler)?;
        let handle = CycleHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(%handle, %group, %role, "Cycle added");
        self.lock().insert(handle, RegisteredCycle { group, role, task });
        Ok(handle)
    }

    fn change_interval(&self, handle: CycleHandle, interval_ms: f64) -> TsnResult<()> {
        let cycles = self.lock();
        let cycle = cycles.get(&handle).ok_or(TsnError::UnknownCycle(handle.0))?;
        if (interval_ms - self.config.cycle_time_ms).abs() > f64::EPSILON {
            warn!(
                %handle,
                group = %cycle.group,
                interval_ms,
                "Interval change ignored; cycles keep the configured period"
            );
        }
        Ok(())
    }

    fn remove_cycle(&self, handle: CycleHandle) {
        if let Err(e) = self.stop_cycle(handle) {
            warn!(%handle, error = %e, "Cycle ended with an error");
        }
    }
}

impl Drop for CycleRegistry {
    fn drop(&mut self) {
        if !self.is_empty() {
            self.remove_all();
        }
    }
}
