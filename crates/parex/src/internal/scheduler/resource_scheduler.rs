use std::sync::Arc;

use crate::internal::common::Map;
use crate::internal::common::resources::ResourceDescription;
use crate::internal::scheduler::optimizer::RunningSlot;
use crate::internal::scheduler::profile::Profile;
use crate::internal::worker::{ReservedHandle, Worker};
use crate::{ActionId, CoreId, ImplementationId};

struct RunningAction {
    core: CoreId,
    implementation: ImplementationId,
    reserved: ReservedHandle,
    started_at: u64,
    expected_end: u64,
}

/// Scheduling view of one worker: execution profiles per (core,
/// implementation) pair plus the reservations of the actions currently
/// running there. The worker itself only tracks capacity; everything
/// time-related lives here.
pub struct ResourceScheduler {
    worker: Arc<Worker>,
    profiles: Map<(CoreId, ImplementationId), Profile>,
    running: Map<ActionId, RunningAction>,
}

impl ResourceScheduler {
    pub fn new(worker: Arc<Worker>) -> Self {
        ResourceScheduler {
            worker,
            profiles: Map::new(),
            running: Map::new(),
        }
    }

    #[inline]
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Default (zeroed) profile for implementations never observed here.
    pub fn profile(&self, core: CoreId, implementation: ImplementationId) -> Profile {
        self.profiles
            .get(&(core, implementation))
            .copied()
            .unwrap_or_default()
    }

    pub fn estimate(&self, core: CoreId, implementation: ImplementationId) -> u64 {
        self.profile(core, implementation).average_execution_time()
    }

    /// Records a dispatched action; `reserved` is the proof of its capacity
    /// reservation and is surrendered back to the worker on completion.
    pub fn start_action(
        &mut self,
        action: ActionId,
        core: CoreId,
        implementation: ImplementationId,
        reserved: ReservedHandle,
        now: u64,
    ) {
        let expected_end = now + self.estimate(core, implementation);
        let previous = self.running.insert(
            action,
            RunningAction {
                core,
                implementation,
                reserved,
                started_at: now,
                expected_end,
            },
        );
        assert!(previous.is_none(), "Action {action} started twice");
    }

    /// Releases the action's reservation, feeds the observed duration into
    /// its profile and returns what it was consuming.
    pub fn finish_action(&mut self, action: ActionId, now: u64) -> ResourceDescription {
        let running = self
            .running
            .remove(&action)
            .unwrap_or_else(|| panic!("Finishing action {action} that is not running here"));
        let observed = now.saturating_sub(running.started_at);
        self.profiles
            .entry((running.core, running.implementation))
            .or_default()
            .accumulate(observed);
        let consumption = running.reserved.consumption().clone();
        self.worker.end_task(running.reserved);
        consumption
    }

    /// Drops the action's reservation without a profile observation. Used
    /// when the action failed and its duration would poison the estimate.
    pub fn abort_action(&mut self, action: ActionId) -> ResourceDescription {
        let running = self
            .running
            .remove(&action)
            .unwrap_or_else(|| panic!("Aborting action {action} that is not running here"));
        let consumption = running.reserved.consumption().clone();
        self.worker.end_task(running.reserved);
        consumption
    }

    /// Earliest instant at which `requirements` are expected to fit. Zero
    /// when they fit right now, otherwise the earliest expected end among the
    /// running actions. A rough lower bound, not a simulation.
    pub fn resource_score(&self, requirements: &ResourceDescription) -> i64 {
        if self.worker.available().contains_dynamic(requirements) {
            return 0;
        }
        self.running
            .values()
            .map(|r| r.expected_end)
            .min()
            .unwrap_or(0) as i64
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Snapshot of the running actions for the lookahead optimizer.
    pub fn running_slots(&self) -> Vec<RunningSlot> {
        self.running
            .iter()
            .map(|(&action, r)| RunningSlot {
                action,
                expected_end: r.expected_end,
                requirements: r.reserved.consumption().clone(),
            })
            .collect()
    }
}
