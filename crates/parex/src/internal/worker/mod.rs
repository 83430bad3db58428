pub mod counts;
pub mod reduction;

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde_json::json;
use smallvec::SmallVec;

use crate::internal::common::Map;
use crate::internal::common::resources::{
    ResourceDescription, SimultaneousCapacity,
};
use crate::internal::registry::{CoreRegistry, Implementation};
use crate::internal::worker::counts::{TaskCountLimits, TaskCounts};
use crate::internal::worker::reduction::{PendingReduction, ReductionOutcome, WaitHandle};
use crate::{CoreId, ImplementationId, WorkerId};

/// Proof that a consumption was subtracted from a worker's available
/// description. Returned by `reserve_resource`/`run_task` and given back to
/// `end_task`.
#[must_use]
#[derive(Debug)]
pub struct ReservedHandle {
    consumption: ResourceDescription,
}

impl ReservedHandle {
    pub fn consumption(&self) -> &ResourceDescription {
        &self.consumption
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerLifecycle {
    /// Accepting reservations.
    Active,
    /// A capacity reduction waits for running tasks to release resources.
    Draining,
    /// All capacity withdrawn; any further reservation is a programming error.
    Removed,
}

/// Precomputed "can this worker run this core, and how many at once" table,
/// ignoring current load.
#[derive(Debug, Clone, Default)]
pub struct CoreCapability {
    pub implementations: SmallVec<[(ImplementationId, SimultaneousCapacity); 2]>,
}

#[derive(Debug)]
struct WorkerState {
    /// Total capacity of the node; mutated only by elastic resize events.
    description: ResourceDescription,
    /// Currently idle capacity; mutated by the reserve/release protocol.
    available: ResourceDescription,
    counts: TaskCounts,
    pending_reductions: Vec<PendingReduction>,
    lifecycle: WorkerLifecycle,
    capabilities: Map<CoreId, CoreCapability>,
    registry_version: Option<u64>,
}

/// Per-node capacity tracker. All mutable state sits behind one per-worker
/// lock; reservations on two different workers never contend.
pub struct Worker {
    id: WorkerId,
    name: String,
    limits: TaskCountLimits,
    state: Mutex<WorkerState>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        name: &str,
        description: ResourceDescription,
        limits: TaskCountLimits,
    ) -> Self {
        log::debug!("New worker {id} '{name}' with {:?}", description.dynamic());
        Worker {
            id,
            name: name.to_string(),
            limits,
            state: Mutex::new(WorkerState {
                available: description.clone(),
                description,
                counts: TaskCounts::default(),
                pending_reductions: Vec::new(),
                lifecycle: WorkerLifecycle::Active,
                capabilities: Map::new(),
                registry_version: None,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &TaskCountLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap()
    }

    /// Snapshot of the total description.
    pub fn description(&self) -> ResourceDescription {
        self.lock().description.clone()
    }

    /// Snapshot of the currently idle capacity. Never act on this snapshot as
    /// if authoritative; all fit checks are re-verified at reservation time.
    pub fn available(&self) -> ResourceDescription {
        self.lock().available.clone()
    }

    pub fn task_counts(&self) -> TaskCounts {
        self.lock().counts
    }

    pub fn lifecycle(&self) -> WorkerLifecycle {
        self.lock().lifecycle
    }

    /// Atomically checks and subtracts `consumption` from the available
    /// capacity. `None` means "insufficient capacity right now" and is not an
    /// error; the caller must re-queue the action rather than busy-wait.
    pub fn reserve_resource(&self, consumption: &ResourceDescription) -> Option<ReservedHandle> {
        let mut state = self.lock();
        self.reserve_locked(&mut state, consumption)
    }

    fn reserve_locked(
        &self,
        state: &mut WorkerState,
        consumption: &ResourceDescription,
    ) -> Option<ReservedHandle> {
        assert!(
            state.lifecycle != WorkerLifecycle::Removed,
            "Reserving on removed worker {}",
            self.name
        );
        if state.available.contains_dynamic(consumption) {
            state.available.reduce(consumption);
            Some(ReservedHandle {
                consumption: consumption.clone(),
            })
        } else {
            None
        }
    }

    /// Adds `consumption` back and commits any pending reduction that the
    /// returned capacity can now satisfy.
    pub fn release_resource(&self, consumption: &ResourceDescription) {
        let mut state = self.lock();
        state.available.increase(consumption);
        self.commit_pending_reductions(&mut state);
    }

    /// Task-count gates plus reservation in one critical section.
    pub fn run_task(&self, consumption: &ResourceDescription) -> Option<ReservedHandle> {
        let mut state = self.lock();
        if !state.counts.can_accept(&self.limits, consumption) {
            return None;
        }
        let reserved = self.reserve_locked(&mut state, consumption)?;
        state.counts.on_start(consumption);
        Some(reserved)
    }

    pub fn end_task(&self, reserved: ReservedHandle) {
        let mut state = self.lock();
        state.counts.on_end(&reserved.consumption);
        state.available.increase(&reserved.consumption);
        self.commit_pending_reductions(&mut state);
    }

    /// Structural check against the total description, ignoring current load.
    pub fn can_run(&self, implementation: &Implementation) -> bool {
        let state = self.lock();
        state.lifecycle != WorkerLifecycle::Removed
            && state.description.contains(&implementation.requirements)
    }

    /// How many instances of `implementation` this worker could host at once,
    /// ignoring current load, bounded by the CPU task-count limit.
    pub fn simultaneous_capacity(&self, implementation: &Implementation) -> SimultaneousCapacity {
        self.lock()
            .description
            .can_host_simultaneously(&implementation.requirements)
            .min(SimultaneousCapacity::Bounded(self.limits.cpu))
    }

    /// Rebuilds the per-core capability tables when the registry version has
    /// advanced since the last rebuild.
    pub fn refresh_capabilities(&self, registry: &CoreRegistry) {
        let mut state = self.lock();
        if state.registry_version == Some(registry.version()) {
            return;
        }
        let mut capabilities = Map::new();
        for core in registry.core_ids() {
            let mut capability = CoreCapability::default();
            for implementation in registry.implementations(core) {
                if state.description.contains(&implementation.requirements) {
                    let capacity = state
                        .description
                        .can_host_simultaneously(&implementation.requirements)
                        .min(SimultaneousCapacity::Bounded(self.limits.cpu));
                    capability
                        .implementations
                        .push((implementation.id, capacity));
                }
            }
            if !capability.implementations.is_empty() {
                capabilities.insert(core, capability);
            }
        }
        log::debug!("Worker {} rebuilt capability tables for {} core(s)", self.name, capabilities.len());
        state.capabilities = capabilities;
        state.registry_version = Some(registry.version());
    }

    /// Implementations of `core` this worker can structurally run, with their
    /// simultaneous capacities. Requires `refresh_capabilities` to have seen
    /// the current registry version.
    pub fn executable_implementations(
        &self,
        core: CoreId,
    ) -> SmallVec<[(ImplementationId, SimultaneousCapacity); 2]> {
        self.lock()
            .capabilities
            .get(&core)
            .map(|c| c.implementations.clone())
            .unwrap_or_default()
    }

    /// Elastic resize: additional capacity is immediately available.
    pub fn increase_features(&self, delta: &ResourceDescription) {
        let mut state = self.lock();
        log::debug!("Worker {} grows by {:?}", self.name, delta.dynamic());
        state.description.increase(delta);
        state.available.increase(delta);
        // New capacity may render the tables stale
        state.registry_version = None;
    }

    /// Elastic resize: withdraws `delta` from the total description
    /// immediately (new scheduling decisions see the reduced capacity), then
    /// commits the withdrawal from idle capacity as soon as possible.
    ///
    /// Idle and busy workers go through the same commit path; the idle case
    /// simply satisfies the pending amount within this critical section.
    pub fn reduce_features(&self, delta: &ResourceDescription) -> crate::Result<ReductionOutcome> {
        let mut state = self.lock();
        state.description.strict_reduce(delta)?;
        state.registry_version = None;
        let handle = WaitHandle::new();
        state.pending_reductions.push(PendingReduction {
            remaining: delta.clone(),
            handle: handle.clone(),
        });
        self.commit_pending_reductions(&mut state);
        if handle.is_complete() {
            log::debug!("Worker {} reduced by {:?}", self.name, delta.dynamic());
            Ok(ReductionOutcome::Completed)
        } else {
            log::debug!(
                "Worker {} reduction of {:?} pending, {} task(s) running",
                self.name,
                delta.dynamic(),
                state.counts.total()
            );
            state.lifecycle = WorkerLifecycle::Draining;
            Ok(ReductionOutcome::Pending(handle))
        }
    }

    /// Commits pending reductions in request order; stops at the first one the
    /// idle capacity cannot cover yet.
    fn commit_pending_reductions(&self, state: &mut WorkerState) {
        while let Some(pending) = state.pending_reductions.first() {
            if !state.available.contains_dynamic(&pending.remaining) {
                break;
            }
            let pending = state.pending_reductions.remove(0);
            state.available.reduce(&pending.remaining);
            pending.handle.complete();
        }
        if state.pending_reductions.is_empty() && state.lifecycle == WorkerLifecycle::Draining {
            state.lifecycle = WorkerLifecycle::Active;
        }
    }

    /// All capacity has round-tripped back and been withdrawn; the node can be
    /// physically decommissioned.
    pub fn should_be_stopped(&self) -> bool {
        let state = self.lock();
        let pending_cpus: u32 = state
            .pending_reductions
            .iter()
            .map(|p| p.remaining.cpus())
            .sum();
        state.available.cpus() == 0 && pending_cpus == 0
    }

    pub fn mark_removed(&self) {
        let mut state = self.lock();
        assert_eq!(
            state.counts.total(),
            0,
            "Removing worker {} with running tasks",
            self.name
        );
        state.lifecycle = WorkerLifecycle::Removed;
    }

    /// Structured counters for the monitoring collaborator.
    pub fn monitoring_data(&self) -> serde_json::Value {
        let state = self.lock();
        json!({
            "name": self.name,
            "total": state.description.dynamic(),
            "available": state.available.dynamic(),
            "task_counts": state.counts,
            "executable_cores": state.capabilities.len(),
        })
    }
}
