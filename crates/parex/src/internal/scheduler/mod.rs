pub mod action;
pub mod action_set;
pub mod gap;
pub mod optimizer;
pub mod profile;
pub mod resource_scheduler;
pub mod score;

use std::sync::Arc;

use serde_json::json;
use smallvec::SmallVec;

use crate::internal::common::resources::{ResourceClass, ResourceDescription};
use crate::internal::common::{Map, Set};
use crate::internal::registry::{CoreRegistry, ImplementationDef};
use crate::internal::scheduler::action::{Action, ActionFlags, ActionMap, ActionState, OnFailure};
use crate::internal::scheduler::action_set::PriorityActionSet;
use crate::internal::scheduler::optimizer::{OptimizedPlan, PendingItem, ScheduleOptimizer};
use crate::internal::scheduler::resource_scheduler::ResourceScheduler;
use crate::internal::scheduler::score::Score;
use crate::internal::worker::counts::TaskCountLimits;
use crate::internal::worker::reduction::ReductionOutcome;
use crate::internal::worker::Worker;
use crate::{ActionId, CoreId, ImplementationId, Priority, WorkerId, MAX_ACTION_RETRIES};

/// Fixed per-predecessor penalty added to the data-availability estimate when
/// the input data was produced on a different worker.
const TRANSFER_PENALTY: i64 = 5;

/// Outgoing interface towards the dispatch/transport collaborator.
pub trait Dispatch {
    /// Hand a scheduled action over for execution. The collaborator reports
    /// back through `action_completed` / `action_error`.
    fn submit(&mut self, worker: WorkerId, action: ActionId, implementation: ImplementationId);

    /// Final failure notification once the retry budget and the on-failure
    /// policy are exhausted.
    fn notify_failed(&mut self, failure: &ActionFailure);
}

#[derive(Debug, Clone)]
pub struct ActionFailure {
    pub action: ActionId,
    pub attempts: u32,
    pub cause: String,
}

/// Result of one scheduling attempt. Capacity shortage and structural
/// incompatibility are ordinary outcomes, not errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScheduleOutcome {
    Scheduled {
        worker: WorkerId,
        implementation: ImplementationId,
    },
    /// Compatible workers exist but none has room right now; the action waits
    /// in the ready set for the next capacity event.
    Unassigned,
    /// No registered worker can structurally run the action; it waits for an
    /// explicit resource change.
    Blocked,
}

/// Parameters of a new action handed to the scheduler.
#[derive(Debug, Clone)]
pub struct ActionSubmit {
    pub core: CoreId,
    pub priority: Priority,
    pub on_failure: OnFailure,
    /// Restrict scheduling to these implementations; empty means any
    /// registered implementation of the core.
    pub candidates: SmallVec<[ImplementationId; 2]>,
    pub predecessors: Vec<ActionId>,
}

impl ActionSubmit {
    pub fn new(core: CoreId) -> Self {
        ActionSubmit {
            core,
            priority: 0,
            on_failure: OnFailure::Abort,
            candidates: SmallVec::new(),
            predecessors: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn deps(mut self, predecessors: &[ActionId]) -> Self {
        self.predecessors = predecessors.to_vec();
        self
    }

    pub fn candidates(mut self, candidates: &[ImplementationId]) -> Self {
        self.candidates = candidates.iter().copied().collect();
        self
    }
}

struct CandidateTarget {
    worker: WorkerId,
    implementation: ImplementationId,
    requirements: ResourceDescription,
    estimate: u64,
    score: Score,
}

/// Global orchestrator: worker set, action arena, ready and blocked queues,
/// and the score-based assignment policy. All dispatching goes through the
/// injected [`Dispatch`] collaborator.
pub struct TaskScheduler {
    registry: CoreRegistry,
    workers: Map<WorkerId, ResourceScheduler>,
    actions: ActionMap,
    ready: PriorityActionSet,
    /// Actions with no structurally compatible worker, keyed by the resource
    /// class they are missing.
    blocked: Map<ResourceClass, Vec<ActionId>>,
    next_action_id: u32,
    next_worker_id: u32,
}

impl TaskScheduler {
    pub fn new(registry: CoreRegistry) -> Self {
        TaskScheduler {
            registry,
            workers: Map::new(),
            actions: ActionMap::default(),
            ready: PriorityActionSet::new(),
            blocked: Map::new(),
            next_action_id: 0,
            next_worker_id: 0,
        }
    }

    #[inline]
    pub fn registry(&self) -> &CoreRegistry {
        &self.registry
    }

    pub fn register_core_element(
        &mut self,
        signature: &str,
        implementations: impl IntoIterator<Item = ImplementationDef>,
    ) -> CoreId {
        let core = self.registry.register_core(signature);
        self.registry.register_implementations(core, implementations);
        core
    }

    pub fn action(&self, action_id: ActionId) -> &Action {
        self.actions.get(action_id)
    }

    pub fn worker(&self, worker_id: WorkerId) -> &Arc<Worker> {
        self.workers
            .get(&worker_id)
            .unwrap_or_else(|| panic!("Asking for invalid worker id={worker_id}"))
            .worker()
    }

    /// Registers a node and retries actions the new capacity may unblock.
    pub fn worker_joined(
        &mut self,
        name: &str,
        description: ResourceDescription,
        limits: TaskCountLimits,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) -> WorkerId {
        let id = WorkerId::new(self.next_worker_id);
        self.next_worker_id += 1;
        let gained = description.clone();
        let worker = Arc::new(Worker::new(id, name, description, limits));
        worker.refresh_capabilities(&self.registry);
        self.workers.insert(id, ResourceScheduler::new(worker));
        self.retry_after_capacity_gain(&gained, dispatch, now);
        id
    }

    /// Withdraws the worker's whole capacity. The returned outcome is pending
    /// until every running task on that node has released its resources.
    pub fn worker_leaving(&mut self, worker_id: WorkerId) -> crate::Result<ReductionOutcome> {
        let worker = self.worker(worker_id).clone();
        let description = worker.description();
        log::debug!("Worker {} leaving, draining {:?}", worker.name(), description.dynamic());
        worker.reduce_features(&description)
    }

    /// Final removal after a drain has completed.
    pub fn worker_removed(&mut self, worker_id: WorkerId) {
        let scheduler = self
            .workers
            .remove(&worker_id)
            .unwrap_or_else(|| panic!("Removing invalid worker id={worker_id}"));
        scheduler.worker().mark_removed();
    }

    /// Elastic resize. Increases immediately retry blocked and unassigned
    /// actions; reductions have no action-level effect until the drain
    /// completes.
    pub fn update_worker(
        &mut self,
        worker_id: WorkerId,
        delta: &ResourceDescription,
        increase: bool,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) -> crate::Result<ReductionOutcome> {
        let worker = self.worker(worker_id).clone();
        if increase {
            worker.increase_features(delta);
            worker.refresh_capabilities(&self.registry);
            self.retry_after_capacity_gain(delta, dispatch, now);
            Ok(ReductionOutcome::Completed)
        } else {
            worker.reduce_features(delta)
        }
    }

    /// Files a new action and attempts to schedule it once all its
    /// predecessors are resolved.
    pub fn new_allocatable_action(
        &mut self,
        submit: ActionSubmit,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) -> (ActionId, ScheduleOutcome) {
        let id = ActionId::new(self.next_action_id);
        self.next_action_id += 1;

        let mut action = Action::new(
            id,
            submit.core,
            submit.priority,
            submit.on_failure,
            submit.candidates,
            submit.predecessors.iter().copied().collect(),
        );
        let mut unfinished = Vec::new();
        for pred in &submit.predecessors {
            if let Some(predecessor) = self.actions.find(*pred) {
                if !predecessor.is_terminal() {
                    unfinished.push(*pred);
                }
            }
        }
        for _ in &unfinished {
            action.add_unfinished_dep();
        }
        self.actions.insert(action);
        for pred in unfinished {
            self.actions.get_mut(pred).add_successor(id);
        }

        if self.actions.get(id).is_ready() {
            let outcome = self.try_schedule(id, dispatch, now);
            (id, outcome)
        } else {
            (id, ScheduleOutcome::Unassigned)
        }
    }

    /// Completion callback from the dispatch collaborator: releases the
    /// reservation, feeds the profile, wakes up newly ready successors and
    /// drains the ready set against the freed capacity.
    pub fn action_completed(&mut self, action_id: ActionId, dispatch: &mut impl Dispatch, now: u64) {
        let worker_id = {
            let action = self.actions.get_mut(action_id);
            let worker_id = action
                .assigned_worker()
                .unwrap_or_else(|| panic!("Completed action {action_id} has no worker"));
            action.set_completed();
            action.sched.expected_end = now;
            worker_id
        };
        let released = self
            .workers
            .get_mut(&worker_id)
            .unwrap_or_else(|| panic!("Asking for invalid worker id={worker_id}"))
            .finish_action(action_id, now);
        log::debug!(
            "Action {action_id} completed on worker {worker_id}, released {:?}",
            released.dynamic()
        );
        self.release_successors(action_id, dispatch, now);
        self.schedule_ready(dispatch, now);
    }

    /// Failure callback. Retries within the budget (excluding the failing
    /// worker), then applies the action's on-failure policy.
    pub fn action_error(
        &mut self,
        action_id: ActionId,
        cause: &str,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) {
        let worker_id = self
            .actions
            .get(action_id)
            .assigned_worker()
            .unwrap_or_else(|| panic!("Failed action {action_id} has no worker"));
        self.workers
            .get_mut(&worker_id)
            .unwrap_or_else(|| panic!("Asking for invalid worker id={worker_id}"))
            .abort_action(action_id);

        let action = self.actions.get_mut(action_id);
        action.attempts += 1;
        let attempts = action.attempts;

        if attempts < MAX_ACTION_RETRIES {
            log::debug!(
                "Action {action_id} failed on worker {worker_id} (attempt {attempts}): {cause}; retrying"
            );
            action.reset_for_retry();
            self.try_schedule(action_id, dispatch, now);
            return;
        }

        match action.on_failure {
            OnFailure::Abort => {
                log::debug!("Action {action_id} failed permanently: {cause}; aborting successors");
                self.fail_with_successors(action_id, cause, dispatch);
            }
            OnFailure::Ignore => {
                log::debug!("Action {action_id} failed permanently: {cause}; ignoring");
                action.set_failed();
                dispatch.notify_failed(&ActionFailure {
                    action: action_id,
                    attempts,
                    cause: cause.to_string(),
                });
                self.release_successors(action_id, dispatch, now);
                self.schedule_ready(dispatch, now);
            }
            OnFailure::Rescue => {
                log::debug!(
                    "Action {action_id} failed on worker {worker_id}: {cause}; rescuing elsewhere"
                );
                action.banned_worker = Some(worker_id);
                action.attempts = 0;
                action.reset_for_retry();
                self.try_schedule(action_id, dispatch, now);
            }
        }
    }

    /// Withdraws an action that has not been dispatched yet. Its successors
    /// are released as if the action had completed.
    pub fn cancel_action(
        &mut self,
        action_id: ActionId,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) -> crate::Result<()> {
        let action = self.actions.get_mut(action_id);
        if !matches!(action.state, ActionState::Unscheduled) {
            return Err(crate::Error::GenericError(format!(
                "Cannot cancel action {action_id} in state {:?}",
                action.state
            )));
        }
        action.set_failed();
        // Invalidate any queue entry
        action.sched.epoch += 1;
        for queue in self.blocked.values_mut() {
            queue.retain(|&id| id != action_id);
        }
        log::debug!("Action {action_id} cancelled");
        self.release_successors(action_id, dispatch, now);
        Ok(())
    }

    /// One lookahead pass over a worker's running and pending actions.
    /// Revises each planned action's expected start and end; consumers use
    /// the plan's order to decide which pending action to retry next. Never
    /// dispatches anything.
    pub fn reoptimize(&mut self, worker_id: WorkerId, now: u64) -> OptimizedPlan {
        let scheduler = self
            .workers
            .get(&worker_id)
            .unwrap_or_else(|| panic!("Asking for invalid worker id={worker_id}"));
        let worker = scheduler.worker();
        worker.refresh_capabilities(&self.registry);

        let running = scheduler.running_slots();
        let running_ids: Set<ActionId> = running.iter().map(|r| r.action).collect();

        let mut window: Vec<(ActionId, ImplementationId)> = Vec::new();
        for action_id in self.actions.ids().collect::<Vec<_>>() {
            let action = self.actions.get(action_id);
            if !matches!(action.state, ActionState::Unscheduled) {
                continue;
            }
            if action.banned_worker == Some(worker_id) {
                continue;
            }
            let implementations = worker.executable_implementations(action.core);
            let chosen = implementations.iter().find(|(id, capacity)| {
                !capacity.is_zero()
                    && (action.candidates.is_empty() || action.candidates.contains(id))
            });
            if let Some(&(implementation, _)) = chosen {
                window.push((action_id, implementation));
            }
        }
        let window_ids: Set<ActionId> = window.iter().map(|(id, _)| *id).collect();

        let mut pending = Vec::new();
        for (action_id, implementation_id) in window {
            let action = self.actions.get(action_id);
            let implementation = self.registry.implementation(action.core, implementation_id);
            let mut predecessors = SmallVec::new();
            let mut data_ready = now;
            for pred in action.predecessors() {
                let Some(predecessor) = self.actions.find(*pred) else {
                    continue;
                };
                if predecessor.is_terminal() {
                    continue;
                }
                if running_ids.contains(pred) || window_ids.contains(pred) {
                    predecessors.push(*pred);
                } else {
                    data_ready = data_ready.max(predecessor.sched.expected_end);
                }
            }
            pending.push(PendingItem {
                action: action_id,
                priority: action.priority,
                requirements: implementation.requirements.clone(),
                estimate: scheduler.estimate(action.core, implementation_id),
                predecessors,
                data_ready,
            });
        }

        let plan = ScheduleOptimizer::optimize(now, worker.available(), running, pending);
        for entry in &plan.entries {
            if running_ids.contains(&entry.action) {
                continue;
            }
            let action = self.actions.get_mut(entry.action);
            action.sched.expected_start = entry.expected_start;
            action.sched.expected_end = entry.expected_end;
            action.sched.flags.insert(ActionFlags::ON_OPTIMIZATION);
        }
        plan
    }

    /// Structured counters for the monitoring collaborator.
    pub fn monitoring_data(&self) -> serde_json::Value {
        let workers: Vec<serde_json::Value> = self
            .workers
            .values()
            .map(|s| s.worker().monitoring_data())
            .collect();
        let blocked: usize = self.blocked.values().map(|q| q.len()).sum();
        let planned = self
            .actions
            .ids()
            .filter(|&id| self.actions.get(id).is_on_optimization())
            .count();
        json!({
            "workers": workers,
            "registered_cores": self.registry.core_count(),
            "ready_actions": self.ready.len(),
            "blocked_actions": blocked,
            "planned_actions": planned,
            "total_actions": self.actions.len(),
        })
    }

    /// One scheduling attempt for a ready action: candidate (worker,
    /// implementation) pairs are scored, then reservations are attempted in
    /// score order. `Unassigned` re-queues, `Blocked` parks.
    fn try_schedule(
        &mut self,
        action_id: ActionId,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) -> ScheduleOutcome {
        let action = self.actions.get(action_id);
        debug_assert!(action.is_ready());
        let core = action.core;
        let priority = action.priority;
        let banned = action.banned_worker;
        let epoch = action.sched.epoch;
        let filter = action.candidates.clone();
        let predecessor_ends: Vec<(Option<WorkerId>, u64)> = action
            .predecessors()
            .iter()
            .filter_map(|p| self.actions.find(*p))
            .map(|p| (p.assigned_worker(), p.sched.expected_end))
            .collect();

        let mut targets: Vec<CandidateTarget> = Vec::new();
        let mut structurally_compatible = false;
        for (&worker_id, scheduler) in self.workers.iter() {
            if banned == Some(worker_id) {
                continue;
            }
            let worker = scheduler.worker();
            worker.refresh_capabilities(&self.registry);
            for (implementation_id, capacity) in worker.executable_implementations(core) {
                if capacity.is_zero() {
                    continue;
                }
                if !filter.is_empty() && !filter.contains(&implementation_id) {
                    continue;
                }
                structurally_compatible = true;
                let implementation = self.registry.implementation(core, implementation_id);
                let estimate = scheduler.estimate(core, implementation_id);
                let resource_score = scheduler.resource_score(&implementation.requirements);
                let data_available = predecessor_ends
                    .iter()
                    .map(|&(pred_worker, end)| {
                        let transfer = if pred_worker.is_some() && pred_worker != Some(worker_id) {
                            TRANSFER_PENALTY
                        } else {
                            0
                        };
                        end as i64 + transfer
                    })
                    .max()
                    .unwrap_or(0);
                targets.push(CandidateTarget {
                    worker: worker_id,
                    implementation: implementation_id,
                    requirements: implementation.requirements.clone(),
                    estimate,
                    score: Score::new(priority, resource_score, data_available, estimate as i64),
                });
            }
        }

        if !structurally_compatible {
            let class = self.missing_class(core, &filter);
            log::debug!("Action {action_id} blocked, no worker provides {class:?}");
            self.blocked.entry(class).or_default().push(action_id);
            return ScheduleOutcome::Blocked;
        }

        targets.sort_by(|a, b| b.score.cmp(&a.score));
        for target in &targets {
            let scheduler = self
                .workers
                .get_mut(&target.worker)
                .unwrap_or_else(|| panic!("Asking for invalid worker id={}", target.worker));
            let Some(reserved) = scheduler.worker().run_task(&target.requirements) else {
                continue;
            };
            scheduler.start_action(action_id, core, target.implementation, reserved, now);
            let action = self.actions.get_mut(action_id);
            action.set_scheduled(target.worker, target.implementation);
            action.set_running();
            action.sched.expected_start = now;
            action.sched.expected_end = now + target.estimate;
            action.sched.flags.remove(ActionFlags::ON_OPTIMIZATION);
            log::debug!(
                "Action {action_id} scheduled on worker {} with implementation {}",
                target.worker,
                target.implementation
            );
            dispatch.submit(target.worker, action_id, target.implementation);
            return ScheduleOutcome::Scheduled {
                worker: target.worker,
                implementation: target.implementation,
            };
        }

        let best = targets
            .first()
            .map(|t| t.score)
            .unwrap_or_else(|| Score::new(priority, 0, 0, 0));
        self.ready.push(action_id, epoch, Some(core), best);
        ScheduleOutcome::Unassigned
    }

    /// Decrements successor dependency counts and schedules those that became
    /// ready, in priority order.
    fn release_successors(&mut self, action_id: ActionId, dispatch: &mut impl Dispatch, now: u64) {
        let successors: Vec<ActionId> = self.actions.get(action_id).successors().to_vec();
        let mut newly_ready = Vec::new();
        for successor in successors {
            if self.actions.get_mut(successor).decrease_unfinished_deps() {
                newly_ready.push(successor);
            }
        }
        newly_ready.sort_by(|a, b| {
            self.actions
                .get(*b)
                .priority
                .cmp(&self.actions.get(*a).priority)
        });
        for successor in newly_ready {
            self.try_schedule(successor, dispatch, now);
        }
    }

    /// Marks the action and every transitive successor failed, notifying the
    /// dispatch collaborator for each.
    fn fail_with_successors(&mut self, action_id: ActionId, cause: &str, dispatch: &mut impl Dispatch) {
        let mut stack = vec![action_id];
        let mut failing: Vec<ActionId> = Vec::new();
        let mut seen: Set<ActionId> = Set::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let action = self.actions.get(id);
            if action.is_terminal() {
                continue;
            }
            stack.extend(action.successors().iter().copied());
            failing.push(id);
        }
        for id in failing {
            let action = self.actions.get_mut(id);
            action.set_failed();
            // Stale-out any ready-set entry
            action.sched.epoch += 1;
            let attempts = action.attempts;
            dispatch.notify_failed(&ActionFailure {
                action: id,
                attempts,
                cause: cause.to_string(),
            });
        }
    }

    /// Visits every unassigned ready action once, in global priority order.
    /// Actions that still do not fit re-enter the ready set.
    fn schedule_ready(&mut self, dispatch: &mut impl Dispatch, now: u64) {
        let mut pending = Vec::new();
        while let Some((action_id, _)) = self.ready.poll(&self.actions) {
            pending.push(action_id);
        }
        for action_id in pending {
            self.try_schedule(action_id, dispatch, now);
        }
    }

    /// Retries blocked actions whose missing resource class the gained
    /// capacity provides, then drains the ready set.
    fn retry_after_capacity_gain(
        &mut self,
        gained: &ResourceDescription,
        dispatch: &mut impl Dispatch,
        now: u64,
    ) {
        let mut unblocked = Vec::new();
        for class in ResourceClass::ALL {
            if gained.dynamic().class_units(class) == 0 {
                continue;
            }
            if let Some(queue) = self.blocked.get_mut(&class) {
                unblocked.append(queue);
            }
        }
        for action_id in unblocked {
            if self.actions.get(action_id).is_ready() {
                self.try_schedule(action_id, dispatch, now);
            }
        }
        self.schedule_ready(dispatch, now);
    }

    fn missing_class(&self, core: CoreId, filter: &[ImplementationId]) -> ResourceClass {
        for implementation in self.registry.implementations(core) {
            if !filter.is_empty() && !filter.contains(&implementation.id) {
                continue;
            }
            for class in ResourceClass::ALL {
                if implementation.requirements.uses_class(class) {
                    return class;
                }
            }
        }
        ResourceClass::Cpu
    }
}
