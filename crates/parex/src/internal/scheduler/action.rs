use std::fmt;

use smallvec::SmallVec;
use thin_vec::ThinVec;

use crate::internal::common::Map;
use crate::{ActionId, CoreId, ImplementationId, Priority, WorkerId};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActionFlags: u32 {
        // Set while the lookahead optimizer holds a speculative placement
        const ON_OPTIMIZATION = 0b00000001;
    }
}

#[cfg_attr(test, derive(Eq, PartialEq))]
#[derive(Debug, Clone, Copy)]
pub enum ActionState {
    Unscheduled,
    Scheduled {
        worker: WorkerId,
        implementation: ImplementationId,
    },
    Running {
        worker: WorkerId,
        implementation: ImplementationId,
    },
    Completed,
    Failed,
}

/// What to do once the retry budget of a failing action is exhausted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OnFailure {
    /// Fail the action and every transitive successor.
    Abort,
    /// Treat the failure as completion for dependency purposes.
    Ignore,
    /// Keep retrying on workers other than the failing one.
    Rescue,
}

/// Expected timing and bookkeeping attached to an action by the scheduler and
/// the lookahead optimizer.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingInfo {
    pub expected_start: u64,
    pub expected_end: u64,
    pub flags: ActionFlags,
    /// Bumped whenever the action re-enters the ready set; queue entries with
    /// an older epoch are stale and discarded transparently.
    pub epoch: u32,
}

impl Default for SchedulingInfo {
    fn default() -> Self {
        SchedulingInfo {
            expected_start: 0,
            expected_end: 0,
            flags: ActionFlags::empty(),
            epoch: 0,
        }
    }
}

/// One schedulable task instance. Dependency edges are index lists into the
/// owning [`ActionMap`]; no action holds a reference to another.
pub struct Action {
    pub id: ActionId,
    pub core: CoreId,
    pub priority: Priority,
    pub on_failure: OnFailure,
    pub state: ActionState,
    pub candidates: SmallVec<[ImplementationId; 2]>,
    predecessors: ThinVec<ActionId>,
    successors: ThinVec<ActionId>,
    unfinished_deps: u32,
    pub attempts: u32,
    /// Worker excluded after a failure under the `Rescue` policy.
    pub banned_worker: Option<WorkerId>,
    pub sched: SchedulingInfo,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("core", &self.core)
            .field("state", &self.state)
            .finish()
    }
}

impl Action {
    pub fn new(
        id: ActionId,
        core: CoreId,
        priority: Priority,
        on_failure: OnFailure,
        candidates: SmallVec<[ImplementationId; 2]>,
        predecessors: ThinVec<ActionId>,
    ) -> Self {
        log::debug!("New action {id} of core {core}");
        Action {
            id,
            core,
            priority,
            on_failure,
            state: ActionState::Unscheduled,
            candidates,
            predecessors,
            successors: ThinVec::new(),
            unfinished_deps: 0,
            attempts: 0,
            banned_worker: None,
            sched: SchedulingInfo::default(),
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.unfinished_deps == 0 && matches!(self.state, ActionState::Unscheduled)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ActionState::Completed | ActionState::Failed)
    }

    /// True while the action's expected timing comes from a lookahead plan
    /// rather than from a dispatch.
    #[inline]
    pub fn is_on_optimization(&self) -> bool {
        self.sched.flags.contains(ActionFlags::ON_OPTIMIZATION)
    }

    #[inline]
    pub fn predecessors(&self) -> &[ActionId] {
        &self.predecessors
    }

    #[inline]
    pub fn successors(&self) -> &[ActionId] {
        &self.successors
    }

    #[inline]
    pub fn unfinished_deps(&self) -> u32 {
        self.unfinished_deps
    }

    #[inline]
    pub(crate) fn add_successor(&mut self, successor: ActionId) {
        self.successors.push(successor);
    }

    #[inline]
    pub(crate) fn add_unfinished_dep(&mut self) {
        self.unfinished_deps += 1;
    }

    /// Returns true when the action became ready.
    #[inline]
    pub(crate) fn decrease_unfinished_deps(&mut self) -> bool {
        match self.unfinished_deps {
            0 => panic!("Action {} has no unfinished dependencies left", self.id),
            n => {
                self.unfinished_deps = n - 1;
                self.unfinished_deps == 0
            }
        }
    }

    pub fn assigned_worker(&self) -> Option<WorkerId> {
        match self.state {
            ActionState::Scheduled { worker, .. } | ActionState::Running { worker, .. } => {
                Some(worker)
            }
            _ => None,
        }
    }

    pub fn assigned_implementation(&self) -> Option<ImplementationId> {
        match self.state {
            ActionState::Scheduled { implementation, .. }
            | ActionState::Running { implementation, .. } => Some(implementation),
            _ => None,
        }
    }

    pub(crate) fn set_scheduled(&mut self, worker: WorkerId, implementation: ImplementationId) {
        assert!(
            matches!(self.state, ActionState::Unscheduled),
            "Invalid state for scheduling action {}: {:?}",
            self.id,
            self.state
        );
        self.state = ActionState::Scheduled {
            worker,
            implementation,
        };
    }

    pub(crate) fn set_running(&mut self) {
        match self.state {
            ActionState::Scheduled {
                worker,
                implementation,
            } => {
                self.state = ActionState::Running {
                    worker,
                    implementation,
                };
            }
            ref state => panic!("Invalid state for running action {}: {state:?}", self.id),
        }
    }

    pub(crate) fn set_completed(&mut self) {
        assert!(
            matches!(self.state, ActionState::Running { .. }),
            "Invalid state for completing action {}: {:?}",
            self.id,
            self.state
        );
        self.state = ActionState::Completed;
    }

    pub(crate) fn set_failed(&mut self) {
        self.state = ActionState::Failed;
    }

    /// Returns the action to the unscheduled state for another attempt.
    pub(crate) fn reset_for_retry(&mut self) {
        self.state = ActionState::Unscheduled;
        self.sched.epoch += 1;
    }
}

/// Arena of actions indexed by id. Unknown ids are programming errors.
#[derive(Debug, Default)]
pub struct ActionMap {
    actions: Map<ActionId, Action>,
}

impl ActionMap {
    #[inline]
    pub fn insert(&mut self, action: Action) {
        let id = action.id;
        if self.actions.insert(id, action).is_some() {
            panic!("Duplicate insertion of action id={id}");
        }
    }

    #[inline]
    pub fn remove(&mut self, action_id: ActionId) -> Option<Action> {
        self.actions.remove(&action_id)
    }

    #[inline]
    pub fn get(&self, action_id: ActionId) -> &Action {
        self.actions.get(&action_id).unwrap_or_else(|| {
            panic!("Asking for invalid action id={action_id}");
        })
    }

    #[inline]
    pub fn get_mut(&mut self, action_id: ActionId) -> &mut Action {
        self.actions.get_mut(&action_id).unwrap_or_else(|| {
            panic!("Asking for invalid action id={action_id}");
        })
    }

    #[inline]
    pub fn find(&self, action_id: ActionId) -> Option<&Action> {
        self.actions.get(&action_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.actions.keys().copied()
    }
}
