use crate::internal::common::resources::ResourceDescription;
use crate::internal::registry::{CoreRegistry, ImplementationDef};
use crate::internal::scheduler::{
    ActionFailure, ActionSubmit, Dispatch, ScheduleOutcome, TaskScheduler,
};
use crate::internal::tests::utils::resources;
use crate::internal::worker::counts::TaskCountLimits;
use crate::{ActionId, CoreId, ImplementationId, WorkerId};

/// Recording stand-in for the dispatch/transport collaborator.
#[derive(Default)]
pub struct TestDispatch {
    pub submissions: Vec<(WorkerId, ActionId, ImplementationId)>,
    pub failures: Vec<ActionFailure>,
}

impl Dispatch for TestDispatch {
    fn submit(&mut self, worker: WorkerId, action: ActionId, implementation: ImplementationId) {
        self.submissions.push((worker, action, implementation));
    }

    fn notify_failed(&mut self, failure: &ActionFailure) {
        self.failures.push(failure.clone());
    }
}

impl TestDispatch {
    pub fn take_submissions(&mut self) -> Vec<(WorkerId, ActionId, ImplementationId)> {
        std::mem::take(&mut self.submissions)
    }

    pub fn submitted_actions(&self) -> Vec<ActionId> {
        self.submissions.iter().map(|(_, a, _)| *a).collect()
    }
}

pub struct TestEnv {
    pub scheduler: TaskScheduler,
    pub dispatch: TestDispatch,
    pub now: u64,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let _ = env_logger::builder().is_test(true).try_init();
        TestEnv {
            scheduler: TaskScheduler::new(CoreRegistry::new()),
            dispatch: TestDispatch::default(),
            now: 0,
        }
    }

    /// One core element with a single method implementation requiring `cpus`.
    pub fn register_simple_core(&mut self, signature: &str, cpus: u32) -> CoreId {
        self.scheduler.register_core_element(
            signature,
            [ImplementationDef::method(
                &format!("{signature}@method"),
                resources::cpus(cpus),
            )],
        )
    }

    pub fn register_core_with(
        &mut self,
        signature: &str,
        requirements: ResourceDescription,
    ) -> CoreId {
        self.scheduler.register_core_element(
            signature,
            [ImplementationDef::method(
                &format!("{signature}@method"),
                requirements,
            )],
        )
    }

    pub fn add_worker(&mut self, name: &str, cpus: u32) -> WorkerId {
        self.add_worker_with(name, resources::cpus(cpus))
    }

    pub fn add_worker_with(&mut self, name: &str, description: ResourceDescription) -> WorkerId {
        self.scheduler.worker_joined(
            name,
            description,
            TaskCountLimits::default(),
            &mut self.dispatch,
            self.now,
        )
    }

    pub fn submit(&mut self, submit: ActionSubmit) -> (ActionId, ScheduleOutcome) {
        self.scheduler
            .new_allocatable_action(submit, &mut self.dispatch, self.now)
    }

    pub fn complete(&mut self, action: ActionId) {
        self.scheduler
            .action_completed(action, &mut self.dispatch, self.now);
    }

    pub fn fail(&mut self, action: ActionId, cause: &str) {
        self.scheduler
            .action_error(action, cause, &mut self.dispatch, self.now);
    }

    pub fn advance(&mut self, duration: u64) {
        self.now += duration;
    }
}
