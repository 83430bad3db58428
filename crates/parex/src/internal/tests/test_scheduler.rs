use crate::internal::scheduler::action::{ActionState, OnFailure};
use crate::internal::scheduler::{ActionSubmit, ScheduleOutcome};
use crate::internal::tests::utils::env::TestEnv;
use crate::internal::tests::utils::resources::cpus_gpus;
use crate::ActionId;

fn assert_scheduled(outcome: ScheduleOutcome) {
    assert!(matches!(outcome, ScheduleOutcome::Scheduled { .. }));
}

#[test]
fn test_four_run_fifth_queued() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 4);

    let mut actions = Vec::new();
    for _ in 0..5 {
        actions.push(env.submit(ActionSubmit::new(core)));
    }
    for (_, outcome) in &actions[..4] {
        assert_scheduled(*outcome);
    }
    assert_eq!(actions[4].1, ScheduleOutcome::Unassigned);
    assert_eq!(env.dispatch.take_submissions().len(), 4);

    env.complete(actions[0].0);
    assert_eq!(env.dispatch.submitted_actions(), vec![actions[4].0]);
}

#[test]
fn test_dependency_defers_successor() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 2);

    let (a, outcome) = env.submit(ActionSubmit::new(core));
    assert_scheduled(outcome);
    let (b, outcome) = env.submit(ActionSubmit::new(core).deps(&[a]));
    assert_eq!(outcome, ScheduleOutcome::Unassigned);
    assert!(matches!(
        env.scheduler.action(b).state,
        ActionState::Unscheduled
    ));
    assert_eq!(env.dispatch.submitted_actions(), vec![a]);
    env.dispatch.take_submissions();

    env.complete(a);
    assert!(matches!(
        env.scheduler.action(a).state,
        ActionState::Completed
    ));
    // The successor is woken exactly once
    assert_eq!(env.dispatch.submitted_actions(), vec![b]);
}

#[test]
fn test_blocked_until_compatible_worker_joins() {
    let mut env = TestEnv::new();
    let core = env.register_core_with("gpu_kernel", cpus_gpus(1, 1));
    env.add_worker("cpu_only", 8);

    let (action, outcome) = env.submit(ActionSubmit::new(core));
    assert_eq!(outcome, ScheduleOutcome::Blocked);
    assert!(env.dispatch.submissions.is_empty());

    let gpu_worker = env.add_worker_with("gpu_node", cpus_gpus(4, 2));
    assert_eq!(env.dispatch.submissions, vec![(
        gpu_worker,
        action,
        crate::ImplementationId::new(0)
    )]);
}

#[test]
fn test_capacity_increase_unblocks() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("wide", 2);
    let worker = env.add_worker("small", 1);

    let (action, outcome) = env.submit(ActionSubmit::new(core));
    assert_eq!(outcome, ScheduleOutcome::Blocked);

    env.scheduler
        .update_worker(
            worker,
            &crate::internal::tests::utils::resources::cpus(2),
            true,
            &mut env.dispatch,
            env.now,
        )
        .unwrap();
    assert_eq!(env.dispatch.submitted_actions(), vec![action]);
}

#[test]
fn test_retry_budget_then_abort() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 2);

    let (action, outcome) = env.submit(ActionSubmit::new(core));
    assert_scheduled(outcome);

    env.fail(action, "worker crashed");
    env.fail(action, "worker crashed");
    assert_eq!(env.dispatch.submissions.len(), 3);
    assert!(env.dispatch.failures.is_empty());

    env.fail(action, "worker crashed");
    assert_eq!(env.dispatch.submissions.len(), 3);
    assert_eq!(env.dispatch.failures.len(), 1);
    let failure = &env.dispatch.failures[0];
    assert_eq!(failure.action, action);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.cause, "worker crashed");
    assert!(matches!(
        env.scheduler.action(action).state,
        ActionState::Failed
    ));
}

#[test]
fn test_abort_fails_transitive_successors() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 4);

    let (a, _) = env.submit(ActionSubmit::new(core));
    let (b, _) = env.submit(ActionSubmit::new(core).deps(&[a]));
    let (c, _) = env.submit(ActionSubmit::new(core).deps(&[b]));

    env.fail(a, "boom");
    env.fail(a, "boom");
    env.fail(a, "boom");

    let failed: Vec<ActionId> = env.dispatch.failures.iter().map(|f| f.action).collect();
    assert!(failed.contains(&a));
    assert!(failed.contains(&b));
    assert!(failed.contains(&c));
    assert!(matches!(env.scheduler.action(b).state, ActionState::Failed));
    assert!(matches!(env.scheduler.action(c).state, ActionState::Failed));
}

#[test]
fn test_ignore_policy_releases_successors() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 2);

    let (a, _) = env.submit(ActionSubmit::new(core).on_failure(OnFailure::Ignore));
    let (b, _) = env.submit(ActionSubmit::new(core).deps(&[a]));
    env.dispatch.take_submissions();

    env.fail(a, "boom");
    env.fail(a, "boom");
    env.fail(a, "boom");

    assert_eq!(env.dispatch.failures.len(), 1);
    assert!(matches!(env.scheduler.action(a).state, ActionState::Failed));
    // The failure counts as completion for dependency purposes
    assert!(env.dispatch.submitted_actions().contains(&b));
}

#[test]
fn test_rescue_policy_moves_to_another_worker() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 2);
    env.add_worker("w1", 2);
    env.add_worker("w2", 2);

    let (action, outcome) = env.submit(ActionSubmit::new(core).on_failure(OnFailure::Rescue));
    assert_scheduled(outcome);

    env.fail(action, "bad node");
    env.fail(action, "bad node");
    let failing_worker = env.dispatch.submissions.last().unwrap().0;
    env.fail(action, "bad node");

    let (rescued_worker, rescued_action, _) = *env.dispatch.submissions.last().unwrap();
    assert_eq!(rescued_action, action);
    assert_ne!(rescued_worker, failing_worker);
    assert!(env.dispatch.failures.is_empty());
}

#[test]
fn test_cancel_before_running() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 1);

    let (a, outcome) = env.submit(ActionSubmit::new(core));
    assert_scheduled(outcome);
    let (b, outcome) = env.submit(ActionSubmit::new(core));
    assert_eq!(outcome, ScheduleOutcome::Unassigned);
    env.dispatch.take_submissions();

    env.scheduler
        .cancel_action(b, &mut env.dispatch, env.now)
        .unwrap();
    assert!(env
        .scheduler
        .cancel_action(a, &mut env.dispatch, env.now)
        .is_err());

    env.complete(a);
    assert!(env.dispatch.submissions.is_empty());
}

#[test]
fn test_priority_order_on_freed_capacity() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 1);

    let (running, outcome) = env.submit(ActionSubmit::new(core));
    assert_scheduled(outcome);
    let (low, _) = env.submit(ActionSubmit::new(core).priority(0));
    let (high, _) = env.submit(ActionSubmit::new(core).priority(5));
    env.dispatch.take_submissions();

    env.complete(running);
    assert_eq!(env.dispatch.submitted_actions(), vec![high]);
    assert!(matches!(
        env.scheduler.action(low).state,
        ActionState::Unscheduled
    ));
}

#[test]
fn test_reoptimize_plans_pending_action() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    let worker = env.add_worker("w1", 2);

    // Seed the profile with one observed 100ms execution
    let (seed, _) = env.submit(ActionSubmit::new(core));
    env.advance(100);
    env.complete(seed);

    let (d, _) = env.submit(ActionSubmit::new(core));
    let (e, _) = env.submit(ActionSubmit::new(core));
    let (f, outcome) = env.submit(ActionSubmit::new(core));
    assert_eq!(outcome, ScheduleOutcome::Unassigned);

    let plan = env.scheduler.reoptimize(worker, env.now);
    let entry = plan.entry(f).expect("pending action must be planned");
    assert_eq!(entry.expected_start, 200);
    assert_eq!(entry.expected_end, 300);
    assert!(entry.depends_on.contains(&d) || entry.depends_on.contains(&e));

    let sched = &env.scheduler.action(f).sched;
    assert_eq!(sched.expected_start, 200);
    assert_eq!(sched.expected_end, 300);
    assert!(env.scheduler.action(f).is_on_optimization());
    assert_eq!(env.scheduler.monitoring_data()["planned_actions"], 1);

    // Dispatching the action supersedes its speculative timing
    env.advance(100);
    env.complete(d);
    assert!(!env.scheduler.action(f).is_on_optimization());
    assert_eq!(env.scheduler.monitoring_data()["planned_actions"], 0);
}

#[test]
fn test_monitoring_snapshot() {
    let mut env = TestEnv::new();
    let core = env.register_simple_core("c", 1);
    env.add_worker("w1", 4);
    let (_, outcome) = env.submit(ActionSubmit::new(core));
    assert_scheduled(outcome);

    let data = env.scheduler.monitoring_data();
    assert_eq!(data["registered_cores"], 1);
    assert_eq!(data["workers"].as_array().unwrap().len(), 1);
    assert_eq!(data["workers"][0]["name"], "w1");
    assert_eq!(data["workers"][0]["available"]["cpus"], 3);
    assert_eq!(data["planned_actions"], 0);
    assert_eq!(data["total_actions"], 1);
}
