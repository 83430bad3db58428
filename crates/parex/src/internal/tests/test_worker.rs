use std::sync::Arc;

use crate::internal::tests::utils::resources::{cpus, cpus_gpus};
use crate::internal::worker::counts::TaskCountLimits;
use crate::internal::worker::reduction::ReductionOutcome;
use crate::internal::worker::{Worker, WorkerLifecycle};
use crate::WorkerId;

fn worker(id: u32, description: crate::resources::ResourceDescription) -> Worker {
    Worker::new(
        WorkerId::new(id),
        &format!("w{id}"),
        description,
        TaskCountLimits::default(),
    )
}

#[test]
fn test_single_cpu_exclusive_run() {
    let w = worker(1, cpus(1));
    let one = cpus(1);

    let first = w.run_task(&one);
    assert!(first.is_some());
    assert!(w.run_task(&one).is_none());

    w.end_task(first.unwrap());
    assert!(w.run_task(&one).is_some());
}

#[test]
fn test_four_slots_fifth_waits() {
    let w = worker(1, cpus(4));
    let one = cpus(1);

    let mut reserved: Vec<_> = (0..4).map(|_| w.run_task(&one).unwrap()).collect();
    assert!(w.run_task(&one).is_none());

    w.end_task(reserved.pop().unwrap());
    assert!(w.run_task(&one).is_some());
}

#[test]
fn test_reduce_idle_completes_synchronously() {
    let w = worker(1, cpus(4));
    let outcome = w.reduce_features(&cpus(2)).unwrap();
    assert!(outcome.is_completed());
    assert_eq!(w.description().cpus(), 2);
    assert_eq!(w.available().cpus(), 2);
    assert_eq!(w.lifecycle(), WorkerLifecycle::Active);
}

#[test]
fn test_reduce_busy_waits_for_releases() {
    let w = Arc::new(worker(1, cpus(4)));
    let one = cpus(1);
    let mut reserved: Vec<_> = (0..4).map(|_| w.run_task(&one).unwrap()).collect();

    let outcome = w.reduce_features(&cpus(2)).unwrap();
    let ReductionOutcome::Pending(handle) = outcome else {
        panic!("reduction should be pending while all CPUs are busy");
    };
    assert_eq!(w.description().cpus(), 2);
    assert_eq!(w.lifecycle(), WorkerLifecycle::Draining);

    let waiter = {
        let handle = handle.clone();
        std::thread::spawn(move || handle.wait())
    };

    w.end_task(reserved.pop().unwrap());
    assert!(!handle.is_complete());
    w.end_task(reserved.pop().unwrap());
    assert!(handle.is_complete());
    waiter.join().unwrap();

    // The two freed CPUs were reclaimed by the reduction; the remaining two
    // are still held by running tasks.
    assert_eq!(w.available().cpus(), 0);
    assert_eq!(w.lifecycle(), WorkerLifecycle::Active);

    w.end_task(reserved.pop().unwrap());
    w.end_task(reserved.pop().unwrap());
    assert_eq!(w.available().cpus(), 2);
    assert_eq!(w.description().cpus(), 2);
}

#[test]
fn test_run_end_round_trip_restores_available() {
    let w = worker(1, cpus_gpus(8, 2));
    let before = w.available();

    let reserved = w.run_task(&cpus_gpus(3, 1)).unwrap();
    assert_ne!(w.available().dynamic(), before.dynamic());
    w.end_task(reserved);
    assert_eq!(w.available().dynamic(), before.dynamic());
}

#[test]
fn test_reservation_conservation() {
    let w = worker(1, cpus_gpus(6, 2));
    let total = *w.description().dynamic();
    let mut reserved = Vec::new();

    for consumption in [cpus(2), cpus_gpus(1, 1), cpus(3)] {
        if let Some(handle) = w.run_task(&consumption) {
            reserved.push(handle);
        }
        let held = reserved
            .iter()
            .fold(crate::resources::DynamicCounters::ZERO, |acc, r| {
                acc + *r.consumption().dynamic()
            });
        assert_eq!(held + *w.available().dynamic(), total);
    }
    assert_eq!(reserved.len(), 3);
    while let Some(handle) = reserved.pop() {
        w.end_task(handle);
    }
    assert_eq!(*w.available().dynamic(), total);
}

#[test]
fn test_full_drain_allows_stop() {
    let w = worker(1, cpus(4));
    let description = w.description();
    assert!(w.reduce_features(&description).unwrap().is_completed());
    assert!(w.should_be_stopped());
    w.mark_removed();
    assert_eq!(w.lifecycle(), WorkerLifecycle::Removed);
}

#[test]
#[should_panic(expected = "Reserving on removed worker")]
fn test_reserve_on_removed_worker_panics() {
    let w = worker(1, cpus(2));
    let description = w.description();
    w.reduce_features(&description).unwrap();
    w.mark_removed();
    let _ = w.reserve_resource(&cpus(1));
}
