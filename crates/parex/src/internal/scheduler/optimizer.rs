use std::cmp::Reverse;
use std::collections::BinaryHeap;

use priority_queue::PriorityQueue;
use smallvec::SmallVec;

use crate::internal::common::Map;
use crate::internal::common::resources::ResourceDescription;
use crate::internal::scheduler::gap::Gap;
use crate::internal::scheduler::score::Score;
use crate::{ActionId, Priority};

/// An action currently holding resources on the worker; it yields an `End`
/// event at its expected completion time.
#[derive(Debug, Clone)]
pub struct RunningSlot {
    pub action: ActionId,
    pub expected_end: u64,
    pub requirements: ResourceDescription,
}

/// A not-yet-started action considered for reordering on this worker.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub action: ActionId,
    pub priority: Priority,
    pub requirements: ResourceDescription,
    /// Profile estimate of the execution duration.
    pub estimate: u64,
    /// Data predecessors that are part of this simulation (running here or
    /// also pending here). Predecessors outside the window are folded into
    /// `data_ready`.
    pub predecessors: SmallVec<[ActionId; 2]>,
    /// Earliest start imposed by predecessors outside the window.
    pub data_ready: u64,
}

/// Revised expected timing for one action, plus the simulation-only ordering
/// edges produced by gap packing. These are not data dependencies.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub action: ActionId,
    pub expected_start: u64,
    pub expected_end: u64,
    pub depends_on: Vec<ActionId>,
}

/// Output of one optimization pass: entries in placement (rescheduled) order.
/// The plan never dispatches anything; the task scheduler consults it to
/// decide which pending action to retry next.
#[derive(Debug, Default)]
pub struct OptimizedPlan {
    pub entries: Vec<PlanEntry>,
}

impl OptimizedPlan {
    pub fn entry(&self, action: ActionId) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.action == action)
    }

    pub fn order(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.entries.iter().map(|e| e.action)
    }
}

/// Event-driven lookahead over per-worker idle-time gaps. Reorders
/// not-yet-started actions to pack the worker's capacity more tightly,
/// first-fit by priority.
pub struct ScheduleOptimizer;

impl ScheduleOptimizer {
    pub fn optimize(
        now: u64,
        available: ResourceDescription,
        running: Vec<RunningSlot>,
        pending: Vec<PendingItem>,
    ) -> OptimizedPlan {
        let mut sim = Simulation::new(now, available, running, pending);
        sim.run();
        OptimizedPlan {
            entries: sim.entries,
        }
    }
}

struct Simulation {
    gaps: Vec<Gap>,
    items: Map<ActionId, PendingItem>,
    running_requirements: Map<ActionId, ResourceDescription>,
    /// Pending items whose in-window predecessors are all placed, ordered by
    /// assignment score.
    selectable: PriorityQueue<ActionId, Score>,
    /// Pending items eligible only at a future instant, keyed by that instant.
    ready: BinaryHeap<Reverse<(u64, ActionId)>>,
    /// Count of unplaced in-window predecessors per pending item.
    waiting: Map<ActionId, u32>,
    dependents: Map<ActionId, Vec<ActionId>>,
    placed_end: Map<ActionId, u64>,
    data_ready: Map<ActionId, u64>,
    /// Expected completion instants of running and placed actions. Starts are
    /// processed inline at claim time, only ends are event-driven.
    end_events: BinaryHeap<Reverse<(u64, ActionId)>>,
    entries: Vec<PlanEntry>,
    now: u64,
}

impl Simulation {
    fn new(
        now: u64,
        available: ResourceDescription,
        running: Vec<RunningSlot>,
        pending: Vec<PendingItem>,
    ) -> Self {
        let mut sim = Simulation {
            gaps: vec![Gap::new(now, u64::MAX, None, available)],
            items: Map::new(),
            running_requirements: Map::new(),
            selectable: PriorityQueue::new(),
            ready: BinaryHeap::new(),
            waiting: Map::new(),
            dependents: Map::new(),
            placed_end: Map::new(),
            data_ready: Map::new(),
            end_events: BinaryHeap::new(),
            entries: Vec::new(),
            now,
        };
        for slot in running {
            sim.placed_end.insert(slot.action, slot.expected_end);
            sim.running_requirements
                .insert(slot.action, slot.requirements);
            sim.end_events.push(Reverse((slot.expected_end, slot.action)));
        }
        let in_window: Vec<ActionId> = pending.iter().map(|p| p.action).collect();
        for item in pending {
            let id = item.action;
            let unplaced = item
                .predecessors
                .iter()
                .filter(|p| !sim.placed_end.contains_key(*p) && in_window.contains(p))
                .count() as u32;
            for pred in &item.predecessors {
                if !sim.placed_end.contains_key(pred) && in_window.contains(pred) {
                    sim.dependents.entry(*pred).or_default().push(id);
                }
            }
            sim.items.insert(id, item);
            if unplaced == 0 {
                sim.resolve_data_ready(id, now);
            } else {
                sim.waiting.insert(id, unplaced);
            }
        }
        sim
    }

    fn run(&mut self) {
        self.claim_runnable(self.now);
        loop {
            if let Some(Reverse((time, action))) = self.end_events.pop() {
                self.process_end(action, time);
                continue;
            }
            // No events left: pull in items that only become time-eligible later
            if let Some(&Reverse((time, _))) = self.ready.peek() {
                self.promote_time_eligible(time);
                self.claim_runnable(time);
                continue;
            }
            // A selectable item whose demand no gap union covers does not fit
            // the worker; place it at its data-ready instant so the plan stays
            // complete.
            if let Some((action, _)) = self.selectable.pop() {
                let item = self.items[&action].clone();
                let start = self.data_ready.get(&action).copied().unwrap_or(self.now);
                log::warn!(
                    "Action {action} does not fit the simulated capacity; planned at {start} without packing"
                );
                self.place(action, start, start + item.estimate, Vec::new());
                continue;
            }
            break;
        }
    }

    fn process_end(&mut self, action: ActionId, time: u64) {
        let requirements = self
            .running_requirements
            .get(&action)
            .cloned()
            .or_else(|| self.items.get(&action).map(|i| i.requirements.clone()))
            .expect("End event for unknown action");
        self.gaps
            .push(Gap::new(time, u64::MAX, Some(action), requirements));
        self.promote_time_eligible(time);
        self.claim_runnable(time);
    }

    /// Reserves the action's requirements out of the current gaps, records the
    /// ordering edges towards the gaps' origin actions and backfills the
    /// carved-out earlier slabs.
    fn process_start(&mut self, action: ActionId, time: u64) {
        let item = self.items[&action].clone();
        let mut missing = item.requirements.clone();
        let mut edges = Vec::new();
        let mut carved = Vec::new();
        let mut i = 0;
        while i < self.gaps.len() && !missing.is_dynamic_useless() {
            if self.gaps[i].initial_time > time {
                i += 1;
                continue;
            }
            let gap = &mut self.gaps[i];
            let common = ResourceDescription::reduce_common_dynamics(&mut gap.resources, &mut missing);
            if !common.is_zero() {
                if let Some(origin) = gap.origin {
                    edges.push(origin);
                }
                carved.push(Gap::new(
                    gap.initial_time,
                    time,
                    gap.origin,
                    ResourceDescription::new(common),
                ));
            }
            if gap.resources.is_dynamic_useless() {
                self.gaps.remove(i);
            } else {
                i += 1;
            }
        }
        let end = time + item.estimate;
        self.place(action, time, end, edges);
        self.end_events.push(Reverse((end, action)));
        for gap in carved {
            // Zero-width slabs are instantaneous, already-fully-reserved
            // slots: the edge above is all that remains of them.
            if !gap.is_zero_width() {
                self.fill_gap(gap);
            }
        }
    }

    /// First-fit backfill of a bounded slab, recursively splitting it into
    /// before/during/after sub-gaps as actions are packed in.
    fn fill_gap(&mut self, gap: Gap) {
        if gap.is_zero_width() || gap.resources.is_dynamic_useless() {
            return;
        }
        let Some(candidate) = self.poll_action_for_gap(&gap) else {
            return;
        };
        let item = self.items[&candidate].clone();
        let data_ready = self.data_ready.get(&candidate).copied().unwrap_or(self.now);
        let start = data_ready.max(gap.initial_time);

        if start > gap.initial_time {
            self.fill_gap(Gap::new(
                gap.initial_time,
                start,
                gap.origin,
                gap.resources.clone(),
            ));
        }

        // Capacity of the slab not taken by the candidate can still host
        // concurrent actions.
        let mut leftover = gap.resources.clone();
        let mut taken = item.requirements.clone();
        ResourceDescription::reduce_common_dynamics(&mut leftover, &mut taken);

        let end = start + item.estimate;
        let mut edges = Vec::new();
        if let Some(origin) = gap.origin {
            edges.push(origin);
        }
        self.place(candidate, start, end, edges);

        if !leftover.is_dynamic_useless() {
            self.fill_gap(Gap::new(start, gap.end_time, gap.origin, leftover));
        }
        if end < gap.end_time {
            self.fill_gap(Gap::new(
                end,
                gap.end_time,
                Some(candidate),
                item.requirements.clone(),
            ));
        }
    }

    /// Highest-priority selectable action that fits the slab in both time and
    /// resources. The slab alone must host the full requirement.
    fn poll_action_for_gap(&mut self, gap: &Gap) -> Option<ActionId> {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some((action, score)) = self.selectable.pop() {
            let item = &self.items[&action];
            let data_ready = self.data_ready.get(&action).copied().unwrap_or(self.now);
            let start = data_ready.max(gap.initial_time);
            let fits_time = data_ready <= gap.end_time
                && start.saturating_add(item.estimate) <= gap.end_time;
            let fits_resources = gap.resources.contains_dynamic(&item.requirements);
            if fits_time && fits_resources {
                found = Some(action);
                break;
            }
            skipped.push((action, score));
        }
        for (action, score) in skipped {
            self.selectable.push(action, score);
        }
        found
    }

    /// Claims the top selectable actions whose demand the current gaps can
    /// cover, in priority order, and starts them. Stops at the first action
    /// that does not fit; lower-priority actions only get in through gap
    /// backfill.
    fn claim_runnable(&mut self, time: u64) {
        loop {
            let Some((&action, _)) = self.selectable.peek() else {
                return;
            };
            let item = &self.items[&action];
            let mut missing = item.requirements.clone();
            for gap in &self.gaps {
                if gap.initial_time > time {
                    continue;
                }
                let mut residue = gap.resources.clone();
                ResourceDescription::reduce_common_dynamics(&mut residue, &mut missing);
                if missing.is_dynamic_useless() {
                    break;
                }
            }
            if !missing.is_dynamic_useless() {
                return;
            }
            // Entries only enter `selectable` once their data-ready instant
            // has been reached, so the start is now.
            debug_assert!(self.data_ready.get(&action).copied().unwrap_or(self.now) <= time);
            self.selectable.pop();
            // Consume the gaps right away so the next claim sees the
            // reduced residues
            self.process_start(action, time);
        }
    }

    fn place(&mut self, action: ActionId, start: u64, end: u64, depends_on: Vec<ActionId>) {
        self.entries.push(PlanEntry {
            action,
            expected_start: start,
            expected_end: end,
            depends_on,
        });
        self.placed_end.insert(action, end);
        self.release_dependents(action, start);
    }

    fn release_dependents(&mut self, action: ActionId, time: u64) {
        let Some(dependents) = self.dependents.remove(&action) else {
            return;
        };
        for dependent in dependents {
            let count = self
                .waiting
                .get_mut(&dependent)
                .expect("dependent without waiting count");
            *count -= 1;
            if *count == 0 {
                self.waiting.remove(&dependent);
                self.resolve_data_ready(dependent, time);
            }
        }
    }

    /// All in-window predecessors placed: the earliest start is the max of
    /// their expected ends and the externally imposed data-ready time.
    fn resolve_data_ready(&mut self, action: ActionId, time: u64) {
        let item = &self.items[&action];
        let mut data_ready = item.data_ready;
        for pred in &item.predecessors {
            if let Some(&end) = self.placed_end.get(pred) {
                data_ready = data_ready.max(end);
            }
        }
        let score = Score::new(
            item.priority,
            0,
            data_ready as i64,
            item.estimate as i64,
        );
        self.data_ready.insert(action, data_ready);
        if data_ready <= time {
            self.selectable.push(action, score);
        } else {
            self.ready.push(Reverse((data_ready, action)));
        }
    }

    fn promote_time_eligible(&mut self, time: u64) {
        while let Some(&Reverse((ready_at, action))) = self.ready.peek() {
            if ready_at > time {
                return;
            }
            self.ready.pop();
            let item = &self.items[&action];
            let score = Score::new(item.priority, 0, ready_at as i64, item.estimate as i64);
            self.selectable.push(action, score);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn cpus(n: u32) -> ResourceDescription {
        ResourceDescription::simple(n)
    }

    fn pending(id: u32, priority: i32, n_cpus: u32, estimate: u64) -> PendingItem {
        PendingItem {
            action: ActionId::new(id),
            priority,
            requirements: cpus(n_cpus),
            estimate,
            predecessors: smallvec![],
            data_ready: 0,
        }
    }

    fn running(id: u32, n_cpus: u32, expected_end: u64) -> RunningSlot {
        RunningSlot {
            action: ActionId::new(id),
            expected_end,
            requirements: cpus(n_cpus),
        }
    }

    #[test]
    fn test_independent_actions_run_concurrently() {
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(4),
            vec![],
            vec![pending(1, 0, 2, 100), pending(2, 0, 2, 100)],
        );
        assert_eq!(plan.entries.len(), 2);
        for entry in &plan.entries {
            assert_eq!(entry.expected_start, 0);
            assert_eq!(entry.expected_end, 100);
        }
    }

    #[test]
    fn test_waits_for_running_action() {
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(0),
            vec![running(1, 4, 100)],
            vec![pending(2, 0, 2, 50), pending(3, 0, 2, 50)],
        );
        let b = plan.entry(ActionId::new(2)).unwrap();
        let c = plan.entry(ActionId::new(3)).unwrap();
        assert_eq!(b.expected_start, 100);
        assert_eq!(c.expected_start, 100);
        assert_eq!(b.expected_end, 150);
        assert!(b.depends_on.contains(&ActionId::new(1)));
    }

    #[test]
    fn test_backfill_fills_gap_before_wide_action() {
        // 4-CPU worker, 2 CPUs busy until t=100. The wide high-priority
        // action must wait for full capacity; the narrow low-priority one is
        // backfilled into the idle half before it.
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(2),
            vec![running(1, 2, 100)],
            vec![pending(2, 10, 4, 50), pending(3, 0, 2, 50)],
        );
        let wide = plan.entry(ActionId::new(2)).unwrap();
        let narrow = plan.entry(ActionId::new(3)).unwrap();
        assert_eq!(wide.expected_start, 100);
        assert_eq!(wide.expected_end, 150);
        assert!(wide.depends_on.contains(&ActionId::new(1)));
        assert_eq!(narrow.expected_start, 0);
        assert_eq!(narrow.expected_end, 50);
    }

    #[test]
    fn test_zero_width_gap_only_records_edge() {
        // The successor consumes the freed capacity at the very instant it
        // appears; the carved slab is zero-width and must not be filled.
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(0),
            vec![running(1, 2, 100)],
            vec![pending(2, 0, 2, 30)],
        );
        let entry = plan.entry(ActionId::new(2)).unwrap();
        assert_eq!(entry.expected_start, 100);
        assert_eq!(entry.expected_end, 130);
        assert_eq!(entry.depends_on, vec![ActionId::new(1)]);
    }

    #[test]
    fn test_in_window_dependency_orders_actions() {
        let mut successor = pending(2, 0, 2, 50);
        successor.predecessors = smallvec![ActionId::new(1)];
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(4),
            vec![],
            vec![pending(1, 0, 2, 80), successor],
        );
        let first = plan.entry(ActionId::new(1)).unwrap();
        let second = plan.entry(ActionId::new(2)).unwrap();
        assert_eq!(first.expected_start, 0);
        assert_eq!(second.expected_start, 80);
        assert_eq!(second.expected_end, 130);
    }

    #[test]
    fn test_busy_worker_is_never_double_booked() {
        // 2-CPU worker fully taken until t=100. The dependent of the
        // running action and an independent action must be serialized
        // after it, never stacked onto capacity that is already spoken for.
        let mut dependent = pending(2, 0, 2, 50);
        dependent.predecessors = smallvec![ActionId::new(1)];
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(0),
            vec![running(1, 2, 100)],
            vec![dependent, pending(3, 0, 2, 50)],
        );
        let a = plan.entry(ActionId::new(2)).unwrap();
        let b = plan.entry(ActionId::new(3)).unwrap();
        assert!(a.expected_start >= 100);
        assert!(b.expected_start >= 100);
        assert!(
            a.expected_start >= b.expected_end || b.expected_start >= a.expected_end,
            "planned intervals overlap: {a:?} vs {b:?}"
        );
    }

    #[test]
    fn test_delayed_input_defers_start() {
        // Input produced outside the window arrives at t=40; the worker is
        // idle the whole time but the action must not start earlier.
        let mut item = pending(1, 0, 2, 60);
        item.data_ready = 40;
        let plan = ScheduleOptimizer::optimize(0, cpus(2), vec![], vec![item]);
        let entry = plan.entry(ActionId::new(1)).unwrap();
        assert_eq!(entry.expected_start, 40);
        assert_eq!(entry.expected_end, 100);
    }

    #[test]
    fn test_plan_order_prefers_priority() {
        let plan = ScheduleOptimizer::optimize(
            0,
            cpus(2),
            vec![],
            vec![pending(1, 1, 2, 50), pending(2, 9, 2, 50)],
        );
        let order: Vec<ActionId> = plan.order().collect();
        assert_eq!(order[0], ActionId::new(2));
        assert_eq!(plan.entry(ActionId::new(1)).unwrap().expected_start, 50);
    }
}
