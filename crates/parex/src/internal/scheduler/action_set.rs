use priority_queue::PriorityQueue;

use crate::internal::common::Map;
use crate::internal::scheduler::action::ActionMap;
use crate::internal::scheduler::score::Score;
use crate::{ActionId, CoreId};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
enum Bucket {
    NoCore,
    Core(CoreId),
}

impl Bucket {
    fn from_core(core: Option<CoreId>) -> Self {
        match core {
            Some(core) => Bucket::Core(core),
            None => Bucket::NoCore,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
struct Entry {
    action: ActionId,
    epoch: u32,
}

/// Composite priority queue over pending actions: one sub-heap per core id
/// plus a no-core bucket, with a top-level heap holding only the current head
/// of each sub-heap. `peek`/`poll` cost `O(log C)` amortized in the number of
/// distinct cores with pending actions, not in the number of actions.
///
/// Entries carry the epoch of the action at insertion time; entries whose
/// epoch no longer matches (the action was rescheduled, cancelled or taken)
/// are discarded transparently.
#[derive(Debug, Default)]
pub struct PriorityActionSet {
    buckets: Map<Bucket, PriorityQueue<Entry, Score>>,
    heads: PriorityQueue<Bucket, Score>,
}

impl PriorityActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: ActionId, epoch: u32, core: Option<CoreId>, score: Score) {
        let bucket = Bucket::from_core(core);
        let queue = self.buckets.entry(bucket).or_default();
        queue.push(Entry { action, epoch }, score);
        if let Some((_, head_score)) = queue.peek() {
            // PriorityQueue::push updates the priority of an existing key
            self.heads.push(bucket, *head_score);
        }
    }

    /// The globally highest-priority live action, without removing it.
    pub fn peek(&mut self, actions: &ActionMap) -> Option<(ActionId, Score)> {
        self.peek_entry(actions)
            .map(|(_, action, score)| (action, score))
    }

    pub fn poll(&mut self, actions: &ActionMap) -> Option<(ActionId, Score)> {
        let (bucket, action, score) = self.peek_entry(actions)?;
        let queue = self.buckets.get_mut(&bucket).expect("polled bucket missing");
        queue.pop();
        let next_head = queue.peek().map(|(_, head_score)| *head_score);
        match next_head {
            Some(head_score) => {
                self.heads.push(bucket, head_score);
            }
            None => {
                self.buckets.remove(&bucket);
                self.heads.remove(&bucket);
            }
        }
        Some((action, score))
    }

    fn peek_entry(&mut self, actions: &ActionMap) -> Option<(Bucket, ActionId, Score)> {
        loop {
            let (&bucket, &head_score) = self.heads.peek()?;
            let queue = self
                .buckets
                .get_mut(&bucket)
                .expect("head bucket without sub-heap");
            prune_stale(queue, actions);
            let head = queue.peek().map(|(entry, score)| (entry.action, *score));
            match head {
                None => {
                    self.buckets.remove(&bucket);
                    self.heads.remove(&bucket);
                }
                Some((action, score)) => {
                    if score == head_score {
                        return Some((bucket, action, score));
                    }
                    // The cached head score was stale; fix it and retry
                    self.heads.push(bucket, score);
                }
            }
        }
    }

    /// Upper bound on the number of pending actions; may count stale entries.
    pub fn len(&self) -> usize {
        self.buckets.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|q| q.is_empty())
    }
}

fn prune_stale(queue: &mut PriorityQueue<Entry, Score>, actions: &ActionMap) {
    while let Some((entry, _)) = queue.peek() {
        let live = actions
            .find(entry.action)
            .is_some_and(|a| a.sched.epoch == entry.epoch && a.is_ready());
        if live {
            return;
        }
        queue.pop();
    }
}
