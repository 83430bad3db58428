use std::cmp::Ordering;

use crate::Priority;
use crate::static_assert_size;

/// Rank of one candidate (worker, implementation) assignment.
///
/// Compared lexicographically: higher action priority wins; ties are broken by
/// an earlier expected start (`max(resource available, data available)`), then
/// by a shorter implementation execution estimate. The comparison is a total
/// order so that scheduling is deterministic given identical inputs.
///
/// `Ord` follows the "bigger is better" convention, so `is_better(other)` is
/// `self > other` and max-heaps order correctly.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Score {
    priority: i64,
    resource_score: i64,
    data_available: i64,
    implementation_score: i64,
}

static_assert_size!(Score, 32);

impl Score {
    pub fn new(
        priority: Priority,
        resource_score: i64,
        data_available: i64,
        implementation_score: i64,
    ) -> Self {
        Score {
            priority: priority as i64,
            resource_score,
            data_available,
            implementation_score,
        }
    }

    /// Earliest instant at which both the resource and the input data are
    /// expected to be available.
    pub fn expected_start(&self) -> i64 {
        self.resource_score.max(self.data_available)
    }

    pub fn implementation_score(&self) -> i64 {
        self.implementation_score
    }

    pub fn is_better(&self, other: &Score) -> bool {
        self > other
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.expected_start().cmp(&self.expected_start()))
            .then_with(|| other.implementation_score.cmp(&self.implementation_score))
            // Remaining components keep the order consistent with equality
            .then_with(|| other.resource_score.cmp(&self.resource_score))
            .then_with(|| other.data_available.cmp(&self.data_available))
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
