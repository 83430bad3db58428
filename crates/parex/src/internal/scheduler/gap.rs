use crate::ActionId;
use crate::internal::common::resources::ResourceDescription;

/// A time-bounded slab of idle or soon-to-be-idle capacity on one worker,
/// anchored to the action whose completion frees it (`None` for the open
/// gap at the start of a schedule). Gaps only exist transiently inside the
/// lookahead optimizer; they are never persisted.
#[derive(Debug, Clone)]
pub struct Gap {
    pub initial_time: u64,
    pub end_time: u64,
    pub origin: Option<ActionId>,
    pub resources: ResourceDescription,
}

impl Gap {
    pub fn new(
        initial_time: u64,
        end_time: u64,
        origin: Option<ActionId>,
        resources: ResourceDescription,
    ) -> Self {
        Gap {
            initial_time,
            end_time,
            origin,
            resources,
        }
    }

    /// An instantaneous, already-fully-reserved slot: nothing can be packed
    /// into it, only the ordering edge matters.
    pub fn is_zero_width(&self) -> bool {
        self.initial_time == self.end_time
    }

    pub fn width(&self) -> u64 {
        self.end_time - self.initial_time
    }
}
