#[macro_use]
pub mod internal;

pub use crate::internal::common::ids::{ActionId, CoreId, ImplementationId, WorkerId};
pub use crate::internal::common::{Map, Set};

// Priority: Bigger number -> Higher priority
pub type Priority = i32;

pub type Error = internal::common::error::SchedulerError;
pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_ACTION_RETRIES: u32 = 3;

pub mod resources {
    pub use crate::internal::common::resources::{
        DynamicCounters, MemoryAmount, ResourceClass, ResourceDescription, ResourceUnits,
        SimultaneousCapacity,
    };
}

pub mod registry {
    pub use crate::internal::registry::{
        CoreRegistry, Implementation, ImplementationDef, ImplementationKind,
    };
}

pub mod worker {
    pub use crate::internal::worker::counts::{TaskCountLimits, TaskCounts};
    pub use crate::internal::worker::reduction::{ReductionOutcome, WaitHandle};
    pub use crate::internal::worker::{ReservedHandle, Worker, WorkerLifecycle};
}

pub mod scheduler {
    pub use crate::internal::scheduler::action::{Action, ActionState, OnFailure};
    pub use crate::internal::scheduler::optimizer::{
        OptimizedPlan, PendingItem, PlanEntry, RunningSlot, ScheduleOptimizer,
    };
    pub use crate::internal::scheduler::score::Score;
    pub use crate::internal::scheduler::{
        ActionFailure, ActionSubmit, Dispatch, ScheduleOutcome, TaskScheduler,
    };
}
