pub mod description;

pub use description::{
    DynamicCounters, ResourceClass, ResourceDescription, SimultaneousCapacity,
};

/// Number of computing units of one resource class (CPU cores, GPU devices, ...).
pub type ResourceUnits = u32;

/// Memory or storage size in MiB.
pub type MemoryAmount = u64;
