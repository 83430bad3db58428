use derive_more::{Add, AddAssign};
use serde::{Deserialize, Serialize};

use crate::internal::common::resources::{MemoryAmount, ResourceUnits};

/// Quantitative, subtractable capacity counters.
///
/// These are the "dynamic" part of a resource description: they change as tasks
/// reserve and release capacity, unlike the qualitative tags which are fixed at
/// worker registration time.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    Add,
    AddAssign,
)]
pub struct DynamicCounters {
    pub cpus: ResourceUnits,
    pub gpus: ResourceUnits,
    pub fpgas: ResourceUnits,
    pub others: ResourceUnits,
    pub memory: MemoryAmount,
    pub storage: MemoryAmount,
}

impl DynamicCounters {
    pub const ZERO: DynamicCounters = DynamicCounters {
        cpus: 0,
        gpus: 0,
        fpgas: 0,
        others: 0,
        memory: 0,
        storage: 0,
    };

    pub fn simple(cpus: ResourceUnits) -> Self {
        DynamicCounters {
            cpus,
            ..Default::default()
        }
    }

    /// Every counter of `self` is at least the corresponding counter of `other`.
    pub fn contains(&self, other: &DynamicCounters) -> bool {
        self.cpus >= other.cpus
            && self.gpus >= other.gpus
            && self.fpgas >= other.fpgas
            && self.others >= other.others
            && self.memory >= other.memory
            && self.storage >= other.storage
    }

    pub fn is_zero(&self) -> bool {
        *self == DynamicCounters::ZERO
    }

    pub fn saturating_reduce(&mut self, other: &DynamicCounters) {
        self.cpus = self.cpus.saturating_sub(other.cpus);
        self.gpus = self.gpus.saturating_sub(other.gpus);
        self.fpgas = self.fpgas.saturating_sub(other.fpgas);
        self.others = self.others.saturating_sub(other.others);
        self.memory = self.memory.saturating_sub(other.memory);
        self.storage = self.storage.saturating_sub(other.storage);
    }

    pub fn component_min(&self, other: &DynamicCounters) -> DynamicCounters {
        DynamicCounters {
            cpus: self.cpus.min(other.cpus),
            gpus: self.gpus.min(other.gpus),
            fpgas: self.fpgas.min(other.fpgas),
            others: self.others.min(other.others),
            memory: self.memory.min(other.memory),
            storage: self.storage.min(other.storage),
        }
    }

    pub fn multiply(&self, amount: u32) -> DynamicCounters {
        DynamicCounters {
            cpus: self.cpus * amount,
            gpus: self.gpus * amount,
            fpgas: self.fpgas * amount,
            others: self.others * amount,
            memory: self.memory * amount as MemoryAmount,
            storage: self.storage * amount as MemoryAmount,
        }
    }

    pub fn class_units(&self, class: ResourceClass) -> ResourceUnits {
        match class {
            ResourceClass::Cpu => self.cpus,
            ResourceClass::Gpu => self.gpus,
            ResourceClass::Fpga => self.fpgas,
            ResourceClass::Other => self.others,
        }
    }
}

/// Resource classes with independent task-count accounting on a worker.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    Cpu,
    Gpu,
    Fpga,
    Other,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::Cpu,
        ResourceClass::Gpu,
        ResourceClass::Fpga,
        ResourceClass::Other,
    ];
}

/// How many non-overlapping copies of a requirement fit into a description.
///
/// A requirement with all dynamic counters at zero is unconstrained, hence
/// `Unbounded` rather than zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum SimultaneousCapacity {
    Bounded(u32),
    Unbounded,
}

impl SimultaneousCapacity {
    pub fn min(self, other: SimultaneousCapacity) -> SimultaneousCapacity {
        match (self, other) {
            (SimultaneousCapacity::Unbounded, x) | (x, SimultaneousCapacity::Unbounded) => x,
            (SimultaneousCapacity::Bounded(a), SimultaneousCapacity::Bounded(b)) => {
                SimultaneousCapacity::Bounded(a.min(b))
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, SimultaneousCapacity::Bounded(0))
    }

    /// Resolves to a concrete count, bounding the unbounded case by `limit`.
    pub fn bounded_by(self, limit: u32) -> u32 {
        match self {
            SimultaneousCapacity::Bounded(n) => n.min(limit),
            SimultaneousCapacity::Unbounded => limit,
        }
    }
}

/// A quantity of heterogeneous capacity: dynamic counters plus qualitative tags.
///
/// The dynamic counters are mutated in place by the reserve/release protocol;
/// the tags (architecture, operating system, software, host queues) never
/// change after creation. An unassigned tag is compatible with anything.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescription {
    dynamic: DynamicCounters,
    architecture: Option<String>,
    operating_system: Option<String>,
    software: Vec<String>,
    host_queues: Vec<String>,
}

fn tag_compatible(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn tag_superset(mine: &[String], required: &[String]) -> bool {
    required.iter().all(|t| mine.contains(t))
}

impl ResourceDescription {
    pub fn new(dynamic: DynamicCounters) -> Self {
        ResourceDescription {
            dynamic,
            ..Default::default()
        }
    }

    pub fn simple(cpus: ResourceUnits) -> Self {
        Self::new(DynamicCounters::simple(cpus))
    }

    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.architecture = Some(architecture.to_string());
        self
    }

    pub fn with_operating_system(mut self, operating_system: &str) -> Self {
        self.operating_system = Some(operating_system.to_string());
        self
    }

    pub fn with_software<T: ToString>(mut self, software: impl IntoIterator<Item = T>) -> Self {
        self.software = software.into_iter().map(|s| s.to_string()).collect();
        self.software.sort_unstable();
        self.software.dedup();
        self
    }

    pub fn with_host_queues<T: ToString>(mut self, queues: impl IntoIterator<Item = T>) -> Self {
        self.host_queues = queues.into_iter().map(|s| s.to_string()).collect();
        self.host_queues.sort_unstable();
        self.host_queues.dedup();
        self
    }

    #[inline]
    pub fn dynamic(&self) -> &DynamicCounters {
        &self.dynamic
    }

    #[inline]
    pub fn cpus(&self) -> ResourceUnits {
        self.dynamic.cpus
    }

    pub fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    /// Adds the dynamic counters of `other` to `self`. Tags are not touched.
    pub fn increase(&mut self, other: &ResourceDescription) {
        self.dynamic += other.dynamic;
    }

    /// Subtracts the dynamic counters of `other`, clamping at zero.
    pub fn reduce(&mut self, other: &ResourceDescription) {
        self.dynamic.saturating_reduce(&other.dynamic);
    }

    /// Subtracts the dynamic counters of `other`; over-subtraction is an error
    /// and leaves `self` untouched.
    pub fn strict_reduce(&mut self, other: &ResourceDescription) -> crate::Result<()> {
        if !self.dynamic.contains(&other.dynamic) {
            return Err(crate::Error::ResourceError(format!(
                "Cannot reduce {:?} by {:?}",
                self.dynamic, other.dynamic
            )));
        }
        self.dynamic.saturating_reduce(&other.dynamic);
        Ok(())
    }

    /// Is `other`'s dynamic demand a subset of this description?
    pub fn contains_dynamic(&self, other: &ResourceDescription) -> bool {
        self.dynamic.contains(&other.dynamic)
    }

    /// Full containment: tag compatibility plus dynamic containment.
    pub fn contains(&self, other: &ResourceDescription) -> bool {
        tag_compatible(&self.architecture, &other.architecture)
            && tag_compatible(&self.operating_system, &other.operating_system)
            && tag_superset(&self.software, &other.software)
            && tag_superset(&self.host_queues, &other.host_queues)
            && self.contains_dynamic(other)
    }

    /// All dynamic counters are zero; the description is spent.
    pub fn is_dynamic_useless(&self) -> bool {
        self.dynamic.is_zero()
    }

    pub fn uses_class(&self, class: ResourceClass) -> bool {
        self.dynamic.class_units(class) > 0
    }

    /// Subtracts `min(a[d], b[d])` componentwise from both descriptions and
    /// returns the overlap. This is how a gap's residual capacity and a pending
    /// requirement consume each other without either going negative.
    pub fn reduce_common_dynamics(
        a: &mut ResourceDescription,
        b: &mut ResourceDescription,
    ) -> DynamicCounters {
        let common = a.dynamic.component_min(&b.dynamic);
        a.dynamic.saturating_reduce(&common);
        b.dynamic.saturating_reduce(&common);
        common
    }

    /// The largest `k` such that `k` non-overlapping copies of `requirement`
    /// fit inside this description. Zero-requirement dimensions do not
    /// constrain the result.
    pub fn can_host_simultaneously(&self, requirement: &ResourceDescription) -> SimultaneousCapacity {
        let mine = &self.dynamic;
        let req = &requirement.dynamic;
        let mut capacity = SimultaneousCapacity::Unbounded;
        if req.cpus > 0 {
            capacity = capacity.min(SimultaneousCapacity::Bounded(mine.cpus / req.cpus));
        }
        if req.gpus > 0 {
            capacity = capacity.min(SimultaneousCapacity::Bounded(mine.gpus / req.gpus));
        }
        if req.fpgas > 0 {
            capacity = capacity.min(SimultaneousCapacity::Bounded(mine.fpgas / req.fpgas));
        }
        if req.others > 0 {
            capacity = capacity.min(SimultaneousCapacity::Bounded(mine.others / req.others));
        }
        if req.memory > 0 {
            capacity =
                capacity.min(SimultaneousCapacity::Bounded((mine.memory / req.memory) as u32));
        }
        if req.storage > 0 {
            capacity =
                capacity.min(SimultaneousCapacity::Bounded((mine.storage / req.storage) as u32));
        }
        capacity
    }

    /// Scales the dynamic counters by `amount`, keeping the tags.
    pub fn multiply(&self, amount: u32) -> ResourceDescription {
        ResourceDescription {
            dynamic: self.dynamic.multiply(amount),
            architecture: self.architecture.clone(),
            operating_system: self.operating_system.clone(),
            software: self.software.clone(),
            host_queues: self.host_queues.clone(),
        }
    }
}
