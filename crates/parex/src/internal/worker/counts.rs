use serde::{Deserialize, Serialize};

use crate::internal::common::resources::{ResourceClass, ResourceDescription};

/// Maximum number of simultaneous tasks per resource class on one worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskCountLimits {
    pub cpu: u32,
    pub gpu: u32,
    pub fpga: u32,
    pub other: u32,
}

impl Default for TaskCountLimits {
    fn default() -> Self {
        TaskCountLimits {
            cpu: u32::MAX,
            gpu: u32::MAX,
            fpga: u32::MAX,
            other: u32::MAX,
        }
    }
}

impl TaskCountLimits {
    pub fn limit(&self, class: ResourceClass) -> u32 {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Gpu => self.gpu,
            ResourceClass::Fpga => self.fpga,
            ResourceClass::Other => self.other,
        }
    }
}

/// Running-task counters split by resource class. A task counts against a
/// class only when its consumption actually touches that class.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct TaskCounts {
    pub cpu: u32,
    pub gpu: u32,
    pub fpga: u32,
    pub other: u32,
}

impl TaskCounts {
    pub fn used(&self, class: ResourceClass) -> u32 {
        match class {
            ResourceClass::Cpu => self.cpu,
            ResourceClass::Gpu => self.gpu,
            ResourceClass::Fpga => self.fpga,
            ResourceClass::Other => self.other,
        }
    }

    fn used_mut(&mut self, class: ResourceClass) -> &mut u32 {
        match class {
            ResourceClass::Cpu => &mut self.cpu,
            ResourceClass::Gpu => &mut self.gpu,
            ResourceClass::Fpga => &mut self.fpga,
            ResourceClass::Other => &mut self.other,
        }
    }

    /// Every class touched by `consumption` still has a free slot.
    pub fn can_accept(&self, limits: &TaskCountLimits, consumption: &ResourceDescription) -> bool {
        ResourceClass::ALL
            .iter()
            .all(|&class| !consumption.uses_class(class) || self.used(class) < limits.limit(class))
    }

    pub fn on_start(&mut self, consumption: &ResourceDescription) {
        for class in ResourceClass::ALL {
            if consumption.uses_class(class) {
                *self.used_mut(class) += 1;
            }
        }
    }

    pub fn on_end(&mut self, consumption: &ResourceDescription) {
        for class in ResourceClass::ALL {
            if consumption.uses_class(class) {
                let used = self.used_mut(class);
                assert!(*used > 0, "Task count of {class:?} would become negative");
                *used -= 1;
            }
        }
    }

    pub fn total(&self) -> u32 {
        self.cpu + self.gpu + self.fpga + self.other
    }
}
