use crate::internal::common::resources::{DynamicCounters, ResourceDescription};

pub fn cpus(cpus: u32) -> ResourceDescription {
    ResourceDescription::simple(cpus)
}

pub fn cpus_gpus(cpus: u32, gpus: u32) -> ResourceDescription {
    ResourceDescription::new(DynamicCounters {
        cpus,
        gpus,
        ..Default::default()
    })
}
