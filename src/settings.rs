use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MemorySize;
use crate::qemu::QemuVirtualMachine;
use crate::vm::VmSpecs;

/// Root of the per-instance settings namespace: keys have the shape
/// `local.<instance>.<cpus|memory|disk>`.
pub const SETTINGS_ROOT: &str = "local";

const CPUS_SUFFIX: &str = "cpus";
const MEM_SUFFIX: &str = "memory";
const DISK_SUFFIX: &str = "disk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Property {
    Cpus,
    Memory,
    Disk,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Obtain,
    Modify,
}

fn operation_msg(operation: Operation) -> &'static str {
    match operation {
        Operation::Obtain => "Cannot obtain instance settings",
        Operation::Modify => "Cannot update instance settings",
    }
}

fn settings_error(operation: Operation, instance: &str, reason: &str) -> Error {
    Error::InstanceSettings {
        operation: operation_msg(operation).to_string(),
        instance: instance.to_string(),
        reason: reason.to_string(),
    }
}

/// Validates and applies live resizes of CPU, memory and disk on stopped
/// instances, through the shared daemon-side registries.
pub struct InstanceSettingsHandler {
    specs: Arc<DashMap<String, VmSpecs>>,
    instances: Arc<DashMap<String, Arc<QemuVirtualMachine>>>,
    deleted_instances: Arc<DashSet<String>>,
    preparing_instances: Arc<DashSet<String>>,
    instance_persister: Box<dyn Fn() + Send + Sync>,
}

impl InstanceSettingsHandler {
    pub fn new(
        specs: Arc<DashMap<String, VmSpecs>>,
        instances: Arc<DashMap<String, Arc<QemuVirtualMachine>>>,
        deleted_instances: Arc<DashSet<String>>,
        preparing_instances: Arc<DashSet<String>>,
        instance_persister: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            specs,
            instances,
            deleted_instances,
            preparing_instances,
            instance_persister: Box::new(instance_persister),
        }
    }

    /// The handled key templates; actual instance names would bloat help
    /// output, so a placeholder stands in.
    pub fn keys(&self) -> Vec<String> {
        [CPUS_SUFFIX, MEM_SUFFIX, DISK_SUFFIX]
            .iter()
            .map(|suffix| format!("{}.<instance-name>.{}", SETTINGS_ROOT, suffix))
            .collect()
    }

    /// Reads are unrestricted by instance state.
    pub fn get(&self, key: &str) -> Result<String> {
        let (instance, property) = parse_key(key)?;
        let spec = self
            .specs
            .get(&instance)
            .ok_or_else(|| self.missing_instance(Operation::Obtain, &instance))?;
        Ok(match property {
            Property::Cpus => spec.num_cores.to_string(),
            Property::Memory => format!("{} bytes", spec.mem_size.in_bytes()),
            Property::Disk => format!("{} bytes", spec.disk_space.in_bytes()),
        })
    }

    /// Apply a resize. The instance must exist, be fully prepared and be
    /// stopped; cpus, memory and disk only ever grow.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let (instance, property) = parse_key(key)?;

        if self.preparing_instances.contains(&instance) {
            return Err(settings_error(
                Operation::Modify,
                &instance,
                "Instance is being prepared",
            ));
        }

        let machine = self
            .instances
            .get(&instance)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| self.missing_instance(Operation::Modify, &instance))?;

        if !machine.current_state().is_stopped() {
            return Err(settings_error(
                Operation::Modify,
                &instance,
                "Instance must be stopped for modification",
            ));
        }

        let mut spec = self
            .specs
            .get_mut(&instance)
            .ok_or_else(|| self.missing_instance(Operation::Modify, &instance))?;

        debug!(
            target: "qemuctl",
            "settings: applying {}={} to instance {}",
            key,
            value,
            instance
        );
        match property {
            Property::Cpus => update_cpus(key, value, &machine, &mut spec)?,
            Property::Memory => {
                let size = parse_size(key, value)?;
                if size < spec.mem_size {
                    return Err(invalid_setting(key, value, "Memory can only be expanded"));
                } else if size > spec.mem_size {
                    machine.resize_memory(size)?;
                    spec.mem_size = size;
                }
            }
            Property::Disk => {
                let size = parse_size(key, value)?;
                if size < spec.disk_space {
                    return Err(invalid_setting(key, value, "Disk can only be expanded"));
                } else if size > spec.disk_space {
                    machine.resize_disk(size)?;
                    spec.disk_space = size;
                }
            }
        }
        drop(spec);

        (self.instance_persister)();
        Ok(())
    }

    fn missing_instance(&self, operation: Operation, instance: &str) -> Error {
        let reason = if self.deleted_instances.contains(instance) {
            "Instance is deleted"
        } else {
            "No such instance"
        };
        settings_error(operation, instance, reason)
    }
}

fn invalid_setting(key: &str, value: &str, reason: &str) -> Error {
    Error::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_key(key: &str) -> Result<(String, Property)> {
    let unrecognized = || Error::InvalidSetting {
        key: key.to_string(),
        value: String::new(),
        reason: "not a recognized instance setting".to_string(),
    };

    let rest = key
        .strip_prefix(SETTINGS_ROOT)
        .and_then(|rest| rest.strip_prefix('.'))
        .ok_or_else(unrecognized)?;
    let (instance, suffix) = rest.rsplit_once('.').ok_or_else(unrecognized)?;
    if instance.is_empty() {
        return Err(unrecognized());
    }
    let property = match suffix {
        CPUS_SUFFIX => Property::Cpus,
        MEM_SUFFIX => Property::Memory,
        DISK_SUFFIX => Property::Disk,
        _ => return Err(unrecognized()),
    };
    Ok((instance.to_string(), property))
}

fn parse_size(key: &str, value: &str) -> Result<MemorySize> {
    value
        .parse::<MemorySize>()
        .map_err(|err| invalid_setting(key, value, &err.to_string()))
}

fn update_cpus(
    key: &str,
    value: &str,
    machine: &QemuVirtualMachine,
    spec: &mut VmSpecs,
) -> Result<()> {
    let cpus: u32 = match value.trim().parse() {
        Ok(cpus) if cpus >= 1 => cpus,
        _ => return Err(invalid_setting(key, value, "Need a positive decimal integer")),
    };
    if cpus < spec.num_cores {
        return Err(invalid_setting(
            key,
            value,
            "The number of cores can only be increased",
        ));
    } else if cpus > spec.num_cores {
        machine.update_cpus(cpus)?;
        spec.num_cores = cpus;
    }
    Ok(())
}
