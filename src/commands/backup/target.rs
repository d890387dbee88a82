use std::collections::HashMap;

use anyhow::{Result, bail};
use tracing as log;

use crate::{config::VmPlan, disk::DiskAddress, prism::VmDescriptor};

#[derive(Debug, Clone)]
pub struct VirtualMachineBackupTarget {
    pub name: String,
    pub disks: Vec<DiskAddress>,
    pub vm: Option<VmDescriptor>,
    /// Sum of the live sizes of the selected disks, in bytes.
    pub estimated_size: u64,
}

impl VirtualMachineBackupTarget {
    pub fn new(plan: &VmPlan) -> Self {
        Self {
            name: plan.name.clone(),
            disks: plan.disks.clone(),
            vm: None,
            estimated_size: 0,
        }
    }

    pub fn attach(&mut self, vm: VmDescriptor) {
        self.estimated_size = 0;
        for addr in &self.disks {
            match vm.disk(addr) {
                Some(d) if d.is_cdrom => {
                    log::warn!("[plan] {}: {} is a CD-ROM slot", self.name, addr);
                }
                Some(d) if d.is_empty => {
                    log::warn!("[plan] {}: {} has no backing disk", self.name, addr);
                }
                Some(d) => self.estimated_size += d.vm_disk_size.unwrap_or(0),
                None => {
                    log::warn!("[plan] {}: no disk at {} on the live VM", self.name, addr);
                }
            }
        }
        self.vm = Some(vm);
    }

    #[inline]
    pub fn uuid(&self) -> Option<&str> {
        self.vm.as_ref().map(|v| v.uuid.as_str())
    }
}

/// Matches every planned VM to exactly one VM on the cluster, by name.
pub fn resolve_targets(
    plan: &[VmPlan],
    vms: &[VmDescriptor],
) -> Result<Vec<VirtualMachineBackupTarget>> {
    let mut by_name: HashMap<&str, Vec<&VmDescriptor>> = HashMap::new();
    for vm in vms {
        by_name.entry(vm.name()).or_default().push(vm);
    }

    let mut out = Vec::with_capacity(plan.len());
    for p in plan {
        let found = by_name.get(p.name.as_str()).map(Vec::as_slice).unwrap_or(&[]);
        let vm = match found {
            [vm] => *vm,
            [] => bail!("VM '{}' not found on the cluster", p.name),
            many => bail!(
                "VM name '{}' is ambiguous: {} VMs share it ({})",
                p.name,
                many.len(),
                many.iter()
                    .map(|v| v.uuid.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut target = VirtualMachineBackupTarget::new(p);
        target.attach(vm.clone());
        out.push(target);
    }
    Ok(out)
}
