//! Linked clone discovery.
//!
//! A linked clone's disks are copy-on-write children of a template's base
//! volume, which shows up in its configuration as a disk value such as
//! `local-lvmthin:base-9000-disk-0/vm-301-disk-0`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use templar_hypervisor::{HypervisorClient, HypervisorError, VmConfig, VmId, VmRunState};

/// A VM whose disks still derive from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedClone {
    pub vm_id: VmId,
    pub name: String,
    pub backing_template: VmId,
    pub run_state: VmRunState,
    /// Disk keys referencing the template's base volume, e.g. `scsi0`
    pub disk_keys: Vec<DiskRef>,
}

/// One disk attribute of a clone that references a base volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskRef {
    pub key: String,
    /// Storage pool holding the disk (the part before `:`)
    pub pool: String,
}

/// True if `value` references `base-<template>-disk-<n>`.
///
/// The match is bounded on both sides, so `base-9000-disk-0` does not match
/// template 900 or template 90001.
pub fn references_base(value: &str, template: VmId) -> bool {
    let needle = format!("base-{}-disk-", template);
    value.match_indices(&needle).any(|(start, _)| {
        let before_ok = value[..start]
            .chars()
            .next_back()
            .map_or(true, |c| c == ':' || c == '/');
        let after_ok = value[start + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit());
        before_ok && after_ok
    })
}

/// Disk attributes of `config` that reference the template's base volumes.
pub fn base_disk_refs(config: &VmConfig, template: VmId) -> Vec<DiskRef> {
    config
        .disks()
        .filter(|(_, value)| references_base(value, template))
        .map(|(key, value)| DiskRef {
            key: key.to_string(),
            pool: value.split(':').next().unwrap_or_default().to_string(),
        })
        .collect()
}

/// Finds the linked clones of a template.
pub struct LinkedCloneResolver {
    client: Arc<dyn HypervisorClient>,
}

impl LinkedCloneResolver {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self { client }
    }

    /// Scan every VM on the host for disks backed by `template`.
    #[instrument(skip(self), fields(template = %template))]
    pub async fn resolve(&self, template: VmId) -> Result<Vec<LinkedClone>, HypervisorError> {
        let vms = self.client.list_vms().await?;
        let mut clones = Vec::new();

        for vm in vms.into_iter().filter(|vm| vm.vm_id != template) {
            let config = self.client.get_vm_config(vm.vm_id).await?;
            let disk_keys = base_disk_refs(&config, template);
            if disk_keys.is_empty() {
                continue;
            }
            debug!(vm_id = %vm.vm_id, disks = disk_keys.len(), "Found linked clone");
            clones.push(LinkedClone {
                vm_id: vm.vm_id,
                name: vm.name,
                backing_template: template,
                run_state: vm.run_state,
                disk_keys,
            });
        }

        if !clones.is_empty() {
            info!(count = clones.len(), "Template has linked clones");
        }
        Ok(clones)
    }
}
