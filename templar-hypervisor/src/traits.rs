//! Core hypervisor port.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::{PoolStatus, StoragePool, Volume};
use crate::types::*;

/// Privileged hypervisor operations needed for template work.
///
/// Every call blocks until the hypervisor has finished the operation. Calls
/// are never retried by implementations; a failed call surfaces as
/// [`HypervisorError::OperationFailed`](crate::HypervisorError::OperationFailed).
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    // =========================================================================
    // Storage
    // =========================================================================

    /// List storage pools with their backend type strings.
    async fn list_storage(&self) -> Result<Vec<PoolStatus>>;

    /// Resolve a volume to the host path of its file or block device node.
    async fn volume_path(&self, volume: &Volume) -> Result<PathBuf>;

    // =========================================================================
    // VM Lifecycle
    // =========================================================================

    /// Create an empty VM shell with a fixed id.
    async fn create_vm(&self, vm_id: VmId, name: &str, specs: &VmSpecs) -> Result<()>;

    /// Import a local image file into a pool as an unused disk of the VM.
    ///
    /// Returns the volume actually created, with its format detected from the
    /// resulting volume identifier.
    async fn import_disk(&self, vm_id: VmId, image: &Path, pool: &StoragePool) -> Result<Volume>;

    /// Attach `volume` as the primary boot disk, add auxiliary devices and set
    /// the boot order to that disk.
    async fn set_disk_and_boot(&self, vm_id: VmId, volume: &Volume, aux: &[AuxDevice]) -> Result<()>;

    /// Convert a stopped VM into a read-only template. Irreversible.
    async fn convert_to_template(&self, vm_id: VmId) -> Result<()>;

    /// Destroy a VM, purging its disks when `purge` is set.
    async fn destroy_vm(&self, vm_id: VmId, purge: bool) -> Result<()>;

    // =========================================================================
    // Inspection
    // =========================================================================

    /// List all VMs and templates on this host.
    async fn list_vms(&self) -> Result<Vec<VmSummary>>;

    /// Dump the raw key/value configuration of a VM.
    async fn get_vm_config(&self, vm_id: VmId) -> Result<VmConfig>;

    /// Current run state of a VM.
    async fn vm_status(&self, vm_id: VmId) -> Result<VmRunState>;

    // =========================================================================
    // Power & disks
    // =========================================================================

    /// Stop a VM. Graceful stops send an ACPI shutdown and wait up to
    /// `timeout`; forced stops power off immediately.
    async fn stop_vm(&self, vm_id: VmId, graceful: bool, timeout: Duration) -> Result<()>;

    /// Start a VM.
    async fn start_vm(&self, vm_id: VmId) -> Result<()>;

    /// Move a disk to `target_pool`, writing a full independent copy and
    /// dropping the source reference.
    async fn move_disk(&self, vm_id: VmId, disk_key: &str, target_pool: &str) -> Result<()>;
}
