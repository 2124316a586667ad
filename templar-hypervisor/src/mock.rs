//! Mock hypervisor backend for testing and development.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::storage::{PoolStatus, StorageKind, StoragePool, Volume};
use crate::traits::HypervisorClient;
use crate::types::*;

/// Mock hypervisor backend for testing.
///
/// Simulates a Proxmox host in memory: VM configurations, template
/// conversion (disks are renamed to `base-<id>-disk-<n>`), disk imports and
/// moves. Useful for:
/// - Unit and integration testing
/// - Dry runs without a Proxmox host (`--dev`)
///
/// Any operation can be made to fail with [`MockBackend::fail_on`], and every
/// call is recorded in order for assertions.
pub struct MockBackend {
    vms: RwLock<BTreeMap<VmId, MockVm>>,
    storage: RwLock<Vec<PoolStatus>>,
    faults: RwLock<HashSet<(&'static str, Option<VmId>)>>,
    calls: RwLock<Vec<String>>,
    import_format: DiskFormat,
    ignore_graceful_stop: bool,
}

struct MockVm {
    entries: BTreeMap<String, String>,
    run_state: VmRunState,
}

impl MockVm {
    fn name(&self) -> String {
        self.entries.get("name").cloned().unwrap_or_default()
    }

    /// Next free `vm-<id>-disk-<n>` index.
    fn next_disk_index(&self, vm_id: VmId) -> u32 {
        let prefix = format!("vm-{}-disk-", vm_id);
        self.entries
            .values()
            .filter_map(|v| {
                let start = v.find(&prefix)? + prefix.len();
                let digits: String = v[start..].chars().take_while(char::is_ascii_digit).collect();
                digits.parse::<u32>().ok()
            })
            .max()
            .map_or(0, |n| n + 1)
    }

    fn next_unused_slot(&self) -> u32 {
        (0..).find(|n| !self.entries.contains_key(&format!("unused{}", n))).unwrap_or(0)
    }
}

fn lock_poisoned() -> HypervisorError {
    HypervisorError::host_op("mock", "Lock poisoned")
}

impl MockBackend {
    /// Create a mock host with a stock storage layout: `local` (dir) and
    /// `local-lvm` (lvmthin).
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            vms: RwLock::new(BTreeMap::new()),
            storage: RwLock::new(vec![
                Self::pool_status("local", "dir"),
                Self::pool_status("local-lvm", "lvmthin"),
            ]),
            faults: RwLock::new(HashSet::new()),
            calls: RwLock::new(Vec::new()),
            import_format: DiskFormat::Raw,
            ignore_graceful_stop: false,
        }
    }

    /// An active pool row with 100 GiB free.
    pub fn pool_status(name: &str, backend_type: &str) -> PoolStatus {
        PoolStatus {
            name: name.to_string(),
            backend_type: backend_type.to_string(),
            active: true,
            total_bytes: 100 << 30,
            used_bytes: 0,
            available_bytes: 100 << 30,
        }
    }

    /// Replace the storage listing.
    pub fn with_storage(self, pools: Vec<PoolStatus>) -> Self {
        if let Ok(mut storage) = self.storage.write() {
            *storage = pools;
        }
        self
    }

    /// Format of disks created by imports into file-backed pools.
    pub fn with_import_format(mut self, format: DiskFormat) -> Self {
        self.import_format = format;
        self
    }

    /// Simulate guests that ignore ACPI shutdown requests.
    pub fn with_ignored_graceful_stop(mut self) -> Self {
        self.ignore_graceful_stop = true;
        self
    }

    /// Seed a VM with raw configuration entries.
    pub fn insert_vm<'a>(
        &self,
        vm_id: VmId,
        name: &str,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
        run_state: VmRunState,
    ) {
        let mut map: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert("name".to_string(), name.to_string());
        if let Ok(mut vms) = self.vms.write() {
            vms.insert(vm_id, MockVm { entries: map, run_state });
        }
    }

    /// Seed a template whose boot disk is `<pool>:base-<id>-disk-0`.
    pub fn insert_template(&self, vm_id: VmId, name: &str, pool: &str) {
        let disk = format!("{}:base-{}-disk-0,size=2252M", pool, vm_id);
        self.insert_vm(
            vm_id,
            name,
            [("scsi0", disk.as_str()), ("template", "1"), ("boot", "order=scsi0")],
            VmRunState::Stopped,
        );
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: &'static str) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert((op, None));
        }
    }

    /// Make later calls of `op` fail for one VM only.
    pub fn fail_on_vm(&self, op: &'static str, vm_id: VmId) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert((op, Some(vm_id)));
        }
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.write() {
            faults.clear();
        }
    }

    /// Calls made so far, formatted as `op` or `op <vmid>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Current configuration of a VM, if it exists.
    pub fn vm(&self, vm_id: VmId) -> Option<VmConfig> {
        let vms = self.vms.read().ok()?;
        vms.get(&vm_id).map(|vm| VmConfig { entries: vm.entries.clone() })
    }

    /// Set the run state of an existing VM.
    pub fn set_run_state(&self, vm_id: VmId, run_state: VmRunState) {
        if let Ok(mut vms) = self.vms.write() {
            if let Some(vm) = vms.get_mut(&vm_id) {
                vm.run_state = run_state;
            }
        }
    }

    /// Record the call and fail it if a fault was injected.
    fn enter(&self, op: &'static str, vm_id: Option<VmId>) -> Result<()> {
        let entry = match vm_id {
            Some(id) => format!("{} {}", op, id),
            None => op.to_string(),
        };
        self.calls.write().map_err(|_| lock_poisoned())?.push(entry);

        let faults = self.faults.read().map_err(|_| lock_poisoned())?;
        if faults.contains(&(op, None)) || vm_id.is_some_and(|id| faults.contains(&(op, Some(id)))) {
            debug!(op, vm_id = ?vm_id, "Injected failure");
            return Err(HypervisorError::OperationFailed {
                op,
                vm_id,
                cause: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn pool_kind(&self, name: &str) -> Result<StorageKind> {
        let storage = self.storage.read().map_err(|_| lock_poisoned())?;
        let pool = storage.iter().find(|p| p.name == name);
        Ok(match pool.map(|p| p.backend_type.as_str()) {
            Some("dir") => StorageKind::FileBacked,
            Some(_) => StorageKind::BlockDevice,
            None => StorageKind::Unknown,
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for MockBackend {
    async fn list_storage(&self) -> Result<Vec<PoolStatus>> {
        self.enter("list_storage", None)?;
        Ok(self.storage.read().map_err(|_| lock_poisoned())?.clone())
    }

    async fn volume_path(&self, volume: &Volume) -> Result<PathBuf> {
        self.enter("volume_path", Some(volume.vm_id))?;
        let path = match volume.format {
            Some(format) => PathBuf::from(format!(
                "/var/lib/vz/images/{}/{}.{}",
                volume.vm_id,
                volume.disk_name(),
                format
            )),
            None => PathBuf::from(format!("/dev/{}/{}", volume.storage, volume.disk_name())),
        };
        Ok(path)
    }

    #[instrument(skip(self, specs), fields(vm_id = %vm_id, name = %name))]
    async fn create_vm(&self, vm_id: VmId, name: &str, specs: &VmSpecs) -> Result<()> {
        self.enter("create_vm", Some(vm_id))?;
        info!("Creating mock VM");

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        if vms.contains_key(&vm_id) {
            return Err(HypervisorError::op(
                "create_vm",
                vm_id,
                format!("VM {} already exists", vm_id),
            ));
        }

        let mut entries = BTreeMap::new();
        entries.insert("name".to_string(), name.to_string());
        entries.insert("memory".to_string(), specs.memory_mib.to_string());
        entries.insert("cores".to_string(), specs.cores.to_string());
        entries.insert("net0".to_string(), format!("virtio,bridge={}", specs.bridge));
        entries.insert("scsihw".to_string(), specs.scsi_controller.clone());
        entries.insert("ostype".to_string(), specs.os_type.clone());
        vms.insert(vm_id, MockVm { entries, run_state: VmRunState::Stopped });
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, image = %image.display(), pool = %pool.name))]
    async fn import_disk(&self, vm_id: VmId, image: &Path, pool: &StoragePool) -> Result<Volume> {
        self.enter("import_disk", Some(vm_id))?;
        let kind = self.pool_kind(&pool.name)?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        let vm = vms.get_mut(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;

        let index = vm.next_disk_index(vm_id);
        let volume = match kind {
            StorageKind::FileBacked => Volume::file(&pool.name, vm_id, index, self.import_format),
            StorageKind::BlockDevice => Volume::block(&pool.name, vm_id, index),
            StorageKind::Unknown => {
                return Err(HypervisorError::op(
                    "import_disk",
                    vm_id,
                    format!("storage '{}' does not exist", pool.name),
                ))
            }
        };
        let slot = vm.next_unused_slot();
        vm.entries.insert(format!("unused{}", slot), volume.volume_id());

        info!(volume = %volume, "Mock disk imported");
        Ok(volume)
    }

    #[instrument(skip(self, aux), fields(vm_id = %vm_id, volume = %volume))]
    async fn set_disk_and_boot(&self, vm_id: VmId, volume: &Volume, aux: &[AuxDevice]) -> Result<()> {
        self.enter("set_disk_and_boot", Some(vm_id))?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        let vm = vms.get_mut(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;

        let volume_id = volume.volume_id();
        vm.entries.retain(|k, v| !(k.starts_with("unused") && volume_part(v) == volume_id));
        vm.entries.insert("scsi0".to_string(), volume_id);
        for device in aux {
            match device {
                AuxDevice::CloudInit { slot, storage } => {
                    vm.entries.insert(
                        slot.clone(),
                        format!("{}:vm-{}-cloudinit,media=cdrom", storage, vm_id),
                    );
                }
            }
        }
        vm.entries.insert("boot".to_string(), "order=scsi0".to_string());
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn convert_to_template(&self, vm_id: VmId) -> Result<()> {
        self.enter("convert_to_template", Some(vm_id))?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        let vm = vms.get_mut(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;
        if vm.run_state.is_running() {
            return Err(HypervisorError::op("convert_to_template", vm_id, "VM is running"));
        }

        let from = format!("vm-{}-disk-", vm_id);
        let to = format!("base-{}-disk-", vm_id);
        for (key, value) in vm.entries.iter_mut() {
            if is_disk_key(key) {
                *value = value.replace(&from, &to);
            }
        }
        vm.entries.insert("template".to_string(), "1".to_string());
        info!("Mock VM converted to template");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, purge = purge))]
    async fn destroy_vm(&self, vm_id: VmId, purge: bool) -> Result<()> {
        self.enter("destroy_vm", Some(vm_id))?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        if !vms.contains_key(&vm_id) {
            return Err(HypervisorError::VmNotFound(vm_id));
        }

        // Proxmox refuses to drop a base volume still used by a linked clone.
        let base = format!("base-{}-disk-", vm_id);
        let in_use = vms
            .iter()
            .filter(|(id, _)| **id != vm_id)
            .any(|(_, vm)| vm.entries.iter().any(|(k, v)| is_disk_key(k) && v.contains(&base)));
        if in_use {
            return Err(HypervisorError::op(
                "destroy_vm",
                vm_id,
                "base volume is used by linked clones",
            ));
        }

        vms.remove(&vm_id);
        info!("Mock VM destroyed");
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        self.enter("list_vms", None)?;
        let vms = self.vms.read().map_err(|_| lock_poisoned())?;
        Ok(vms
            .iter()
            .map(|(id, vm)| VmSummary {
                vm_id: *id,
                name: vm.name(),
                run_state: vm.run_state,
            })
            .collect())
    }

    async fn get_vm_config(&self, vm_id: VmId) -> Result<VmConfig> {
        self.enter("get_vm_config", Some(vm_id))?;
        let vms = self.vms.read().map_err(|_| lock_poisoned())?;
        let vm = vms.get(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;
        Ok(VmConfig { entries: vm.entries.clone() })
    }

    async fn vm_status(&self, vm_id: VmId) -> Result<VmRunState> {
        self.enter("vm_status", Some(vm_id))?;
        let vms = self.vms.read().map_err(|_| lock_poisoned())?;
        let vm = vms.get(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;
        Ok(vm.run_state)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, graceful = graceful, timeout_secs = timeout.as_secs()))]
    async fn stop_vm(&self, vm_id: VmId, graceful: bool, timeout: Duration) -> Result<()> {
        self.enter("stop_vm", Some(vm_id))?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        let vm = vms.get_mut(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;
        if graceful && self.ignore_graceful_stop {
            debug!("Mock guest ignored shutdown request");
            return Ok(());
        }
        vm.run_state = VmRunState::Stopped;
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn start_vm(&self, vm_id: VmId) -> Result<()> {
        self.enter("start_vm", Some(vm_id))?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        let vm = vms.get_mut(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;
        if vm.run_state.is_running() {
            return Err(HypervisorError::op("start_vm", vm_id, "VM is already running"));
        }
        vm.run_state = VmRunState::Running;
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, disk = %disk_key, target = %target_pool))]
    async fn move_disk(&self, vm_id: VmId, disk_key: &str, target_pool: &str) -> Result<()> {
        self.enter("move_disk", Some(vm_id))?;
        let kind = self.pool_kind(target_pool)?;

        let mut vms = self.vms.write().map_err(|_| lock_poisoned())?;
        let vm = vms.get_mut(&vm_id).ok_or(HypervisorError::VmNotFound(vm_id))?;
        let current = vm
            .entries
            .get(disk_key)
            .cloned()
            .ok_or_else(|| HypervisorError::op("move_disk", vm_id, format!("no disk '{}'", disk_key)))?;

        let index = vm.next_disk_index(vm_id);
        let moved = match kind {
            StorageKind::FileBacked => Volume::file(target_pool, vm_id, index, self.import_format),
            StorageKind::BlockDevice => Volume::block(target_pool, vm_id, index),
            StorageKind::Unknown => {
                return Err(HypervisorError::op(
                    "move_disk",
                    vm_id,
                    format!("storage '{}' does not exist", target_pool),
                ))
            }
        };
        let options = current.split_once(',').map(|(_, o)| o);
        let value = match options {
            Some(options) => format!("{},{}", moved.volume_id(), options),
            None => moved.volume_id(),
        };
        vm.entries.insert(disk_key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_import_and_template() {
        let backend = MockBackend::new().with_import_format(DiskFormat::Qcow2);
        let id = VmId(9000);
        backend.create_vm(id, "ubuntu", &VmSpecs::default()).await.unwrap();

        let pool = StoragePool::new("local", StorageKind::FileBacked);
        let volume = backend.import_disk(id, Path::new("/tmp/u.img"), &pool).await.unwrap();
        assert_eq!(volume.volume_id(), "local:9000/vm-9000-disk-0.qcow2");
        assert_eq!(backend.vm(id).unwrap().unused_disks(), vec!["local:9000/vm-9000-disk-0.qcow2"]);

        backend
            .set_disk_and_boot(id, &volume, &[AuxDevice::cloud_init("local")])
            .await
            .unwrap();
        backend.convert_to_template(id).await.unwrap();

        let config = backend.get_vm_config(id).await.unwrap();
        assert!(config.is_template());
        assert!(config.unused_disks().is_empty());
        assert_eq!(config.get("scsi0"), Some("local:9000/base-9000-disk-0.qcow2"));
    }

    #[tokio::test]
    async fn test_block_import() {
        let backend = MockBackend::new();
        let id = VmId(9001);
        backend.create_vm(id, "debian", &VmSpecs::default()).await.unwrap();

        let pool = StoragePool::new("local-lvm", StorageKind::BlockDevice);
        let volume = backend.import_disk(id, Path::new("/tmp/d.qcow2"), &pool).await.unwrap();
        assert_eq!(volume, Volume::block("local-lvm", id, 0));
        assert_eq!(
            backend.volume_path(&volume).await.unwrap(),
            PathBuf::from("/dev/local-lvm/vm-9001-disk-0")
        );
    }

    #[tokio::test]
    async fn test_fault_injection_and_call_log() {
        let backend = MockBackend::new();
        backend.fail_on_vm("create_vm", VmId(9001));

        backend.create_vm(VmId(9000), "a", &VmSpecs::default()).await.unwrap();
        let err = backend.create_vm(VmId(9001), "b", &VmSpecs::default()).await.unwrap_err();
        assert_eq!(err.operation(), Some("create_vm"));
        assert_eq!(backend.calls(), vec!["create_vm 9000", "create_vm 9001"]);
    }

    #[tokio::test]
    async fn test_destroy_refused_while_clone_uses_base() {
        let backend = MockBackend::new();
        backend.insert_template(VmId(9000), "ubuntu", "local-lvm");
        backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0,size=2252M")],
            VmRunState::Running,
        );

        assert!(backend.destroy_vm(VmId(9000), true).await.is_err());
        assert!(backend.vm(VmId(9000)).is_some());
    }

    #[tokio::test]
    async fn test_ignored_graceful_stop() {
        let backend = MockBackend::new().with_ignored_graceful_stop();
        backend.insert_vm(VmId(301), "web-1", [("boot", "order=scsi0")], VmRunState::Running);

        backend.stop_vm(VmId(301), true, Duration::from_secs(1)).await.unwrap();
        assert!(backend.vm_status(VmId(301)).await.unwrap().is_running());

        backend.stop_vm(VmId(301), false, Duration::from_secs(1)).await.unwrap();
        assert_eq!(backend.vm_status(VmId(301)).await.unwrap(), VmRunState::Stopped);
    }

    #[tokio::test]
    async fn test_move_disk_keeps_options() {
        let backend = MockBackend::new();
        backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0,size=2252M")],
            VmRunState::Stopped,
        );
        backend.move_disk(VmId(301), "scsi0", "local-lvm").await.unwrap();
        assert_eq!(
            backend.vm(VmId(301)).unwrap().get("scsi0"),
            Some("local-lvm:vm-301-disk-1,size=2252M")
        );
    }
}
