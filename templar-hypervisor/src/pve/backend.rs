//! `qm`/`pvesm` implementation of the hypervisor port.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::parse;
use crate::storage::{PoolStatus, StoragePool, Volume};
use crate::traits::HypervisorClient;
use crate::types::*;

use super::{DEFAULT_PVESM, DEFAULT_QM};

/// Hypervisor backend that shells out to the Proxmox VE tools.
pub struct PveBackend {
    /// qm binary path
    qm_path: String,
    /// pvesm binary path
    pvesm_path: String,
}

impl PveBackend {
    /// Create a backend using the tools from `PATH`.
    pub fn new() -> Self {
        Self {
            qm_path: DEFAULT_QM.to_string(),
            pvesm_path: DEFAULT_PVESM.to_string(),
        }
    }

    /// Set the qm binary path.
    pub fn with_qm(mut self, path: impl Into<String>) -> Self {
        self.qm_path = path.into();
        self
    }

    /// Set the pvesm binary path.
    pub fn with_pvesm(mut self, path: impl Into<String>) -> Self {
        self.pvesm_path = path.into();
        self
    }

    /// Execute a tool and return its stdout.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        op: &'static str,
        vm_id: Option<VmId>,
    ) -> Result<String> {
        debug!(command = %program, args = ?args, "Executing hypervisor command");

        let fail = |cause: String| HypervisorError::OperationFailed { op, vm_id, cause };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| fail(format!("failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(op, stderr = %stderr, "Hypervisor command failed");
            return Err(fail(format!("{} exited with {}: {}", program, output.status, stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn qm(&self, args: &[&str], op: &'static str, vm_id: VmId) -> Result<String> {
        self.run(&self.qm_path, args, op, Some(vm_id)).await
    }
}

impl Default for PveBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for PveBackend {
    async fn list_storage(&self) -> Result<Vec<PoolStatus>> {
        let out = self.run(&self.pvesm_path, &["status"], "list_storage", None).await?;
        Ok(parse::parse_pvesm_status(&out)?)
    }

    #[instrument(skip(self), fields(volume = %volume))]
    async fn volume_path(&self, volume: &Volume) -> Result<PathBuf> {
        let volume_id = volume.volume_id();
        let out = self
            .run(&self.pvesm_path, &["path", &volume_id], "volume_path", Some(volume.vm_id))
            .await?;
        let path = out.trim();
        if path.is_empty() {
            return Err(HypervisorError::op("volume_path", volume.vm_id, "pvesm returned no path"));
        }
        Ok(PathBuf::from(path))
    }

    #[instrument(skip(self, specs), fields(vm_id = %vm_id, name = %name))]
    async fn create_vm(&self, vm_id: VmId, name: &str, specs: &VmSpecs) -> Result<()> {
        info!("Creating VM shell");

        let id = vm_id.to_string();
        let memory = specs.memory_mib.to_string();
        let cores = specs.cores.to_string();
        let net0 = format!("virtio,bridge={}", specs.bridge);
        let mut args = vec![
            "create", &id,
            "--name", name,
            "--memory", &memory,
            "--cores", &cores,
            "--net0", &net0,
            "--scsihw", &specs.scsi_controller,
            "--ostype", &specs.os_type,
        ];
        if specs.guest_agent {
            args.extend(["--agent", "enabled=1"]);
        }
        if specs.serial_console {
            args.extend(["--serial0", "socket", "--vga", "serial0"]);
        }

        self.qm(&args, "create_vm", vm_id).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, image = %image.display(), pool = %pool.name))]
    async fn import_disk(&self, vm_id: VmId, image: &Path, pool: &StoragePool) -> Result<Volume> {
        info!("Importing disk image");

        let before: HashSet<String> = self
            .get_vm_config(vm_id)
            .await?
            .unused_disks()
            .into_iter()
            .map(str::to_string)
            .collect();

        let id = vm_id.to_string();
        let image_arg = image.to_string_lossy();
        self.qm(&["importdisk", &id, &image_arg, &pool.name], "import_disk", vm_id)
            .await?;

        let config = self.get_vm_config(vm_id).await?;
        let created = config
            .unused_disks()
            .into_iter()
            .find(|v| !before.contains(*v))
            .ok_or_else(|| {
                HypervisorError::op("import_disk", vm_id, "no new unused disk after import")
            })?;

        let volume = Volume::parse(created)?;
        info!(volume = %volume, format = ?volume.format, "Disk imported");
        Ok(volume)
    }

    #[instrument(skip(self, aux), fields(vm_id = %vm_id, volume = %volume))]
    async fn set_disk_and_boot(&self, vm_id: VmId, volume: &Volume, aux: &[AuxDevice]) -> Result<()> {
        let id = vm_id.to_string();
        let volume_id = volume.volume_id();
        let mut owned: Vec<String> = vec![
            "set".into(), id,
            "--scsi0".into(), volume_id,
        ];
        for device in aux {
            match device {
                AuxDevice::CloudInit { slot, storage } => {
                    owned.push(format!("--{}", slot));
                    owned.push(format!("{}:cloudinit", storage));
                }
            }
        }
        owned.push("--boot".into());
        owned.push("order=scsi0".into());

        let args: Vec<&str> = owned.iter().map(String::as_str).collect();
        self.qm(&args, "set_disk_and_boot", vm_id).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn convert_to_template(&self, vm_id: VmId) -> Result<()> {
        info!("Converting VM to template");
        self.qm(&["template", &vm_id.to_string()], "convert_to_template", vm_id)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, purge = purge))]
    async fn destroy_vm(&self, vm_id: VmId, purge: bool) -> Result<()> {
        info!("Destroying VM");
        let id = vm_id.to_string();
        let mut args = vec!["destroy", &id];
        if purge {
            args.extend(["--purge", "1", "--destroy-unreferenced-disks", "1"]);
        }
        self.qm(&args, "destroy_vm", vm_id).await?;
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let out = self.run(&self.qm_path, &["list"], "list_vms", None).await?;
        let vms = parse::parse_qm_list(&out)?;
        debug!(count = vms.len(), "Listed VMs");
        Ok(vms)
    }

    async fn get_vm_config(&self, vm_id: VmId) -> Result<VmConfig> {
        let out = self.qm(&["config", &vm_id.to_string()], "get_vm_config", vm_id).await?;
        Ok(parse::parse_qm_config(&out)?)
    }

    async fn vm_status(&self, vm_id: VmId) -> Result<VmRunState> {
        let out = self.qm(&["status", &vm_id.to_string()], "vm_status", vm_id).await?;
        Ok(parse::parse_qm_status(&out)?)
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, graceful = graceful, timeout_secs = timeout.as_secs()))]
    async fn stop_vm(&self, vm_id: VmId, graceful: bool, timeout: Duration) -> Result<()> {
        let id = vm_id.to_string();
        if graceful {
            info!("Shutting down VM");
            let secs = timeout.as_secs().max(1).to_string();
            self.qm(&["shutdown", &id, "--timeout", &secs], "stop_vm", vm_id).await?;
        } else {
            info!("Force stopping VM");
            self.qm(&["stop", &id], "stop_vm", vm_id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    async fn start_vm(&self, vm_id: VmId) -> Result<()> {
        info!("Starting VM");
        self.qm(&["start", &vm_id.to_string()], "start_vm", vm_id).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id, disk = %disk_key, target = %target_pool))]
    async fn move_disk(&self, vm_id: VmId, disk_key: &str, target_pool: &str) -> Result<()> {
        info!("Moving disk to materialize a full copy");
        let id = vm_id.to_string();
        self.qm(
            &["disk", "move", &id, disk_key, target_pool, "--delete", "1"],
            "move_disk",
            vm_id,
        )
        .await?;
        Ok(())
    }
}
