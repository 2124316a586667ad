//! Device tools backed by kpartx, losetup and qemu-nbd.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use templar_hypervisor::DiskFormat;

use super::{parse_kpartx_add, DeviceTools, PartitionMap};
use crate::error::AttachError;

/// Number of NBD slots created by `modprobe nbd max_part=16`.
const NBD_SLOTS: u32 = 16;

/// Device tools that run on the host.
pub struct HostDeviceTools {
    /// sysfs block directory, `/sys/block` on a real host
    sysfs_block: PathBuf,
    /// Directory holding device nodes, `/dev` on a real host
    dev_root: PathBuf,
}

impl HostDeviceTools {
    pub fn new() -> Self {
        Self {
            sysfs_block: PathBuf::from("/sys/block"),
            dev_root: PathBuf::from("/dev"),
        }
    }

    /// Look up sysfs and device nodes under other roots.
    pub fn with_roots(mut self, sysfs_block: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        self.sysfs_block = sysfs_block.into();
        self.dev_root = dev_root.into();
        self
    }

    /// Execute a device tool and return its stdout.
    async fn run(&self, tool: &'static str, args: &[&str]) -> Result<String, AttachError> {
        debug!(command = %tool, args = ?args, "Executing device command");

        let output = Command::new(tool)
            .args(args)
            .output()
            .await
            .map_err(|e| AttachError::tool(tool, format!("failed to execute: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(tool, stderr = %stderr, "Device command failed");
            return Err(AttachError::tool(tool, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Load the nbd module unless its slots already exist.
    async fn ensure_nbd_module(&self) -> Result<(), AttachError> {
        if self.sysfs_block.join("nbd0").exists() {
            return Ok(());
        }
        info!("Loading nbd kernel module");
        self.run("modprobe", &["nbd", &format!("max_part={}", NBD_SLOTS)]).await?;
        Ok(())
    }

    /// First NBD slot whose size is zero.
    pub fn find_free_nbd(&self) -> Option<PathBuf> {
        (0..NBD_SLOTS).find_map(|i| {
            let name = format!("nbd{}", i);
            let size = std::fs::read_to_string(self.sysfs_block.join(&name).join("size")).ok()?;
            (size.trim() == "0").then(|| self.dev_root.join(&name))
        })
    }

    /// True once a loop or NBD slot has nothing behind it anymore.
    fn is_detached(&self, device: &Path) -> bool {
        let Some(name) = device.file_name() else {
            return true;
        };
        let sys = self.sysfs_block.join(name);
        if !sys.exists() {
            return true;
        }
        if name.to_string_lossy().starts_with("loop") {
            return !sys.join("loop").join("backing_file").exists();
        }
        std::fs::read_to_string(sys.join("size"))
            .map(|s| s.trim() == "0")
            .unwrap_or(true)
    }
}

impl Default for HostDeviceTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTools for HostDeviceTools {
    #[instrument(skip(self), fields(device = %device.display()))]
    async fn add_partition_maps(&self, device: &Path) -> Result<Vec<PartitionMap>, AttachError> {
        let dev = device.to_string_lossy();
        let out = self.run("kpartx", &["-av", &dev]).await?;
        let maps = parse_kpartx_add(&out).map_err(|e| AttachError::tool("kpartx", e.to_string()))?;
        debug!(count = maps.len(), "Partition maps added");
        Ok(maps)
    }

    #[instrument(skip(self), fields(device = %device.display()))]
    async fn remove_partition_maps(&self, device: &Path) -> Result<(), AttachError> {
        let dev = device.to_string_lossy();
        self.run("kpartx", &["-dv", &dev]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(image = %image.display()))]
    async fn attach_loop(&self, image: &Path) -> Result<PathBuf, AttachError> {
        let img = image.to_string_lossy();
        let out = match self.run("losetup", &["-P", "-f", "--show", &img]).await {
            Err(AttachError::Tool { cause, .. }) if cause.contains("unused loop device") => {
                return Err(AttachError::NoFreeDeviceSlot { kind: "loop" });
            }
            other => other?,
        };
        let device = out.trim();
        if device.is_empty() {
            return Err(AttachError::tool("losetup", "no device name printed"));
        }
        info!(device = %device, "Loop device attached");
        Ok(PathBuf::from(device))
    }

    #[instrument(skip(self), fields(device = %device.display()))]
    async fn detach_loop(&self, device: &Path) -> Result<(), AttachError> {
        if self.is_detached(device) {
            debug!("Loop device already detached");
            return Ok(());
        }
        let dev = device.to_string_lossy();
        self.run("losetup", &["-d", &dev]).await?;
        Ok(())
    }

    async fn free_nbd_slot(&self) -> Result<PathBuf, AttachError> {
        self.ensure_nbd_module().await?;
        let device = self
            .find_free_nbd()
            .ok_or(AttachError::NoFreeDeviceSlot { kind: "nbd" })?;
        debug!(device = %device.display(), "Picked free NBD slot");
        Ok(device)
    }

    #[instrument(skip(self), fields(image = %image.display(), format = %format, device = %device.display()))]
    async fn connect_nbd(&self, image: &Path, format: DiskFormat, device: &Path) -> Result<(), AttachError> {
        let format_arg = format!("--format={}", format);
        let connect_arg = format!("--connect={}", device.display());
        let img = image.to_string_lossy();
        self.run("qemu-nbd", &[&format_arg, &connect_arg, &img]).await?;

        info!("NBD device connected");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %device.display()))]
    async fn disconnect_nbd(&self, device: &Path) -> Result<(), AttachError> {
        if self.is_detached(device) {
            debug!("NBD device already disconnected");
            return Ok(());
        }
        let dev = device.to_string_lossy();
        self.run("qemu-nbd", &["--disconnect", &dev]).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}
