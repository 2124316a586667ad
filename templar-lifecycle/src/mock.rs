//! In-memory stand-ins for the host side of template work.
//!
//! Used by tests and by `--dev` runs, where no device may be touched:
//! - [`MockDeviceTools`]: fake loop/NBD/kpartx attachments
//! - [`MockMounter`]: "mounts" a fixture directory
//! - [`StaticImages`]: images that are already on disk

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info};

use templar_hypervisor::DiskFormat;

use crate::cache::{CacheEntry, ImageProvider};
use crate::device::{DeviceTools, PartitionMap};
use crate::error::{AttachError, LifecycleError, Result};
use crate::registry::TemplateSpec;
use crate::repair::{MountPoint, Mounter};

fn poisoned() -> AttachError {
    AttachError::tool("mock", "Lock poisoned")
}

// =============================================================================
// DEVICE TOOLS
// =============================================================================

/// Device tools that only record what they were asked to do.
///
/// Loop attaches return `/dev/loop7`, NBD connects `/dev/nbd2`, and kpartx
/// reports a single `p1` map named after the device.
pub struct MockDeviceTools {
    calls: RwLock<Vec<String>>,
    checks: RwLock<u32>,
    appear_after: u32,
    missing: Vec<String>,
    fail_release: bool,
    fail_attach: bool,
    no_partition_table: bool,
    no_free_slot: bool,
}

impl MockDeviceTools {
    pub fn new() -> Self {
        info!("Creating mock device tools");
        Self {
            calls: RwLock::new(Vec::new()),
            checks: RwLock::new(0),
            appear_after: 0,
            missing: Vec::new(),
            fail_release: false,
            fail_attach: false,
            no_partition_table: false,
            no_free_slot: false,
        }
    }

    /// Partitions show up only after this many existence checks.
    pub fn with_partition_delay(mut self, checks: u32) -> Self {
        self.appear_after = checks;
        self
    }

    /// Partition nodes whose path contains `pattern` never show up. An empty
    /// pattern hides every partition.
    pub fn with_missing_partitions(mut self, pattern: impl Into<String>) -> Self {
        self.missing.push(pattern.into());
        self
    }

    /// Every detach fails as if the device were busy.
    pub fn with_failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// kpartx and qemu-nbd fail after touching the device, leaving partial
    /// state behind.
    pub fn with_failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    /// kpartx finds no partition table and prints nothing.
    pub fn with_no_partition_table(mut self) -> Self {
        self.no_partition_table = true;
        self
    }

    /// No loop or NBD slot is free.
    pub fn with_exhausted_slots(mut self) -> Self {
        self.no_free_slot = true;
        self
    }

    /// Tool invocations so far, e.g. `losetup -d /dev/loop7`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Number of partition existence checks so far.
    pub fn checks(&self) -> u32 {
        self.checks.read().map(|c| *c).unwrap_or_default()
    }

    /// Attaches minus releases, per mechanism. Zero when nothing is left
    /// attached.
    pub fn outstanding(&self) -> i64 {
        let attached = self.count("kpartx -av") + self.count("losetup -P") + self.count("qemu-nbd --format");
        let released = self.count("kpartx -dv") + self.count("losetup -d") + self.count("qemu-nbd --disconnect");
        attached as i64 - released as i64
    }

    fn log(&self, entry: String) -> std::result::Result<(), AttachError> {
        debug!(call = %entry, "Mock device call");
        self.calls.write().map_err(|_| poisoned())?.push(entry);
        Ok(())
    }

    fn release_result(&self, tool: &'static str) -> std::result::Result<(), AttachError> {
        if self.fail_release {
            return Err(AttachError::tool(tool, "device or resource busy"));
        }
        Ok(())
    }
}

impl Default for MockDeviceTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTools for MockDeviceTools {
    async fn add_partition_maps(&self, device: &Path) -> std::result::Result<Vec<PartitionMap>, AttachError> {
        self.log(format!("kpartx -av {}", device.display()))?;
        if self.fail_attach {
            return Err(AttachError::tool("kpartx", "unparseable output"));
        }
        if self.no_partition_table {
            return Ok(Vec::new());
        }
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().replace('-', "--"))
            .unwrap_or_default();
        Ok(vec![PartitionMap {
            name: format!("{}p1", name),
        }])
    }

    async fn remove_partition_maps(&self, device: &Path) -> std::result::Result<(), AttachError> {
        self.log(format!("kpartx -dv {}", device.display()))?;
        self.release_result("kpartx")
    }

    async fn attach_loop(&self, image: &Path) -> std::result::Result<PathBuf, AttachError> {
        if self.no_free_slot {
            return Err(AttachError::NoFreeDeviceSlot { kind: "loop" });
        }
        self.log(format!("losetup -P -f --show {}", image.display()))?;
        Ok(PathBuf::from("/dev/loop7"))
    }

    async fn detach_loop(&self, device: &Path) -> std::result::Result<(), AttachError> {
        self.log(format!("losetup -d {}", device.display()))?;
        self.release_result("losetup")
    }

    async fn free_nbd_slot(&self) -> std::result::Result<PathBuf, AttachError> {
        if self.no_free_slot {
            return Err(AttachError::NoFreeDeviceSlot { kind: "nbd" });
        }
        Ok(PathBuf::from("/dev/nbd2"))
    }

    async fn connect_nbd(
        &self,
        image: &Path,
        format: DiskFormat,
        device: &Path,
    ) -> std::result::Result<(), AttachError> {
        self.log(format!(
            "qemu-nbd --format={} --connect={} {}",
            format,
            device.display(),
            image.display()
        ))?;
        if self.fail_attach {
            return Err(AttachError::tool("qemu-nbd", "Failed to setup NBD device"));
        }
        Ok(())
    }

    async fn disconnect_nbd(&self, device: &Path) -> std::result::Result<(), AttachError> {
        self.log(format!("qemu-nbd --disconnect {}", device.display()))?;
        self.release_result("qemu-nbd")
    }

    async fn exists(&self, path: &Path) -> bool {
        let Ok(mut checks) = self.checks.write() else {
            return false;
        };
        *checks += 1;
        let shown = path.to_string_lossy();
        *checks > self.appear_after && !self.missing.iter().any(|m| shown.contains(m.as_str()))
    }
}

// =============================================================================
// MOUNTS
// =============================================================================

/// Which mount steps fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountFaults {
    pub mount: bool,
    pub sync: bool,
    pub unmount: bool,
}

/// Mounter that presents a fixture directory as the mounted root.
pub struct MockMounter {
    root: PathBuf,
    faults: MountFaults,
    calls: RwLock<Vec<&'static str>>,
}

impl MockMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            faults: MountFaults::default(),
            calls: RwLock::new(Vec::new()),
        }
    }

    pub fn with_faults(mut self, faults: MountFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Steps run so far: `mount`, `sync`, `unmount`.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn step(&self, step: &'static str, device: &Path, fail: bool) -> Result<()> {
        let err = |cause: &str| LifecycleError::MountFailed {
            device: device.to_path_buf(),
            cause: cause.to_string(),
        };
        self.calls.write().map_err(|_| err("Lock poisoned"))?.push(step);
        if fail {
            return Err(err(&format!("injected {} failure", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for MockMounter {
    async fn mount(&self, device: &Path) -> Result<MountPoint> {
        self.step("mount", device, self.faults.mount)?;
        Ok(MountPoint::at(device, &self.root))
    }

    async fn sync(&self, mount: &MountPoint) -> Result<()> {
        self.step("sync", mount.device(), self.faults.sync)
    }

    async fn unmount(&self, mount: MountPoint) -> Result<()> {
        self.step("unmount", mount.device(), self.faults.unmount)
    }
}

// =============================================================================
// IMAGES
// =============================================================================

/// Image provider that never downloads: every image is `<dir>/<image_filename>`.
pub struct StaticImages {
    dir: PathBuf,
    unavailable: Vec<String>,
}

impl StaticImages {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            unavailable: Vec::new(),
        }
    }

    /// Fail `ensure` for this template.
    pub fn with_unavailable(mut self, template: impl Into<String>) -> Self {
        self.unavailable.push(template.into());
        self
    }
}

#[async_trait]
impl ImageProvider for StaticImages {
    async fn ensure(&self, spec: &TemplateSpec) -> Result<CacheEntry> {
        if self.unavailable.contains(&spec.name) {
            return Err(LifecycleError::DownloadFailed {
                url: spec.url.clone(),
                cause: "image unavailable".to_string(),
            });
        }
        let local_path = self.dir.join(&spec.image_filename);
        let size_bytes = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
        Ok(CacheEntry {
            source_url: spec.url.clone(),
            local_path,
            size_bytes,
        })
    }
}
