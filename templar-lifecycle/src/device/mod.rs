//! Attaching template volumes as partitioned host devices.
//!
//! The mechanism follows the pool layout:
//!
//! | Pool kind    | Format  | Mechanism                        | Root partition          |
//! |--------------|---------|----------------------------------|-------------------------|
//! | BlockDevice  | -       | `kpartx -av <node>`              | `/dev/mapper/<name>p1`  |
//! | FileBacked   | raw     | `losetup -P -f --show <file>`    | `/dev/loopNp1`          |
//! | FileBacked   | other   | `qemu-nbd --format=F --connect`  | `/dev/nbdNp1`           |
//!
//! Every successful [`DeviceAttacher::attach`] yields an [`AttachedVolume`]
//! whose [`AttachedVolume::release`] consumes it, so a volume can only be
//! released once.

mod host;
mod kpartx;

pub use host::HostDeviceTools;
pub use kpartx::{parse_kpartx_add, PartitionMap};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use templar_hypervisor::{DiskFormat, StorageKind, Volume};

use crate::error::AttachError;
use crate::report::{LeakKind, LeakedResource};

/// Host tools that expose disk images as block devices.
#[async_trait]
pub trait DeviceTools: Send + Sync {
    // =========================================================================
    // Partition maps (block device pools)
    // =========================================================================

    /// Create device-mapper entries for the partitions of `device`.
    async fn add_partition_maps(&self, device: &Path) -> Result<Vec<PartitionMap>, AttachError>;

    /// Remove the partition maps of `device`. Succeeds if none exist.
    async fn remove_partition_maps(&self, device: &Path) -> Result<(), AttachError>;

    // =========================================================================
    // Loop devices (raw images)
    // =========================================================================

    /// Attach a raw image to a free loop device with partition scanning.
    async fn attach_loop(&self, image: &Path) -> Result<PathBuf, AttachError>;

    /// Detach a loop device. Succeeds if it is already detached.
    async fn detach_loop(&self, device: &Path) -> Result<(), AttachError>;

    // =========================================================================
    // Network block devices (qcow2, vmdk)
    // =========================================================================

    /// Pick an unused NBD slot, loading the driver if needed.
    async fn free_nbd_slot(&self) -> Result<PathBuf, AttachError>;

    /// Connect an image to the NBD slot `device` with an explicit format.
    async fn connect_nbd(&self, image: &Path, format: DiskFormat, device: &Path) -> Result<(), AttachError>;

    /// Disconnect an NBD slot. Succeeds if it is already disconnected.
    async fn disconnect_nbd(&self, device: &Path) -> Result<(), AttachError>;

    /// Whether a device node exists yet.
    async fn exists(&self, path: &Path) -> bool;
}

/// Partition wait settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttachSettings {
    /// Number of checks for the root partition node
    pub partition_wait_polls: u32,
    /// Delay between checks in milliseconds
    pub partition_wait_interval_ms: u64,
}

impl Default for AttachSettings {
    fn default() -> Self {
        Self {
            partition_wait_polls: 10,
            partition_wait_interval_ms: 500,
        }
    }
}

impl AttachSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.partition_wait_interval_ms)
    }
}

/// The mechanism a volume was attached with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachMechanism {
    /// kpartx maps over a block device node
    PartitionMap { device: PathBuf },
    /// Loop device over a raw image file
    Loop { device: PathBuf },
    /// NBD slot over a formatted image file
    Nbd { device: PathBuf },
}

impl AttachMechanism {
    /// The attached whole-disk device.
    pub fn device(&self) -> &Path {
        match self {
            AttachMechanism::PartitionMap { device }
            | AttachMechanism::Loop { device }
            | AttachMechanism::Nbd { device } => device,
        }
    }
}

/// A volume attached on the host.
///
/// Must be handed to [`AttachedVolume::release`] before it goes out of scope.
pub struct AttachedVolume {
    volume: Volume,
    root_partition: PathBuf,
    mechanism: AttachMechanism,
    tools: Arc<dyn DeviceTools>,
    released: bool,
}

impl AttachedVolume {
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Device node of the first partition.
    pub fn root_partition(&self) -> &Path {
        &self.root_partition
    }

    pub fn mechanism(&self) -> &AttachMechanism {
        &self.mechanism
    }

    /// Reverse the attach mechanism.
    #[instrument(skip(self), fields(volume = %self.volume, device = %self.mechanism.device().display()))]
    pub async fn release(mut self) -> Result<(), AttachError> {
        self.released = true;
        let result = reverse(self.tools.as_ref(), &self.mechanism).await;
        match &result {
            Ok(()) => info!("Volume released"),
            Err(e) => error!(error = %e, "Failed to release volume"),
        }
        result
    }
}

impl Drop for AttachedVolume {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                volume = %self.volume,
                device = %self.mechanism.device().display(),
                "Attached volume dropped without release"
            );
        }
    }
}

/// Attaches volumes with the mechanism their storage requires.
pub struct DeviceAttacher {
    tools: Arc<dyn DeviceTools>,
    settings: AttachSettings,
}

impl DeviceAttacher {
    pub fn new(tools: Arc<dyn DeviceTools>) -> Self {
        Self {
            tools,
            settings: AttachSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AttachSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach `volume`, found on the host at `host_path`, and wait for its
    /// root partition.
    ///
    /// On failure nothing stays attached; a failed undo is pushed to `leaks`.
    #[instrument(skip(self, leaks), fields(volume = %volume, kind = %pool_kind, path = %host_path.display()))]
    pub async fn attach(
        &self,
        volume: &Volume,
        pool_kind: StorageKind,
        host_path: &Path,
        leaks: &mut Vec<LeakedResource>,
    ) -> Result<AttachedVolume, AttachError> {
        let (mechanism, root_partition) = match select_mechanism(pool_kind, volume.format) {
            Mechanism::PartitionMap => {
                let mechanism = AttachMechanism::PartitionMap { device: host_path.to_path_buf() };
                // kpartx may have created maps before failing.
                let maps = match self.tools.add_partition_maps(host_path).await {
                    Ok(maps) => maps,
                    Err(e) => {
                        self.undo(&mechanism, leaks).await;
                        return Err(e);
                    }
                };
                let Some(root) = maps.iter().find(|m| m.is_first()).map(PartitionMap::path) else {
                    warn!(maps = maps.len(), "No partition table on volume");
                    self.undo(&mechanism, leaks).await;
                    return Err(AttachError::NoPartitionFound {
                        expected: host_path.to_path_buf(),
                        polls: 0,
                    });
                };
                (mechanism, root)
            }
            Mechanism::Loop => {
                let device = self.tools.attach_loop(host_path).await?;
                let root = first_partition(&device);
                (AttachMechanism::Loop { device }, root)
            }
            Mechanism::Nbd(format) => {
                let device = self.tools.free_nbd_slot().await?;
                let mechanism = AttachMechanism::Nbd { device };
                if let Err(e) = self.tools.connect_nbd(host_path, format, mechanism.device()).await {
                    self.undo(&mechanism, leaks).await;
                    return Err(e);
                }
                let root = first_partition(mechanism.device());
                (mechanism, root)
            }
        };

        let attached = AttachedVolume {
            volume: volume.clone(),
            root_partition,
            mechanism,
            tools: self.tools.clone(),
            released: false,
        };

        let polls = self.settings.partition_wait_polls;
        for attempt in 1..=polls {
            if self.tools.exists(&attached.root_partition).await {
                info!(
                    device = %attached.mechanism.device().display(),
                    root = %attached.root_partition.display(),
                    "Volume attached"
                );
                return Ok(attached);
            }
            debug!(attempt, root = %attached.root_partition.display(), "Waiting for root partition");
            if attempt < polls {
                tokio::time::sleep(self.settings.interval()).await;
            }
        }

        let expected = attached.root_partition.clone();
        let device = attached.mechanism.device().display().to_string();
        if let Err(e) = attached.release().await {
            leaks.push(LeakedResource::new(LeakKind::Device, device, e));
        }
        Err(AttachError::NoPartitionFound { expected, polls })
    }
}

impl DeviceAttacher {
    /// Reverse a partial attach, recording a failure in `leaks`.
    async fn undo(&self, mechanism: &AttachMechanism, leaks: &mut Vec<LeakedResource>) {
        let device = mechanism.device().display().to_string();
        match reverse(self.tools.as_ref(), mechanism).await {
            Ok(()) => debug!(device = %device, "Partial attach undone"),
            Err(e) => {
                error!(device = %device, error = %e, "Failed to undo partial attach");
                leaks.push(LeakedResource::new(LeakKind::Device, device, e));
            }
        }
    }
}

async fn reverse(tools: &dyn DeviceTools, mechanism: &AttachMechanism) -> Result<(), AttachError> {
    match mechanism {
        AttachMechanism::PartitionMap { device } => tools.remove_partition_maps(device).await,
        AttachMechanism::Loop { device } => tools.detach_loop(device).await,
        AttachMechanism::Nbd { device } => tools.disconnect_nbd(device).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mechanism {
    PartitionMap,
    Loop,
    Nbd(DiskFormat),
}

fn select_mechanism(pool_kind: StorageKind, format: Option<DiskFormat>) -> Mechanism {
    match (pool_kind, format) {
        (StorageKind::BlockDevice, _) | (StorageKind::Unknown, None) => Mechanism::PartitionMap,
        (_, Some(format)) if !format.is_raw() => Mechanism::Nbd(format),
        _ => Mechanism::Loop,
    }
}

/// `/dev/loop0` → `/dev/loop0p1`
fn first_partition(device: &Path) -> PathBuf {
    let mut name = device.as_os_str().to_os_string();
    name.push("p1");
    PathBuf::from(name)
}
