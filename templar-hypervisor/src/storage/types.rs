//! Storage type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::{DiskFormat, VmId};

/// How volumes of a pool are laid out on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Volumes are image files in a directory
    FileBacked,
    /// Volumes are block device nodes (LVM, LVM-thin, ZFS zvols)
    BlockDevice,
    /// Could not be classified; never auto-selected
    Unknown,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageKind::FileBacked => "file-backed",
            StorageKind::BlockDevice => "block-device",
            StorageKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Storage backend types that can be classified from metadata alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Local directory (file-based)
    Dir,
    /// Thick LVM (block-based)
    Lvm,
    /// Thin-provisioned LVM (block-based)
    LvmThin,
    /// ZFS zvols (block-based)
    Zfs,
}

impl BackendType {
    pub fn kind(&self) -> StorageKind {
        match self {
            BackendType::Dir => StorageKind::FileBacked,
            BackendType::Lvm | BackendType::LvmThin | BackendType::Zfs => StorageKind::BlockDevice,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Dir => "dir",
            BackendType::Lvm => "lvm",
            BackendType::LvmThin => "lvmthin",
            BackendType::Zfs => "zfs",
        }
    }
}

impl FromStr for BackendType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dir" => Ok(BackendType::Dir),
            "lvm" => Ok(BackendType::Lvm),
            "lvmthin" => Ok(BackendType::LvmThin),
            "zfs" | "zfspool" => Ok(BackendType::Zfs),
            _ => Err(()),
        }
    }
}

/// One row of the storage status listing, as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool name
    pub name: String,
    /// Backend type string exactly as reported
    pub backend_type: String,
    /// Whether the pool is active on this host
    pub active: bool,
    /// Total capacity in bytes
    pub total_bytes: u64,
    /// Used capacity in bytes
    pub used_bytes: u64,
    /// Available capacity in bytes
    pub available_bytes: u64,
}

/// A storage pool with its kind resolved for the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub kind: StorageKind,
    /// Parsed backend type, when the metadata was recognised
    pub backend: Option<BackendType>,
}

impl StoragePool {
    pub fn new(name: impl Into<String>, kind: StorageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn is_thin_lvm(&self) -> bool {
        self.backend == Some(BackendType::LvmThin)
    }
}

// =============================================================================
// VOLUMES
// =============================================================================

/// A VM disk volume on a storage pool.
///
/// The path expression differs by pool layout:
/// - file-backed: `pool:VMID/vm-VMID-disk-N.EXT`
/// - block device: `pool:vm-VMID-disk-N`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Volume {
    pub storage: String,
    pub vm_id: VmId,
    pub disk_index: u32,
    /// Image format; `None` for block device volumes
    pub format: Option<DiskFormat>,
}

impl Volume {
    /// Volume on a file-backed pool.
    pub fn file(storage: impl Into<String>, vm_id: VmId, disk_index: u32, format: DiskFormat) -> Self {
        Self {
            storage: storage.into(),
            vm_id,
            disk_index,
            format: Some(format),
        }
    }

    /// Volume on a block device pool.
    pub fn block(storage: impl Into<String>, vm_id: VmId, disk_index: u32) -> Self {
        Self {
            storage: storage.into(),
            vm_id,
            disk_index,
            format: None,
        }
    }

    /// Volume name without pool or directory, e.g. `vm-9000-disk-0`.
    pub fn disk_name(&self) -> String {
        format!("vm-{}-disk-{}", self.vm_id, self.disk_index)
    }

    /// Build the canonical path expression.
    pub fn volume_id(&self) -> String {
        match self.format {
            Some(format) => format!(
                "{}:{}/{}.{}",
                self.storage,
                self.vm_id,
                self.disk_name(),
                format.as_str()
            ),
            None => format!("{}:{}", self.storage, self.disk_name()),
        }
    }

    /// Parse a path expression produced by the hypervisor.
    ///
    /// Disk options after a comma (`,size=2G`) are ignored.
    pub fn parse(volume_id: &str) -> Result<Self, ParseError> {
        let err = || ParseError::VolumeId(volume_id.to_string());
        let volume_id_core = crate::types::volume_part(volume_id);

        let (storage, rest) = volume_id_core.split_once(':').ok_or_else(err)?;
        if storage.is_empty() {
            return Err(err());
        }

        match rest.split_once('/') {
            Some((dir, file)) => {
                let (stem, ext) = file.rsplit_once('.').ok_or_else(err)?;
                let (vm_id, disk_index) = parse_disk_name(stem).ok_or_else(err)?;
                if dir.parse::<u32>().ok() != Some(vm_id.0) {
                    return Err(err());
                }
                let format = DiskFormat::from_extension(ext)?;
                Ok(Volume::file(storage, vm_id, disk_index, format))
            }
            None => {
                let (vm_id, disk_index) = parse_disk_name(rest).ok_or_else(err)?;
                Ok(Volume::block(storage, vm_id, disk_index))
            }
        }
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.volume_id())
    }
}

/// Split `vm-<id>-disk-<n>` into its numbers.
fn parse_disk_name(name: &str) -> Option<(VmId, u32)> {
    let rest = name.strip_prefix("vm-")?;
    let (id, index) = rest.split_once("-disk-")?;
    Some((VmId(id.parse().ok()?), index.parse().ok()?))
}

/// Base volume name a template's linked clones point at, e.g. `base-9000-disk-0`.
pub fn base_volume_name(template: VmId, disk_index: u32) -> String {
    format!("base-{}-disk-{}", template, disk_index)
}
