//! Type definitions for VM identity, configuration and status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

// =============================================================================
// VM IDENTITY
// =============================================================================

/// Numeric VM identifier as used by `qm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VmId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(VmId)
            .map_err(|_| ParseError::Number { field: "vmid", value: s.to_string() })
    }
}

// =============================================================================
// VM STATUS
// =============================================================================

/// Run state of a VM as far as template work is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRunState {
    Stopped,
    Running,
}

impl VmRunState {
    /// Map a `qm` status word. Anything that still holds the VM process
    /// (paused, suspended, prelaunch) counts as running.
    pub fn from_status_word(word: &str) -> Self {
        match word.trim() {
            "stopped" => VmRunState::Stopped,
            _ => VmRunState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmRunState::Running)
    }
}

/// One row of the VM listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub vm_id: VmId,
    pub name: String,
    pub run_state: VmRunState,
}

// =============================================================================
// VM CREATION
// =============================================================================

/// Hardware shape of a template VM shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpecs {
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Number of CPU cores
    pub cores: u32,
    /// Bridge for net0
    pub bridge: String,
    /// SCSI controller model
    pub scsi_controller: String,
    /// Guest OS type hint
    pub os_type: String,
    /// Enable the QEMU guest agent channel
    pub guest_agent: bool,
    /// Attach a serial console and use it as display
    pub serial_console: bool,
}

impl Default for VmSpecs {
    fn default() -> Self {
        Self {
            memory_mib: 2048,
            cores: 2,
            bridge: "vmbr0".to_string(),
            scsi_controller: "virtio-scsi-pci".to_string(),
            os_type: "l26".to_string(),
            guest_agent: true,
            serial_console: true,
        }
    }
}

/// Auxiliary devices attached next to the boot disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AuxDevice {
    /// Cloud-init metadata drive allocated on the given storage pool.
    CloudInit { slot: String, storage: String },
}

impl AuxDevice {
    /// Cloud-init drive on `ide2`, the slot cloud images expect.
    pub fn cloud_init(storage: impl Into<String>) -> Self {
        AuxDevice::CloudInit {
            slot: "ide2".to_string(),
            storage: storage.into(),
        }
    }
}

// =============================================================================
// DISK FORMATS
// =============================================================================

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Vmdk,
}

impl DiskFormat {
    /// Get the format string (also the file extension on file-backed pools).
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
        }
    }

    /// Detect the format from a file extension.
    pub fn from_extension(ext: &str) -> Result<Self, ParseError> {
        match ext.to_ascii_lowercase().as_str() {
            "raw" | "img" => Ok(DiskFormat::Raw),
            "qcow2" => Ok(DiskFormat::Qcow2),
            "vmdk" => Ok(DiskFormat::Vmdk),
            other => Err(ParseError::DiskFormat(other.to_string())),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, DiskFormat::Raw)
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RAW VM CONFIG
// =============================================================================

static DISK_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(scsi|virtio|sata|ide|unused)\d+$|^efidisk0$|^tpmstate0$")
        .expect("static regex")
});

/// Raw key/value configuration of a VM as dumped by `qm config`.
///
/// Only the current configuration is kept; snapshot and pending sections are
/// dropped by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub entries: BTreeMap<String, String>,
}

impl VmConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name")
    }

    /// True if `qm template` has been run on this VM.
    pub fn is_template(&self) -> bool {
        self.get("template") == Some("1")
    }

    /// Disk attributes as `(key, value)` pairs, e.g. `("scsi0", "local-lvm:vm-100-disk-0,size=8G")`.
    pub fn disks(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|(k, _)| is_disk_key(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Unused disk references, lowest index first.
    pub fn unused_disks(&self) -> Vec<&str> {
        let mut unused: Vec<(u32, &str)> = self
            .entries
            .iter()
            .filter_map(|(k, v)| {
                let idx = k.strip_prefix("unused")?.parse::<u32>().ok()?;
                Some((idx, volume_part(v)))
            })
            .collect();
        unused.sort_by_key(|(idx, _)| *idx);
        unused.into_iter().map(|(_, v)| v).collect()
    }
}

/// True for configuration keys that describe a disk.
pub fn is_disk_key(key: &str) -> bool {
    DISK_KEY.is_match(key)
}

/// The volume identifier part of a disk attribute value (before the first comma).
pub fn volume_part(value: &str) -> &str {
    value.split(',').next().unwrap_or(value).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_parse() {
        assert_eq!("9000".parse::<VmId>().unwrap(), VmId(9000));
        assert_eq!(" 301 ".parse::<VmId>().unwrap(), VmId(301));
        assert!("web-1".parse::<VmId>().is_err());
    }

    #[test]
    fn test_disk_format_from_extension() {
        assert_eq!(DiskFormat::from_extension("qcow2").unwrap(), DiskFormat::Qcow2);
        assert_eq!(DiskFormat::from_extension("RAW").unwrap(), DiskFormat::Raw);
        assert!(DiskFormat::from_extension("iso").is_err());
    }

    #[test]
    fn test_disk_keys() {
        for key in ["scsi0", "virtio12", "sata1", "ide2", "unused0", "efidisk0", "tpmstate0"] {
            assert!(is_disk_key(key), "{key} should be a disk key");
        }
        for key in ["scsihw", "net0", "boot", "name", "efidisk1"] {
            assert!(!is_disk_key(key), "{key} should not be a disk key");
        }
    }

    #[test]
    fn test_unused_disks_sorted() {
        let mut config = VmConfig::default();
        config.entries.insert("unused1".into(), "local:9000/vm-9000-disk-1.raw".into());
        config.entries.insert("unused0".into(), "local:9000/vm-9000-disk-0.qcow2".into());
        assert_eq!(
            config.unused_disks(),
            vec!["local:9000/vm-9000-disk-0.qcow2", "local:9000/vm-9000-disk-1.raw"]
        );
    }
}
