//! Error types for template lifecycle operations.

use std::path::PathBuf;

use thiserror::Error;

use templar_hypervisor::{HypervisorError, VmId};

/// Errors raised while attaching or releasing a volume on the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// The partition table was attached but the root partition never showed up.
    #[error("No root partition appeared at {expected} after {polls} checks")]
    NoPartitionFound { expected: PathBuf, polls: u32 },

    /// Every loop or NBD slot on the host is in use. Retry once one frees up.
    #[error("No free {kind} device slot")]
    NoFreeDeviceSlot { kind: &'static str },

    /// A device tool exited with an error or produced unusable output.
    #[error("{tool} failed: {cause}")]
    Tool { tool: &'static str, cause: String },
}

impl AttachError {
    pub(crate) fn tool(tool: &'static str, cause: impl Into<String>) -> Self {
        Self::Tool {
            tool,
            cause: cause.into(),
        }
    }
}

/// Errors that can end a template's lifecycle run.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The source image could not be made available in the local cache.
    #[error("Download of {url} failed: {cause}")]
    DownloadFailed { url: String, cause: String },

    /// Creating the VM shell or importing its disk failed.
    #[error("Import failed: {0}")]
    ImportFailed(#[source] HypervisorError),

    #[error("Attach failed: {0}")]
    AttachFailed(#[from] AttachError),

    /// Mounting, syncing or unmounting the root filesystem failed.
    #[error("Mount of {device} failed: {cause}")]
    MountFailed { device: PathBuf, cause: String },

    /// I/O error while rewriting boot configuration.
    #[error("Repair of {path} failed: {source}")]
    RepairFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template's VM id is held by a VM that is not this template.
    #[error("VM id {vm_id} is taken by '{existing}', which is not template '{template}'")]
    VmIdConflict {
        vm_id: VmId,
        existing: String,
        template: String,
    },

    /// Linked clones still depend on the template.
    #[error("Template {template} still has linked clones: {clones:?}")]
    DependentCloneBlocking { template: VmId, clones: Vec<VmId> },

    #[error("Conversion of linked clones of {template} failed at VM {failed}: {cause} (converted {converted:?}, pending {pending:?})")]
    CloneConversionFailed {
        template: VmId,
        converted: Vec<VmId>,
        failed: VmId,
        pending: Vec<VmId>,
        cause: String,
    },

    /// The final `qm template` step failed.
    #[error("Template conversion failed: {0}")]
    TemplateConversionFailed(#[source] HypervisorError),

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// No usable storage pool could be resolved.
    #[error("Storage resolution failed: {0}")]
    Storage(String),
}

/// Errors in the template registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Duplicate template name: {0}")]
    DuplicateName(String),

    #[error("VM id {vm_id} is used by both {first} and {second}")]
    DuplicateVmId {
        vm_id: VmId,
        first: String,
        second: String,
    },

    /// Proxmox reserves ids below 100.
    #[error("Template {name} has VM id {vm_id}; ids below 100 are reserved")]
    ReservedVmId { name: String, vm_id: VmId },

    #[error("Template {name} is missing {field}")]
    MissingField { name: String, field: &'static str },

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),
}

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;
