//! Error types for the hypervisor port.

use thiserror::Error;

use crate::types::VmId;

/// Errors that can occur while parsing hypervisor CLI output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A table header was missing or did not have the expected columns.
    #[error("Unexpected header in {source_cmd} output: {line:?}")]
    Header { source_cmd: &'static str, line: String },

    /// A data row could not be split into the expected fields.
    #[error("Malformed row {line_no} in {source_cmd} output: {line:?}")]
    Row {
        source_cmd: &'static str,
        line_no: usize,
        line: String,
    },

    /// A numeric field did not parse.
    #[error("Invalid number {value:?} for {field}")]
    Number { field: &'static str, value: String },

    /// A volume identifier did not match either path expression shape.
    #[error("Invalid volume identifier: {0:?}")]
    VolumeId(String),

    /// An image file extension is not a known disk format.
    #[error("Unknown disk format: {0:?}")]
    DiskFormat(String),
}

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// A hypervisor operation failed. `op` names the port operation.
    #[error("{op} failed{}: {cause}", vm_suffix(.vm_id))]
    OperationFailed {
        op: &'static str,
        vm_id: Option<VmId>,
        cause: String,
    },

    /// VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    /// The CLI produced output that could not be parsed.
    #[error("Failed to parse hypervisor output: {0}")]
    Parse(#[from] ParseError),
}

fn vm_suffix(vm_id: &Option<VmId>) -> String {
    match vm_id {
        Some(id) => format!(" for VM {}", id),
        None => String::new(),
    }
}

impl HypervisorError {
    /// Build an `OperationFailed` error for a VM-scoped operation.
    pub fn op(op: &'static str, vm_id: VmId, cause: impl Into<String>) -> Self {
        Self::OperationFailed {
            op,
            vm_id: Some(vm_id),
            cause: cause.into(),
        }
    }

    /// Build an `OperationFailed` error for a host-scoped operation.
    pub fn host_op(op: &'static str, cause: impl Into<String>) -> Self {
        Self::OperationFailed {
            op,
            vm_id: None,
            cause: cause.into(),
        }
    }

    /// Name of the failed operation, when known.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::OperationFailed { op, .. } => Some(*op),
            _ => None,
        }
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
