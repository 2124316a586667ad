//! Proxmox VE backend.
//!
//! Drives the host through the `qm` and `pvesm` command line tools. All
//! string parsing of their output lives in [`crate::parse`].

mod backend;

pub use backend::PveBackend;

/// Default path of the `qm` binary.
pub const DEFAULT_QM: &str = "qm";

/// Default path of the `pvesm` binary.
pub const DEFAULT_PVESM: &str = "pvesm";
