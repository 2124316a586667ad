//! # templar Hypervisor
//!
//! Hypervisor port for building and maintaining VM templates on a Proxmox VE
//! host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          HypervisorClient Trait         │
//! │ (create_vm, import_disk, template, ...) │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │    PveBackend     │     │    MockBackend    │
//! │   (qm / pvesm)    │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! Output of the CLI tools is turned into typed values by [`parse`]; storage
//! pools are classified by [`StorageResolver`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use templar_hypervisor::{HypervisorClient, MockBackend, StorageResolver};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::new();
//!     let resolver = StorageResolver::new(backend.list_storage().await.unwrap());
//!     let pool = resolver.auto_select().unwrap();
//!     println!("templates go to {}", pool.name);
//! }
//! ```

pub mod error;
pub mod mock;
pub mod parse;
pub mod pve;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::{HypervisorError, ParseError};
pub use mock::MockBackend;
pub use pve::PveBackend;
pub use storage::{
    base_volume_name, BackendType, PoolStatus, StorageKind, StoragePool, StorageResolver, Volume,
};
pub use traits::HypervisorClient;
pub use types::*;
