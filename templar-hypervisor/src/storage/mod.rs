//! Storage pool classification and selection.
//!
//! Pools are classified once per run from the hypervisor's storage listing:
//!
//! ```text
//!   backend type parses?  ──yes──▶  dir → FileBacked
//!          │                        lvm / lvmthin / zfs → BlockDevice
//!          no
//!          ▼
//!   name heuristics       ──────▶  "local" → FileBacked
//!                                   contains "lvm"/"zfs" → BlockDevice
//!                                   otherwise → Unknown
//! ```

mod types;

pub use types::*;

use tracing::{debug, info, warn};

/// Classifies pools and picks a default pool for template disks.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    catalog: Vec<PoolStatus>,
}

impl StorageResolver {
    /// Create a resolver over a storage listing.
    pub fn new(catalog: Vec<PoolStatus>) -> Self {
        Self { catalog }
    }

    /// All pools in the listing with their resolved kinds.
    pub fn pools(&self) -> Vec<StoragePool> {
        self.catalog.iter().map(|status| self.classify(&status.name)).collect()
    }

    /// Whether the listing contains a pool with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.catalog.iter().any(|p| p.name == name)
    }

    /// Classify a pool by name.
    ///
    /// Pools missing from the listing are classified by name alone.
    pub fn classify(&self, name: &str) -> StoragePool {
        let backend = self
            .catalog
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.backend_type.parse::<BackendType>().ok());

        let pool = match backend {
            Some(backend) => StoragePool::new(name, backend.kind()).with_backend(backend),
            None => StoragePool::new(name, kind_from_name(name)),
        };
        debug!(pool = %pool.name, kind = %pool.kind, "Classified storage pool");
        pool
    }

    /// Pick a pool when the operator did not name one.
    ///
    /// Preference: file-backed `local`, any file-backed pool, any classified
    /// pool that is not thin-LVM, and thin-LVM only as a last resort.
    /// Unknown and inactive pools are never picked.
    pub fn auto_select(&self) -> Option<StoragePool> {
        let candidates: Vec<StoragePool> = self
            .catalog
            .iter()
            .filter(|p| p.active)
            .map(|p| self.classify(&p.name))
            .filter(|p| p.kind != StorageKind::Unknown)
            .collect();

        let picked = candidates
            .iter()
            .find(|p| p.kind == StorageKind::FileBacked && p.name == "local")
            .or_else(|| candidates.iter().find(|p| p.kind == StorageKind::FileBacked))
            .or_else(|| candidates.iter().find(|p| !p.is_thin_lvm()))
            .cloned();

        if let Some(pool) = picked {
            info!(pool = %pool.name, kind = %pool.kind, "Auto-selected storage pool");
            return Some(pool);
        }

        let fallback = candidates.into_iter().find(|p| p.is_thin_lvm());
        if let Some(pool) = &fallback {
            warn!(
                pool = %pool.name,
                "Only thin-LVM storage available; using it for templates"
            );
        }
        fallback
    }
}

/// Name heuristics for pools whose backend type is not recognised.
fn kind_from_name(name: &str) -> StorageKind {
    let lower = name.to_ascii_lowercase();
    if lower == "local" {
        StorageKind::FileBacked
    } else if lower.contains("lvm") || lower.contains("zfs") {
        StorageKind::BlockDevice
    } else {
        StorageKind::Unknown
    }
}
