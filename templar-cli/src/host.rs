//! Wiring of the host-facing ports.

use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::info;

use templar_hypervisor::{HypervisorClient, MockBackend, PveBackend};
use templar_lifecycle::mock::{MockDeviceTools, MockMounter, StaticImages};
use templar_lifecycle::{DeviceTools, HostDeviceTools, HostMounter, ImageCache, ImageProvider, Mounter};

use crate::config::{Config, HypervisorBackend};

/// Root filesystem presented to the repairer in development mode.
const DEV_FSTAB: &str = "\
LABEL=cloudimg-rootfs\t/\text4\tdiscard,errors=remount-ro\t0 1
LABEL=UEFI\t/boot/efi\tvfat\tumask=0077\t0 1
";

/// The hypervisor and host tools a run works against.
pub struct Host {
    pub client: Arc<dyn HypervisorClient>,
    pub images: Arc<dyn ImageProvider>,
    pub tools: Arc<dyn DeviceTools>,
    pub mounter: Arc<dyn Mounter>,
    /// Keeps the development root alive for the run
    _dev_root: Option<TempDir>,
}

impl Host {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.hypervisor.backend {
            HypervisorBackend::Pve => {
                info!(qm = %config.hypervisor.qm, pvesm = %config.hypervisor.pvesm, "Using Proxmox backend");
                let backend = PveBackend::new()
                    .with_qm(&config.hypervisor.qm)
                    .with_pvesm(&config.hypervisor.pvesm);
                Ok(Self {
                    client: Arc::new(backend),
                    images: Arc::new(ImageCache::new(&config.cache.root)),
                    tools: Arc::new(HostDeviceTools::new()),
                    mounter: Arc::new(HostMounter::new()),
                    _dev_root: None,
                })
            }
            HypervisorBackend::Mock => {
                info!("Development mode: using in-memory hypervisor and device tools");
                let root = tempfile::Builder::new()
                    .prefix("templar-dev-root-")
                    .tempdir()
                    .context("Failed to create development root")?;
                std::fs::create_dir_all(root.path().join("etc"))
                    .and_then(|_| std::fs::write(root.path().join("etc/fstab"), DEV_FSTAB))
                    .context("Failed to seed development root")?;

                Ok(Self {
                    client: Arc::new(MockBackend::new()),
                    images: Arc::new(StaticImages::new(&config.cache.root)),
                    tools: Arc::new(MockDeviceTools::new()),
                    mounter: Arc::new(MockMounter::new(root.path())),
                    _dev_root: Some(root),
                })
            }
        }
    }
}
