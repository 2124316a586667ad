//! Detaching linked clones from their template.
//!
//! Moving a clone's disk onto its own pool makes the hypervisor write a full,
//! independent copy and drop the reference to the base volume.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use templar_hypervisor::{HypervisorClient, HypervisorError, VmId};

use crate::clones::LinkedClone;

/// Grace period for an ACPI shutdown before the VM is powered off.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of converting a batch of clones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub converted: Vec<VmId>,
    /// The clone that failed and why; conversion stops there
    pub failed: Option<(VmId, String)>,
    /// Clones not attempted because an earlier one failed
    pub pending: Vec<VmId>,
}

impl ConversionReport {
    /// Every clone is now independent of the template.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.pending.is_empty()
    }
}

/// Converts linked clones into full clones.
pub struct CloneConverter {
    client: Arc<dyn HypervisorClient>,
    stop_timeout: Duration,
}

impl CloneConverter {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self {
            client,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Convert clones in order, stopping at the first failure. Conversions
    /// already done are kept.
    pub async fn convert_all(&self, clones: &[LinkedClone]) -> ConversionReport {
        let mut report = ConversionReport::default();

        for (idx, clone) in clones.iter().enumerate() {
            match self.convert(clone).await {
                Ok(()) => report.converted.push(clone.vm_id),
                Err(e) => {
                    error!(vm_id = %clone.vm_id, error = %e, "Linked clone conversion failed");
                    report.failed = Some((clone.vm_id, e.to_string()));
                    report.pending = clones[idx + 1..].iter().map(|c| c.vm_id).collect();
                    break;
                }
            }
        }

        report
    }

    /// Convert one clone. A clone that was running is started again whatever
    /// step failed after the shutdown request; the first error is returned.
    #[instrument(skip(self, clone), fields(vm_id = %clone.vm_id, name = %clone.name))]
    pub async fn convert(&self, clone: &LinkedClone) -> Result<(), HypervisorError> {
        if !clone.run_state.is_running() {
            self.move_disks(clone).await?;
            info!("Linked clone converted to full clone");
            return Ok(());
        }

        let converted = match self.stop(clone.vm_id).await {
            Ok(()) => self.move_disks(clone).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.restart(clone.vm_id).await {
            error!(error = %e, "Failed to restart VM after conversion");
            return Err(converted.err().unwrap_or(e));
        }

        converted?;
        info!("Linked clone converted to full clone");
        Ok(())
    }

    /// Start the VM unless it is known to be running already.
    async fn restart(&self, vm_id: VmId) -> Result<(), HypervisorError> {
        match self.client.vm_status(vm_id).await {
            Ok(state) if state.is_running() => {
                debug!("VM still running, no restart needed");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read VM state before restart"),
        }
        info!("Restarting VM");
        self.client.start_vm(vm_id).await
    }

    async fn stop(&self, vm_id: VmId) -> Result<(), HypervisorError> {
        info!(timeout_secs = self.stop_timeout.as_secs(), "Shutting down VM for conversion");
        if let Err(e) = self.client.stop_vm(vm_id, true, self.stop_timeout).await {
            warn!(error = %e, "Graceful shutdown failed");
        }

        if self.client.vm_status(vm_id).await?.is_running() {
            warn!("VM still running after grace period; forcing stop");
            self.client.stop_vm(vm_id, false, self.stop_timeout).await?;
        }
        Ok(())
    }

    async fn move_disks(&self, clone: &LinkedClone) -> Result<(), HypervisorError> {
        for disk in &clone.disk_keys {
            info!(disk = %disk.key, pool = %disk.pool, "Materializing disk");
            self.client.move_disk(clone.vm_id, &disk.key, &disk.pool).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clones::LinkedCloneResolver;
    use templar_hypervisor::{MockBackend, VmRunState};

    fn host() -> Arc<MockBackend> {
        let backend = Arc::new(MockBackend::new().with_storage(vec![
            MockBackend::pool_status("local", "dir"),
            MockBackend::pool_status("local-lvmthin", "lvmthin"),
        ]));
        backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvmthin");
        backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvmthin:base-9000-disk-0/vm-301-disk-0,size=2252M")],
            VmRunState::Running,
        );
        backend.insert_vm(
            VmId(302),
            "web-2",
            [("scsi0", "local-lvmthin:base-9000-disk-0/vm-302-disk-0,size=2252M")],
            VmRunState::Stopped,
        );
        backend
    }

    async fn clones(backend: &Arc<MockBackend>) -> Vec<LinkedClone> {
        LinkedCloneResolver::new(backend.clone()).resolve(VmId(9000)).await.unwrap()
    }

    #[tokio::test]
    async fn test_convert_all() {
        let backend = host();
        let converter = CloneConverter::new(backend.clone());

        let report = converter.convert_all(&clones(&backend).await).await;
        assert!(report.is_complete());
        assert_eq!(report.converted, vec![VmId(301), VmId(302)]);

        assert!(clones(&backend).await.is_empty());
        assert!(backend.vm_status(VmId(301)).await.unwrap().is_running());
        assert!(!backend.vm_status(VmId(302)).await.unwrap().is_running());
        assert_eq!(
            backend.vm(VmId(301)).unwrap().get("scsi0"),
            Some("local-lvmthin:vm-301-disk-1,size=2252M")
        );
    }

    #[tokio::test]
    async fn test_restart_after_failed_move() {
        let backend = host();
        backend.fail_on_vm("move_disk", VmId(301));
        let converter = CloneConverter::new(backend.clone());

        let report = converter.convert_all(&clones(&backend).await).await;
        assert!(!report.is_complete());
        assert_eq!(report.failed.as_ref().map(|(id, _)| *id), Some(VmId(301)));
        assert_eq!(report.pending, vec![VmId(302)]);
        assert!(report.converted.is_empty());

        assert!(backend.vm_status(VmId(301)).await.unwrap().is_running());
        assert!(backend.calls().contains(&"start_vm 301".to_string()));
    }

    #[tokio::test]
    async fn test_forced_stop_when_guest_ignores_shutdown() {
        let backend = Arc::new(MockBackend::new().with_ignored_graceful_stop());
        backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");
        backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0")],
            VmRunState::Running,
        );
        let converter = CloneConverter::new(backend.clone());

        let report = converter.convert_all(&clones(&backend).await).await;
        assert!(report.is_complete());

        let stops: Vec<String> = backend
            .calls()
            .into_iter()
            .filter(|c| c == "stop_vm 301")
            .collect();
        assert_eq!(stops.len(), 2);
        assert!(backend.vm_status(VmId(301)).await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_restart_when_status_check_fails() {
        let backend = host();
        backend.fail_on_vm("vm_status", VmId(301));
        let converter = CloneConverter::new(backend.clone());

        let report = converter.convert_all(&clones(&backend).await).await;
        assert_eq!(report.failed.as_ref().map(|(id, _)| *id), Some(VmId(301)));
        assert!(backend.calls().contains(&"start_vm 301".to_string()));
        assert!(!backend.calls().iter().any(|c| c.starts_with("move_disk")));

        backend.clear_faults();
        assert!(backend.vm_status(VmId(301)).await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_failed_forced_stop_leaves_vm_running() {
        let backend = Arc::new(MockBackend::new().with_ignored_graceful_stop());
        backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");
        backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0")],
            VmRunState::Running,
        );
        backend.fail_on_vm("stop_vm", VmId(301));
        let converter = CloneConverter::new(backend.clone());

        let report = converter.convert_all(&clones(&backend).await).await;
        assert_eq!(report.failed.as_ref().map(|(id, _)| *id), Some(VmId(301)));
        assert!(report.failed.as_ref().unwrap().1.contains("stop_vm"));
        assert!(backend.vm_status(VmId(301)).await.unwrap().is_running());
        assert!(!backend.calls().iter().any(|c| c.starts_with("move_disk")));
    }
}
