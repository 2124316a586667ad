//! Per-template state machine.
//!
//! ```text
//!   Absent ──▶ Importing ──▶ Repairing ──▶ Templated
//!     │            │             │
//!     └────────────┴─────────────┴──────▶ Failed
//! ```
//!
//! Templates are processed one after another. A failure ends only that
//! template's run; once its VM shell exists, the shell is destroyed again so
//! the fixed id is free for the next attempt.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use templar_hypervisor::{
    AuxDevice, HypervisorClient, StorageKind, StoragePool, StorageResolver, VmId, VmSpecs,
};

use crate::cache::{CacheEntry, ImageProvider};
use crate::clones::LinkedCloneResolver;
use crate::converter::CloneConverter;
use crate::decision::DecisionStrategy;
use crate::device::{AttachSettings, DeviceAttacher, DeviceTools};
use crate::error::{LifecycleError, Result};
use crate::registry::TemplateSpec;
use crate::repair::{BootConfigRepairer, Mounter, RepairReport, RepairSettings};
use crate::report::{BatchReport, LeakKind, LeakedResource, LifecycleState, Outcome, TemplateReport};

/// Template VM settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    /// Hardware of the template VM
    #[serde(flatten)]
    pub specs: VmSpecs,
    /// Attach a cloud-init drive on the template's pool
    pub cloud_init: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            specs: VmSpecs::default(),
            cloud_init: true,
        }
    }
}

/// What to do with an id that may already be taken.
enum Slot {
    Free,
    Skip(String),
}

/// Drives templates through import, repair and conversion.
pub struct Orchestrator {
    client: Arc<dyn HypervisorClient>,
    images: Arc<dyn ImageProvider>,
    decisions: Arc<dyn DecisionStrategy>,
    attacher: DeviceAttacher,
    repairer: BootConfigRepairer,
    clones: LinkedCloneResolver,
    converter: CloneConverter,
    vm: VmSettings,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn HypervisorClient>,
        images: Arc<dyn ImageProvider>,
        tools: Arc<dyn DeviceTools>,
        mounter: Arc<dyn Mounter>,
        decisions: Arc<dyn DecisionStrategy>,
    ) -> Self {
        Self {
            attacher: DeviceAttacher::new(tools),
            repairer: BootConfigRepairer::new(mounter),
            clones: LinkedCloneResolver::new(client.clone()),
            converter: CloneConverter::new(client.clone()),
            client,
            images,
            decisions,
            vm: VmSettings::default(),
        }
    }

    pub fn with_vm_settings(mut self, vm: VmSettings) -> Self {
        self.vm = vm;
        self
    }

    pub fn with_attach_settings(mut self, settings: AttachSettings) -> Self {
        self.attacher = self.attacher.with_settings(settings);
        self
    }

    pub fn with_repair_settings(mut self, settings: RepairSettings) -> Self {
        self.repairer = self.repairer.with_settings(settings);
        self
    }

    /// Grace period for stopping linked clones before conversion.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.converter = self.converter.with_stop_timeout(timeout);
        self
    }

    /// Resolve the pool templates are imported into, once per run.
    ///
    /// A named pool must exist; if its layout cannot be determined the
    /// operator has to confirm it. Without a name the pool is auto-selected.
    #[instrument(skip(self))]
    pub async fn resolve_storage(&self, requested: Option<&str>) -> Result<StoragePool> {
        let resolver = StorageResolver::new(self.client.list_storage().await?);

        let pool = match requested {
            Some(name) => {
                if !resolver.contains(name) {
                    return Err(LifecycleError::Storage(format!(
                        "storage pool '{}' does not exist",
                        name
                    )));
                }
                let pool = resolver.classify(name);
                if pool.kind == StorageKind::Unknown {
                    warn!(pool = %pool.name, "Storage layout could not be determined");
                    if !self.decisions.confirm_unknown_storage(&pool) {
                        return Err(LifecycleError::Storage(format!(
                            "layout of storage pool '{}' is unknown and was not confirmed",
                            name
                        )));
                    }
                }
                pool
            }
            None => resolver.auto_select().ok_or_else(|| {
                LifecycleError::Storage("no active file-backed or block-device pool found".to_string())
            })?,
        };

        info!(pool = %pool.name, kind = %pool.kind, "Using storage pool for templates");
        Ok(pool)
    }

    /// Process every template. One template's failure never stops the others.
    pub async fn run(&self, templates: &[TemplateSpec], pool: &StoragePool) -> BatchReport {
        let mut report = BatchReport::new();

        for spec in templates {
            let outcome = self.provision(spec, pool, &mut report.leaked).await;
            match &outcome {
                Outcome::Templated { repair } => info!(
                    template = %spec.name,
                    vm_id = %spec.vm_id,
                    files_changed = repair.files_changed.len(),
                    "Template ready"
                ),
                Outcome::Skipped { reason } => {
                    info!(template = %spec.name, vm_id = %spec.vm_id, reason = %reason, "Template skipped")
                }
                Outcome::Failed { stage, error } => error!(
                    template = %spec.name,
                    vm_id = %spec.vm_id,
                    stage = %stage,
                    error = %error,
                    "Template failed"
                ),
            }
            report.record(TemplateReport {
                name: spec.name.clone(),
                vm_id: spec.vm_id,
                outcome,
            });
        }

        let (templated, skipped, failed) = report.counts();
        info!(templated, skipped, failed, leaked = report.leaked.len(), "Batch finished");
        report
    }

    /// Destroy a VM unless linked clones still depend on it.
    ///
    /// Dependents are looked up again right before the destroy call.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn guarded_destroy(&self, vm_id: VmId, purge: bool) -> Result<()> {
        let remaining = self.clones.resolve(vm_id).await?;
        if !remaining.is_empty() {
            let clones: Vec<VmId> = remaining.iter().map(|c| c.vm_id).collect();
            warn!(clones = ?clones, "Refusing to destroy template with linked clones");
            return Err(LifecycleError::DependentCloneBlocking { template: vm_id, clones });
        }
        self.client.destroy_vm(vm_id, purge).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(template = %spec.name, vm_id = %spec.vm_id, pool = %pool.name))]
    async fn provision(&self, spec: &TemplateSpec, pool: &StoragePool, leaks: &mut Vec<LeakedResource>) -> Outcome {
        let mut stage = LifecycleState::Absent;
        let failed = |stage: LifecycleState, e: LifecycleError| Outcome::Failed {
            stage,
            error: e.to_string(),
        };

        match self.clear_slot(spec).await {
            Ok(Slot::Free) => {}
            Ok(Slot::Skip(reason)) => return Outcome::Skipped { reason },
            Err(e) => return failed(stage, e),
        }

        transition(&mut stage, LifecycleState::Importing);
        let image = match self.images.ensure(spec).await {
            Ok(image) => image,
            Err(e) => return failed(stage, e),
        };

        if let Err(e) = self.client.create_vm(spec.vm_id, &spec.name, &self.vm.specs).await {
            return failed(stage, LifecycleError::ImportFailed(e));
        }

        match self.build(spec, pool, &image, &mut stage, leaks).await {
            Ok(repair) => {
                transition(&mut stage, LifecycleState::Templated);
                Outcome::Templated { repair }
            }
            Err(e) => {
                let failed_in = stage;
                transition(&mut stage, LifecycleState::Failed);
                if let Err(cleanup) = self.guarded_destroy(spec.vm_id, true).await {
                    error!(error = %cleanup, "Failed to destroy partially built VM");
                    leaks.push(LeakedResource::new(LeakKind::Vm, spec.vm_id.to_string(), cleanup));
                } else {
                    info!("Partially built VM destroyed");
                }
                failed(failed_in, e)
            }
        }
    }

    /// Make the template's id available, replacing an existing VM if the
    /// operator agrees. Only a template of the same name is ever replaced.
    async fn clear_slot(&self, spec: &TemplateSpec) -> Result<Slot> {
        let vms = self.client.list_vms().await?;
        let Some(existing) = vms.into_iter().find(|vm| vm.vm_id == spec.vm_id) else {
            return Ok(Slot::Free);
        };

        info!(name = %existing.name, "VM id already in use");
        let config = self.client.get_vm_config(existing.vm_id).await?;
        if existing.name != spec.name || !config.is_template() {
            return Err(LifecycleError::VmIdConflict {
                vm_id: existing.vm_id,
                existing: existing.name,
                template: spec.name.clone(),
            });
        }

        if !self.decisions.should_update(spec, &existing) {
            return Ok(Slot::Skip(format!("existing VM {} kept", existing.vm_id)));
        }

        let clones = self.clones.resolve(spec.vm_id).await?;
        if !clones.is_empty() {
            if !self.decisions.should_convert_clones(spec, &clones) {
                let blocking = LifecycleError::DependentCloneBlocking {
                    template: spec.vm_id,
                    clones: clones.iter().map(|c| c.vm_id).collect(),
                };
                warn!(error = %blocking, "Linked clone conversion declined");
                return Ok(Slot::Skip(blocking.to_string()));
            }

            let report = self.converter.convert_all(&clones).await;
            if let Some((failed, cause)) = report.failed {
                return Err(LifecycleError::CloneConversionFailed {
                    template: spec.vm_id,
                    converted: report.converted,
                    failed,
                    pending: report.pending,
                    cause,
                });
            }
        }

        self.guarded_destroy(spec.vm_id, true).await?;
        info!("Existing template destroyed");
        Ok(Slot::Free)
    }

    /// Import, repair and convert. The VM shell already exists.
    async fn build(
        &self,
        spec: &TemplateSpec,
        pool: &StoragePool,
        image: &CacheEntry,
        stage: &mut LifecycleState,
        leaks: &mut Vec<LeakedResource>,
    ) -> Result<RepairReport> {
        let volume = self
            .client
            .import_disk(spec.vm_id, &image.local_path, pool)
            .await
            .map_err(LifecycleError::ImportFailed)?;

        let aux = if self.vm.cloud_init {
            vec![AuxDevice::cloud_init(&pool.name)]
        } else {
            Vec::new()
        };
        self.client
            .set_disk_and_boot(spec.vm_id, &volume, &aux)
            .await
            .map_err(LifecycleError::ImportFailed)?;

        transition(stage, LifecycleState::Repairing);
        let host_path = self.client.volume_path(&volume).await?;
        let attached = self.attacher.attach(&volume, pool.kind, &host_path, leaks).await?;

        let repaired = self.repairer.repair(attached.root_partition(), leaks).await;

        let device = attached.mechanism().device().display().to_string();
        let released = attached.release().await;
        if let Err(e) = &released {
            leaks.push(LeakedResource::new(LeakKind::Device, device, e));
        }

        let repair = repaired?;
        released?;

        self.client
            .convert_to_template(spec.vm_id)
            .await
            .map_err(LifecycleError::TemplateConversionFailed)?;
        Ok(repair)
    }
}

fn transition(stage: &mut LifecycleState, next: LifecycleState) {
    info!(from = %stage, to = %next, "Template state change");
    *stage = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::FixedDecisions;
    use crate::mock::{MockDeviceTools, MockMounter, MountFaults, StaticImages};
    use crate::registry::TemplateRegistry;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use templar_hypervisor::{MockBackend, VmRunState};

    struct Host {
        backend: Arc<MockBackend>,
        tools: Arc<MockDeviceTools>,
        mounter: Arc<MockMounter>,
        root: tempfile::TempDir,
    }

    impl Host {
        fn new(backend: MockBackend, tools: MockDeviceTools, faults: MountFaults) -> Self {
            let root = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(root.path().join("etc")).unwrap();
            std::fs::write(root.path().join("etc/fstab"), "PARTUUID=1234-01 / ext4 defaults 0 1\n").unwrap();
            Self {
                backend: Arc::new(backend),
                tools: Arc::new(tools),
                mounter: Arc::new(MockMounter::new(root.path()).with_faults(faults)),
                root,
            }
        }

        fn orchestrator(&self, decisions: FixedDecisions) -> Orchestrator {
            Orchestrator::new(
                self.backend.clone(),
                Arc::new(StaticImages::new("/var/cache/templar")),
                self.tools.clone(),
                self.mounter.clone(),
                Arc::new(decisions),
            )
            .with_attach_settings(AttachSettings {
                partition_wait_polls: 3,
                partition_wait_interval_ms: 1,
            })
            .with_stop_timeout(Duration::from_millis(10))
        }

        fn fstab(&self) -> String {
            std::fs::read_to_string(self.root.path().join("etc/fstab")).unwrap()
        }
    }

    fn ubuntu() -> TemplateSpec {
        TemplateRegistry::builtin().get("ubuntu-22.04-standard").unwrap().clone()
    }

    fn local() -> StoragePool {
        StoragePool::new("local", StorageKind::FileBacked)
    }

    #[tokio::test]
    async fn test_fresh_template() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        let orchestrator = host.orchestrator(FixedDecisions::decline_all());

        let report = orchestrator.run(&[ubuntu()], &local()).await;
        let result = report.get("ubuntu-22.04-standard").unwrap();
        assert_eq!(result.final_state(), Some(LifecycleState::Templated));
        assert_eq!(host.fstab(), "/dev/sda1 / ext4 defaults 0 1\n");

        let config = host.backend.vm(VmId(9000)).unwrap();
        assert!(config.is_template());
        assert_eq!(config.get("boot"), Some("order=scsi0"));
        assert_eq!(config.get("ide2"), Some("local:vm-9000-cloudinit,media=cdrom"));
        assert_eq!(host.tools.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_release_once_under_mount_faults() {
        let cases = [
            MountFaults { mount: true, ..MountFaults::default() },
            MountFaults { sync: true, ..MountFaults::default() },
            MountFaults { unmount: true, ..MountFaults::default() },
        ];
        for faults in cases {
            let host = Host::new(MockBackend::new(), MockDeviceTools::new(), faults);
            let report = host
                .orchestrator(FixedDecisions::decline_all())
                .run(&[ubuntu()], &local())
                .await;

            assert!(report.has_failures());
            assert_eq!(host.tools.count("losetup -P"), 1);
            assert_eq!(host.tools.count("losetup -d"), 1);
            assert!(host.backend.vm(VmId(9000)).is_none(), "failed VM must be destroyed");
        }
    }

    #[tokio::test]
    async fn test_release_once_when_patch_fails() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        std::fs::remove_file(host.root.path().join("etc/fstab")).unwrap();
        std::fs::create_dir_all(host.root.path().join("etc/fstab")).unwrap();

        let report = host
            .orchestrator(FixedDecisions::decline_all())
            .run(&[ubuntu()], &local())
            .await;

        match &report.get("ubuntu-22.04-standard").unwrap().outcome {
            Outcome::Failed { stage, .. } => assert_eq!(*stage, LifecycleState::Repairing),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(host.mounter.calls(), vec!["mount", "sync", "unmount"]);
        assert_eq!(host.tools.count("losetup -d"), 1);
    }

    #[tokio::test]
    async fn test_unmount_failure_recorded_as_leak() {
        let host = Host::new(
            MockBackend::new(),
            MockDeviceTools::new(),
            MountFaults { unmount: true, ..MountFaults::default() },
        );
        let report = host
            .orchestrator(FixedDecisions::decline_all())
            .run(&[ubuntu()], &local())
            .await;
        assert_eq!(report.leaked.len(), 1);
        assert_eq!(report.leaked[0].kind, LeakKind::Mount);
    }

    #[tokio::test]
    async fn test_existing_template_kept_when_update_declined() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        host.backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");

        let report = host
            .orchestrator(FixedDecisions::decline_all())
            .run(&[ubuntu()], &local())
            .await;
        assert!(matches!(
            report.get("ubuntu-22.04-standard").unwrap().outcome,
            Outcome::Skipped { .. }
        ));
        assert!(!host.backend.calls().iter().any(|c| c.starts_with("destroy_vm")));
    }

    #[tokio::test]
    async fn test_foreign_vm_on_template_id_is_never_destroyed() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        host.backend.insert_vm(
            VmId(9000),
            "prod-db",
            [("scsi0", "local-lvm:vm-9000-disk-0,size=500G")],
            VmRunState::Running,
        );

        let report = host
            .orchestrator(FixedDecisions::assume_yes())
            .run(&[ubuntu()], &local())
            .await;
        match &report.get("ubuntu-22.04-standard").unwrap().outcome {
            Outcome::Failed { stage, error } => {
                assert_eq!(*stage, LifecycleState::Absent);
                assert!(error.contains("prod-db"), "{error}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let calls = host.backend.calls();
        assert!(!calls.iter().any(|c| c.starts_with("destroy_vm") || c.starts_with("create_vm")));
        let vm = host.backend.vm(VmId(9000)).unwrap();
        assert_eq!(vm.name(), Some("prod-db"));
        assert_eq!(vm.get("scsi0"), Some("local-lvm:vm-9000-disk-0,size=500G"));
    }

    #[tokio::test]
    async fn test_same_name_non_template_is_not_replaced() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        host.backend.insert_vm(
            VmId(9000),
            "ubuntu-22.04-standard",
            [("scsi0", "local-lvm:vm-9000-disk-0,size=2252M")],
            VmRunState::Stopped,
        );

        let report = host
            .orchestrator(FixedDecisions::assume_yes())
            .run(&[ubuntu()], &local())
            .await;
        assert_eq!(report.counts(), (0, 0, 1));
        assert!(!host.backend.calls().contains(&"destroy_vm 9000".to_string()));
    }

    #[tokio::test]
    async fn test_conversion_failure_leaves_template() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        host.backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");
        host.backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0")],
            VmRunState::Running,
        );
        host.backend.fail_on_vm("move_disk", VmId(301));

        let report = host
            .orchestrator(FixedDecisions::assume_yes())
            .run(&[ubuntu()], &local())
            .await;
        let result = report.get("ubuntu-22.04-standard").unwrap();
        match &result.outcome {
            Outcome::Failed { stage, error } => {
                assert_eq!(*stage, LifecycleState::Absent);
                assert!(error.contains("301"), "{error}");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(host.backend.vm(VmId(9000)).unwrap().is_template());
        assert!(host.backend.vm_status(VmId(301)).await.unwrap().is_running());
        assert!(!host.backend.calls().contains(&"destroy_vm 9000".to_string()));
    }

    #[tokio::test]
    async fn test_update_with_converted_clones() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        host.backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");
        host.backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0")],
            VmRunState::Running,
        );

        let report = host
            .orchestrator(FixedDecisions::assume_yes())
            .run(&[ubuntu()], &local())
            .await;
        assert_eq!(
            report.get("ubuntu-22.04-standard").unwrap().final_state(),
            Some(LifecycleState::Templated)
        );
        assert_eq!(
            host.backend.vm(VmId(9000)).unwrap().get("scsi0"),
            Some("local:9000/base-9000-disk-0.raw")
        );
        assert!(host.backend.vm_status(VmId(301)).await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_guarded_destroy_refuses_with_clones() {
        let host = Host::new(MockBackend::new(), MockDeviceTools::new(), MountFaults::default());
        host.backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");
        host.backend.insert_vm(
            VmId(301),
            "web-1",
            [("scsi0", "local-lvm:base-9000-disk-0/vm-301-disk-0")],
            VmRunState::Stopped,
        );

        let err = host
            .orchestrator(FixedDecisions::assume_yes())
            .guarded_destroy(VmId(9000), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::DependentCloneBlocking { template: VmId(9000), ref clones } if clones == &vec![VmId(301)]
        ));
        assert!(!host.backend.calls().contains(&"destroy_vm 9000".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_storage() {
        let backend = MockBackend::new().with_storage(vec![
            MockBackend::pool_status("local", "dir"),
            MockBackend::pool_status("nas", "cifs"),
        ]);
        let host = Host::new(backend, MockDeviceTools::new(), MountFaults::default());

        let declining = host.orchestrator(FixedDecisions::decline_all());
        assert_eq!(declining.resolve_storage(None).await.unwrap().name, "local");
        assert!(matches!(
            declining.resolve_storage(Some("nas")).await,
            Err(LifecycleError::Storage(_))
        ));
        assert!(matches!(
            declining.resolve_storage(Some("missing")).await,
            Err(LifecycleError::Storage(_))
        ));

        let confirming = host.orchestrator(FixedDecisions::assume_yes());
        let pool = confirming.resolve_storage(Some("nas")).await.unwrap();
        assert_eq!(pool.kind, StorageKind::Unknown);
    }

    /// Random hosts: a template with some linked clones, some of which fail
    /// to convert, under random operator answers. The template is destroyed
    /// exactly when every clone was converted first.
    #[tokio::test]
    async fn test_destroy_never_reached_with_unconverted_clones() {
        let mut rng = StdRng::seed_from_u64(0x7e3a_11ce);

        for round in 0..64 {
            let backend = MockBackend::new();
            backend.insert_template(VmId(9000), "ubuntu-22.04-standard", "local-lvm");

            let mut linked = Vec::new();
            let mut failing = Vec::new();
            for i in 0..rng.gen_range(0..6u32) {
                let vm_id = VmId(300 + i);
                let run_state = if rng.gen_bool(0.5) {
                    VmRunState::Running
                } else {
                    VmRunState::Stopped
                };
                if rng.gen_bool(0.6) {
                    let disk = format!("local-lvm:base-9000-disk-0/vm-{}-disk-0", vm_id);
                    backend.insert_vm(vm_id, "clone", [("scsi0", disk.as_str())], run_state);
                    linked.push(vm_id);
                    if rng.gen_bool(0.2) {
                        backend.fail_on_vm("move_disk", vm_id);
                        failing.push(vm_id);
                    }
                } else {
                    let disk = format!("local-lvm:vm-{}-disk-0", vm_id);
                    backend.insert_vm(vm_id, "independent", [("scsi0", disk.as_str())], run_state);
                }
            }

            let decisions = FixedDecisions {
                update_existing: rng.gen_bool(0.8),
                convert_clones: rng.gen_bool(0.5),
                allow_unknown_storage: false,
            };
            let host = Host::new(backend, MockDeviceTools::new(), MountFaults::default());
            host.orchestrator(decisions).run(&[ubuntu()], &local()).await;

            // Clones are converted in id order; a failure stops the batch.
            let first_failure = linked.iter().position(|id| failing.contains(id));
            let all_converted = decisions.convert_clones && first_failure.is_none();
            let expect_destroy = decisions.update_existing && (linked.is_empty() || all_converted);

            let destroyed = host.backend.calls().contains(&"destroy_vm 9000".to_string());
            assert_eq!(destroyed, expect_destroy, "round {round}: linked {linked:?}, failing {failing:?}, {decisions:?}");
        }
    }
}
