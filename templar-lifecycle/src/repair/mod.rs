//! Boot configuration repair.
//!
//! Cloud images identify their root filesystem by `PARTUUID=` or
//! `LABEL=cloudimg-rootfs`. Once the disk is imported into a pool those
//! identifiers are not guaranteed to resolve at boot, so they are rewritten to
//! a stable device path in:
//!
//! - `etc/fstab` (plus commenting out active `/boot/efi` mounts)
//! - `boot/grub/grub.cfg`
//! - `etc/default/grub` and `etc/default/grub.d/*.cfg` (plus commenting out
//!   `GRUB_FORCE_PARTUUID=`)
//!
//! Replacement is literal and line based. Files without matches are left
//! alone, and a file is only written when its content actually changes, so a
//! second pass over a repaired tree writes nothing.

mod mount;

pub use mount::{HostMounter, MountPoint, Mounter};

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LifecycleError, Result};
use crate::report::{LeakKind, LeakedResource};

/// Default stable root device.
pub const DEFAULT_ROOT_DEVICE: &str = "/dev/sda1";

static PARTUUID_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"PARTUUID=[^\s"']+"#).expect("static regex"));
static CLOUDIMG_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LABEL=cloudimg-rootfs\b").expect("static regex"));
static ROOT_PARTUUID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"root=PARTUUID=[^\s"']+"#).expect("static regex"));
static ROOT_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"root=LABEL=cloudimg-rootfs\b").expect("static regex"));
static FORCE_PARTUUID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*GRUB_FORCE_PARTUUID=").expect("static regex"));

/// Repair settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    /// Device path written in place of PARTUUID/LABEL references
    pub root_device: String,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            root_device: DEFAULT_ROOT_DEVICE.to_string(),
        }
    }
}

/// What a repair pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Boot configuration files found in the tree
    pub files_scanned: usize,
    /// Files rewritten, relative to the filesystem root
    pub files_changed: Vec<String>,
}

impl RepairReport {
    /// Nothing needed rewriting.
    pub fn is_noop(&self) -> bool {
        self.files_changed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Rules {
    Fstab,
    GrubCfg,
    DefaultGrub,
}

/// Rewrite boot references under a mounted root filesystem.
pub fn repair_root(root: &Path, root_device: &str) -> Result<RepairReport> {
    let mut report = RepairReport::default();

    for (relative, rules) in targets(root)? {
        let path = root.join(&relative);
        if !path.exists() {
            continue;
        }
        report.files_scanned += 1;

        let io_err = |source| LifecycleError::RepairFailed {
            path: path.clone(),
            source,
        };
        let bytes = std::fs::read(&path).map_err(io_err)?;
        let Ok(original) = String::from_utf8(bytes) else {
            warn!(file = %relative, "Skipping boot file that is not UTF-8");
            continue;
        };

        let patched = apply(rules, &original, root_device);
        if patched == original {
            debug!(file = %relative, "No boot references to rewrite");
            continue;
        }

        std::fs::write(&path, patched).map_err(io_err)?;
        info!(file = %relative, device = %root_device, "Rewrote boot references");
        report.files_changed.push(relative);
    }

    Ok(report)
}

/// Files to inspect, relative to the root.
fn targets(root: &Path) -> Result<Vec<(String, Rules)>> {
    let mut targets = vec![
        ("etc/fstab".to_string(), Rules::Fstab),
        ("boot/grub/grub.cfg".to_string(), Rules::GrubCfg),
        ("etc/default/grub".to_string(), Rules::DefaultGrub),
    ];

    let dropins = root.join("etc/default/grub.d");
    if dropins.is_dir() {
        let entries = std::fs::read_dir(&dropins).map_err(|source| LifecycleError::RepairFailed {
            path: dropins.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".cfg"))
            .collect();
        names.sort();
        targets.extend(
            names
                .into_iter()
                .map(|n| (format!("etc/default/grub.d/{}", n), Rules::DefaultGrub)),
        );
    }

    Ok(targets)
}

fn apply(rules: Rules, text: &str, device: &str) -> String {
    match rules {
        Rules::Fstab => map_lines(text, |line| patch_fstab_line(line, device)),
        Rules::GrubCfg => patch_kernel_root(text, device),
        Rules::DefaultGrub => {
            let patched = patch_kernel_root(text, device);
            map_lines(&patched, |line| {
                if FORCE_PARTUUID.is_match(line) {
                    format!("#{}", line)
                } else {
                    line.to_string()
                }
            })
        }
    }
}

/// Apply `f` to every line, keeping line endings as they were.
fn map_lines(text: &str, f: impl Fn(&str) -> String) -> String {
    text.split_inclusive('\n').map(f).collect()
}

fn patch_fstab_line(line: &str, device: &str) -> String {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return line.to_string();
    }
    if trimmed.split_whitespace().nth(1) == Some("/boot/efi") {
        return format!("#{}", line);
    }
    let patched = PARTUUID_REF.replace_all(line, NoExpand(device));
    CLOUDIMG_LABEL.replace_all(&patched, NoExpand(device)).into_owned()
}

fn patch_kernel_root(text: &str, device: &str) -> String {
    let replacement = format!("root={}", device);
    let patched = ROOT_PARTUUID.replace_all(text, NoExpand(&replacement));
    ROOT_LABEL.replace_all(&patched, NoExpand(&replacement)).into_owned()
}

/// Mounts a root partition, repairs it and unmounts it again.
pub struct BootConfigRepairer {
    mounter: Arc<dyn Mounter>,
    settings: RepairSettings,
}

impl BootConfigRepairer {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self {
            mounter,
            settings: RepairSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RepairSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Repair the filesystem on `partition`.
    ///
    /// Sync and unmount run whenever the mount succeeded. The first error
    /// wins; an unmount failure is also pushed to `leaks`.
    #[instrument(skip(self, leaks), fields(partition = %partition.display()))]
    pub async fn repair(&self, partition: &Path, leaks: &mut Vec<LeakedResource>) -> Result<RepairReport> {
        let mount = self.mounter.mount(partition).await?;

        let patched = repair_root(mount.path(), &self.settings.root_device);
        let synced = self.mounter.sync(&mount).await;

        let target = mount.path().display().to_string();
        let unmounted = self.mounter.unmount(mount).await;

        if let Err(e) = &unmounted {
            error!(mount_point = %target, error = %e, "Failed to unmount repaired filesystem");
            leaks.push(LeakedResource::new(LeakKind::Mount, target, e));
        }

        let report = match (patched, synced) {
            (Err(e), synced) => {
                if let Err(sync_err) = synced {
                    error!(error = %sync_err, "Sync after failed repair also failed");
                }
                return Err(e);
            }
            (Ok(_), Err(e)) => return Err(e),
            (Ok(report), Ok(())) => report,
        };
        unmounted?;

        if report.is_noop() {
            info!("Boot configuration already uses stable device paths");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockMounter, MountFaults};

    const FSTAB: &str = "\
# /etc/fstab: static file system information.
LABEL=cloudimg-rootfs\t/\text4\tdiscard,errors=remount-ro\t0 1
LABEL=UEFI\t/boot/efi\tvfat\tumask=0077\t0 1
";

    const GRUB_CFG: &str = "\
menuentry 'Ubuntu' {
\tsearch --no-floppy --fs-uuid --set=root 6a3b1c2d
\tlinux\t/boot/vmlinuz-5.15.0-91-generic root=PARTUUID=1f2e3d4c-01 ro console=tty1 console=ttyS0
\tinitrd\t/boot/initrd.img-5.15.0-91-generic
}
";

    const FORCE_PARTUUID_CFG: &str = "\
# Force the use of PARTUUID when booting without an initrd
GRUB_FORCE_PARTUUID=1f2e3d4c-01
";

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read(root: &Path, relative: &str) -> String {
        std::fs::read_to_string(root.join(relative)).unwrap()
    }

    fn cloud_image_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "etc/fstab", FSTAB);
        write(dir.path(), "boot/grub/grub.cfg", GRUB_CFG);
        write(dir.path(), "etc/default/grub", "GRUB_TIMEOUT=0\nGRUB_CMDLINE_LINUX=\"\"\n");
        write(dir.path(), "etc/default/grub.d/40-force-partuuid.cfg", FORCE_PARTUUID_CFG);
        write(dir.path(), "etc/default/grub.d/50-cloudimg-settings.cfg", "GRUB_TERMINAL=console\n");
        dir
    }

    #[test]
    fn test_fstab_rewrite() {
        let dir = cloud_image_tree();
        repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        assert_eq!(
            read(dir.path(), "etc/fstab"),
            "\
# /etc/fstab: static file system information.
/dev/sda1\t/\text4\tdiscard,errors=remount-ro\t0 1
#LABEL=UEFI\t/boot/efi\tvfat\tumask=0077\t0 1
"
        );
    }

    #[test]
    fn test_partuuid_fstab_root_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "etc/fstab", "PARTUUID=1234-01 / ext4 defaults 0 1\n");
        repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        assert_eq!(read(dir.path(), "etc/fstab"), "/dev/sda1 / ext4 defaults 0 1\n");
    }

    #[test]
    fn test_grub_rewrite_preserves_other_bytes() {
        let dir = cloud_image_tree();
        repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        assert_eq!(
            read(dir.path(), "boot/grub/grub.cfg"),
            GRUB_CFG.replace("root=PARTUUID=1f2e3d4c-01", "root=/dev/sda1")
        );
    }

    #[test]
    fn test_force_partuuid_commented_out() {
        let dir = cloud_image_tree();
        let report = repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        assert_eq!(
            read(dir.path(), "etc/default/grub.d/40-force-partuuid.cfg"),
            "# Force the use of PARTUUID when booting without an initrd\n#GRUB_FORCE_PARTUUID=1f2e3d4c-01\n"
        );
        assert_eq!(report.files_scanned, 5);
        assert_eq!(
            report.files_changed,
            vec![
                "etc/fstab",
                "boot/grub/grub.cfg",
                "etc/default/grub.d/40-force-partuuid.cfg"
            ]
        );
    }

    #[test]
    fn test_second_pass_writes_nothing() {
        let dir = cloud_image_tree();
        repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        let before: Vec<String> = ["etc/fstab", "boot/grub/grub.cfg", "etc/default/grub.d/40-force-partuuid.cfg"]
            .iter()
            .map(|f| read(dir.path(), f))
            .collect();

        let second = repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        assert!(second.is_noop());
        let after: Vec<String> = ["etc/fstab", "boot/grub/grub.cfg", "etc/default/grub.d/40-force-partuuid.cfg"]
            .iter()
            .map(|f| read(dir.path(), f))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_missing_files_are_noop() {
        let dir = tempfile::tempdir().unwrap();
        let report = repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap();
        assert_eq!(report, RepairReport::default());
    }

    #[test]
    fn test_custom_root_device() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "etc/fstab", "LABEL=cloudimg-rootfs / ext4 defaults 0 1\n");
        repair_root(dir.path(), "/dev/vda1").unwrap();
        assert_eq!(read(dir.path(), "etc/fstab"), "/dev/vda1 / ext4 defaults 0 1\n");
    }

    #[test]
    fn test_unreadable_file_is_repair_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/fstab")).unwrap();
        let err = repair_root(dir.path(), DEFAULT_ROOT_DEVICE).unwrap_err();
        assert!(matches!(err, LifecycleError::RepairFailed { .. }));
    }

    #[tokio::test]
    async fn test_repairer_mounts_syncs_unmounts() {
        let dir = cloud_image_tree();
        let mounter = Arc::new(MockMounter::new(dir.path()));
        let repairer = BootConfigRepairer::new(mounter.clone());
        let mut leaks = Vec::new();

        let report = repairer.repair(Path::new("/dev/loop7p1"), &mut leaks).await.unwrap();
        assert!(!report.is_noop());
        assert_eq!(mounter.calls(), vec!["mount", "sync", "unmount"]);
        assert!(leaks.is_empty());
    }

    #[tokio::test]
    async fn test_unmount_runs_after_patch_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/fstab")).unwrap();
        let mounter = Arc::new(MockMounter::new(dir.path()));
        let repairer = BootConfigRepairer::new(mounter.clone());

        let err = repairer
            .repair(Path::new("/dev/loop7p1"), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::RepairFailed { .. }));
        assert_eq!(mounter.calls(), vec!["mount", "sync", "unmount"]);
    }

    #[tokio::test]
    async fn test_unmount_failure_is_leak_and_error() {
        let dir = cloud_image_tree();
        let mounter = Arc::new(MockMounter::new(dir.path()).with_faults(MountFaults {
            unmount: true,
            ..MountFaults::default()
        }));
        let repairer = BootConfigRepairer::new(mounter.clone());
        let mut leaks = Vec::new();

        let err = repairer.repair(Path::new("/dev/loop7p1"), &mut leaks).await.unwrap_err();
        assert!(matches!(err, LifecycleError::MountFailed { .. }));
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].kind, LeakKind::Mount);
    }

    #[tokio::test]
    async fn test_sync_failure_does_not_hide_patch_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/fstab")).unwrap();
        let mounter = Arc::new(MockMounter::new(dir.path()).with_faults(MountFaults {
            sync: true,
            ..MountFaults::default()
        }));
        let repairer = BootConfigRepairer::new(mounter.clone());

        let err = repairer
            .repair(Path::new("/dev/loop7p1"), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::RepairFailed { .. }));
        assert_eq!(mounter.calls(), vec!["mount", "sync", "unmount"]);
    }
}
