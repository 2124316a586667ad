//! Mounting root filesystems for repair.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LifecycleError, Result};

/// A mounted root filesystem.
///
/// When backed by a scoped temporary directory, the directory is removed once
/// the value is dropped after a successful unmount.
pub struct MountPoint {
    device: PathBuf,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl MountPoint {
    /// A mount at a directory owned by someone else.
    pub fn at(device: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            path: path.into(),
            dir: None,
        }
    }

    /// A mount at a scoped temporary directory.
    pub fn scoped(device: impl Into<PathBuf>, dir: TempDir) -> Self {
        Self {
            device: device.into(),
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Give up ownership of the directory without removing it. Used when the
    /// filesystem could not be unmounted.
    pub fn keep(self) -> PathBuf {
        match self.dir {
            Some(dir) => dir.keep(),
            None => self.path,
        }
    }
}

/// Mounts and unmounts partitions.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `device` read-write at a fresh, uniquely named directory.
    async fn mount(&self, device: &Path) -> Result<MountPoint>;

    /// Flush pending writes to the device.
    async fn sync(&self, mount: &MountPoint) -> Result<()>;

    /// Unmount. On failure the mount point is kept on disk.
    async fn unmount(&self, mount: MountPoint) -> Result<()>;
}

/// Mounter backed by `mount`, `sync` and `umount`.
pub struct HostMounter {
    /// Parent directory for mount points
    base_dir: PathBuf,
}

impl HostMounter {
    pub fn new() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    async fn run(&self, program: &str, args: &[&str], device: &Path) -> Result<()> {
        debug!(command = %program, args = ?args, "Executing mount command");

        let fail = |cause: String| LifecycleError::MountFailed {
            device: device.to_path_buf(),
            cause,
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| fail(format!("failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(command = %program, stderr = %stderr, "Mount command failed");
            return Err(fail(format!("{}: {}", program, stderr)));
        }
        Ok(())
    }
}

impl Default for HostMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mounter for HostMounter {
    #[instrument(skip(self), fields(device = %device.display()))]
    async fn mount(&self, device: &Path) -> Result<MountPoint> {
        let dir = tempfile::Builder::new()
            .prefix("templar-root-")
            .tempdir_in(&self.base_dir)
            .map_err(|e| LifecycleError::MountFailed {
                device: device.to_path_buf(),
                cause: format!("cannot create mount point: {}", e),
            })?;

        let dev = device.to_string_lossy();
        let target = dir.path().to_string_lossy().into_owned();
        self.run("mount", &[&dev, &target], device).await?;

        info!(mount_point = %target, "Root filesystem mounted");
        Ok(MountPoint::scoped(device, dir))
    }

    async fn sync(&self, mount: &MountPoint) -> Result<()> {
        let target = mount.path().to_string_lossy();
        self.run("sync", &["-f", &target], mount.device()).await
    }

    #[instrument(skip(self, mount), fields(mount_point = %mount.path().display()))]
    async fn unmount(&self, mount: MountPoint) -> Result<()> {
        let target = mount.path().to_string_lossy().into_owned();
        let device = mount.device().to_path_buf();
        match self.run("umount", &[&target], &device).await {
            Ok(()) => {
                info!("Root filesystem unmounted");
                Ok(())
            }
            Err(e) => {
                let kept = mount.keep();
                warn!(mount_point = %kept.display(), "Mount point left in place");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_preserves_scoped_dir() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().to_path_buf();
        let mount = MountPoint::scoped("/dev/loop0p1", dir);
        let kept = mount.keep();
        assert_eq!(kept, expected);
        assert!(kept.exists());
        std::fs::remove_dir(kept).unwrap();
    }

    #[test]
    fn test_scoped_dir_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        drop(MountPoint::scoped("/dev/loop0p1", dir));
        assert!(!path.exists());
    }
}
