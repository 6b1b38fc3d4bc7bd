//! Block Device Manager: attaches a disk image, mounts its volumes read-only
//! into a scratch area, and guarantees that everything is released again.

mod ops;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use ops::{DeviceOps, OpsError, SystemOps, Volume};

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Disk image not found: {0}")]
    NotFound(PathBuf),

    #[error("Disk image {path} is not readable: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Disk image {path} is not a recognized disk or volume format: {reason}")]
    UnrecognizedFormat { path: PathBuf, reason: String },

    #[error("Summed volume size {total} exceeds the mount budget of {budget} bytes")]
    BudgetExceeded { total: u64, budget: u64 },

    #[error("Device operation failed: {0}")]
    Ops(#[from] OpsError),
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("Unable to create scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A disk image queued for one analysis invocation.
///
/// `max_mount_size` bounds the summed size of all discoverable volumes so a
/// corrupt or adversarial image cannot exhaust the host's resources.
#[derive(Debug, Clone)]
pub struct DiskImage {
    pub path: PathBuf,
    pub max_mount_size: u64,
}

/// A filesystem from the image, exposed read-only at a scratch path.
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub device: String,
    pub target: PathBuf,
    pub fstype: Option<String>,
}

/// An attached, kernel-visible block device backing one disk image.
///
/// Owns its mountpoints. Dropping the handle tears everything down, so a
/// caller that bails out mid-pipeline (errors, panics, cancellation) still
/// releases the device and all mounts. [`BlockDevice::detach`] is idempotent
/// and never fails; unmount/detach trouble is logged instead of propagated.
pub struct BlockDevice {
    ops: Arc<dyn DeviceOps>,
    device: Option<String>,
    volumes: Vec<Volume>,
    mounts: Vec<MountPoint>,
    scratch: PathBuf,
}

impl BlockDevice {
    /// Attaches `image` and enumerates its volumes.
    ///
    /// The volume size budget is checked here, before any mount is attempted;
    /// an over-budget image is detached again and rejected.
    pub fn attach(
        ops: Arc<dyn DeviceOps>,
        image: &DiskImage,
        scratch_root: &Path,
    ) -> Result<Self, AttachError> {
        if !image.path.exists() {
            return Err(AttachError::NotFound(image.path.clone()));
        }
        let mut probe = [0u8; 512];
        fs::File::open(&image.path)
            .and_then(|mut f| f.read(&mut probe))
            .map_err(|source| AttachError::Unreadable {
                path: image.path.clone(),
                source,
            })?;

        let device = ops
            .attach(&image.path)
            .map_err(|e| AttachError::UnrecognizedFormat {
                path: image.path.clone(),
                reason: e.to_string(),
            })?;
        debug!("attached {} as {}", image.path.display(), device);

        let volumes = match ops.volumes(&device) {
            Ok(volumes) => volumes,
            Err(e) => {
                if let Err(detach_err) = ops.detach(&device) {
                    warn!("detach of {} after enumeration failure: {}", device, detach_err);
                }
                return Err(AttachError::Ops(e));
            }
        };

        let total: u64 = volumes.iter().map(|v| v.size).sum();
        if total > image.max_mount_size {
            if let Err(detach_err) = ops.detach(&device) {
                warn!("detach of over-budget device {}: {}", device, detach_err);
            }
            return Err(AttachError::BudgetExceeded {
                total,
                budget: image.max_mount_size,
            });
        }

        // Short unique suffix: overlay mount option strings are length-limited,
        // so scratch paths have to stay compact while never colliding across
        // concurrent invocations.
        let mut suffix = Uuid::new_v4().simple().to_string();
        suffix.truncate(6);
        Ok(Self {
            ops,
            device: Some(device),
            volumes,
            mounts: Vec::new(),
            scratch: scratch_root.join(suffix),
        })
    }

    /// Volumes discovered on the attached device.
    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// Mounts every volume read-only under the scratch directory.
    ///
    /// A volume that refuses to mount (unsupported filesystem, corruption) is
    /// logged and skipped; an empty result means the image simply has nothing
    /// to analyze and is not an error.
    pub fn mount(&mut self) -> Result<&[MountPoint], MountError> {
        let Some(device) = self.device.clone() else {
            return Ok(&self.mounts);
        };
        fs::create_dir_all(&self.scratch).map_err(|source| MountError::Scratch {
            path: self.scratch.clone(),
            source,
        })?;

        for (index, volume) in self.volumes.iter().enumerate() {
            let target = self.scratch.join(format!("vol{index}"));
            if let Err(source) = fs::create_dir_all(&target) {
                return Err(MountError::Scratch {
                    path: target,
                    source,
                });
            }
            match self.ops.mount_readonly(volume, &target) {
                Ok(()) => {
                    debug!("mounted {} at {}", volume.device, target.display());
                    self.mounts.push(MountPoint {
                        device: volume.device.clone(),
                        target,
                        fstype: volume.fstype.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        "skipping volume {} on {}: mount failed: {}",
                        volume.device, device, e
                    );
                    let _ = fs::remove_dir(&target);
                }
            }
        }
        Ok(&self.mounts)
    }

    /// Mountpoints created so far.
    pub fn mountpoints(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Unmounts everything and releases the device. Idempotent; never fails.
    pub fn detach(&mut self) {
        for mount in self.mounts.drain(..).rev() {
            if let Err(e) = self.ops.unmount(&mount.target) {
                warn!("unmount of {} failed: {}", mount.target.display(), e);
            }
            let _ = fs::remove_dir(&mount.target);
        }
        if let Some(device) = self.device.take() {
            if let Err(e) = self.ops.detach(&device) {
                warn!("detach of {} failed: {}", device, e);
            }
            debug!("detached {}", device);
        }
        let _ = fs::remove_dir(&self.scratch);
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        attached: usize,
        detached: usize,
        mounted: usize,
        unmounted: usize,
    }

    /// [`DeviceOps`] mock that tracks acquisition/release balance. A set of
    /// volume indexes can be marked as failing to mount.
    struct MockOps {
        volumes: Vec<Volume>,
        failing: Vec<usize>,
        counters: Mutex<Counters>,
    }

    impl MockOps {
        fn new(volumes: Vec<Volume>) -> Self {
            Self {
                volumes,
                failing: Vec::new(),
                counters: Mutex::new(Counters::default()),
            }
        }

        fn with_failing(mut self, failing: Vec<usize>) -> Self {
            self.failing = failing;
            self
        }
    }

    impl DeviceOps for MockOps {
        fn attach(&self, _image: &Path) -> ops::Result<String> {
            self.counters.lock().unwrap().attached += 1;
            Ok("/dev/loop9".to_string())
        }

        fn volumes(&self, _device: &str) -> ops::Result<Vec<Volume>> {
            Ok(self.volumes.clone())
        }

        fn mount_readonly(&self, volume: &Volume, _target: &Path) -> ops::Result<()> {
            let index = self
                .volumes
                .iter()
                .position(|v| v.device == volume.device)
                .unwrap();
            if self.failing.contains(&index) {
                return Err(OpsError::CommandFailed {
                    command: "mount".to_string(),
                    status: 32,
                    stderr: "wrong fs type".to_string(),
                });
            }
            self.counters.lock().unwrap().mounted += 1;
            Ok(())
        }

        fn unmount(&self, _target: &Path) -> ops::Result<()> {
            self.counters.lock().unwrap().unmounted += 1;
            Ok(())
        }

        fn detach(&self, _device: &str) -> ops::Result<()> {
            self.counters.lock().unwrap().detached += 1;
            Ok(())
        }
    }

    fn volume(device: &str, size: u64) -> Volume {
        Volume {
            device: device.to_string(),
            size,
            fstype: Some("ext4".to_string()),
        }
    }

    fn fake_image(dir: &Path, budget: u64) -> DiskImage {
        let path = dir.join("disk.raw");
        fs::write(&path, b"not really a disk").unwrap();
        DiskImage {
            path,
            max_mount_size: budget,
        }
    }

    #[test]
    fn test_attach_missing_image() {
        let ops = Arc::new(MockOps::new(vec![]));
        let image = DiskImage {
            path: PathBuf::from("/nonexistent/disk.raw"),
            max_mount_size: u64::MAX,
        };
        let err = BlockDevice::attach(ops, &image, Path::new("/tmp")).err().unwrap();
        assert!(matches!(err, AttachError::NotFound(_)));
    }

    #[test]
    fn test_budget_checked_before_any_mount() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(MockOps::new(vec![
            volume("/dev/loop9p1", 600),
            volume("/dev/loop9p2", 600),
        ]));
        let image = fake_image(dir.path(), 1000);

        let err = BlockDevice::attach(ops.clone(), &image, dir.path()).err().unwrap();
        assert!(matches!(
            err,
            AttachError::BudgetExceeded {
                total: 1200,
                budget: 1000
            }
        ));

        let counters = ops.counters.lock().unwrap();
        assert_eq!(counters.mounted, 0);
        assert_eq!(counters.attached, 1);
        assert_eq!(counters.detached, 1);
    }

    #[test]
    fn test_mount_skips_failing_volume() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(
            MockOps::new(vec![
                volume("/dev/loop9p1", 10),
                volume("/dev/loop9p2", 10),
                volume("/dev/loop9p3", 10),
            ])
            .with_failing(vec![1]),
        );
        let image = fake_image(dir.path(), u64::MAX);

        let mut bd = BlockDevice::attach(ops.clone(), &image, dir.path()).unwrap();
        let mounts = bd.mount().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].device, "/dev/loop9p1");
        assert_eq!(mounts[1].device, "/dev/loop9p3");
    }

    #[test]
    fn test_teardown_balance_on_explicit_detach() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(MockOps::new(vec![
            volume("/dev/loop9p1", 10),
            volume("/dev/loop9p2", 10),
        ]));
        let image = fake_image(dir.path(), u64::MAX);

        let mut bd = BlockDevice::attach(ops.clone(), &image, dir.path()).unwrap();
        bd.mount().unwrap();
        bd.detach();
        bd.detach(); // idempotent

        let counters = ops.counters.lock().unwrap();
        assert_eq!(counters.attached, 1);
        assert_eq!(counters.detached, 1);
        assert_eq!(counters.mounted, 2);
        assert_eq!(counters.unmounted, 2);
    }

    #[test]
    fn test_teardown_runs_on_drop_after_midway_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(MockOps::new(vec![volume("/dev/loop9p1", 10)]));
        let image = fake_image(dir.path(), u64::MAX);

        {
            let mut bd = BlockDevice::attach(ops.clone(), &image, dir.path()).unwrap();
            bd.mount().unwrap();
            // Simulates downstream processing bailing out with `?` before any
            // explicit detach call.
        }

        let counters = ops.counters.lock().unwrap();
        assert_eq!(counters.mounted, counters.unmounted);
        assert_eq!(counters.attached, counters.detached);
    }
}
