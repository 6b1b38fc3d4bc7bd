use std::path::Path;
use std::process::Command;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("{command} exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("no free nbd device slot available")]
    NoFreeNbdSlot,

    #[error("Output parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;

/// One mountable filesystem discovered on an attached block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Device node exposing the volume, e.g. `/dev/loop3p1`.
    pub device: String,
    /// Size in bytes as reported by the kernel.
    pub size: u64,
    /// Filesystem type, if the kernel could identify one.
    pub fstype: Option<String>,
}

/// OS-level block device operations behind the Block Device Manager.
///
/// The loop/nbd device namespace and the mount table are process-wide OS
/// resources; everything that touches them funnels through this trait so the
/// manager's lifecycle guarantees can be tested without root privileges.
pub trait DeviceOps: Send + Sync {
    /// Attaches the image file and returns the backing device node.
    fn attach(&self, image: &Path) -> Result<String>;

    /// Enumerates mountable volumes on an attached device.
    fn volumes(&self, device: &str) -> Result<Vec<Volume>>;

    /// Mounts a volume read-only at `target`.
    fn mount_readonly(&self, volume: &Volume, target: &Path) -> Result<()>;

    /// Unmounts the filesystem at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Releases an attached device node.
    fn detach(&self, device: &str) -> Result<()>;
}

/// `lsblk --json` output shape, only the columns we ask for.
#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    size: u64,
    #[serde(rename = "type")]
    kind: String,
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Production [`DeviceOps`] backed by losetup/qemu-nbd, lsblk, and mount.
///
/// Raw images go through a loop device; qcow2/VHD family images go through
/// qemu-nbd. Device slots are picked by the tools themselves (`losetup
/// --find`) or by scanning for an unused nbd node, so concurrent invocations
/// do not contend for the same slot.
pub struct SystemOps;

const NBD_EXTENSIONS: &[&str] = &["qcow", "qcow2", "qcow3", "vhd", "vhdx", "vdi", "vmdk"];

impl SystemOps {
    fn needs_nbd(image: &Path) -> bool {
        image
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| NBD_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    fn free_nbd_slot() -> Result<String> {
        for n in 0..16 {
            let size_path = format!("/sys/block/nbd{n}/size");
            match std::fs::read_to_string(&size_path) {
                Ok(size) if size.trim() == "0" => return Ok(format!("/dev/nbd{n}")),
                _ => continue,
            }
        }
        Err(OpsError::NoFreeNbdSlot)
    }

    fn run(program: &str, args: &[&str]) -> Result<String> {
        debug!("running {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(OpsError::CommandFailed {
                command: program.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn collect_volumes(device: &LsblkDevice, out: &mut Vec<Volume>) {
        let mountable = matches!(device.kind.as_str(), "part" | "disk" | "loop")
            && device
                .fstype
                .as_deref()
                .is_some_and(|t| t != "swap" && t != "LVM2_member");
        if mountable {
            out.push(Volume {
                device: format!("/dev/{}", device.name),
                size: device.size,
                fstype: device.fstype.clone(),
            });
        }
        for child in &device.children {
            Self::collect_volumes(child, out);
        }
    }
}

impl DeviceOps for SystemOps {
    fn attach(&self, image: &Path) -> Result<String> {
        let image_arg = image.to_string_lossy();
        if Self::needs_nbd(image) {
            let slot = Self::free_nbd_slot()?;
            Self::run(
                "qemu-nbd",
                &["--read-only", &format!("--connect={slot}"), &image_arg],
            )?;
            Ok(slot)
        } else {
            Self::run(
                "losetup",
                &["--find", "--show", "--partscan", "--read-only", &image_arg],
            )
        }
    }

    fn volumes(&self, device: &str) -> Result<Vec<Volume>> {
        let json = Self::run(
            "lsblk",
            &[
                "--json",
                "--bytes",
                "--output",
                "NAME,SIZE,TYPE,FSTYPE",
                device,
            ],
        )?;
        let report: LsblkReport = serde_json::from_str(&json)?;

        let mut volumes = Vec::new();
        for dev in &report.blockdevices {
            Self::collect_volumes(dev, &mut volumes);
        }
        Ok(volumes)
    }

    fn mount_readonly(&self, volume: &Volume, target: &Path) -> Result<()> {
        // noload skips journal replay, required for dirty ext filesystems.
        let options = match volume.fstype.as_deref() {
            Some(t) if t.starts_with("ext") => "ro,noload",
            _ => "ro",
        };
        let target = target.to_string_lossy();
        let mut args = vec!["-o", options];
        if let Some(fstype) = volume.fstype.as_deref() {
            args.extend(["-t", fstype]);
        }
        args.extend([volume.device.as_str(), target.as_ref()]);
        Self::run("mount", &args)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Self::run("umount", &[target.to_string_lossy().as_ref()])?;
        Ok(())
    }

    fn detach(&self, device: &str) -> Result<()> {
        if device.contains("nbd") {
            Self::run("qemu-nbd", &["--disconnect", device])?;
        } else {
            Self::run("losetup", &["--detach", device])?;
        }
        Ok(())
    }
}
