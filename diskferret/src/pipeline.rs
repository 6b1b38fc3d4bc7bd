//! One-disk task orchestration.
//!
//! `process_image` runs the full flow for a single disk image: attach, mount,
//! probe every mountpoint, inventory every container root, optionally compute
//! drift and export containers, and always tear the device down again.
//! Failures scoped to one mountpoint or one container are logged into the
//! [`ProcessingLog`] and never abort siblings; only an [`AttachError`] is
//! fatal for the disk.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::block::{AttachError, BlockDevice, DeviceOps, DiskImage};
use crate::drift::{self, DriftEntry, DriftOptions};
use crate::export::{self, ExportManifest, Selection};
use crate::inventory::{self, ContainerRecord};
use crate::locate::{self, OverridePolicy};

/// Default mount budget: 512 GiB of summed volume sizes.
pub const DEFAULT_MAX_MOUNT_SIZE: u64 = 512 * 1024 * 1024 * 1024;

/// Per-invocation configuration for all stages of the pipeline.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Custom container-root path relative to each mountpoint.
    pub container_root: Option<PathBuf>,
    pub override_policy: OverridePolicy,
    /// Compute drift for every inventoried container.
    pub detect_drift: bool,
    pub hash_files: bool,
    /// When set, export the selection for the matching containers.
    pub export: Option<Selection>,
    /// Container IDs to export; empty means every container.
    pub export_ids: Vec<String>,
    pub max_mount_size: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            container_root: None,
            override_policy: OverridePolicy::default(),
            detect_drift: false,
            hash_files: true,
            export: None,
            export_ids: Vec::new(),
            max_mount_size: DEFAULT_MAX_MOUNT_SIZE,
        }
    }
}

/// Ordered, human-readable record of what was processed and what was skipped,
/// with enough context to tell "nothing found" apart from "something failed".
#[derive(Debug, Default)]
pub struct ProcessingLog {
    lines: Vec<String>,
}

impl ProcessingLog {
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.lines.push(message);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Writes the log as plain text, one line per entry.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        for line in &self.lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Everything one task invocation produced.
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub inventory: Vec<ContainerRecord>,
    pub drift: Vec<DriftEntry>,
    pub exports: Vec<ExportManifest>,
    pub log: ProcessingLog,
}

/// Processes one disk image end to end.
///
/// Teardown is guaranteed: the device handle detaches on every exit path,
/// including panics and early returns, via its `Drop` impl.
pub fn process_image(
    ops: Arc<dyn DeviceOps>,
    image_path: &Path,
    config: &TaskConfig,
    scratch_root: &Path,
    output_dir: &Path,
) -> Result<TaskOutcome, AttachError> {
    let disk = image_path.display().to_string();
    let image = DiskImage {
        path: image_path.to_path_buf(),
        max_mount_size: config.max_mount_size,
    };

    let mut device = BlockDevice::attach(ops, &image, scratch_root)?;
    let mut outcome = TaskOutcome::default();
    inspect_mounts(&mut device, &disk, config, output_dir, &mut outcome);
    device.detach();

    outcome.log.record(format!("Done processing {disk}"));
    Ok(outcome)
}

fn inspect_mounts(
    device: &mut BlockDevice,
    disk: &str,
    config: &TaskConfig,
    output_dir: &Path,
    outcome: &mut TaskOutcome,
) {
    let mountpoints = match device.mount() {
        Ok(mountpoints) => mountpoints.to_vec(),
        Err(e) => {
            outcome
                .log
                .record(format!("Unable to mount disk {disk}: {e}"));
            return;
        }
    };
    if mountpoints.is_empty() {
        outcome
            .log
            .record(format!("No mountable filesystems on disk {disk}"));
        return;
    }

    for mountpoint in &mountpoints {
        let mp = mountpoint.target.display().to_string();
        let roots = locate::locate_all(
            &mountpoint.target,
            config.container_root.as_deref(),
            config.override_policy,
        );
        if roots.is_empty() {
            outcome
                .log
                .record(format!("No container root in mountpoint {mp} of disk {disk}"));
            continue;
        }

        for root in roots {
            let records = match inventory::list(&root) {
                Ok(records) => records,
                Err(e) => {
                    outcome.log.record(format!(
                        "Unable to list {} containers in mountpoint {mp}: {e}",
                        root.kind
                    ));
                    continue;
                }
            };
            outcome.log.record(format!(
                "Found {} {} container(s) in mountpoint {mp}",
                records.len(),
                root.kind
            ));

            for record in &records {
                inspect_container(record, disk, config, output_dir, outcome);
            }
            outcome.inventory.extend(records);
        }
    }
}

fn inspect_container(
    record: &ContainerRecord,
    disk: &str,
    config: &TaskConfig,
    output_dir: &Path,
    outcome: &mut TaskOutcome,
) {
    if config.detect_drift {
        let options = DriftOptions {
            hash_files: config.hash_files,
        };
        match drift::diff(record, options) {
            Ok(entries) => {
                outcome.log.record(format!(
                    "Container {} drift: {} change(s)",
                    record.id,
                    entries.len()
                ));
                outcome.drift.extend(entries);
            }
            Err(e) => {
                outcome.log.record(format!(
                    "Drift unavailable for container {} on disk {disk}: {e}",
                    record.id
                ));
            }
        }
    }

    if let Some(selection) = &config.export {
        let wanted =
            config.export_ids.is_empty() || config.export_ids.iter().any(|id| *id == record.id);
        if !wanted {
            return;
        }
        let dest = output_dir.join(format!("{}.tar.gz", record.id));
        match export::export(record, selection, &dest) {
            Ok(manifest) => {
                outcome.log.record(format!(
                    "Exported container {} as {}",
                    record.id,
                    dest.display()
                ));
                outcome.exports.push(manifest);
            }
            Err(e) => {
                outcome.log.record(format!(
                    "Error exporting container {} on disk {disk}: {e}",
                    record.id
                ));
            }
        }
    }
}

/// Writes the inventory as pretty-printed JSON.
pub fn write_inventory(path: &Path, records: &[ContainerRecord]) -> std::io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, records)?;
    Ok(())
}

/// Writes the drift report as pretty-printed JSON.
pub fn write_drift_json(path: &Path, entries: &[DriftEntry]) -> std::io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, entries)?;
    Ok(())
}

/// Writes the drift report as a flat CSV with a fixed column set.
pub fn write_drift_csv(path: &Path, entries: &[DriftEntry]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "container_id,path,change,size,sha256")?;
    for entry in entries {
        writeln!(
            file,
            "{},{},{},{},{}",
            entry.container_id,
            csv_field(&entry.path.to_string_lossy()),
            entry.kind,
            entry.size.map(|s| s.to_string()).unwrap_or_default(),
            entry.sha256.as_deref().unwrap_or(""),
        )?;
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
