pub mod drift;
pub mod export;
pub mod list;

use std::path::PathBuf;
use std::sync::Arc;

use diskferret::block::{DeviceOps, SystemOps};
use diskferret::locate::OverridePolicy;
use diskferret::pipeline::{self, TaskConfig, TaskOutcome};

use crate::error::{FerretCliError, Result};

/// Options shared by every subcommand.
pub struct CommonArgs {
    pub container_root: Option<PathBuf>,
    pub root_fallback: bool,
    pub max_mount_size: Option<u64>,
    pub scratch_dir: PathBuf,
    pub output: PathBuf,
}

impl CommonArgs {
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            container_root: self.container_root.clone(),
            override_policy: if self.root_fallback {
                OverridePolicy::OverrideThenDefaults
            } else {
                OverridePolicy::OverrideOnly
            },
            max_mount_size: self
                .max_mount_size
                .unwrap_or(pipeline::DEFAULT_MAX_MOUNT_SIZE),
            ..TaskConfig::default()
        }
    }
}

/// Runs the pipeline over every input image, merging the outcomes.
///
/// A disk that fails to attach is reported and skipped; the remaining disks
/// are still processed.
pub fn process_images(
    common: &CommonArgs,
    images: &[PathBuf],
    config: &TaskConfig,
) -> Result<TaskOutcome> {
    if images.is_empty() {
        return Err(FerretCliError::Input(
            "At least one disk image is required".to_string(),
        ));
    }
    std::fs::create_dir_all(&common.output)?;

    let ops: Arc<dyn DeviceOps> = Arc::new(SystemOps);
    let mut merged = TaskOutcome::default();
    let mut last_attach_error = None;
    let mut processed = 0usize;
    for image in images {
        match pipeline::process_image(
            ops.clone(),
            image,
            config,
            &common.scratch_dir,
            &common.output,
        ) {
            Ok(outcome) => {
                processed += 1;
                merged.inventory.extend(outcome.inventory);
                merged.drift.extend(outcome.drift);
                merged.exports.extend(outcome.exports);
                for line in outcome.log.lines() {
                    merged.log.record(line.clone());
                }
            }
            Err(e) => {
                merged
                    .log
                    .record(format!("Skipping disk {}: {e}", image.display()));
                eprintln!("Skipping disk {}: {e}", image.display());
                last_attach_error = Some(e);
            }
        }
    }

    // A bad disk never aborts its siblings, but when not a single disk could
    // be attached there is nothing to report and the run as a whole failed.
    match last_attach_error {
        Some(e) if processed == 0 => Err(e.into()),
        _ => Ok(merged),
    }
}
