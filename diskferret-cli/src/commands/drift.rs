use std::path::PathBuf;

use crate::commands::{self, CommonArgs};
use crate::error::Result;
use diskferret::drift::ChangeKind;
use diskferret::pipeline;

pub fn execute(common: &CommonArgs, images: &[PathBuf], no_hash: bool) -> Result<()> {
    let mut config = common.task_config();
    config.detect_drift = true;
    config.hash_files = !no_hash;

    let outcome = commands::process_images(common, images, &config)?;

    let added = count(&outcome.drift, ChangeKind::Added);
    let modified = count(&outcome.drift, ChangeKind::Modified);
    let deleted = count(&outcome.drift, ChangeKind::Deleted);
    println!(
        "{} container(s): {added} added, {modified} modified, {deleted} deleted",
        outcome.inventory.len()
    );

    let json_path = common.output.join("container_drift.json");
    pipeline::write_drift_json(&json_path, &outcome.drift)?;
    pipeline::write_drift_csv(&common.output.join("container_drift.csv"), &outcome.drift)?;
    outcome.log.write_to(&common.output.join("container_drift.log"))?;
    println!("Drift report written to {}", json_path.display());

    Ok(())
}

fn count(entries: &[diskferret::drift::DriftEntry], kind: ChangeKind) -> usize {
    entries.iter().filter(|e| e.kind == kind).count()
}
