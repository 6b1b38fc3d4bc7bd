use std::path::PathBuf;

use diskferret::export::Selection;

use crate::commands::{self, CommonArgs};
use crate::error::Result;

pub fn execute(
    common: &CommonArgs,
    images: &[PathBuf],
    containers: Option<&str>,
    paths: &[PathBuf],
) -> Result<()> {
    let mut config = common.task_config();
    config.export = Some(if paths.is_empty() {
        Selection::Everything
    } else {
        Selection::Paths(paths.to_vec())
    });
    // An empty ID list exports every container.
    config.export_ids = containers
        .map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let outcome = commands::process_images(common, images, &config)?;

    if outcome.exports.is_empty() {
        println!("No containers exported.");
    } else {
        for manifest in &outcome.exports {
            println!(
                "Exported container {} ({} entries) to {}",
                manifest.container_id,
                manifest.entries.len(),
                manifest.archive.display()
            );
        }
    }
    outcome.log.write_to(&common.output.join("container_export.log"))?;

    Ok(())
}
