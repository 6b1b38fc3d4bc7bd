use std::path::PathBuf;

use tabled::{Table, Tabled};

use crate::commands::{self, CommonArgs};
use crate::error::Result;
use diskferret::pipeline;

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Runtime")]
    runtime: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Created")]
    created: String,
}

pub fn execute(common: &CommonArgs, images: &[PathBuf]) -> Result<()> {
    let config = common.task_config();
    let outcome = commands::process_images(common, images, &config)?;

    if outcome.inventory.is_empty() {
        println!("No containers found.");
    } else {
        let rows: Vec<ContainerRow> = outcome
            .inventory
            .iter()
            .map(|record| ContainerRow {
                id: short_id(&record.id),
                runtime: record.kind.to_string(),
                image: record.image.clone(),
                state: record.state.to_string(),
                created: record
                    .created
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();
        println!("{}", Table::new(rows));
        println!();
        println!("Found {} container(s)", outcome.inventory.len());
    }

    let inventory_path = common.output.join("container_list.json");
    pipeline::write_inventory(&inventory_path, &outcome.inventory)?;
    outcome.log.write_to(&common.output.join("container_list.log"))?;
    println!("Inventory written to {}", inventory_path.display());

    Ok(())
}

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_truncation() {
        assert_eq!(short_id("cafe01"), "cafe01");
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        // Multi-byte names must not split a character.
        assert_eq!(short_id("контейнер-форензика"), "контейнер-фо");
    }
}
