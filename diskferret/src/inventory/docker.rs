//! Docker storage-layout traversal.
//!
//! Containers live under `containers/<id>/config.v2.json`; the overlay2
//! layer chain is resolved from `image/overlay2/layerdb/mounts/<id>/mount-id`
//! through the writable layer's `lower` file, whose `l/<short>` link names
//! dereference via the `overlay2/l/` symlink farm.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ContainerRecord, ContainerState, LayerRef, ListError, Result};
use crate::locate::RuntimeKind;

/// The slice of `config.v2.json` this crate cares about.
#[derive(Debug, Deserialize)]
struct ConfigV2 {
    #[serde(rename = "State")]
    state: Option<DockerState>,

    #[serde(rename = "Config")]
    config: Option<DockerConfig>,

    #[serde(rename = "Created")]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerState {
    #[serde(rename = "Running")]
    running: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(rename = "Image")]
    image: Option<String>,
}

impl ConfigV2 {
    fn from_str(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

pub(super) fn list(root: &Path) -> Result<Vec<ContainerRecord>> {
    let containers_dir = root.join("containers");
    if !containers_dir.is_dir() {
        debug!("{} has no containers directory", root.display());
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(&containers_dir).map_err(|source| ListError::Unreadable {
        path: containers_dir.clone(),
        source,
    })?;

    let mut records = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        records.push(read_container(root, &id));
    }
    Ok(records)
}

/// Builds one record, degrading to `Unknown` state on malformed metadata
/// instead of failing the listing.
fn read_container(root: &Path, id: &str) -> ContainerRecord {
    let config_path = root.join("containers").join(id).join("config.v2.json");
    let config = fs::read_to_string(&config_path)
        .map_err(|e| e.to_string())
        .and_then(|json| ConfigV2::from_str(&json).map_err(|e| e.to_string()));

    let (image, state, created) = match config {
        Ok(config) => {
            let image = config
                .config
                .and_then(|c| c.image)
                .unwrap_or_default();
            let state = match config.state.and_then(|s| s.running) {
                Some(true) => ContainerState::Running,
                Some(false) => ContainerState::Stopped,
                None => ContainerState::Unknown,
            };
            let created = config
                .created
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            (image, state, created)
        }
        Err(e) => {
            warn!("malformed metadata for container {}: {}", id, e);
            (String::new(), ContainerState::Unknown, None)
        }
    };

    ContainerRecord {
        id: id.to_string(),
        kind: RuntimeKind::Docker,
        image,
        state,
        created,
        layers: resolve_layers(root, id),
    }
}

/// Resolves the overlay2 layer chain for a container, base-to-top.
fn resolve_layers(root: &Path, id: &str) -> Vec<LayerRef> {
    let mount_id_path = root
        .join("image/overlay2/layerdb/mounts")
        .join(id)
        .join("mount-id");
    let mount_id = match fs::read_to_string(&mount_id_path) {
        Ok(s) => s.trim().to_string(),
        Err(e) => {
            warn!("no layerdb mount entry for container {}: {}", id, e);
            return Vec::new();
        }
    };

    let top_dir = root.join("overlay2").join(&mount_id);
    let mut layers = Vec::new();

    // `lower` lists l/<short> names uppermost-first; reverse for base-first.
    match fs::read_to_string(top_dir.join("lower")) {
        Ok(lower) => {
            for link_name in lower.trim().split(':').rev() {
                let Some(short) = link_name.strip_prefix("l/") else {
                    warn!("unexpected lower entry '{}' for container {}", link_name, id);
                    continue;
                };
                match resolve_link(root, short) {
                    Some(layer) => layers.push(layer),
                    None => warn!("dangling layer link l/{} for container {}", short, id),
                }
            }
        }
        // A container built straight from scratch has no lower file.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("unreadable lower file for container {}: {}", id, e),
    }

    layers.push(LayerRef {
        id: mount_id,
        path: top_dir.join("diff"),
    });
    layers
}

/// Dereferences `overlay2/l/<short>` to the layer's `diff` directory.
fn resolve_link(root: &Path, short: &str) -> Option<LayerRef> {
    let link = root.join("overlay2/l").join(short);
    let target = fs::read_link(&link).ok()?;
    // Targets look like ../<layer-id>/diff.
    let layer_id = target.parent()?.file_name()?.to_string_lossy().to_string();
    let path = normalize_link_target(&link, &target)?;
    Some(LayerRef { id: layer_id, path })
}

fn normalize_link_target(link: &Path, target: &Path) -> Option<PathBuf> {
    if target.is_absolute() {
        return Some(target.to_path_buf());
    }
    let mut resolved = link.parent()?.to_path_buf();
    for component in target.components() {
        match component {
            std::path::Component::ParentDir => {
                resolved.pop();
            }
            std::path::Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_v2_state_mapping() {
        let json = r#"{
            "ID": "abc",
            "State": {"Running": true, "Paused": false},
            "Config": {"Image": "nginx:1.25"},
            "Created": "2024-03-01T10:00:00.000000000Z"
        }"#;
        let config = ConfigV2::from_str(json).unwrap();
        assert_eq!(config.state.unwrap().running, Some(true));
        assert_eq!(config.config.unwrap().image.as_deref(), Some("nginx:1.25"));
    }

    #[test]
    fn test_config_v2_tolerates_missing_fields() {
        let config = ConfigV2::from_str("{}").unwrap();
        assert!(config.state.is_none());
        assert!(config.config.is_none());
        assert!(config.created.is_none());
    }

    #[test]
    fn test_normalize_link_target() {
        let resolved = normalize_link_target(
            Path::new("/mnt/vol0/var/lib/docker/overlay2/l/SHORT"),
            Path::new("../1a2b3c/diff"),
        )
        .unwrap();
        assert_eq!(
            resolved,
            Path::new("/mnt/vol0/var/lib/docker/overlay2/1a2b3c/diff")
        );
    }
}
