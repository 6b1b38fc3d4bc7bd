//! containerd storage-layout traversal.
//!
//! containerd keeps its container and layer graph in a boltdb (`meta.db`)
//! that this crate deliberately does not parse. What the CRI plugin writes as
//! plain files is enough for an inventory: one JSON status checkpoint per
//! container under `io.containerd.grpc.v1.cri/containers/<id>/status`. Layer
//! chains stay in the boltdb, so containerd records carry an empty chain and
//! drift/export report them as unsupported.

use std::fs;
use std::path::Path;

use chrono::DateTime;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ContainerRecord, ContainerState, ListError, Result};
use crate::locate::RuntimeKind;

const CRI_CONTAINERS_DIR: &str = "io.containerd.grpc.v1.cri/containers";

/// The CRI plugin's status checkpoint. Written either bare or wrapped in a
/// versioned envelope depending on the containerd release.
#[derive(Debug, Deserialize)]
struct StatusFile {
    status: Option<CriStatus>,

    #[serde(flatten)]
    bare: CriStatus,
}

#[derive(Debug, Default, Deserialize)]
struct CriStatus {
    #[serde(rename = "CreatedAt")]
    created_at: Option<i64>,

    #[serde(rename = "StartedAt")]
    started_at: Option<i64>,

    #[serde(rename = "FinishedAt")]
    finished_at: Option<i64>,
}

impl StatusFile {
    fn into_status(self) -> CriStatus {
        self.status.unwrap_or(self.bare)
    }
}

pub(super) fn list(root: &Path) -> Result<Vec<ContainerRecord>> {
    let containers_dir = root.join(CRI_CONTAINERS_DIR);
    if !containers_dir.is_dir() {
        debug!(
            "{} has no CRI container checkpoints, metadata is boltdb-only",
            root.display()
        );
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
        records.push(read_container(&entry.path(), &id));
    }
    Ok(records)
}

fn read_container(container_dir: &Path, id: &str) -> ContainerRecord {
    let status = fs::read_to_string(container_dir.join("status"))
        .map_err(|e| e.to_string())
        .and_then(|json| {
            serde_json::from_str::<StatusFile>(&json).map_err(|e| e.to_string())
        });

    let (state, created) = match status {
        Ok(status) => {
            let status = status.into_status();
            let state = match (status.started_at, status.finished_at) {
                (Some(started), Some(0)) if started > 0 => ContainerState::Running,
                (Some(started), None) if started > 0 => ContainerState::Running,
                (_, Some(finished)) if finished > 0 => ContainerState::Stopped,
                _ => ContainerState::Unknown,
            };
            let created = status
                .created_at
                .filter(|&ns| ns > 0)
                .map(DateTime::from_timestamp_nanos);
            (state, created)
        }
        Err(e) => {
            warn!("malformed CRI status for container {}: {}", id, e);
            (ContainerState::Unknown, None)
        }
    };

    ContainerRecord {
        id: id.to_string(),
        kind: RuntimeKind::Containerd,
        // Image references live in the boltdb; not resolvable from plain files.
        image: String::new(),
        state,
        created,
        layers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_status_running() {
        let json = r#"{"CreatedAt": 1709290800000000000, "StartedAt": 1709290801000000000, "FinishedAt": 0}"#;
        let status: StatusFile = serde_json::from_str(json).unwrap();
        let status = status.into_status();
        assert_eq!(status.started_at, Some(1709290801000000000));
        assert_eq!(status.finished_at, Some(0));
    }

    #[test]
    fn test_versioned_envelope() {
        let json = r#"{"version": "v1", "status": {"CreatedAt": 1, "StartedAt": 2, "FinishedAt": 3}}"#;
        let status: StatusFile = serde_json::from_str(json).unwrap();
        assert_eq!(status.into_status().finished_at, Some(3));
    }
}
