//! Container Inventory Builder: a pure, deterministic read over a located
//! container root, producing normalized [`ContainerRecord`]s.

mod containerd;
mod docker;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::locate::{ContainerRoot, RuntimeKind};

#[derive(Error, Debug)]
pub enum ListError {
    #[error("Container root {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ListError>;

/// Best-effort lifecycle state read from on-disk runtime metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One filesystem layer. Read-only; shared across containers built from the
/// same image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerRef {
    pub id: String,
    pub path: PathBuf,
}

/// One discovered container, normalized across runtimes.
///
/// `layers` is ordered base-to-top; the last entry, when present, is the
/// writable layer. An empty chain means the runtime keeps its layer graph in
/// an opaque store we do not parse (containerd's boltdb) - drift and export
/// then fail softly for this container only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub kind: RuntimeKind,
    pub image: String,
    pub state: ContainerState,
    pub created: Option<DateTime<Utc>>,
    pub layers: Vec<LayerRef>,
}

/// Enumerates the containers stored under `root`.
///
/// Re-running over an unmodified root yields an identical sequence: records
/// are sorted by container ID and every field comes from a plain filesystem
/// read. One malformed container is logged and carried as `Unknown` rather
/// than aborting the listing.
pub fn list(root: &ContainerRoot) -> Result<Vec<ContainerRecord>> {
    let mut records = match root.kind {
        RuntimeKind::Docker => docker::list(&root.path)?,
        RuntimeKind::Containerd => containerd::list(&root.path)?,
    };
    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(records)
}
