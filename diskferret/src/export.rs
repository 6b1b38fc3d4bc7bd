//! Export Engine: copies a container's merged filesystem (or a selection of
//! it) into a gzip-compressed tar archive.
//!
//! Every archive entry gets one mtime equal to the export start time. This is
//! a deliberate normalization - original on-disk timestamps are dropped, so
//! re-running an export later produces a byte-different archive with
//! identical content.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tar::{Builder, EntryType, Header};
use thiserror::Error;
use tracing::{debug, warn};

use crate::inventory::ContainerRecord;
use crate::layers::{MergedEntry, MergedView};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Container {0} has no resolvable layer chain")]
    UnsupportedLayerChain(String),

    #[error("Selection matched no paths in the container filesystem")]
    NothingSelected,

    #[error("Destination {path} is not writable: {source}")]
    Destination {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// What to copy out of the merged container filesystem.
#[derive(Debug, Clone)]
pub enum Selection {
    Everything,
    Paths(Vec<PathBuf>),
}

impl Selection {
    fn matches(&self, path: &Path) -> bool {
        match self {
            Selection::Everything => true,
            Selection::Paths(wanted) => wanted.iter().any(|w| {
                let w = w.strip_prefix("/").unwrap_or(w);
                path == w || path.starts_with(w)
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    /// Path within the merged container filesystem.
    pub source: PathBuf,
    /// Path of the entry inside the archive.
    pub archived: PathBuf,
}

/// Record of one export operation.
#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub container_id: String,
    pub archive: PathBuf,
    /// Unix timestamp applied uniformly to every archive entry.
    pub timestamp: u64,
    pub entries: Vec<ManifestEntry>,
}

/// Exports `selection` from the container's merged filesystem into a
/// `.tar.gz` at `dest`.
///
/// Symlinks are preserved as links unless their target would escape the
/// container root; escaping links are skipped and logged, never followed.
pub fn export(
    record: &ContainerRecord,
    selection: &Selection,
    dest: &Path,
) -> Result<ExportManifest> {
    if record.layers.is_empty() {
        return Err(ExportError::UnsupportedLayerChain(record.id.clone()));
    }

    let view = MergedView::build(&record.layers)?;
    let selected: Vec<_> = view
        .entries()
        .filter(|(path, _)| selection.matches(path))
        .collect();
    if selected.is_empty() {
        return Err(ExportError::NothingSelected);
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let file = File::create(dest).map_err(|source| ExportError::Destination {
        path: dest.to_path_buf(),
        source,
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    let mut entries = Vec::new();
    for (path, entry) in selected {
        match entry {
            MergedEntry::Directory { .. } => {
                let mut header = base_header(timestamp, 0o755);
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, path, std::io::empty())?;
            }
            MergedEntry::File { size, source, .. } => {
                let mut header = base_header(timestamp, file_mode(source));
                header.set_entry_type(EntryType::Regular);
                header.set_size(*size);
                let reader = File::open(source)?;
                builder.append_data(&mut header, path, reader)?;
            }
            MergedEntry::Symlink { target, .. } => {
                if escapes_root(path, target) {
                    warn!(
                        "skipping symlink {} -> {}: target escapes the container root",
                        path.display(),
                        target.display()
                    );
                    continue;
                }
                let mut header = base_header(timestamp, 0o777);
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, path, target)?;
            }
        }
        entries.push(ManifestEntry {
            source: path.clone(),
            archived: path.clone(),
        });
    }

    builder.into_inner()?.finish()?;
    debug!(
        "exported {} entries from container {} to {}",
        entries.len(),
        record.id,
        dest.display()
    );

    Ok(ExportManifest {
        container_id: record.id.clone(),
        archive: dest.to_path_buf(),
        timestamp,
        entries,
    })
}

/// Permission bits of the winning layer file, so execute bits on binaries
/// survive the export. Timestamps are normalized; modes are not.
#[cfg(unix)]
fn file_mode(source: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(source)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_source: &Path) -> u32 {
    0o644
}

fn base_header(timestamp: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_mtime(timestamp);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// True when a relative link target climbs above the container root.
/// Absolute targets resolve against the container root itself and therefore
/// cannot escape.
fn escapes_root(link_path: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }
    let mut depth: isize = link_path.components().count() as isize - 1;
    for component in target.components() {
        match component {
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            std::path::Component::CurDir => {}
            _ => depth += 1,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_detection() {
        // Link at top level pointing out of the root.
        assert!(escapes_root(Path::new("evil"), Path::new("../outside")));
        // One level down, one level up: stays inside.
        assert!(!escapes_root(Path::new("etc/link"), Path::new("../motd")));
        // One level down, two levels up: escapes.
        assert!(escapes_root(
            Path::new("etc/link"),
            Path::new("../../outside")
        ));
        // Absolute targets are container-rooted.
        assert!(!escapes_root(Path::new("etc/link"), Path::new("/etc/motd")));
    }

    #[test]
    fn test_selection_matching() {
        let selection = Selection::Paths(vec![PathBuf::from("/etc")]);
        assert!(selection.matches(Path::new("etc")));
        assert!(selection.matches(Path::new("etc/passwd")));
        assert!(!selection.matches(Path::new("var/log/syslog")));
        assert!(Selection::Everything.matches(Path::new("anything")));
    }
}
