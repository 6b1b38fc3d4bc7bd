//! Drift Detector: the writable top layer's changeset against the union of
//! its base layers.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::inventory::ContainerRecord;
use crate::layers::{self, MergedEntry, MergedView};

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Container {0} has no resolvable layer chain")]
    UnsupportedLayerChain(String),

    #[error("Layer at {path} is unreadable: {source}")]
    LayerUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DriftError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// One changed path in a container's writable layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    pub container_id: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Tuning for the comparison.
///
/// Hashing is the authoritative content check and is on by default; turning
/// it off falls back to size+mtime, trading accuracy for speed on large
/// containers.
#[derive(Debug, Clone, Copy)]
pub struct DriftOptions {
    pub hash_files: bool,
}

impl Default for DriftOptions {
    fn default() -> Self {
        Self { hash_files: true }
    }
}

/// Computes the drift of `record`'s top layer against its base layers.
///
/// Whiteout and opaque markers are interpreted as deletions, never reported
/// as regular files. The result is sorted by path.
pub fn diff(record: &ContainerRecord, options: DriftOptions) -> Result<Vec<DriftEntry>> {
    let Some((top, lower)) = record.layers.split_last() else {
        return Err(DriftError::UnsupportedLayerChain(record.id.clone()));
    };

    let base = MergedView::build(lower).map_err(|source| DriftError::LayerUnreadable {
        path: top.path.clone(),
        source,
    })?;

    let mut entries = Vec::new();
    walk_top(
        record,
        &base,
        &top.path,
        &top.path,
        options,
        &mut entries,
    )
    .map_err(|source| DriftError::LayerUnreadable {
        path: top.path.clone(),
        source,
    })?;

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn walk_top(
    record: &ContainerRecord,
    base: &MergedView,
    top_root: &Path,
    dir: &Path,
    options: DriftOptions,
    out: &mut Vec<DriftEntry>,
) -> std::io::Result<()> {
    let rel_dir = dir.strip_prefix(top_root).unwrap_or(Path::new(""));

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let source = entry.path();

        if name.to_str() == Some(layers::OPAQUE_MARKER) {
            // Everything the marker hides in the base view is gone, unless
            // the top layer re-creates the path: then it is still present in
            // the merged view and the regular walk classifies it.
            for (path, base_entry) in base.entries() {
                if path.starts_with(rel_dir)
                    && path != rel_dir
                    && !matches!(base_entry, MergedEntry::Directory { .. })
                {
                    let re_added = top_root
                        .join(path)
                        .symlink_metadata()
                        .is_ok_and(|m| !layers::is_whiteout_device(&m));
                    if re_added {
                        continue;
                    }
                    out.push(deleted(record, path.clone()));
                }
            }
            continue;
        }
        if let Some(target) = layers::whiteout_target(&name) {
            let target = rel_dir.join(target);
            if base.get(&target).is_some() {
                out.push(deleted(record, target));
            }
            continue;
        }

        let metadata = source.symlink_metadata()?;
        if layers::is_whiteout_device(&metadata) {
            let target = rel_dir.join(&name);
            if base.get(&target).is_some() {
                out.push(deleted(record, target));
            }
            continue;
        }

        let rel = rel_dir.join(&name);
        if metadata.is_dir() {
            match base.get(&rel) {
                Some(MergedEntry::Directory { .. }) => {}
                Some(_) => out.push(DriftEntry {
                    container_id: record.id.clone(),
                    path: rel.clone(),
                    kind: ChangeKind::Modified,
                    size: None,
                    sha256: None,
                }),
                None => out.push(DriftEntry {
                    container_id: record.id.clone(),
                    path: rel.clone(),
                    kind: ChangeKind::Added,
                    size: None,
                    sha256: None,
                }),
            }
            walk_top(record, base, top_root, &source, options, out)?;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(&source)?;
            let kind = match base.get(&rel) {
                Some(MergedEntry::Symlink {
                    target: base_target,
                    ..
                }) if *base_target == target => continue,
                Some(_) => ChangeKind::Modified,
                None => ChangeKind::Added,
            };
            out.push(DriftEntry {
                container_id: record.id.clone(),
                path: rel,
                kind,
                size: None,
                sha256: None,
            });
        } else if metadata.is_file() {
            compare_file(record, base, &rel, &source, &metadata, options, out)?;
        }
    }
    Ok(())
}

fn compare_file(
    record: &ContainerRecord,
    base: &MergedView,
    rel: &Path,
    source: &Path,
    metadata: &fs::Metadata,
    options: DriftOptions,
    out: &mut Vec<DriftEntry>,
) -> std::io::Result<()> {
    let (kind, hash) = match base.get(rel) {
        None => (
            ChangeKind::Added,
            maybe_hash(source, options),
        ),
        Some(MergedEntry::File {
            size,
            mtime,
            source: base_source,
        }) => {
            let changed = if options.hash_files {
                let top_hash = sha256_file(source)?;
                let base_hash = sha256_file(base_source)?;
                if top_hash == base_hash {
                    return Ok(());
                }
                out.push(DriftEntry {
                    container_id: record.id.clone(),
                    path: rel.to_path_buf(),
                    kind: ChangeKind::Modified,
                    size: Some(metadata.len()),
                    sha256: Some(top_hash),
                });
                return Ok(());
            } else {
                *size != metadata.len() || *mtime != metadata.modified().ok()
            };
            if !changed {
                return Ok(());
            }
            (ChangeKind::Modified, None)
        }
        // Type change: file over what used to be a dir or symlink.
        Some(_) => (ChangeKind::Modified, maybe_hash(source, options)),
    };

    out.push(DriftEntry {
        container_id: record.id.clone(),
        path: rel.to_path_buf(),
        kind,
        size: Some(metadata.len()),
        sha256: hash,
    });
    Ok(())
}

fn maybe_hash(path: &Path, options: DriftOptions) -> Option<String> {
    if !options.hash_files {
        return None;
    }
    match sha256_file(path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            warn!("unable to hash {}: {}", path.display(), e);
            None
        }
    }
}

fn deleted(record: &ContainerRecord, path: PathBuf) -> DriftEntry {
    DriftEntry {
        container_id: record.id.clone(),
        path,
        kind: ChangeKind::Deleted,
        size: None,
        sha256: None,
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{ContainerState, LayerRef};
    use crate::locate::RuntimeKind;
    use std::fs;

    fn record_with_layers(dir: &Path, names: &[&str]) -> ContainerRecord {
        let layers = names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::create_dir_all(&path).unwrap();
                LayerRef {
                    id: name.to_string(),
                    path,
                }
            })
            .collect();
        ContainerRecord {
            id: "c1".to_string(),
            kind: RuntimeKind::Docker,
            image: "busybox:latest".to_string(),
            state: ContainerState::Stopped,
            created: None,
            layers,
        }
    }

    #[test]
    fn test_empty_layer_chain_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with_layers(dir.path(), &[]);
        assert!(matches!(
            diff(&record, DriftOptions::default()),
            Err(DriftError::UnsupportedLayerChain(_))
        ));
    }

    #[test]
    fn test_added_and_modified_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with_layers(dir.path(), &["base", "top"]);
        let base = &record.layers[0].path;
        let top = &record.layers[1].path;

        fs::create_dir_all(base.join("etc")).unwrap();
        fs::write(base.join("etc/passwd"), b"root:x:0:0").unwrap();
        fs::write(base.join("etc/motd"), b"hello").unwrap();
        fs::write(base.join("etc/hosts"), b"127.0.0.1").unwrap();

        fs::create_dir_all(top.join("etc")).unwrap();
        fs::write(top.join("etc/passwd"), b"root:x:0:0:evil").unwrap();
        fs::write(top.join("etc/.wh.motd"), b"").unwrap();
        fs::write(top.join("malware.sh"), b"#!/bin/sh").unwrap();

        let entries = diff(&record, DriftOptions::default()).unwrap();
        let kinds: Vec<_> = entries
            .iter()
            .map(|e| (e.path.to_str().unwrap(), e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("etc/motd", ChangeKind::Deleted),
                ("etc/passwd", ChangeKind::Modified),
                ("malware.sh", ChangeKind::Added),
            ]
        );
        // Hashing on by default: added/modified files carry a digest.
        assert!(entries[1].sha256.is_some());
        assert!(entries[2].sha256.is_some());
    }

    #[test]
    fn test_opaque_readd_is_not_a_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with_layers(dir.path(), &["base", "top"]);
        let base = &record.layers[0].path;
        let top = &record.layers[1].path;

        fs::create_dir_all(base.join("cfg")).unwrap();
        fs::write(base.join("cfg/a.conf"), b"same").unwrap();
        fs::write(base.join("cfg/b.conf"), b"dropped").unwrap();

        // Opaque marker wipes cfg/, but a.conf is re-created identically.
        fs::create_dir_all(top.join("cfg")).unwrap();
        fs::write(top.join("cfg/.wh..wh..opq"), b"").unwrap();
        fs::write(top.join("cfg/a.conf"), b"same").unwrap();

        let entries = diff(&record, DriftOptions::default()).unwrap();
        let kinds: Vec<_> = entries
            .iter()
            .map(|e| (e.path.to_str().unwrap(), e.kind))
            .collect();
        // Only the path the top layer does not re-populate is deleted;
        // the re-added identical file is present in the merged view.
        assert_eq!(kinds, vec![("cfg/b.conf", ChangeKind::Deleted)]);
    }

    #[test]
    fn test_identical_file_is_not_drift() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with_layers(dir.path(), &["base", "top"]);
        fs::write(record.layers[0].path.join("same"), b"content").unwrap();
        fs::write(record.layers[1].path.join("same"), b"content").unwrap();

        let entries = diff(&record, DriftOptions::default()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_metadata_fallback_without_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with_layers(dir.path(), &["base", "top"]);
        fs::write(record.layers[0].path.join("grown"), b"aa").unwrap();
        fs::write(record.layers[1].path.join("grown"), b"aaaa").unwrap();

        let entries = diff(&record, DriftOptions { hash_files: false }).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ChangeKind::Modified);
        assert!(entries[0].sha256.is_none());
    }
}
