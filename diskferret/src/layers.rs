//! Layer stacks and the merged filesystem view.
//!
//! A container filesystem is an ordered stack of layer directories, base
//! first, writable layer last. [`MergedView`] applies copy-up semantics over
//! the stack: the topmost occurrence of a path wins, and whiteout/opaque
//! markers from upper layers remove lower content instead of showing up as
//! regular files.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use crate::inventory::LayerRef;

/// aufs-style whiteout prefix, also used inside exported layer tars.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker replacing a directory's entire lower content.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Returns the path deleted by a whiteout file name, if it is one.
pub fn whiteout_target(name: &OsStr) -> Option<String> {
    let name = name.to_str()?;
    if name == OPAQUE_MARKER {
        return None;
    }
    name.strip_prefix(WHITEOUT_PREFIX).map(str::to_string)
}

/// True for the overlayfs deletion convention: a 0:0 character device node.
#[cfg(unix)]
pub fn is_whiteout_device(metadata: &Metadata) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    metadata.file_type().is_char_device() && metadata.rdev() == 0
}

#[cfg(not(unix))]
pub fn is_whiteout_device(_metadata: &Metadata) -> bool {
    false
}

/// One path in the merged view, pointing back at the layer file that won.
#[derive(Debug, Clone)]
pub enum MergedEntry {
    File {
        size: u64,
        mtime: Option<SystemTime>,
        source: PathBuf,
    },
    Directory {
        source: PathBuf,
    },
    Symlink {
        target: PathBuf,
        source: PathBuf,
    },
}

/// Copy-up merge of a layer stack, keyed by container-relative path.
///
/// A `BTreeMap` keeps traversal in sorted path order, which keeps drift
/// reports and export manifests deterministic.
pub struct MergedView {
    entries: BTreeMap<PathBuf, MergedEntry>,
}

impl MergedView {
    /// Builds the merged view by applying `layers` base-to-top.
    pub fn build(layers: &[LayerRef]) -> io::Result<Self> {
        let mut view = Self {
            entries: BTreeMap::new(),
        };
        for layer in layers {
            view.apply_layer(&layer.path)?;
        }
        Ok(view)
    }

    pub fn get(&self, path: &Path) -> Option<&MergedEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PathBuf, &MergedEntry)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes a path and everything under it.
    fn remove_subtree(&mut self, path: &Path) {
        self.entries
            .retain(|p, _| !(p == path || p.starts_with(path)));
    }

    /// Drops a directory's content while keeping the directory itself.
    fn clear_directory(&mut self, dir: &Path) {
        self.entries.retain(|p, _| p == dir || !p.starts_with(dir));
    }

    fn apply_layer(&mut self, layer_root: &Path) -> io::Result<()> {
        self.apply_dir(layer_root, layer_root)
    }

    fn apply_dir(&mut self, layer_root: &Path, dir: &Path) -> io::Result<()> {
        let rel_dir = dir
            .strip_prefix(layer_root)
            .unwrap_or(Path::new(""))
            .to_path_buf();
        let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<io::Result<_>>()?;

        // Markers first: an opaque marker or whiteout must clear lower
        // content before this layer's own sibling entries are inserted.
        for entry in &entries {
            let name = entry.file_name();
            if name.to_str() == Some(OPAQUE_MARKER) {
                self.clear_directory(&rel_dir);
            } else if let Some(target) = whiteout_target(&name) {
                self.remove_subtree(&rel_dir.join(target));
            } else if entry
                .path()
                .symlink_metadata()
                .is_ok_and(|m| is_whiteout_device(&m))
            {
                self.remove_subtree(&rel_dir.join(&name));
            }
        }

        for entry in &entries {
            let source = entry.path();
            let name = entry.file_name();
            if name.to_str() == Some(OPAQUE_MARKER) || whiteout_target(&name).is_some() {
                continue;
            }

            let metadata = source.symlink_metadata()?;
            if is_whiteout_device(&metadata) {
                continue;
            }

            let rel = rel_dir.join(&name);
            if metadata.is_dir() {
                self.entries
                    .insert(rel.clone(), MergedEntry::Directory { source });
                self.apply_dir(layer_root, &entry.path())?;
            } else if metadata.file_type().is_symlink() {
                match std::fs::read_link(&source) {
                    Ok(target) => {
                        // An upper-layer file replacing a lower dir hides the
                        // dir's content too; same for symlinks.
                        self.remove_subtree(&rel);
                        self.entries.insert(rel, MergedEntry::Symlink { target, source });
                    }
                    Err(e) => warn!("unreadable symlink {}: {}", source.display(), e),
                }
            } else if metadata.is_file() {
                self.remove_subtree(&rel);
                self.entries.insert(
                    rel,
                    MergedEntry::File {
                        size: metadata.len(),
                        mtime: metadata.modified().ok(),
                        source,
                    },
                );
            }
            // Sockets, fifos, and device nodes other than whiteouts carry no
            // exportable content and are ignored.
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn layer(dir: &Path, name: &str) -> LayerRef {
        let path = dir.join(name);
        fs::create_dir_all(&path).unwrap();
        LayerRef {
            id: name.to_string(),
            path,
        }
    }

    #[test]
    fn test_topmost_layer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base");
        let top = layer(dir.path(), "top");
        fs::write(base.path.join("motd"), b"old").unwrap();
        fs::write(top.path.join("motd"), b"new").unwrap();

        let view = MergedView::build(&[base, top]).unwrap();
        match view.get(Path::new("motd")).unwrap() {
            MergedEntry::File { source, .. } => {
                assert!(source.ends_with("top/motd"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_whiteout_hides_lower_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base");
        let top = layer(dir.path(), "top");
        fs::create_dir_all(base.path.join("a")).unwrap();
        fs::write(base.path.join("a/b.txt"), b"data").unwrap();
        fs::create_dir_all(top.path.join("a")).unwrap();
        fs::write(top.path.join("a/.wh.b.txt"), b"").unwrap();

        let view = MergedView::build(&[base, top]).unwrap();
        assert!(view.get(Path::new("a/b.txt")).is_none());
        assert!(view.get(Path::new("a")).is_some());
        // The marker itself never appears as a regular file.
        assert!(view.get(Path::new("a/.wh.b.txt")).is_none());
    }

    #[test]
    fn test_opaque_marker_replaces_directory_content() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base");
        let top = layer(dir.path(), "top");
        fs::create_dir_all(base.path.join("cfg")).unwrap();
        fs::write(base.path.join("cfg/stale.conf"), b"x").unwrap();
        fs::create_dir_all(top.path.join("cfg")).unwrap();
        fs::write(top.path.join("cfg/.wh..wh..opq"), b"").unwrap();
        fs::write(top.path.join("cfg/fresh.conf"), b"y").unwrap();

        let view = MergedView::build(&[base, top]).unwrap();
        assert!(view.get(Path::new("cfg/stale.conf")).is_none());
        assert!(view.get(Path::new("cfg/fresh.conf")).is_some());
    }

    #[test]
    fn test_entries_are_sorted_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base");
        fs::write(base.path.join("zz"), b"").unwrap();
        fs::write(base.path.join("aa"), b"").unwrap();
        fs::create_dir_all(base.path.join("mid")).unwrap();
        fs::write(base.path.join("mid/file"), b"").unwrap();

        let view = MergedView::build(&[base]).unwrap();
        let paths: Vec<_> = view.entries().map(|(p, _)| p.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }
}
