//! Container Root Locator: decides whether a mounted filesystem hosts a
//! supported container-runtime storage layout.
//!
//! Detection is purely structural - the expected directory set plus at least
//! one runtime metadata artifact - so it works on dead disks where the
//! runtime software itself is absent or unbootable.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

/// Default Docker data root, relative to a mountpoint.
pub const DOCKER_DEFAULT_ROOT: &str = "var/lib/docker";
/// Default containerd data root, relative to a mountpoint.
pub const CONTAINERD_DEFAULT_ROOT: &str = "var/lib/containerd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Containerd,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Containerd => write!(f, "containerd"),
        }
    }
}

/// Which probe produced a [`ContainerRoot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootSource {
    Default,
    Override,
}

/// A location confirmed to contain a runtime's persistent storage.
#[derive(Debug, Clone)]
pub struct ContainerRoot {
    pub kind: RuntimeKind,
    pub path: PathBuf,
    pub source: RootSource,
}

/// Precedence between a user-supplied root override and the well-known
/// default paths.
///
/// With `OverrideOnly` a custom root suppresses default probing entirely.
/// `OverrideThenDefaults` falls back to the defaults when the override does
/// not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverridePolicy {
    #[default]
    OverrideOnly,
    OverrideThenDefaults,
}

/// Probes one mountpoint and returns the first matching container root.
///
/// `None` is the common outcome for unrelated mountpoints (boot partitions,
/// data disks) and must not abort processing of sibling mountpoints.
pub fn locate(
    mountpoint: &Path,
    override_path: Option<&Path>,
    policy: OverridePolicy,
) -> Option<ContainerRoot> {
    locate_all(mountpoint, override_path, policy).into_iter().next()
}

/// Like [`locate`], but returns every matching root. A single disk can host
/// both a Docker and a containerd layout.
pub fn locate_all(
    mountpoint: &Path,
    override_path: Option<&Path>,
    policy: OverridePolicy,
) -> Vec<ContainerRoot> {
    if let Some(rel) = override_path {
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        let candidate = mountpoint.join(rel);
        if let Some(kind) = classify(&candidate) {
            debug!("override container root {} is {}", candidate.display(), kind);
            return vec![ContainerRoot {
                kind,
                path: candidate,
                source: RootSource::Override,
            }];
        }
        debug!("override path {} has no supported layout", candidate.display());
        if policy == OverridePolicy::OverrideOnly {
            return Vec::new();
        }
    }

    let mut roots = Vec::new();
    for default in [DOCKER_DEFAULT_ROOT, CONTAINERD_DEFAULT_ROOT] {
        let candidate = mountpoint.join(default);
        if let Some(kind) = classify(&candidate) {
            debug!("found {} root at {}", kind, candidate.display());
            roots.push(ContainerRoot {
                kind,
                path: candidate,
                source: RootSource::Default,
            });
        }
    }
    roots
}

/// Structural classification of a directory as a runtime storage root.
fn classify(path: &Path) -> Option<RuntimeKind> {
    if !path.is_dir() {
        return None;
    }

    const DOCKER_MARKERS: &[&str] = &["containers", "image", "overlay2"];
    if DOCKER_MARKERS.iter().any(|m| path.join(m).is_dir()) {
        return Some(RuntimeKind::Docker);
    }

    let has_containerd_plugin = fs::read_dir(path)
        .ok()?
        .flatten()
        .any(|e| e.file_name().to_string_lossy().starts_with("io.containerd."));
    if has_containerd_plugin {
        return Some(RuntimeKind::Containerd);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_docker_root(mountpoint: &Path) {
        fs::create_dir_all(mountpoint.join("var/lib/docker/containers")).unwrap();
        fs::create_dir_all(mountpoint.join("var/lib/docker/overlay2")).unwrap();
    }

    fn make_containerd_root(mountpoint: &Path) {
        fs::create_dir_all(
            mountpoint.join("var/lib/containerd/io.containerd.snapshotter.v1.overlayfs"),
        )
        .unwrap();
    }

    #[test]
    fn test_unrelated_mountpoint_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("boot/grub")).unwrap();
        assert!(locate(dir.path(), None, OverridePolicy::default()).is_none());
    }

    #[test]
    fn test_default_docker_root() {
        let dir = tempfile::tempdir().unwrap();
        make_docker_root(dir.path());

        let root = locate(dir.path(), None, OverridePolicy::default()).unwrap();
        assert_eq!(root.kind, RuntimeKind::Docker);
        assert_eq!(root.source, RootSource::Default);
        assert_eq!(root.path, dir.path().join("var/lib/docker"));
    }

    #[test]
    fn test_both_runtimes_on_one_disk() {
        let dir = tempfile::tempdir().unwrap();
        make_docker_root(dir.path());
        make_containerd_root(dir.path());

        let roots = locate_all(dir.path(), None, OverridePolicy::default());
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].kind, RuntimeKind::Docker);
        assert_eq!(roots[1].kind, RuntimeKind::Containerd);
    }

    #[test]
    fn test_override_suppresses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        make_docker_root(dir.path());

        // Override pointing somewhere without a layout: OverrideOnly finds
        // nothing even though the default path would match.
        let miss = locate(
            dir.path(),
            Some(Path::new("/srv/custom")),
            OverridePolicy::OverrideOnly,
        );
        assert!(miss.is_none());

        let fallback = locate(
            dir.path(),
            Some(Path::new("/srv/custom")),
            OverridePolicy::OverrideThenDefaults,
        )
        .unwrap();
        assert_eq!(fallback.source, RootSource::Default);
    }

    #[test]
    fn test_override_custom_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("srv/custom/containers")).unwrap();

        let root = locate(
            dir.path(),
            Some(Path::new("/srv/custom")),
            OverridePolicy::OverrideOnly,
        )
        .unwrap();
        assert_eq!(root.kind, RuntimeKind::Docker);
        assert_eq!(root.source, RootSource::Override);
    }
}
