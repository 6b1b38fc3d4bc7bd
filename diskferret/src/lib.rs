//! Core library for inventorying containers found on disk images. The crate
//! attaches a disk image as a block device, mounts its filesystems read-only,
//! probes each mountpoint for Docker or containerd storage roots, and builds a
//! normalized container inventory with optional filesystem drift detection and
//! selective export of merged container filesystems.

/// Attaching disk images as block devices and mounting their volumes.
pub mod block;
/// Drift detection between a container's writable layer and its base layers.
pub mod drift;
/// Exporting merged container filesystems into compressed archives.
pub mod export;
/// Container enumeration for supported runtime storage layouts.
pub mod inventory;
/// Layer stacks, whiteout markers, and the merged filesystem view.
pub mod layers;
/// Structural detection of container-runtime storage roots.
pub mod locate;
/// One-disk task orchestration: attach, inspect, always tear down.
pub mod pipeline;
