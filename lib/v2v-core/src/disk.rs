// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source disk model shared by both copy strategies.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, V2vError};

/// One virtual disk of the source VM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDisk {
    pub name: String,
    pub size: u64,
    pub boot: bool,
    pub datastore: String,
    /// Hypervisor device key of the backing.
    pub device_key: i32,
    /// CBT marker of the most recent completed snapshot.
    pub change_id: Option<String>,
    pub snapshot_name: Option<String>,
    /// Backing file of the disk inside the current snapshot, e.g.
    /// `[ds1] vm/vm-000002.vmdk`.
    pub snapshot_backing: Option<String>,
    /// Source backing file, e.g. `[ds1] vm/vm.vmdk`.
    pub backing_path: String,
    /// Local block device the disk is written to.
    pub target_path: Option<PathBuf>,
    pub catalog_volume_id: Option<String>,
}

impl VmDisk {
    pub fn target(&self) -> Result<&PathBuf> {
        self.target_path.as_ref().ok_or_else(|| {
            V2vError::StateMismatch(format!("disk {} has no target path", self.name))
        })
    }

    /// Datastore-relative backing path turned into the host-side path under
    /// `/vmfs/volumes`.
    pub fn host_backing_path(&self) -> Result<String> {
        datastore_path_to_host(&self.backing_path).ok_or_else(|| {
            V2vError::StateMismatch(format!(
                "disk {}: malformed backing path {:?}",
                self.name, self.backing_path
            ))
        })
    }
}

/// `[ds1] dir/file.vmdk` to `/vmfs/volumes/ds1/dir/file.vmdk`.
pub fn datastore_path_to_host(path: &str) -> Option<String> {
    let rest = path.trim().strip_prefix('[')?;
    let (ds, file) = rest.split_once(']')?;
    let file = file.trim();
    if ds.is_empty() || file.is_empty() {
        return None;
    }
    Some(format!("/vmfs/volumes/{ds}/{file}"))
}

/// Handle of the single rotating migration snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Managed object reference, e.g. `snapshot-1042`.
    pub handle: String,
    pub name: String,
}

/// A changed extent reported by CBT.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRegion {
    pub start: u64,
    pub length: u64,
}

impl ChangedRegion {
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }
}

/// Sorts `regions` and merges any that overlap or touch, rejecting those
/// that fall outside a disk of `disk_size` bytes. Zero-length regions are
/// dropped.
pub fn normalize_regions(
    disk: &str,
    disk_size: u64,
    regions: &[ChangedRegion],
) -> Result<Vec<ChangedRegion>> {
    let mut sorted: Vec<ChangedRegion> =
        regions.iter().copied().filter(|r| r.length > 0).collect();
    sorted.sort_by_key(|r| r.start);

    let mut out: Vec<ChangedRegion> = Vec::with_capacity(sorted.len());
    for r in sorted {
        if r.start.checked_add(r.length).map_or(true, |end| end > disk_size) {
            return Err(V2vError::StateMismatch(format!(
                "disk {disk}: changed region [{}, +{}) beyond size {disk_size}",
                r.start, r.length
            )));
        }
        match out.last_mut() {
            Some(prev) if r.start <= prev.end() => {
                prev.length = prev.end().max(r.end()) - prev.start;
            }
            _ => out.push(r),
        }
    }
    Ok(out)
}

pub fn total_bytes(regions: &[ChangedRegion]) -> u64 {
    regions.iter().map(|r| r.length).sum()
}
