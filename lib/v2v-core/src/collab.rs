// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the systems around the data-plane: the hypervisor manager,
//! the helper-VM provisioner and whoever reports progress to the operator.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::disk::{ChangedRegion, SnapshotRef, VmDisk};
use crate::error::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// The hypervisor host currently running a VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRef {
    pub name: String,
    pub management_ip: String,
}

/// VM inventory and lifecycle, as offered by the hypervisor manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VmManager: Send + Sync {
    async fn disks(&self, vm: &str) -> Result<Vec<VmDisk>>;

    async fn power_state(&self, vm: &str) -> Result<PowerState>;

    /// Requests power off without waiting for it to complete.
    async fn power_off(&self, vm: &str) -> Result<()>;

    async fn host_of(&self, vm: &str) -> Result<HostRef>;

    async fn create_snapshot(&self, vm: &str, name: &str) -> Result<SnapshotRef>;

    async fn delete_snapshot(&self, vm: &str, snapshot: &SnapshotRef) -> Result<()>;

    /// Updates `disk.change_id` and `disk.snapshot_backing` from `snapshot`.
    async fn refresh_disk(
        &self,
        vm: &str,
        snapshot: &SnapshotRef,
        disk: &mut VmDisk,
    ) -> Result<()>;

    /// Extents of `disk` written since the CBT marker `since`, as seen by
    /// `snapshot`.
    async fn changed_areas(
        &self,
        vm: &str,
        snapshot: &SnapshotRef,
        disk: &VmDisk,
        since: &str,
    ) -> Result<Vec<ChangedRegion>>;
}

/// Attaches catalog volumes to the helper VM running the migration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Returns the block device the volume appeared as.
    async fn attach_volume(&self, catalog_id: &str) -> Result<PathBuf>;
}

/// Receives human-facing status lines.
#[cfg_attr(test, mockall::automock)]
pub trait ProgressSink: Send + Sync {
    fn report(&self, disk: &str, stage: &str, percent: Option<u8>);
}

