// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vendor-agnostic access to the storage arrays that migrated disks land on.
//!
//! Each supported array family implements [`StorageProvider`]. Callers pick a
//! driver by name through a [`ProviderRegistry`] assembled at startup, and
//! from then on only speak the trait: volume lifecycle, initiator-group
//! mapping and NAA resolution look the same whichever array is underneath.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

pub mod cinder;
pub mod error;
pub mod generic;
pub mod http;
pub mod naa;
pub mod netapp;
pub mod poll;
pub mod pure;
pub mod registry;

pub use error::{ErrorKind, Result, StorageError};
pub use registry::{create_provider, ProviderConfig, ProviderRegistry, Vendor};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Rounds a requested size up to a whole number of GiB. Arrays are asked
/// for aligned sizes only so that the target is never smaller than the
/// source disk.
pub fn round_up_to_gib(bytes: u64) -> Result<u64> {
    bytes
        .div_ceil(GIB)
        .checked_mul(GIB)
        .ok_or(StorageError::SizeOverflow(bytes))
}

/// Identity of a volume on an array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// The name the array knows the volume by.
    pub name: String,
    /// Provisioned size in bytes.
    pub size: u64,
    /// Canonical `naa.<hex>` identifier.
    pub naa: String,
    /// Opaque backend identifier.
    pub id: String,
    /// Set when the volume is already registered in the block-storage
    /// catalog, as it is for volumes the catalog itself created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
}

/// A [`Volume`] as reported by an inventory query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
    pub naa: String,
    pub serial: String,
    pub id: String,
}

impl From<VolumeInfo> for Volume {
    fn from(info: VolumeInfo) -> Self {
        Volume {
            name: info.name,
            size: info.size,
            naa: info.naa,
            id: info.id,
            catalog_id: None,
        }
    }
}

/// Facts resolved by [`StorageProvider::create_or_update_initiator_group`]
/// and consumed by the same driver's map/unmap/list calls.
///
/// Lives for one migration attempt and is never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingContext {
    /// FlashArray host objects whose initiators matched.
    Pure { hosts: Vec<String> },
    /// ONTAP igroups whose initiators matched.
    NetApp { igroups: Vec<String> },
    /// Connector facts for the catalog-driven driver.
    Generic {
        initiator_group_name: String,
        iqns: Vec<String>,
        wwpns: Vec<String>,
        /// Hosts this attempt forced into existence with a throwaway volume.
        created_hosts: Vec<String>,
    },
}

impl MappingContext {
    pub fn vendor(&self) -> Vendor {
        match self {
            MappingContext::Pure { .. } => Vendor::Pure,
            MappingContext::NetApp { .. } => Vendor::Netapp,
            MappingContext::Generic { .. } => Vendor::Generic,
        }
    }

    /// The array-side groups a mapping made with this context touches.
    pub fn groups(&self) -> Vec<String> {
        match self {
            MappingContext::Pure { hosts } => hosts.clone(),
            MappingContext::NetApp { igroups } => igroups.clone(),
            MappingContext::Generic { initiator_group_name, .. } => {
                vec![initiator_group_name.clone()]
            }
        }
    }
}

/// Error for a context handed to the wrong driver.
pub(crate) fn wrong_context(driver: Vendor, ctx: &MappingContext) -> StorageError {
    StorageError::StateMismatch(format!(
        "{driver} driver received a {} mapping context",
        ctx.vendor()
    ))
}

/// Operations every array driver supports.
///
/// A driver instance holds at most one management session and is owned by a
/// single orchestration call; none of these methods are expected to be
/// invoked concurrently on the same instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Establishes a management session.
    async fn connect(&mut self) -> Result<()>;

    /// Tears down the management session. Safe to call when not connected.
    async fn disconnect(&mut self) -> Result<()>;

    /// Checks the session is usable, silently reconnecting if it was
    /// dropped or expired.
    async fn validate_credentials(&mut self) -> Result<()>;

    /// Creates an empty volume of at least `size_bytes`, rounded up to a
    /// whole GiB.
    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<Volume>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn get_volume_info(&self, name: &str) -> Result<VolumeInfo>;

    async fn list_all_volumes(&self) -> Result<Vec<VolumeInfo>>;

    async fn get_all_volume_naas(&self) -> Result<Vec<String>>;

    /// Resolves which array-side hosts or groups correspond to the given
    /// IQNs/WWNs. Fails with a not-found error when none match.
    async fn create_or_update_initiator_group(
        &self,
        group: &str,
        hba_ids: &[String],
    ) -> Result<MappingContext>;

    /// Maps `volume` to every group in `ctx`. Mapping an already-mapped pair
    /// succeeds.
    async fn map_volume_to_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()>;

    /// Removes the mapping made by [`Self::map_volume_to_group`]. Removing an
    /// absent mapping succeeds.
    async fn unmap_volume_from_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()>;

    /// Lists the groups `volume` is currently mapped to.
    async fn get_mapped_groups(
        &self,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<Vec<String>>;

    /// Builds a context addressing exactly `groups`, used to restore mappings
    /// captured with [`Self::get_mapped_groups`].
    fn context_for_groups(&self, groups: &[String]) -> MappingContext;

    /// Locates the array volume a catalog entry was provisioned from.
    async fn resolve_cinder_volume_to_lun(&self, catalog_id: &str) -> Result<Volume>;

    fn who_am_i(&self) -> &'static str;
}
