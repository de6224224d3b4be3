// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data-plane of a VM disk migration.
//!
//! Two ways of moving a source VM's disks onto target block volumes:
//!
//! - [`replicate::Replicator`] streams disk content over NBD while the VM
//!   keeps running, using changed-block tracking to shrink each pass until
//!   the disks converge.
//! - [`xcopy::XcopyOrchestrator`] has the hypervisor host clone each disk
//!   straight onto an array volume, leaving the copy to the array.

#![allow(clippy::style)]

pub mod catalog;
pub mod collab;
pub mod disk;
pub mod error;
pub mod esxi;
pub mod nbd;
pub mod replicate;
pub mod tracker;
pub mod transport;
pub mod xcopy;

pub use array_provider::poll;
pub use error::{ErrorKind, NbdError, Result, V2vError};

pub use collab::{HostRef, PowerState, ProgressSink, Provisioner, VmManager};
pub use disk::{ChangedRegion, SnapshotRef, VmDisk};
pub use replicate::{ReplicationReport, Replicator};
pub use xcopy::{CopiedVolume, XcopyOrchestrator};
