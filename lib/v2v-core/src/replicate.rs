// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Changed-block-tracking replication.
//!
//! One full copy from an initial snapshot, then repeated passes that copy
//! only what CBT reports as written since the previous pass. Between passes
//! the single migration snapshot is rotated; every disk finishes a pass
//! before the rotation happens. The loop ends when a pass finds no drift on
//! any disk, or after `max_iterations` incremental passes.

use std::sync::Arc;

use serde_derive::Serialize;
use slog::{debug, info, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::collab::{ProgressSink, VmManager};
use crate::disk::{normalize_regions, total_bytes, SnapshotRef, VmDisk};
use crate::error::{Result, V2vError};
use crate::transport::BlockTransport;

/// Counters describing what a replication run did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub full_copies: u32,
    pub incremental_copies: u32,
    pub rotations: u32,
    /// Incremental passes run, including the final drift-free one.
    pub iterations: u32,
    pub bytes_transferred: u64,
    /// True if the last pass saw no drift; false if the iteration cap ended
    /// the run.
    pub converged: bool,
}

pub struct Replicator {
    vm: String,
    vms: Arc<dyn VmManager>,
    transport: Box<dyn BlockTransport>,
    progress: Arc<dyn ProgressSink>,
    cfg: v2v_config::Replication,
    cancel: CancellationToken,
    report: ReplicationReport,
    log: Logger,
}

impl Replicator {
    pub fn new(
        vm: &str,
        vms: Arc<dyn VmManager>,
        transport: Box<dyn BlockTransport>,
        progress: Arc<dyn ProgressSink>,
        cfg: v2v_config::Replication,
        log: &Logger,
    ) -> Self {
        Self {
            vm: vm.to_string(),
            vms,
            transport,
            progress,
            cfg,
            cancel: CancellationToken::new(),
            report: ReplicationReport::default(),
            log: log.new(o!("vm" => vm.to_string(), "component" => "replicate")),
        }
    }

    /// Replaces the token checked between disk copies and handed to the
    /// transport.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.transport.set_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn report(&self) -> &ReplicationReport {
        &self.report
    }

    /// Runs the replication loop over `disks` and returns them with their
    /// final `change_id`.
    pub async fn replicate(&mut self, mut disks: Vec<VmDisk>) -> Result<Vec<VmDisk>> {
        self.report = ReplicationReport::default();
        let mut snapshot: Option<SnapshotRef> = None;

        let res = self.run(&mut disks, &mut snapshot).await;

        let stopped = self.transport.stop_all().await;
        let deleted = match snapshot.take() {
            Some(snap) => self.vms.delete_snapshot(&self.vm, &snap).await,
            None => Ok(()),
        };

        match res {
            Ok(()) => {
                stopped?;
                deleted?;
                info!(self.log, "replication finished";
                    "full_copies" => self.report.full_copies,
                    "incremental_copies" => self.report.incremental_copies,
                    "rotations" => self.report.rotations,
                    "bytes" => self.report.bytes_transferred,
                    "converged" => self.report.converged,
                );
                Ok(disks)
            }
            Err(e) => {
                if let Err(ce) = stopped {
                    warn!(self.log, "failed to stop transport sessions"; "error" => %ce);
                }
                if let Err(ce) = deleted {
                    warn!(self.log, "failed to delete migration snapshot"; "error" => %ce);
                }
                Err(e)
            }
        }
    }

    fn check_cancelled(&self, target: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(V2vError::Cancelled {
                op: "replicate",
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// Takes a fresh snapshot and refreshes every disk's CBT marker from it.
    /// The previous snapshot, if any, is deleted first so that at most one
    /// exists at a time.
    async fn rotate(
        &mut self,
        disks: &mut [VmDisk],
        snapshot: &mut Option<SnapshotRef>,
    ) -> Result<()> {
        if let Some(old) = snapshot.take() {
            self.vms.delete_snapshot(&self.vm, &old).await?;
        }
        let snap = self.vms.create_snapshot(&self.vm, &self.cfg.snapshot_name).await?;
        *snapshot = Some(snap.clone());
        for disk in disks.iter_mut() {
            self.vms.refresh_disk(&self.vm, &snap, disk).await?;
            disk.snapshot_name = Some(snap.name.clone());
        }
        debug!(self.log, "snapshot taken"; "snapshot" => &snap.handle);
        Ok(())
    }

    async fn run(
        &mut self,
        disks: &mut [VmDisk],
        snapshot: &mut Option<SnapshotRef>,
    ) -> Result<()> {
        self.rotate(disks, snapshot).await?;
        let Some(snap) = snapshot.clone() else {
            return Err(V2vError::StateMismatch("no migration snapshot".to_string()));
        };

        // Full pass. Every disk is copied once before any diffing starts.
        for disk in disks.iter() {
            self.check_cancelled(&disk.name)?;
            self.progress.report(&disk.name, "full copy", Some(0));
            self.transport.start(disk, &snap).await?;
            let bytes = self.transport.copy_full(disk).await?;
            self.report.full_copies += 1;
            self.report.bytes_transferred += bytes;
            self.progress.report(&disk.name, "full copy", Some(100));
        }

        // CBT marker each disk's target content corresponds to.
        let mut baselines = Self::baselines(disks)?;

        for iteration in 1..=self.cfg.max_iterations {
            self.rotate(disks, snapshot).await?;
            self.report.rotations += 1;
            let Some(snap) = snapshot.clone() else {
                return Err(V2vError::StateMismatch("no migration snapshot".to_string()));
            };
            self.report.iterations = iteration;

            let mut drifted = 0;
            for (disk, baseline) in disks.iter().zip(baselines.iter()) {
                self.check_cancelled(&disk.name)?;
                let raw = self
                    .vms
                    .changed_areas(&self.vm, &snap, disk, baseline)
                    .await?;
                let regions = normalize_regions(&disk.name, disk.size, &raw)?;
                if regions.is_empty() {
                    debug!(self.log, "no drift"; "disk" => &disk.name, "iteration" => iteration);
                    continue;
                }
                drifted += 1;
                let stage = format!("incremental pass {iteration}");
                self.progress.report(&disk.name, &stage, None);
                self.transport.stop(disk).await?;
                self.transport.start(disk, &snap).await?;
                let bytes = self.transport.copy_regions(disk, &regions).await?;
                self.report.incremental_copies += 1;
                self.report.bytes_transferred += bytes;
                info!(self.log, "copied changed regions";
                    "disk" => &disk.name,
                    "iteration" => iteration,
                    "regions" => regions.len(),
                    "bytes" => total_bytes(&regions),
                );
            }

            if drifted == 0 {
                self.report.converged = true;
                return Ok(());
            }
            baselines = Self::baselines(disks)?;
        }

        warn!(self.log, "iteration cap reached with drift remaining";
            "max_iterations" => self.cfg.max_iterations);
        Ok(())
    }

    fn baselines(disks: &[VmDisk]) -> Result<Vec<String>> {
        disks
            .iter()
            .map(|d| {
                d.change_id.clone().ok_or_else(|| {
                    V2vError::StateMismatch(format!(
                        "disk {} has no change id; is CBT enabled?",
                        d.name
                    ))
                })
            })
            .collect()
    }
}
