// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Follows a remote clone started on a hypervisor host until it ends.

use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, Logger};
use tokio_util::sync::CancellationToken;

use crate::collab::ProgressSink;
use crate::error::{Result, V2vError};
use crate::esxi::{CloneHandle, EsxiHost};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloneState {
    Running { percent: u8 },
    Finished,
}

/// What the tracker needs to observe a clone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloneWatch: Send + Sync {
    async fn is_running(&self, pid: u32) -> Result<bool>;

    async fn used_bytes(&self, path: &str) -> Result<u64>;

    async fn path_exists(&self, path: &str) -> Result<bool>;
}

#[async_trait]
impl CloneWatch for EsxiHost {
    async fn is_running(&self, pid: u32) -> Result<bool> {
        EsxiHost::is_running(self, pid).await
    }

    async fn used_bytes(&self, path: &str) -> Result<u64> {
        EsxiHost::used_bytes(self, path).await
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        EsxiHost::path_exists(self, path).await
    }
}

/// Share of `source_size` that `used` represents, capped at 99 while the
/// clone is still running.
pub fn percent_of(used: u64, source_size: u64) -> u8 {
    if source_size == 0 {
        return 0;
    }
    let pct = (u128::from(used) * 100 / u128::from(source_size)).min(99);
    pct as u8
}

pub struct CloneTracker<'a> {
    watch: &'a dyn CloneWatch,
    handle: CloneHandle,
    /// Directory whose usage grows as the clone proceeds.
    measure_path: String,
    source_size: u64,
    interval: Duration,
    state: CloneState,
    log: Logger,
}

impl<'a> CloneTracker<'a> {
    pub fn new(
        watch: &'a dyn CloneWatch,
        handle: CloneHandle,
        measure_path: &str,
        source_size: u64,
        interval: Duration,
        log: &Logger,
    ) -> Self {
        Self {
            watch,
            handle,
            measure_path: measure_path.to_string(),
            source_size,
            interval,
            state: CloneState::Running { percent: 0 },
            log: log.clone(),
        }
    }

    pub fn state(&self) -> CloneState {
        self.state
    }

    /// Samples the clone once.
    pub async fn poll(&mut self) -> Result<CloneState> {
        if self.state == CloneState::Finished {
            return Ok(self.state);
        }
        if self.watch.is_running(self.handle.pid).await? {
            let used = self.watch.used_bytes(&self.measure_path).await?;
            self.state = CloneState::Running {
                percent: percent_of(used, self.source_size),
            };
            return Ok(self.state);
        }
        if !self.watch.path_exists(&self.handle.target).await? {
            return Err(V2vError::CloneFailed { target: self.handle.target.clone() });
        }
        self.state = CloneState::Finished;
        info!(self.log, "clone finished"; "target" => &self.handle.target);
        Ok(self.state)
    }

    /// Polls until the clone finishes. Cancellation stops watching; the
    /// remote process keeps running.
    pub async fn wait(
        &mut self,
        disk: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            match self.poll().await? {
                CloneState::Finished => {
                    progress.report(disk, "array clone", Some(100));
                    return Ok(());
                }
                CloneState::Running { percent } => {
                    debug!(self.log, "clone running"; "pid" => self.handle.pid, "percent" => percent);
                    progress.report(disk, "array clone", Some(percent));
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(V2vError::Cancelled {
                        op: "track clone",
                        target: self.handle.target.clone(),
                    });
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
