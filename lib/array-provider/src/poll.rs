// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded fixed-interval polling.
//!
//! Every wait in the data-plane (volume availability, device visibility,
//! power state, clone completion) goes through [`poll_until`] so that none of
//! them can block without an attempt ceiling, and all of them stop promptly
//! when the caller's [`CancellationToken`] fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How many times to check and how long to sleep between checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollConfig {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Why a poll ended without producing a value.
#[derive(Debug)]
pub enum PollError<E> {
    /// The check never reported readiness within the attempt ceiling.
    Timeout { attempts: u32 },
    /// The cancellation token fired.
    Cancelled,
    /// The check itself failed; polling stops at the first failure.
    Failed(E),
}

/// Runs `check` until it yields `Some`, fails, the attempts are exhausted, or
/// `cancel` fires. The check receives the 1-based attempt number.
///
/// There is no sleep after the final attempt.
pub async fn poll_until<T, E, F, Fut>(
    cfg: PollConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 1..=cfg.attempts {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            res = check(attempt) => res,
        };
        if let Some(value) = outcome.map_err(PollError::Failed)? {
            return Ok(value);
        }

        if attempt < cfg.attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(cfg.interval) => {}
            }
        }
    }

    Err(PollError::Timeout { attempts: cfg.attempts })
}
