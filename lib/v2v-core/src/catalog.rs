// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Importing array volumes into the block-storage catalog.

use array_provider::cinder::CinderClient;
use array_provider::poll::PollConfig;
use async_trait::async_trait;
use slog::{info, Logger};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VolumeCatalog: Send + Sync {
    /// Registers the array volume `source_name` and returns its catalog id.
    /// The backend renames the array volume as part of the import.
    async fn import(
        &self,
        source_name: &str,
        display_name: &str,
        bootable: bool,
    ) -> Result<String>;

    /// Waits until the imported volume is usable.
    async fn wait_available(&self, id: &str, cancel: &CancellationToken) -> Result<()>;
}

pub struct CinderCatalog {
    client: CinderClient,
    cfg: v2v_config::Catalog,
    poll: PollConfig,
    log: Logger,
}

impl CinderCatalog {
    pub fn new(
        cfg: &v2v_config::Catalog,
        polling: &v2v_config::Polling,
        log: &Logger,
    ) -> Result<Self> {
        let client = CinderClient::new(&cfg.endpoint, &cfg.token, cfg.insecure, log)?;
        Ok(Self::from_client(client, cfg, polling, log))
    }

    pub fn from_client(
        client: CinderClient,
        cfg: &v2v_config::Catalog,
        polling: &v2v_config::Polling,
        log: &Logger,
    ) -> Self {
        Self {
            client,
            cfg: cfg.clone(),
            poll: PollConfig::new(polling.volume_attempts, polling.volume_interval()),
            log: log.clone(),
        }
    }

    /// The configured backend host, or one discovered from the advertised
    /// pools. Resolved on every call.
    async fn backend_host(&self) -> Result<String> {
        if let Some(host) = &self.cfg.backend_host {
            return Ok(host.clone());
        }
        Ok(self
            .client
            .discover_backend_host(self.cfg.backend_name.as_deref())
            .await?)
    }
}

#[async_trait]
impl VolumeCatalog for CinderCatalog {
    async fn import(
        &self,
        source_name: &str,
        display_name: &str,
        bootable: bool,
    ) -> Result<String> {
        let host = self.backend_host().await?;
        let vol = self
            .client
            .manage_existing(
                &host,
                source_name,
                display_name,
                self.cfg.volume_type.as_deref(),
                bootable,
            )
            .await?;
        info!(self.log, "volume imported";
            "source" => source_name, "id" => &vol.id, "host" => &host);
        Ok(vol.id)
    }

    async fn wait_available(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.client.wait_for_available(id, self.poll, cancel).await?;
        Ok(())
    }
}
