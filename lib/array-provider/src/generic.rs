// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for arrays without a native integration, operated entirely
//! through the block-storage catalog.
//!
//! Volumes are catalog volumes; a "mapping" is a catalog attachment created
//! with the hypervisor host's connector. NAAs are read from volume metadata,
//! which the backend driver is expected to populate.
//!
//! Some backends only create their host object on the first attach. With the
//! `precreate_host` option the driver forces that by attaching and discarding
//! a 1 GiB scratch volume before any real mapping is made.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::cinder::{CinderClient, CinderVolume, Connector};
use crate::error::{Result, StorageError};
use crate::http::HttpTransport;
use crate::naa::normalize_naa;
use crate::poll::PollConfig;
use crate::registry::{ProviderConfig, Vendor};
use crate::{
    round_up_to_gib, wrong_context, MappingContext, StorageProvider, Volume,
    VolumeInfo, GIB,
};

/// Metadata keys that may carry the SCSI identifier, in preference order.
const NAA_METADATA_KEYS: [&str; 3] = ["naa", "wwn", "scsi_wwn"];

const DEFAULT_VOLUME_POLL: PollConfig =
    PollConfig::new(60, Duration::from_secs(5));

fn volume_naa(vol: &CinderVolume) -> Result<String> {
    let raw = NAA_METADATA_KEYS
        .iter()
        .find_map(|k| vol.metadata.get(*k))
        .ok_or_else(|| StorageError::NotFound {
            kind: "naa metadata",
            name: vol.id.clone(),
        })?;
    normalize_naa(raw)
}

impl TryFrom<CinderVolume> for VolumeInfo {
    type Error = StorageError;

    fn try_from(vol: CinderVolume) -> Result<Self> {
        let naa = volume_naa(&vol)?;
        Ok(VolumeInfo {
            serial: naa.trim_start_matches("naa.").to_string(),
            name: vol.display_name().to_string(),
            size: vol.size * GIB,
            naa,
            id: vol.id,
        })
    }
}

/// Splits HBA identifiers into iSCSI names and FC port names.
fn split_hba_ids(hba_ids: &[String]) -> (Vec<String>, Vec<String>) {
    let mut iqns = Vec::new();
    let mut wwpns = Vec::new();
    for id in hba_ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let lower = id.to_ascii_lowercase();
        if lower.starts_with("iqn.") || lower.starts_with("eui.") {
            iqns.push(lower);
        } else {
            wwpns.push(lower.replace(':', ""));
        }
    }
    iqns.sort();
    iqns.dedup();
    wwpns.sort();
    wwpns.dedup();
    (iqns, wwpns)
}

fn scratch_volume_name(host: &str) -> String {
    format!("host-precreate-{host}")
}

pub struct GenericProvider {
    catalog: CinderClient,
    volume_type: Option<String>,
    precreate_host: bool,
    poll: PollConfig,
    connected: bool,
    /// Fired on disconnect so that in-flight waits stop.
    cancel: CancellationToken,
    /// Hosts this driver instance already forced into existence.
    precreated: Mutex<BTreeSet<String>>,
    /// (volume id, group) to attachment id.
    attachments: Mutex<BTreeMap<(String, String), String>>,
    log: Logger,
}

fn catalog_token(cfg: &ProviderConfig) -> Result<&str> {
    cfg.api_token.as_deref().ok_or_else(|| {
        StorageError::Config("generic driver needs a catalog token".to_string())
    })
}

impl GenericProvider {
    pub fn new(cfg: ProviderConfig, log: &Logger) -> Result<Self> {
        let log = log.new(o!("array" => "generic"));
        let token = catalog_token(&cfg)?;
        let catalog = CinderClient::new(&cfg.endpoint, token, cfg.insecure, &log)?;
        Self::with_catalog(cfg, catalog, log)
    }

    /// Like [`Self::new`], speaking to the catalog through `transport`.
    pub fn with_transport(
        cfg: ProviderConfig,
        transport: Arc<dyn HttpTransport>,
        log: &Logger,
    ) -> Result<Self> {
        let log = log.new(o!("array" => "generic"));
        let token = catalog_token(&cfg)?;
        let catalog =
            CinderClient::with_transport(&cfg.endpoint, token, transport, &log);
        Self::with_catalog(cfg, catalog, log)
    }

    fn with_catalog(
        cfg: ProviderConfig,
        catalog: CinderClient,
        log: Logger,
    ) -> Result<Self> {
        let poll = PollConfig::new(
            parse_option(&cfg, "volume_poll_attempts")?
                .unwrap_or(DEFAULT_VOLUME_POLL.attempts),
            parse_option(&cfg, "volume_poll_interval_secs")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_VOLUME_POLL.interval),
        );
        Ok(Self {
            catalog,
            volume_type: cfg.option("volume_type").map(str::to_string),
            precreate_host: cfg.flag("precreate_host"),
            poll,
            connected: false,
            cancel: CancellationToken::new(),
            precreated: Mutex::new(BTreeSet::new()),
            attachments: Mutex::new(BTreeMap::new()),
            log,
        })
    }

    fn ensure_connected(&self, op: &'static str) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(StorageError::NotConnected {
                op,
                target: "catalog".to_string(),
            })
        }
    }

    fn precreated(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<String>>> {
        self.precreated.lock().map_err(|_| {
            StorageError::StateMismatch("host bookkeeping poisoned".to_string())
        })
    }

    fn attachments(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), String>>>
    {
        self.attachments.lock().map_err(|_| {
            StorageError::StateMismatch(
                "attachment bookkeeping poisoned".to_string(),
            )
        })
    }

    async fn create_available(&self, name: &str, size_gib: u64) -> Result<CinderVolume> {
        let vol = self
            .catalog
            .create_volume(name, size_gib, self.volume_type.as_deref())
            .await?;
        self.catalog.wait_for_available(&vol.id, self.poll, &self.cancel).await
    }

    /// Attaches and discards a scratch volume so the backend creates its
    /// host object for `connector`.
    async fn precreate(&self, connector: &Connector) -> Result<()> {
        let name = scratch_volume_name(&connector.host);
        let scratch = self.create_available(&name, 1).await?;
        let attached = self.catalog.create_attachment(&scratch.id, connector).await;

        if let Ok(att) = &attached {
            if let Err(e) = self.catalog.delete_attachment(&att.id).await {
                warn!(self.log, "failed to detach scratch volume";
                    "volume" => &scratch.id, "error" => %e);
            }
        }
        if let Err(e) = self.catalog.delete_volume(&scratch.id).await {
            warn!(self.log, "failed to delete scratch volume";
                "volume" => &scratch.id, "error" => %e);
        }

        attached?;
        info!(self.log, "backend host created"; "host" => &connector.host);
        Ok(())
    }

    fn connector_for(ctx: &MappingContext) -> Result<Connector> {
        match ctx {
            MappingContext::Generic { initiator_group_name, iqns, wwpns, .. } => {
                if iqns.is_empty() && wwpns.is_empty() {
                    return Err(StorageError::StateMismatch(format!(
                        "no initiators known for {initiator_group_name}"
                    )));
                }
                Ok(Connector::new(initiator_group_name, iqns, wwpns))
            }
            other => Err(wrong_context(Vendor::Generic, other)),
        }
    }
}

fn parse_option<T: std::str::FromStr>(
    cfg: &ProviderConfig,
    key: &str,
) -> Result<Option<T>> {
    cfg.option(key)
        .map(|v| {
            v.parse().map_err(|_| {
                StorageError::Config(format!("option {key:?}: bad value {v:?}"))
            })
        })
        .transpose()
}

#[async_trait]
impl StorageProvider for GenericProvider {
    async fn connect(&mut self) -> Result<()> {
        self.catalog.ping().await?;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.connected = true;
        debug!(self.log, "catalog session ready");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.connected = false;
        Ok(())
    }

    async fn validate_credentials(&mut self) -> Result<()> {
        if !self.connected {
            return self.connect().await;
        }
        match self.catalog.ping().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unauthorized() => {
                self.connected = false;
                self.connect().await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<Volume> {
        self.ensure_connected("create volume")?;
        let size_gib = round_up_to_gib(size_bytes)? / GIB;
        let vol = self.create_available(name, size_gib).await?;
        let naa = volume_naa(&vol).unwrap_or_else(|e| {
            debug!(self.log, "volume has no NAA yet"; "error" => %e);
            String::new()
        });
        info!(self.log, "created volume"; "volume" => name, "id" => &vol.id);
        Ok(Volume {
            name: vol.display_name().to_string(),
            size: vol.size * GIB,
            naa,
            catalog_id: Some(vol.id.clone()),
            id: vol.id,
        })
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.ensure_connected("delete volume")?;
        let vol = self.catalog.find_volume_by_name(name).await?;
        self.catalog.delete_volume(&vol.id).await
    }

    async fn get_volume_info(&self, name: &str) -> Result<VolumeInfo> {
        self.ensure_connected("get volume")?;
        VolumeInfo::try_from(self.catalog.find_volume_by_name(name).await?)
    }

    async fn list_all_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.ensure_connected("list volumes")?;
        let mut out = Vec::new();
        for vol in self.catalog.list_volumes().await? {
            let id = vol.id.clone();
            match VolumeInfo::try_from(vol) {
                Ok(info) => out.push(info),
                Err(e) => debug!(self.log, "skipping volume"; "id" => id, "error" => %e),
            }
        }
        Ok(out)
    }

    async fn get_all_volume_naas(&self) -> Result<Vec<String>> {
        Ok(self.list_all_volumes().await?.into_iter().map(|v| v.naa).collect())
    }

    async fn create_or_update_initiator_group(
        &self,
        group: &str,
        hba_ids: &[String],
    ) -> Result<MappingContext> {
        self.ensure_connected("resolve initiators")?;
        let (iqns, wwpns) = split_hba_ids(hba_ids);
        if iqns.is_empty() && wwpns.is_empty() {
            return Err(StorageError::NotFound {
                kind: "initiator",
                name: group.to_string(),
            });
        }

        let mut created_hosts = Vec::new();
        if self.precreate_host {
            let done = self.precreated()?.contains(group);
            if !done {
                self.precreate(&Connector::new(group, &iqns, &wwpns)).await?;
                self.precreated()?.insert(group.to_string());
            }
            created_hosts.push(group.to_string());
        }

        Ok(MappingContext::Generic {
            initiator_group_name: group.to_string(),
            iqns,
            wwpns,
            created_hosts,
        })
    }

    async fn map_volume_to_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        self.ensure_connected("map volume")?;
        let connector = Self::connector_for(ctx)?;
        let key = (volume.id.clone(), connector.host.clone());
        if self.attachments()?.contains_key(&key) {
            debug!(self.log, "volume already attached";
                "volume" => &volume.name, "group" => group);
            return Ok(());
        }
        let att = self.catalog.create_attachment(&volume.id, &connector).await?;
        self.attachments()?.insert(key, att.id);
        info!(self.log, "mapped volume"; "volume" => &volume.name, "group" => group);
        Ok(())
    }

    async fn unmap_volume_from_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        self.ensure_connected("unmap volume")?;
        let host = match ctx {
            MappingContext::Generic { initiator_group_name, .. } => {
                initiator_group_name.clone()
            }
            other => return Err(wrong_context(Vendor::Generic, other)),
        };
        let key = (volume.id.clone(), host);
        let att_id = self.attachments()?.get(&key).cloned();
        let Some(att_id) = att_id else {
            debug!(self.log, "no attachment to remove";
                "volume" => &volume.name, "group" => group);
            return Ok(());
        };
        self.catalog.delete_attachment(&att_id).await?;
        self.attachments()?.remove(&key);
        info!(self.log, "unmapped volume"; "volume" => &volume.name, "group" => group);
        Ok(())
    }

    /// Catalog attachments do not name the initiator group they were made
    /// for, so a volume with live attachments cannot be detached and later
    /// restored through this driver.
    async fn get_mapped_groups(
        &self,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<Vec<String>> {
        if !matches!(ctx, MappingContext::Generic { .. }) {
            return Err(wrong_context(Vendor::Generic, ctx));
        }
        self.ensure_connected("list attachments")?;
        let live: Vec<String> = self
            .catalog
            .list_attachments(&volume.id)
            .await?
            .into_iter()
            .filter(|a| a.status.as_deref() != Some("detached"))
            .map(|a| a.id)
            .collect();
        if live.is_empty() {
            return Ok(Vec::new());
        }
        Err(StorageError::Unsupported {
            op: "list mapped groups",
            driver: "generic",
            detail: format!(
                "volume {} has catalog attachments {}",
                volume.name,
                live.join(", ")
            ),
        })
    }

    fn context_for_groups(&self, groups: &[String]) -> MappingContext {
        // Only the group name survives a round trip; initiators must be
        // resolved again before a restored mapping can be made.
        MappingContext::Generic {
            initiator_group_name: groups.first().cloned().unwrap_or_default(),
            iqns: Vec::new(),
            wwpns: Vec::new(),
            created_hosts: Vec::new(),
        }
    }

    async fn resolve_cinder_volume_to_lun(&self, catalog_id: &str) -> Result<Volume> {
        self.ensure_connected("resolve volume")?;
        let vol = self.catalog.get_volume(catalog_id).await?;
        let mut volume: Volume = VolumeInfo::try_from(vol)?.into();
        volume.catalog_id = Some(catalog_id.to_string());
        Ok(volume)
    }

    fn who_am_i(&self) -> &'static str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http::testing::{ok, scripted, status, Recorded};
    use crate::http::{ApiRequest, ApiResponse, Method};
    use crate::ErrorKind;

    const NAA: &str = "naa.624a93704d1c8a3bb6e04d2b00011a40";

    /// Volumes and attachments kept as the catalog keeps them. Every volume
    /// is available as soon as it exists.
    #[derive(Default)]
    struct FakeCatalog {
        volumes: BTreeMap<String, (String, u64)>,
        attachments: BTreeMap<String, String>,
        next: u32,
    }

    impl FakeCatalog {
        fn volume_json(id: &str, name: &str, size: u64) -> serde_json::Value {
            json!({ "volume": {
                "id": id,
                "name": name,
                "status": "available",
                "size": size,
                "metadata": { "naa": NAA },
            }})
        }

        fn handle(&mut self, req: &ApiRequest) -> ApiResponse {
            let body = req.body.clone().unwrap_or_default();
            let path = req.path.as_str();
            if req.method == Method::POST && path == "/volumes" {
                self.next += 1;
                let id = format!("vol-{}", self.next);
                let name = body["volume"]["name"].as_str().unwrap_or_default();
                let size = body["volume"]["size"].as_u64().unwrap_or_default();
                self.volumes.insert(id.clone(), (name.to_string(), size));
                return ok(Self::volume_json(&id, name, size));
            }
            if req.method == Method::POST && path == "/attachments" {
                self.next += 1;
                let id = format!("att-{}", self.next);
                let vol = body["attachment"]["volume_uuid"].as_str().unwrap_or_default();
                self.attachments.insert(id.clone(), vol.to_string());
                return ok(json!({ "attachment": { "id": id, "status": "attached" } }));
            }
            if req.method == Method::GET && path == "/attachments" {
                let vol = req.query_value("volume_id").unwrap_or_default();
                let attachments: Vec<_> = self
                    .attachments
                    .iter()
                    .filter(|(_, v)| v.as_str() == vol)
                    .map(|(id, _)| json!({ "id": id, "status": "attached" }))
                    .collect();
                return ok(json!({ "attachments": attachments }));
            }
            if let Some(id) = path.strip_prefix("/attachments/") {
                return match self.attachments.remove(id) {
                    Some(_) => ok(json!({})),
                    None => status(404, "Attachment could not be found."),
                };
            }
            if path == "/volumes" {
                return ok(json!({ "volumes": [] }));
            }
            if let Some(id) = path.strip_prefix("/volumes/") {
                if req.method == Method::DELETE {
                    self.volumes.remove(id);
                    return ok(json!({}));
                }
                return match self.volumes.get(id) {
                    Some((name, size)) => ok(Self::volume_json(id, name, *size)),
                    None => status(404, "Volume could not be found."),
                };
            }
            status(404, "no such endpoint")
        }
    }

    async fn connected(cfg: ProviderConfig) -> (GenericProvider, Recorded) {
        let catalog = Mutex::new(FakeCatalog::default());
        let (transport, seen) =
            scripted(move |req| catalog.lock().unwrap().handle(req));
        let log = Logger::root(slog::Discard, o!());
        let mut provider =
            GenericProvider::with_transport(cfg, transport, &log).unwrap();
        provider.connect().await.unwrap();
        (provider, seen)
    }

    fn esx01() -> Vec<String> {
        vec!["iqn.1998-01.com.vmware:esx01".to_string()]
    }

    fn cfg() -> ProviderConfig {
        ProviderConfig {
            endpoint: "https://cinder.example:8776/v3/admin".into(),
            api_token: Some("gAAAAAB".into()),
            ..Default::default()
        }
    }

    fn vol(metadata: &[(&str, &str)]) -> CinderVolume {
        CinderVolume {
            id: "a3c6".into(),
            name: Some("disk0".into()),
            status: "available".into(),
            size: 2,
            bootable: None,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            host: None,
        }
    }

    #[test]
    fn naa_read_from_metadata() {
        let info = VolumeInfo::try_from(vol(&[(
            "scsi_wwn",
            "naa.3624A93704D1C8A3BB6E04D2B00011A40",
        )]))
        .unwrap();
        assert_eq!(info.naa, "naa.624a93704d1c8a3bb6e04d2b00011a40");
        assert_eq!(info.size, 2 * GIB);
        assert!(matches!(
            VolumeInfo::try_from(vol(&[])),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn hba_ids_split_by_kind() {
        let (iqns, wwpns) = split_hba_ids(&[
            "IQN.1998-01.com.vmware:esx01".into(),
            "21:00:00:24:ff:4c:aa:01".into(),
            "".into(),
            "iqn.1998-01.com.vmware:esx01".into(),
        ]);
        assert_eq!(iqns, vec!["iqn.1998-01.com.vmware:esx01"]);
        assert_eq!(wwpns, vec!["21000024ff4caa01"]);
    }

    #[test]
    fn restored_context_without_initiators_cannot_map() {
        let log = Logger::root(slog::Discard, o!());
        let provider = GenericProvider::new(cfg(), &log).unwrap();
        let ctx = provider.context_for_groups(&["esx01".into()]);
        assert!(matches!(
            GenericProvider::connector_for(&ctx),
            Err(StorageError::StateMismatch(_))
        ));
        let pure = MappingContext::Pure { hosts: vec![] };
        assert!(matches!(
            GenericProvider::connector_for(&pure),
            Err(StorageError::StateMismatch(_))
        ));
    }

    #[test]
    fn poll_options_parsed() {
        let log = Logger::root(slog::Discard, o!());
        let mut c = cfg();
        c.options.insert("volume_poll_attempts".into(), "3".into());
        c.options.insert("precreate_host".into(), "true".into());
        let provider = GenericProvider::new(c.clone(), &log).unwrap();
        assert_eq!(provider.poll.attempts, 3);
        assert_eq!(provider.poll.interval, DEFAULT_VOLUME_POLL.interval);
        assert!(provider.precreate_host);

        c.options.insert("volume_poll_attempts".into(), "many".into());
        assert!(matches!(
            GenericProvider::new(c, &log),
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn requires_connect_first() {
        let log = Logger::root(slog::Discard, o!());
        let provider = GenericProvider::new(cfg(), &log).unwrap();
        let err = provider.list_all_volumes().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Connectivity);
        assert_eq!(scratch_volume_name("esx01"), "host-precreate-esx01");
    }

    #[tokio::test]
    async fn precreate_attaches_and_discards_a_scratch_volume() {
        let mut c = cfg();
        c.options.insert("precreate_host".into(), "true".into());
        let (provider, seen) = connected(c).await;

        for _ in 0..2 {
            let ctx = provider
                .create_or_update_initiator_group("esx01", &esx01())
                .await
                .unwrap();
            let MappingContext::Generic { created_hosts, iqns, .. } = ctx else {
                panic!("generic driver returned another context");
            };
            assert_eq!(created_hosts, vec!["esx01"]);
            assert_eq!(iqns, esx01());
        }

        let created = seen.bodies(Method::POST, "/volumes");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["volume"]["name"], "host-precreate-esx01");
        assert_eq!(created[0]["volume"]["size"], 1);

        let lines = seen.lines();
        assert!(lines.contains(&"POST /attachments".to_string()));
        assert!(lines.contains(&"DELETE /attachments/att-2".to_string()));
        assert!(lines.contains(&"DELETE /volumes/vol-1".to_string()));
    }

    #[tokio::test]
    async fn created_volumes_carry_their_catalog_id() {
        let (provider, seen) = connected(cfg()).await;
        let vol = provider.create_volume("web01-disk0", GIB + 1).await.unwrap();
        assert_eq!(vol.name, "web01-disk0");
        assert_eq!(vol.size, 2 * GIB);
        assert_eq!(vol.naa, NAA);
        assert_eq!(vol.catalog_id.as_deref(), Some("vol-1"));
        assert_eq!(seen.bodies(Method::POST, "/volumes")[0]["volume"]["size"], 2);

        let resolved = provider.resolve_cinder_volume_to_lun("vol-1").await.unwrap();
        assert_eq!(resolved.catalog_id.as_deref(), Some("vol-1"));
        assert_eq!(resolved.naa, NAA);
    }

    #[tokio::test]
    async fn mappings_are_attachments() {
        let (provider, seen) = connected(cfg()).await;
        let vol = provider.create_volume("web01-disk0", GIB).await.unwrap();
        let ctx = provider
            .create_or_update_initiator_group("esx01", &esx01())
            .await
            .unwrap();
        assert!(provider.get_mapped_groups(&vol, &ctx).await.unwrap().is_empty());

        provider.map_volume_to_group("esx01", &vol, &ctx).await.unwrap();
        provider.map_volume_to_group("esx01", &vol, &ctx).await.unwrap();
        assert_eq!(seen.bodies(Method::POST, "/attachments").len(), 1);

        let err = provider.get_mapped_groups(&vol, &ctx).await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { driver: "generic", .. }));
        assert_eq!(err.kind(), ErrorKind::StateMismatch);

        provider.unmap_volume_from_group("esx01", &vol, &ctx).await.unwrap();
        provider.unmap_volume_from_group("esx01", &vol, &ctx).await.unwrap();
        let detaches = seen
            .all()
            .iter()
            .filter(|r| r.method == Method::DELETE && r.path.starts_with("/attachments/"))
            .count();
        assert_eq!(detaches, 1);
        assert!(provider.get_mapped_groups(&vol, &ctx).await.unwrap().is_empty());
    }
}
