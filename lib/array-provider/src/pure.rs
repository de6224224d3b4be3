// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure Storage FlashArray driver (REST 2.x).

use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_json::json;
use slog::{debug, info, o, Logger};

use crate::error::{Result, StorageError};
use crate::http::{initiator_eq, ApiRequest, HttpTransport, Method, RestClient};
use crate::naa::{build_naa, PURE_NAA_PREFIX};
use crate::registry::{ProviderConfig, Vendor};
use crate::{
    round_up_to_gib, wrong_context, MappingContext, StorageProvider, Volume,
    VolumeInfo,
};

const API_VERSION: &str = "2.4";
const AUTH_API_VERSION: &str = "1.19";

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct Items<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct PureVolume {
    id: String,
    name: String,
    serial: String,
    #[serde(default)]
    provisioned: u64,
}

#[derive(Debug, Deserialize)]
struct PureHost {
    name: String,
    #[serde(default)]
    iqns: Vec<String>,
    #[serde(default)]
    wwns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PureConnection {
    host: Option<NamedRef>,
    host_group: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct ApiToken {
    api_token: String,
}

fn v2(path: &str) -> String {
    format!("/api/{API_VERSION}{path}")
}

impl TryFrom<PureVolume> for VolumeInfo {
    type Error = StorageError;

    fn try_from(v: PureVolume) -> Result<Self> {
        Ok(VolumeInfo {
            naa: build_naa(PURE_NAA_PREFIX, &v.serial)?,
            serial: v.serial.to_ascii_lowercase(),
            name: v.name,
            size: v.provisioned,
            id: v.id,
        })
    }
}

/// Names of hosts carrying any of `ids` as an IQN or WWN.
fn match_hosts(hosts: &[PureHost], ids: &[String]) -> Vec<String> {
    let mut names: Vec<String> = hosts
        .iter()
        .filter(|h| {
            h.iqns.iter().chain(h.wwns.iter()).any(|initiator| {
                ids.iter().any(|id| initiator_eq(initiator, id))
            })
        })
        .map(|h| h.name.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn connection_groups(conns: Vec<PureConnection>) -> Vec<String> {
    let mut names: Vec<String> = conns
        .into_iter()
        .filter_map(|c| {
            c.host
                .and_then(|h| h.name)
                .or_else(|| c.host_group.and_then(|g| g.name))
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Cinder's FlashArray driver names volumes `volume-<id>-cinder`.
pub fn cinder_volume_name(catalog_id: &str) -> String {
    format!("volume-{catalog_id}-cinder")
}

pub struct PureProvider {
    cfg: ProviderConfig,
    rest: RestClient,
    session: Option<String>,
    log: Logger,
}

impl PureProvider {
    pub fn new(cfg: ProviderConfig, log: &Logger) -> Result<Self> {
        if cfg.api_token.is_none()
            && (cfg.username.is_none() || cfg.password.is_none())
        {
            return Err(StorageError::Config(
                "pure driver needs api_token or username and password"
                    .to_string(),
            ));
        }
        let log = log.new(o!("array" => "pure"));
        let rest = RestClient::new(&cfg.endpoint, cfg.insecure, &log)?;
        Ok(Self { cfg, rest, session: None, log })
    }

    /// Like [`Self::new`], speaking to the array through `transport`.
    pub fn with_transport(
        cfg: ProviderConfig,
        transport: Arc<dyn HttpTransport>,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("array" => "pure"));
        let rest = RestClient::with_transport(&cfg.endpoint, transport, &log);
        Self { cfg, rest, session: None, log }
    }

    fn authed(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
    ) -> Result<ApiRequest> {
        let token = self.session.as_deref().ok_or_else(|| {
            StorageError::NotConnected { op, target: self.rest.base().to_string() }
        })?;
        Ok(self
            .rest
            .request(method, &v2(path))
            .header("x-auth-token", token))
    }

    async fn obtain_api_token(&self) -> Result<String> {
        if let Some(token) = &self.cfg.api_token {
            return Ok(token.clone());
        }
        let (Some(username), Some(password)) =
            (&self.cfg.username, &self.cfg.password)
        else {
            return Err(StorageError::Config(
                "missing FlashArray credentials".to_string(),
            ));
        };
        let req = self
            .rest
            .request(
                Method::POST,
                &format!("/api/{AUTH_API_VERSION}/auth/apitoken"),
            )
            .json(&json!({ "username": username, "password": password }));
        let token: ApiToken =
            self.rest.send_json("obtain api token", username, req).await?;
        Ok(token.api_token)
    }

    async fn volumes(&self, name: Option<&str>) -> Result<Vec<PureVolume>> {
        let target = name.unwrap_or("all volumes");
        let mut req = self.authed("list volumes", Method::GET, "/volumes")?;
        req = match name {
            Some(name) => req.query(&[("names", name)]),
            None => req.query(&[("destroyed", "false")]),
        };
        match self.rest.send_json::<Items<PureVolume>>("get volume", target, req).await
        {
            Ok(items) => Ok(items.items),
            Err(e) if e.api_says(400, "not exist") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn hosts(&self) -> Result<Vec<PureHost>> {
        let req = self.authed("list hosts", Method::GET, "/hosts")?;
        let items: Items<PureHost> =
            self.rest.send_json("list hosts", self.rest.base(), req).await?;
        Ok(items.items)
    }

    fn hosts_of<'a>(&self, ctx: &'a MappingContext) -> Result<&'a [String]> {
        match ctx {
            MappingContext::Pure { hosts } if hosts.is_empty() => {
                Err(StorageError::StateMismatch(
                    "pure mapping context has no hosts".to_string(),
                ))
            }
            MappingContext::Pure { hosts } => Ok(hosts.as_slice()),
            other => Err(wrong_context(Vendor::Pure, other)),
        }
    }
}

#[async_trait]
impl StorageProvider for PureProvider {
    async fn connect(&mut self) -> Result<()> {
        let api_token = self.obtain_api_token().await?;
        let req = self
            .rest
            .request(Method::POST, &v2("/login"))
            .header("api-token", &api_token);
        let resp = self.rest.send("login", self.rest.base(), req).await?;
        let token = resp
            .header("x-auth-token")
            .ok_or_else(|| StorageError::Decode {
                op: "login",
                target: self.rest.base().to_string(),
                detail: "response lacks x-auth-token header".to_string(),
            })?
            .to_string();
        self.session = Some(token);
        info!(self.log, "connected to FlashArray");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let req = self.authed("logout", Method::POST, "/logout")?;
        let res = self.rest.send_empty("logout", self.rest.base(), req).await;
        self.session = None;
        res
    }

    async fn validate_credentials(&mut self) -> Result<()> {
        if self.session.is_none() {
            return self.connect().await;
        }
        let req = self.authed("validate session", Method::GET, "/arrays")?;
        match self.rest.send_empty("validate session", self.rest.base(), req).await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_unauthorized() => {
                debug!(self.log, "session expired, reconnecting");
                self.session = None;
                self.connect().await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<Volume> {
        let size = round_up_to_gib(size_bytes)?;
        let req = self
            .authed("create volume", Method::POST, "/volumes")?
            .query(&[("names", name)])
            .json(&json!({ "provisioned": size }));
        let items: Items<PureVolume> =
            self.rest.send_json("create volume", name, req).await?;
        let vol = items.items.into_iter().next().ok_or_else(|| {
            StorageError::Decode {
                op: "create volume",
                target: name.to_string(),
                detail: "empty item list".to_string(),
            }
        })?;
        info!(self.log, "created volume"; "volume" => name, "size" => size);
        Ok(VolumeInfo::try_from(vol)?.into())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        // FlashArray deletion is two-phase: destroy, then eradicate.
        let req = self
            .authed("destroy volume", Method::PATCH, "/volumes")?
            .query(&[("names", name)])
            .json(&json!({ "destroyed": true }));
        match self.rest.send_empty("destroy volume", name, req).await {
            Err(e) if e.api_says(400, "not exist") => {
                return Err(StorageError::NotFound {
                    kind: "volume",
                    name: name.to_string(),
                })
            }
            other => other?,
        }
        let req = self
            .authed("eradicate volume", Method::DELETE, "/volumes")?
            .query(&[("names", name)]);
        self.rest.send_empty("eradicate volume", name, req).await?;
        info!(self.log, "deleted volume"; "volume" => name);
        Ok(())
    }

    async fn get_volume_info(&self, name: &str) -> Result<VolumeInfo> {
        let vol = self.volumes(Some(name)).await?.into_iter().next().ok_or_else(
            || StorageError::NotFound { kind: "volume", name: name.to_string() },
        )?;
        VolumeInfo::try_from(vol)
    }

    async fn list_all_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.volumes(None)
            .await?
            .into_iter()
            .map(VolumeInfo::try_from)
            .collect()
    }

    async fn get_all_volume_naas(&self) -> Result<Vec<String>> {
        Ok(self.list_all_volumes().await?.into_iter().map(|v| v.naa).collect())
    }

    async fn create_or_update_initiator_group(
        &self,
        group: &str,
        hba_ids: &[String],
    ) -> Result<MappingContext> {
        let hosts = match_hosts(&self.hosts().await?, hba_ids);
        if hosts.is_empty() {
            return Err(StorageError::NotFound {
                kind: "host",
                name: format!("{group} [{}]", hba_ids.join(", ")),
            });
        }
        debug!(self.log, "resolved initiator group";
            "group" => group,
            "hosts" => hosts.join(","),
        );
        Ok(MappingContext::Pure { hosts })
    }

    async fn map_volume_to_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        for host in self.hosts_of(ctx)? {
            let req = self
                .authed("map volume", Method::POST, "/connections")?
                .query(&[
                    ("host_names", host.as_str()),
                    ("volume_names", volume.name.as_str()),
                ]);
            match self.rest.send_empty("map volume", &volume.name, req).await {
                Err(e) if e.api_says(400, "already") => {
                    debug!(self.log, "volume already connected";
                        "volume" => &volume.name, "host" => host);
                }
                other => other?,
            }
        }
        info!(self.log, "mapped volume"; "volume" => &volume.name, "group" => group);
        Ok(())
    }

    async fn unmap_volume_from_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        for host in self.hosts_of(ctx)? {
            let req = self
                .authed("unmap volume", Method::DELETE, "/connections")?
                .query(&[
                    ("host_names", host.as_str()),
                    ("volume_names", volume.name.as_str()),
                ]);
            match self.rest.send_empty("unmap volume", &volume.name, req).await {
                Err(e) if e.api_says(400, "not exist") => {
                    debug!(self.log, "volume was not connected";
                        "volume" => &volume.name, "host" => host);
                }
                other => other?,
            }
        }
        info!(self.log, "unmapped volume"; "volume" => &volume.name, "group" => group);
        Ok(())
    }

    async fn get_mapped_groups(
        &self,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<Vec<String>> {
        if !matches!(ctx, MappingContext::Pure { .. }) {
            return Err(wrong_context(Vendor::Pure, ctx));
        }
        let req = self
            .authed("list connections", Method::GET, "/connections")?
            .query(&[("volume_names", volume.name.as_str())]);
        let items: Items<PureConnection> =
            self.rest.send_json("list connections", &volume.name, req).await?;
        Ok(connection_groups(items.items))
    }

    fn context_for_groups(&self, groups: &[String]) -> MappingContext {
        MappingContext::Pure { hosts: groups.to_vec() }
    }

    async fn resolve_cinder_volume_to_lun(&self, catalog_id: &str) -> Result<Volume> {
        let name = cinder_volume_name(catalog_id);
        Ok(self.get_volume_info(&name).await?.into())
    }

    fn who_am_i(&self) -> &'static str {
        "pure"
    }
}
