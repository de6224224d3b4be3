// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-storage catalog (Cinder v3) client.
//!
//! Authentication is out of scope: the client is handed a pre-issued token
//! and a project-scoped endpoint (`https://<host>:8776/v3/<project>`).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use slog::{debug, info, o, Logger};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};
use crate::http::{ApiRequest, HttpTransport, Method, RestClient};
use crate::poll::{poll_until, PollConfig, PollError};

/// Attachments API needs at least this microversion.
const ATTACHMENTS_MICROVERSION: &str = "volume 3.27";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CinderVolume {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    /// Size in GiB.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub bootable: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "os-vol-host-attr:host", default)]
    pub host: Option<String>,
}

impl CinderVolume {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.id)
    }

    pub fn is_available(&self) -> bool {
        self.status == "available"
    }
}

#[derive(Debug, Deserialize)]
struct VolumeBody {
    volume: CinderVolume,
}

#[derive(Debug, Deserialize)]
struct VolumesBody {
    #[serde(default)]
    volumes: Vec<CinderVolume>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, serde_json::Value>,
}

impl Pool {
    pub fn backend_name(&self) -> Option<&str> {
        self.capabilities.get("volume_backend_name").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct PoolsBody {
    #[serde(default)]
    pools: Vec<Pool>,
}

/// Host-side facts a backend needs to export a volume.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Connector {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwpns: Vec<String>,
    pub multipath: bool,
    pub platform: &'static str,
    pub os_type: &'static str,
}

impl Connector {
    pub fn new(host: &str, iqns: &[String], wwpns: &[String]) -> Self {
        Connector {
            host: host.to_string(),
            initiator: iqns.first().cloned(),
            wwpns: wwpns
                .iter()
                .map(|w| w.replace(':', "").to_ascii_lowercase())
                .collect(),
            multipath: iqns.len() + wwpns.len() > 1,
            platform: "x86_64",
            os_type: "linux2",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub volume_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    attachment: Attachment,
}

#[derive(Debug, Deserialize)]
struct AttachmentsBody {
    #[serde(default)]
    attachments: Vec<Attachment>,
}

/// Where the backend keeps a volume: `<host>@<backend>#<pool>`.
pub fn split_pool_name(name: &str) -> Option<(&str, &str, &str)> {
    let (host, rest) = name.split_once('@')?;
    let (backend, pool) = rest.split_once('#')?;
    Some((host, backend, pool))
}

/// Picks the pool whose backend is `backend`, or the only pool when no
/// backend is named.
pub fn select_pool<'a>(pools: &'a [Pool], backend: Option<&str>) -> Result<&'a Pool> {
    match backend {
        Some(backend) => pools
            .iter()
            .find(|p| {
                p.backend_name() == Some(backend)
                    || split_pool_name(&p.name).map(|(_, b, _)| b) == Some(backend)
            })
            .ok_or_else(|| StorageError::NotFound {
                kind: "backend pool",
                name: backend.to_string(),
            }),
        None => match pools {
            [only] => Ok(only),
            [] => Err(StorageError::NotFound {
                kind: "backend pool",
                name: "any".to_string(),
            }),
            _ => Err(StorageError::StateMismatch(format!(
                "{} backend pools advertised, name one explicitly",
                pools.len()
            ))),
        },
    }
}

pub struct CinderClient {
    rest: RestClient,
    token: String,
    log: Logger,
}

impl CinderClient {
    pub fn new(
        endpoint: &str,
        token: &str,
        insecure: bool,
        log: &Logger,
    ) -> Result<Self> {
        let log = log.new(o!("component" => "cinder"));
        Ok(Self {
            rest: RestClient::new(endpoint, insecure, &log)?,
            token: token.to_string(),
            log,
        })
    }

    /// Like [`Self::new`], speaking to the catalog through `transport`.
    pub fn with_transport(
        endpoint: &str,
        token: &str,
        transport: Arc<dyn HttpTransport>,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "cinder"));
        Self {
            rest: RestClient::with_transport(endpoint, transport, &log),
            token: token.to_string(),
            log,
        }
    }

    fn req(&self, method: Method, path: &str) -> ApiRequest {
        self.rest.request(method, path).header("X-Auth-Token", &self.token)
    }

    fn attachments_req(&self, method: Method, path: &str) -> ApiRequest {
        self.req(method, path)
            .header("OpenStack-API-Version", ATTACHMENTS_MICROVERSION)
    }

    /// Cheap authenticated round trip.
    pub async fn ping(&self) -> Result<()> {
        let req = self.req(Method::GET, "/volumes").query(&[("limit", "1")]);
        self.rest.send_empty("list volumes", self.rest.base(), req).await
    }

    pub async fn get_volume(&self, id: &str) -> Result<CinderVolume> {
        let req = self.req(Method::GET, &format!("/volumes/{id}"));
        match self.rest.send_json::<VolumeBody>("get volume", id, req).await {
            Ok(body) => Ok(body.volume),
            Err(e) if e.api_says(404, "") => {
                Err(StorageError::NotFound { kind: "volume", name: id.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_volumes(&self) -> Result<Vec<CinderVolume>> {
        let req = self.req(Method::GET, "/volumes/detail");
        let body: VolumesBody =
            self.rest.send_json("list volumes", self.rest.base(), req).await?;
        Ok(body.volumes)
    }

    pub async fn find_volume_by_name(&self, name: &str) -> Result<CinderVolume> {
        let req =
            self.req(Method::GET, "/volumes/detail").query(&[("name", name)]);
        let body: VolumesBody =
            self.rest.send_json("find volume", name, req).await?;
        body.volumes
            .into_iter()
            .find(|v| v.name.as_deref() == Some(name))
            .ok_or_else(|| StorageError::NotFound {
                kind: "volume",
                name: name.to_string(),
            })
    }

    pub async fn create_volume(
        &self,
        name: &str,
        size_gib: u64,
        volume_type: Option<&str>,
    ) -> Result<CinderVolume> {
        let req = self.req(Method::POST, "/volumes").json(&json!({
            "volume": {
                "name": name,
                "size": size_gib,
                "volume_type": volume_type,
            }
        }));
        let body: VolumeBody =
            self.rest.send_json("create volume", name, req).await?;
        info!(self.log, "created catalog volume";
            "volume" => name, "id" => &body.volume.id);
        Ok(body.volume)
    }

    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        let req = self.req(Method::DELETE, &format!("/volumes/{id}"));
        match self.rest.send_empty("delete volume", id, req).await {
            Err(e) if e.api_says(404, "") => Ok(()),
            other => other,
        }
    }

    /// Imports an existing backend volume (`source_name` on the array) into
    /// the catalog. The backend renames it to `volume-<id>` in the process.
    pub async fn manage_existing(
        &self,
        backend_host: &str,
        source_name: &str,
        display_name: &str,
        volume_type: Option<&str>,
        bootable: bool,
    ) -> Result<CinderVolume> {
        let req = self.req(Method::POST, "/os-volume-manage").json(&json!({
            "volume": {
                "host": backend_host,
                "ref": { "source-name": source_name },
                "name": display_name,
                "volume_type": volume_type,
                "bootable": bootable,
            }
        }));
        let body: VolumeBody =
            self.rest.send_json("manage volume", source_name, req).await?;
        info!(self.log, "imported volume into catalog";
            "source" => source_name,
            "id" => &body.volume.id,
            "host" => backend_host,
        );
        Ok(body.volume)
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        let req = self
            .req(Method::GET, "/scheduler-stats/get_pools")
            .query(&[("detail", "true")]);
        let body: PoolsBody =
            self.rest.send_json("list pools", self.rest.base(), req).await?;
        Ok(body.pools)
    }

    /// Resolves the `host@backend#pool` string `manage_existing` needs.
    pub async fn discover_backend_host(&self, backend: Option<&str>) -> Result<String> {
        let pools = self.list_pools().await?;
        let pool = select_pool(&pools, backend)?;
        debug!(self.log, "selected backend pool"; "pool" => &pool.name);
        Ok(pool.name.clone())
    }

    pub async fn create_attachment(
        &self,
        volume_id: &str,
        connector: &Connector,
    ) -> Result<Attachment> {
        let req = self.attachments_req(Method::POST, "/attachments").json(&json!({
            "attachment": {
                "volume_uuid": volume_id,
                "connector": connector,
            }
        }));
        let body: AttachmentBody =
            self.rest.send_json("create attachment", volume_id, req).await?;
        debug!(self.log, "created attachment";
            "volume" => volume_id,
            "attachment" => &body.attachment.id,
            "host" => &connector.host,
        );
        Ok(body.attachment)
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> Result<()> {
        let req = self.attachments_req(
            Method::DELETE,
            &format!("/attachments/{attachment_id}"),
        );
        match self.rest.send_empty("delete attachment", attachment_id, req).await
        {
            Err(e) if e.api_says(404, "") => Ok(()),
            other => other,
        }
    }

    pub async fn list_attachments(&self, volume_id: &str) -> Result<Vec<Attachment>> {
        let req = self
            .attachments_req(Method::GET, "/attachments")
            .query(&[("volume_id", volume_id)]);
        let body: AttachmentsBody =
            self.rest.send_json("list attachments", volume_id, req).await?;
        Ok(body.attachments)
    }

    /// Polls until the volume reaches `status`. A volume landing in an
    /// `error*` state fails immediately.
    pub async fn wait_for_status(
        &self,
        id: &str,
        status: &str,
        cfg: PollConfig,
        cancel: &CancellationToken,
    ) -> Result<CinderVolume> {
        let res = poll_until(cfg, cancel, |attempt| async move {
            let vol = self.get_volume(id).await?;
            if vol.status == status {
                return Ok(Some(vol));
            }
            if vol.status.starts_with("error") {
                return Err(StorageError::StateMismatch(format!(
                    "volume {id} entered {} while waiting for {status}",
                    vol.status
                )));
            }
            debug!(self.log, "waiting for volume status";
                "volume" => id,
                "status" => &vol.status,
                "want" => status,
                "attempt" => attempt,
            );
            Ok::<_, StorageError>(None)
        })
        .await;
        match res {
            Ok(vol) => Ok(vol),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Timeout { attempts }) => Err(StorageError::Timeout {
                op: "wait for volume status",
                target: id.to_string(),
                attempts,
            }),
            Err(PollError::Cancelled) => Err(StorageError::Cancelled {
                op: "wait for volume status",
                target: id.to_string(),
            }),
        }
    }

    pub async fn wait_for_available(
        &self,
        id: &str,
        cfg: PollConfig,
        cancel: &CancellationToken,
    ) -> Result<CinderVolume> {
        self.wait_for_status(id, "available", cfg, cancel).await
    }
}
