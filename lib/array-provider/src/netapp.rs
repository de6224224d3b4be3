// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NetApp ONTAP driver (REST API, basic auth).
//!
//! LUNs live at `/vol/<flexvol>/<name>` inside a single SVM, both of which are
//! taken from the provider options (`svm`, `flexvol`). LUN serial numbers are
//! 12 printable ASCII characters; the NAA embeds their hex encoding.

use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_json::json;
use slog::{debug, info, o, Logger};

use crate::error::{Result, StorageError};
use crate::http::{initiator_eq, ApiRequest, HttpTransport, Method, RestClient};
use crate::naa::{build_naa, extract_serial, NETAPP_NAA_PREFIX};
use crate::registry::{ProviderConfig, Vendor};
use crate::{
    round_up_to_gib, wrong_context, MappingContext, StorageProvider, Volume,
    VolumeInfo,
};

const LUN_FIELDS: &str = "uuid,name,serial_number,space.size";
const DEFAULT_OS_TYPE: &str = "vmware";

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct Records<T> {
    #[serde(default)]
    records: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LunSpace {
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct Lun {
    uuid: String,
    name: String,
    serial_number: String,
    space: Option<LunSpace>,
}

#[derive(Debug, Deserialize)]
struct Initiator {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Igroup {
    name: String,
    #[serde(default)]
    initiators: Vec<Initiator>,
}

#[derive(Debug, Deserialize)]
struct UuidRef {
    uuid: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LunMap {
    lun: Option<UuidRef>,
    igroup: Option<UuidRef>,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    name: String,
}

/// NAA for an ONTAP LUN serial.
pub fn naa_from_serial(serial: &str) -> Result<String> {
    build_naa(NETAPP_NAA_PREFIX, &hex::encode(serial.as_bytes()))
}

/// Inverse of [`naa_from_serial`].
pub fn serial_from_naa(naa: &str) -> Result<String> {
    let hexed = extract_serial(naa, NETAPP_NAA_PREFIX)?;
    let bytes = hex::decode(&hexed).map_err(|_| StorageError::InvalidNaa {
        naa: naa.to_string(),
        reason: "serial is not hex",
    })?;
    String::from_utf8(bytes).map_err(|_| StorageError::InvalidNaa {
        naa: naa.to_string(),
        reason: "serial is not ASCII",
    })
}

impl TryFrom<Lun> for VolumeInfo {
    type Error = StorageError;

    fn try_from(lun: Lun) -> Result<Self> {
        Ok(VolumeInfo {
            naa: naa_from_serial(&lun.serial_number)?,
            serial: lun.serial_number,
            size: lun.space.map(|s| s.size).unwrap_or_default(),
            name: lun.name,
            id: lun.uuid,
        })
    }
}

/// Last path component of a LUN path.
fn lun_leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Cinder's ONTAP driver keeps the `volume-<id>` name but places the LUN
/// under an arbitrary flexvol, and may suffix it; match on the leaf.
fn is_cinder_lun(path: &str, catalog_id: &str) -> bool {
    lun_leaf(path).starts_with(&format!("volume-{catalog_id}"))
}

fn match_igroups(igroups: &[Igroup], ids: &[String]) -> Vec<String> {
    let mut names: Vec<String> = igroups
        .iter()
        .filter(|g| {
            g.initiators
                .iter()
                .any(|i| ids.iter().any(|id| initiator_eq(&i.name, id)))
        })
        .map(|g| g.name.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

pub struct NetAppProvider {
    rest: RestClient,
    username: String,
    password: String,
    svm: String,
    flexvol: String,
    os_type: String,
    cluster: Option<String>,
    log: Logger,
}

impl NetAppProvider {
    pub fn new(cfg: ProviderConfig, log: &Logger) -> Result<Self> {
        let rest = RestClient::new(&cfg.endpoint, cfg.insecure, log)?;
        Self::with_rest(cfg, rest, log)
    }

    /// Like [`Self::new`], speaking to the cluster through `transport`.
    pub fn with_transport(
        cfg: ProviderConfig,
        transport: Arc<dyn HttpTransport>,
        log: &Logger,
    ) -> Result<Self> {
        let rest = RestClient::with_transport(&cfg.endpoint, transport, log);
        Self::with_rest(cfg, rest, log)
    }

    fn with_rest(cfg: ProviderConfig, rest: RestClient, log: &Logger) -> Result<Self> {
        let (Some(username), Some(password)) =
            (cfg.username.clone(), cfg.password.clone())
        else {
            return Err(StorageError::Config(
                "netapp driver needs username and password".to_string(),
            ));
        };
        let svm = cfg.require_option("svm")?.to_string();
        let flexvol = cfg.require_option("flexvol")?.to_string();
        let os_type =
            cfg.option("os_type").unwrap_or(DEFAULT_OS_TYPE).to_string();
        let log = log.new(o!("array" => "netapp", "svm" => svm.clone()));
        Ok(Self {
            rest,
            username,
            password,
            svm,
            flexvol,
            os_type,
            cluster: None,
            log,
        })
    }

    fn req(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
    ) -> Result<ApiRequest> {
        if self.cluster.is_none() {
            return Err(StorageError::NotConnected {
                op,
                target: self.rest.base().to_string(),
            });
        }
        Ok(self.unchecked_req(method, path))
    }

    fn unchecked_req(&self, method: Method, path: &str) -> ApiRequest {
        self.rest
            .request(method, &format!("/api{path}"))
            .basic_auth(&self.username, &self.password)
    }

    /// Full LUN path for a bare volume name.
    fn lun_path(&self, name: &str) -> String {
        if name.starts_with("/vol/") {
            name.to_string()
        } else {
            format!("/vol/{}/{}", self.flexvol, name)
        }
    }

    async fn luns(&self, name_filter: Option<&str>) -> Result<Vec<Lun>> {
        let target = name_filter.unwrap_or("all luns");
        let mut req = self
            .req("list luns", Method::GET, "/storage/luns")?
            .query(&[("svm.name", self.svm.as_str()), ("fields", LUN_FIELDS)]);
        if let Some(name) = name_filter {
            req = req.query(&[("name", name)]);
        }
        let recs: Records<Lun> = self.rest.send_json("list luns", target, req).await?;
        Ok(recs.records)
    }

    async fn igroups(&self) -> Result<Vec<Igroup>> {
        let req = self
            .req("list igroups", Method::GET, "/protocols/san/igroups")?
            .query(&[
                ("svm.name", self.svm.as_str()),
                ("fields", "name,initiators.name"),
            ]);
        let recs: Records<Igroup> =
            self.rest.send_json("list igroups", &self.svm, req).await?;
        Ok(recs.records)
    }

    async fn lun_maps(
        &self,
        path: &str,
        igroup: Option<&str>,
    ) -> Result<Vec<LunMap>> {
        let mut req = self
            .req("list lun maps", Method::GET, "/protocols/san/lun-maps")?
            .query(&[
                ("svm.name", self.svm.as_str()),
                ("lun.name", path),
                ("fields", "lun.uuid,igroup.uuid,igroup.name"),
            ]);
        if let Some(igroup) = igroup {
            req = req.query(&[("igroup.name", igroup)]);
        }
        let recs: Records<LunMap> =
            self.rest.send_json("list lun maps", path, req).await?;
        Ok(recs.records)
    }

    fn igroups_of<'a>(&self, ctx: &'a MappingContext) -> Result<&'a [String]> {
        match ctx {
            MappingContext::NetApp { igroups } if igroups.is_empty() => {
                Err(StorageError::StateMismatch(
                    "netapp mapping context has no igroups".to_string(),
                ))
            }
            MappingContext::NetApp { igroups } => Ok(igroups.as_slice()),
            other => Err(wrong_context(Vendor::Netapp, other)),
        }
    }
}

#[async_trait]
impl StorageProvider for NetAppProvider {
    async fn connect(&mut self) -> Result<()> {
        let req = self
            .unchecked_req(Method::GET, "/cluster")
            .query(&[("fields", "name")]);
        let cluster: Cluster =
            self.rest.send_json("connect", self.rest.base(), req).await?;
        info!(self.log, "connected to ONTAP cluster"; "cluster" => &cluster.name);
        self.cluster = Some(cluster.name);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Basic auth is stateless; forgetting the session is all there is.
        self.cluster = None;
        Ok(())
    }

    async fn validate_credentials(&mut self) -> Result<()> {
        if self.cluster.is_none() {
            return self.connect().await;
        }
        let req = self
            .unchecked_req(Method::GET, "/cluster")
            .query(&[("fields", "name")]);
        match self.rest.send_empty("validate session", self.rest.base(), req).await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_unauthorized() => {
                debug!(self.log, "session rejected, reconnecting");
                self.cluster = None;
                self.connect().await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<Volume> {
        let size = round_up_to_gib(size_bytes)?;
        let path = self.lun_path(name);
        let req = self
            .req("create lun", Method::POST, "/storage/luns")?
            .query(&[("return_records", "true")])
            .json(&json!({
                "svm": { "name": self.svm },
                "name": path,
                "os_type": self.os_type,
                "space": { "size": size },
            }));
        let recs: Records<Lun> = self.rest.send_json("create lun", &path, req).await?;
        let lun = match recs.records.into_iter().next() {
            Some(lun) if !lun.serial_number.is_empty() => lun,
            // Older ONTAP releases omit fields from return_records.
            _ => self.luns(Some(&path)).await?.into_iter().next().ok_or_else(
                || StorageError::NotFound { kind: "lun", name: path.clone() },
            )?,
        };
        info!(self.log, "created lun"; "lun" => &path, "size" => size);
        let mut info = VolumeInfo::try_from(lun)?;
        if info.size == 0 {
            info.size = size;
        }
        Ok(info.into())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let info = self.get_volume_info(name).await?;
        let req = self.req(
            "delete lun",
            Method::DELETE,
            &format!("/storage/luns/{}", info.id),
        )?;
        self.rest.send_empty("delete lun", &info.name, req).await?;
        info!(self.log, "deleted lun"; "lun" => &info.name);
        Ok(())
    }

    async fn get_volume_info(&self, name: &str) -> Result<VolumeInfo> {
        let path = self.lun_path(name);
        let lun = self
            .luns(Some(&path))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound { kind: "lun", name: path.clone() })?;
        VolumeInfo::try_from(lun)
    }

    async fn list_all_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.luns(None).await?.into_iter().map(VolumeInfo::try_from).collect()
    }

    async fn get_all_volume_naas(&self) -> Result<Vec<String>> {
        Ok(self.list_all_volumes().await?.into_iter().map(|v| v.naa).collect())
    }

    async fn create_or_update_initiator_group(
        &self,
        group: &str,
        hba_ids: &[String],
    ) -> Result<MappingContext> {
        let igroups = match_igroups(&self.igroups().await?, hba_ids);
        if igroups.is_empty() {
            return Err(StorageError::NotFound {
                kind: "igroup",
                name: format!("{group} [{}]", hba_ids.join(", ")),
            });
        }
        debug!(self.log, "resolved initiator group";
            "group" => group,
            "igroups" => igroups.join(","),
        );
        Ok(MappingContext::NetApp { igroups })
    }

    async fn map_volume_to_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        let path = self.lun_path(&volume.name);
        for igroup in self.igroups_of(ctx)? {
            let req = self
                .req("map lun", Method::POST, "/protocols/san/lun-maps")?
                .json(&json!({
                    "svm": { "name": self.svm },
                    "lun": { "name": path },
                    "igroup": { "name": igroup },
                }));
            match self.rest.send_empty("map lun", &path, req).await {
                Err(e)
                    if e.api_says(400, "already mapped")
                        || e.api_says(409, "already") =>
                {
                    debug!(self.log, "lun already mapped";
                        "lun" => &path, "igroup" => igroup);
                }
                other => other?,
            }
        }
        info!(self.log, "mapped lun"; "lun" => &path, "group" => group);
        Ok(())
    }

    async fn unmap_volume_from_group(
        &self,
        group: &str,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        let path = self.lun_path(&volume.name);
        for igroup in self.igroups_of(ctx)? {
            for map in self.lun_maps(&path, Some(igroup)).await? {
                let (Some(lun_uuid), Some(igroup_uuid)) = (
                    map.lun.and_then(|l| l.uuid),
                    map.igroup.and_then(|g| g.uuid),
                ) else {
                    continue;
                };
                let req = self.req(
                    "unmap lun",
                    Method::DELETE,
                    &format!("/protocols/san/lun-maps/{lun_uuid}/{igroup_uuid}"),
                )?;
                self.rest.send_empty("unmap lun", &path, req).await?;
            }
        }
        info!(self.log, "unmapped lun"; "lun" => &path, "group" => group);
        Ok(())
    }

    async fn get_mapped_groups(
        &self,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<Vec<String>> {
        if !matches!(ctx, MappingContext::NetApp { .. }) {
            return Err(wrong_context(Vendor::Netapp, ctx));
        }
        let path = self.lun_path(&volume.name);
        let mut names: Vec<String> = self
            .lun_maps(&path, None)
            .await?
            .into_iter()
            .filter_map(|m| m.igroup.and_then(|g| g.name))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn context_for_groups(&self, groups: &[String]) -> MappingContext {
        MappingContext::NetApp { igroups: groups.to_vec() }
    }

    async fn resolve_cinder_volume_to_lun(&self, catalog_id: &str) -> Result<Volume> {
        let pattern = format!("*volume-{catalog_id}*");
        let lun = self
            .luns(Some(&pattern))
            .await?
            .into_iter()
            .find(|lun| is_cinder_lun(&lun.name, catalog_id))
            .ok_or_else(|| StorageError::NotFound {
                kind: "lun",
                name: format!("volume-{catalog_id}"),
            })?;
        Ok(VolumeInfo::try_from(lun)?.into())
    }

    fn who_am_i(&self) -> &'static str {
        "netapp"
    }
}
