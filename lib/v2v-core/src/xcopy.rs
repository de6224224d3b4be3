// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Array-offloaded disk copy.
//!
//! Instead of streaming disk content through the migration helper, each disk
//! is cloned by the hypervisor host straight onto a freshly created array
//! volume (`vmkfstools -i` onto an RDM, which the array executes as XCOPY).
//! The volume is imported into the block-storage catalog before it is mapped
//! to the host, because the import renames it on the array.
//!
//! Once a volume is mapped to the host, the unmap runs on every exit path.
//! A volume created for a copy is deleted again if the import fails; a
//! failure after the import is reported as [`V2vError::Stranded`] naming the
//! catalog id the volume was left under.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use array_provider::poll::{poll_until, PollConfig};
use array_provider::{MappingContext, StorageProvider, Volume};
use futures::FutureExt;
use serde_derive::Serialize;
use slog::{info, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::catalog::VolumeCatalog;
use crate::collab::{HostRef, PowerState, ProgressSink, Provisioner, VmManager};
use crate::disk::VmDisk;
use crate::error::{Result, V2vError};
use crate::esxi::{EsxiHost, HostConnector};
use crate::tracker::CloneTracker;

/// Outcome of copying one disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CopiedVolume {
    pub disk: String,
    /// The array volume, under its post-import name.
    pub volume: Volume,
    pub catalog_id: String,
    /// Where the volume appeared on the helper VM.
    pub device_path: PathBuf,
}

/// Name of the array volume created for `disk` of `vm`.
pub fn volume_name(vm: &str, disk: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect()
    };
    format!("{}-{}", clean(vm), clean(disk))
}

/// RDM pointer placed next to the source disk, and the directory whose
/// growth the tracker samples.
fn rdm_location(source: &str) -> (String, String) {
    let (dir, file) = source.rsplit_once('/').unwrap_or((".", source));
    let stem = file.strip_suffix(".vmdk").unwrap_or(file);
    (format!("{dir}/{stem}-v2v-rdm.vmdk"), dir.to_string())
}

pub struct XcopyOrchestrator {
    vms: Arc<dyn VmManager>,
    provider: Box<dyn StorageProvider>,
    catalog: Arc<dyn VolumeCatalog>,
    provisioner: Arc<dyn Provisioner>,
    hosts: Arc<dyn HostConnector>,
    progress: Arc<dyn ProgressSink>,
    polling: v2v_config::Polling,
    cancel: CancellationToken,
    log: Logger,
}

/// Per-call state: the host session and what it resolved.
struct HostSession {
    host: HostRef,
    esxi: EsxiHost,
    initiators: Vec<String>,
}

impl XcopyOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vms: Arc<dyn VmManager>,
        provider: Box<dyn StorageProvider>,
        catalog: Arc<dyn VolumeCatalog>,
        provisioner: Arc<dyn Provisioner>,
        hosts: Arc<dyn HostConnector>,
        progress: Arc<dyn ProgressSink>,
        polling: v2v_config::Polling,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "xcopy", "array" => provider.who_am_i()));
        Self {
            vms,
            provider,
            catalog,
            provisioner,
            hosts,
            progress,
            polling,
            cancel: CancellationToken::new(),
            log,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn device_poll(&self) -> PollConfig {
        PollConfig::new(self.polling.device_attempts, self.polling.device_interval())
    }

    /// Copies every disk of `vm` onto new array volumes.
    pub async fn copy_disks(&mut self, vm: &str) -> Result<Vec<CopiedVolume>> {
        self.ensure_powered_off(vm).await?;
        let disks = self.vms.disks(vm).await?;

        self.provider.validate_credentials().await?;
        let res = self.copy_all(vm, &disks).await;
        if let Err(e) = self.provider.disconnect().await {
            warn!(self.log, "failed to close array session"; "error" => %e);
        }
        res
    }

    /// Clones `disk` of `vm` onto the existing array volume `volume_name`,
    /// restoring the volume's previous mappings afterwards.
    pub async fn copy_to_existing_volume(
        &mut self,
        vm: &str,
        disk: &VmDisk,
        volume_name: &str,
    ) -> Result<Volume> {
        self.ensure_powered_off(vm).await?;
        self.provider.validate_credentials().await?;
        let res = self.copy_existing(vm, disk, volume_name).await;
        if let Err(e) = self.provider.disconnect().await {
            warn!(self.log, "failed to close array session"; "error" => %e);
        }
        res
    }

    async fn ensure_powered_off(&self, vm: &str) -> Result<()> {
        if self.vms.power_state(vm).await? == PowerState::PoweredOff {
            return Ok(());
        }
        info!(self.log, "powering off source VM"; "vm" => vm);
        self.vms.power_off(vm).await?;
        let cfg = PollConfig::new(
            self.polling.power_off_attempts,
            self.polling.power_off_interval(),
        );
        poll_until(cfg, &self.cancel, |_| async move {
            let state = self.vms.power_state(vm).await?;
            Ok::<_, V2vError>((state == PowerState::PoweredOff).then_some(()))
        })
        .await
        .map_err(|e| V2vError::from_poll(e, "wait for power off", vm))
    }

    async fn open_host(&self, vm: &str) -> Result<HostSession> {
        let host = self.vms.host_of(vm).await?;
        let runner = self.hosts.open(&host).await?;
        let esxi = EsxiHost::new(runner, &self.log);
        let initiators = esxi.initiator_ids().await?;
        Ok(HostSession { host, esxi, initiators })
    }

    async fn copy_all(&self, vm: &str, disks: &[VmDisk]) -> Result<Vec<CopiedVolume>> {
        let session = self.open_host(vm).await?;
        let mut out = Vec::with_capacity(disks.len());
        for disk in disks {
            if self.cancel.is_cancelled() {
                return Err(V2vError::Cancelled { op: "copy disks", target: vm.to_string() });
            }
            out.push(self.copy_one(vm, &session, disk).await?);
        }
        Ok(out)
    }

    async fn copy_one(
        &self,
        vm: &str,
        session: &HostSession,
        disk: &VmDisk,
    ) -> Result<CopiedVolume> {
        let log = self.log.new(o!("disk" => disk.name.clone()));
        self.progress.report(&disk.name, "create volume", None);
        let created = self
            .provider
            .create_volume(&volume_name(vm, &disk.name), disk.size)
            .await?;

        // Catalog-driven arrays create the volume in the catalog already.
        let catalog_id = match created.catalog_id.clone() {
            Some(id) => id,
            None => self.import(vm, disk, &created).await?,
        };
        let volume = self.settle(&catalog_id).await.map_err(|e| V2vError::Stranded {
            volume: created.name.clone(),
            catalog_id: catalog_id.clone(),
            source: Box::new(e),
        })?;
        info!(log, "volume ready in catalog";
            "created" => &created.name, "now" => &volume.name, "naa" => &volume.naa);

        let ctx = self
            .provider
            .create_or_update_initiator_group(&session.host.name, &session.initiators)
            .await?;
        self.clone_mapped(session, disk, &volume, &ctx).await?;

        let device_path = self.provisioner.attach_volume(&catalog_id).await?;
        self.progress.report(&disk.name, "attached", Some(100));
        Ok(CopiedVolume { disk: disk.name.clone(), volume, catalog_id, device_path })
    }

    /// Imports a freshly created array volume, deleting it again if the
    /// catalog refuses it. The array volume is renamed by the import and every
    /// later step must use the new name.
    async fn import(&self, vm: &str, disk: &VmDisk, created: &Volume) -> Result<String> {
        self.progress.report(&disk.name, "import volume", None);
        let display = format!("{vm}-{}", disk.name);
        match self.catalog.import(&created.name, &display, disk.boot).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Err(de) = self.provider.delete_volume(&created.name).await {
                    warn!(self.log, "failed to delete unimported volume";
                        "volume" => &created.name, "error" => %de);
                }
                Err(e)
            }
        }
    }

    /// Waits for the catalog volume and finds it on the array again.
    async fn settle(&self, catalog_id: &str) -> Result<Volume> {
        self.catalog.wait_available(catalog_id, &self.cancel).await?;
        Ok(self.provider.resolve_cinder_volume_to_lun(catalog_id).await?)
    }

    async fn copy_existing(
        &self,
        vm: &str,
        disk: &VmDisk,
        volume_name: &str,
    ) -> Result<Volume> {
        let session = self.open_host(vm).await?;
        let volume: Volume = self.provider.get_volume_info(volume_name).await?.into();
        let ctx = self
            .provider
            .create_or_update_initiator_group(&session.host.name, &session.initiators)
            .await?;

        let original = self.provider.get_mapped_groups(&volume, &ctx).await?;
        let restore = self.provider.context_for_groups(&original);

        let res = AssertUnwindSafe(
            self.detach_and_clone(&session, disk, &volume, &ctx, &original, &restore),
        )
        .catch_unwind()
        .await;

        // A partial detach leaves some groups mapped; mapping is idempotent,
        // so restore all of them.
        if !original.is_empty() {
            if let Err(e) = self
                .provider
                .map_volume_to_group(&original.join(","), &volume, &restore)
                .await
            {
                warn!(self.log, "failed to restore original mappings";
                    "volume" => &volume.name,
                    "groups" => original.join(","),
                    "error" => %e,
                );
            }
        }
        match res {
            Ok(res) => res.map(|()| volume),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn detach_and_clone(
        &self,
        session: &HostSession,
        disk: &VmDisk,
        volume: &Volume,
        ctx: &MappingContext,
        original: &[String],
        restore: &MappingContext,
    ) -> Result<()> {
        if !original.is_empty() {
            info!(self.log, "detaching volume from its current groups";
                "volume" => &volume.name, "groups" => original.join(","));
            self.provider
                .unmap_volume_from_group(&original.join(","), volume, restore)
                .await?;
        }
        self.clone_mapped(session, disk, volume, ctx).await
    }

    /// Maps `volume` to the host, clones `disk` onto it and unmaps it again,
    /// whatever happens in between.
    async fn clone_mapped(
        &self,
        session: &HostSession,
        disk: &VmDisk,
        volume: &Volume,
        ctx: &MappingContext,
    ) -> Result<()> {
        let group = session.host.name.as_str();
        self.provider.map_volume_to_group(group, volume, ctx).await?;

        let res = AssertUnwindSafe(self.clone_onto(session, disk, volume))
            .catch_unwind()
            .await;

        if let Err(e) = self.provider.unmap_volume_from_group(group, volume, ctx).await {
            warn!(self.log, "failed to unmap volume";
                "volume" => &volume.name, "group" => group, "error" => %e);
        }

        match res {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn clone_onto(
        &self,
        session: &HostSession,
        disk: &VmDisk,
        volume: &Volume,
    ) -> Result<()> {
        self.progress.report(&disk.name, "wait for device", None);
        session
            .esxi
            .wait_for_device(&volume.naa, self.device_poll(), &self.cancel)
            .await?;

        // Offload is assumed available; the check is informational only.
        match session.esxi.vaai_clone_supported(&volume.naa).await {
            Ok(supported) => info!(self.log, "VAAI clone status";
                "naa" => &volume.naa, "supported" => ?supported),
            Err(e) => warn!(self.log, "VAAI check failed"; "error" => %e),
        }

        let source = disk.host_backing_path()?;
        let (rdm, measure_dir) = rdm_location(&source);
        let handle = session.esxi.start_clone(&source, &volume.naa, &rdm).await?;
        let mut tracker = CloneTracker::new(
            &session.esxi,
            handle,
            &measure_dir,
            disk.size,
            self.polling.clone_interval(),
            &self.log,
        );
        tracker.wait(&disk.name, self.progress.as_ref(), &self.cancel).await?;

        if let Err(e) = session.esxi.remove_rdm(&rdm).await {
            warn!(self.log, "failed to remove RDM pointer"; "rdm" => &rdm, "error" => %e);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use array_provider::{StorageError, VolumeInfo};
    use async_trait::async_trait;

    use super::*;
    use crate::catalog::MockVolumeCatalog;
    use crate::collab::{MockProgressSink, MockProvisioner, MockVmManager};
    use crate::esxi::{CommandOutput, CommandRunner, MockHostConnector};

    const NAA: &str = "naa.624a93704d1c8a3bb6e04d2b00011a40";

    #[derive(Default)]
    struct ArrayState {
        calls: Mutex<Vec<String>>,
        mapped: Mutex<BTreeSet<(String, String)>>,
        /// Group whose unmap is refused.
        fail_unmap: Option<String>,
        /// Volumes are born in the catalog, as on catalog-driven arrays.
        catalog_on_create: bool,
    }

    /// Array double tracking mappings as (volume, group) pairs. Clones share
    /// state so tests can inspect it after handing one to the orchestrator.
    #[derive(Clone, Default)]
    struct FakeArray(Arc<ArrayState>);

    impl FakeArray {
        fn with_mapping(volume: &str, group: &str) -> Self {
            Self::with_mappings(volume, &[group])
        }

        fn with_mappings(volume: &str, groups: &[&str]) -> Self {
            let array = Self::default();
            for group in groups {
                array.0.mapped.lock().unwrap().insert((volume.into(), group.to_string()));
            }
            array
        }

        fn refusing_unmap(self, group: &str) -> Self {
            let state = ArrayState {
                fail_unmap: Some(group.to_string()),
                mapped: Mutex::new(self.0.mapped.lock().unwrap().clone()),
                ..Default::default()
            };
            Self(Arc::new(state))
        }

        fn catalog_driven() -> Self {
            Self(Arc::new(ArrayState { catalog_on_create: true, ..Default::default() }))
        }

        fn record(&self, call: String) {
            self.0.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.0.calls.lock().unwrap().clone()
        }

        fn mapped(&self) -> Vec<(String, String)> {
            self.0.mapped.lock().unwrap().iter().cloned().collect()
        }
    }

    #[async_trait]
    impl StorageProvider for FakeArray {
        async fn connect(&mut self) -> array_provider::Result<()> {
            Ok(())
        }
        async fn disconnect(&mut self) -> array_provider::Result<()> {
            self.record("disconnect".into());
            Ok(())
        }
        async fn validate_credentials(&mut self) -> array_provider::Result<()> {
            Ok(())
        }
        async fn create_volume(
            &self,
            name: &str,
            size: u64,
        ) -> array_provider::Result<Volume> {
            self.record(format!("create {name} {size}"));
            Ok(Volume {
                name: name.into(),
                size,
                naa: String::new(),
                id: "1".into(),
                catalog_id: self.0.catalog_on_create.then(|| "gen-1".to_string()),
            })
        }
        async fn delete_volume(&self, name: &str) -> array_provider::Result<()> {
            self.record(format!("delete {name}"));
            Ok(())
        }
        async fn get_volume_info(&self, name: &str) -> array_provider::Result<VolumeInfo> {
            Ok(VolumeInfo {
                name: name.into(),
                size: 1 << 30,
                naa: NAA.into(),
                serial: "4d1c8a3bb6e04d2b00011a40".into(),
                id: "7".into(),
            })
        }
        async fn list_all_volumes(&self) -> array_provider::Result<Vec<VolumeInfo>> {
            Ok(vec![])
        }
        async fn get_all_volume_naas(&self) -> array_provider::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn create_or_update_initiator_group(
            &self,
            group: &str,
            _: &[String],
        ) -> array_provider::Result<MappingContext> {
            Ok(MappingContext::Pure { hosts: vec![group.to_string()] })
        }
        async fn map_volume_to_group(
            &self,
            _: &str,
            volume: &Volume,
            ctx: &MappingContext,
        ) -> array_provider::Result<()> {
            for g in ctx.groups() {
                self.record(format!("map {} {g}", volume.name));
                self.0.mapped.lock().unwrap().insert((volume.name.clone(), g));
            }
            Ok(())
        }
        async fn unmap_volume_from_group(
            &self,
            _: &str,
            volume: &Volume,
            ctx: &MappingContext,
        ) -> array_provider::Result<()> {
            for g in ctx.groups() {
                self.record(format!("unmap {} {g}", volume.name));
                if self.0.fail_unmap.as_deref() == Some(g.as_str()) {
                    return Err(StorageError::Api {
                        op: "unmap",
                        target: volume.name.clone(),
                        status: 500,
                        body: "internal error".into(),
                    });
                }
                self.0.mapped.lock().unwrap().remove(&(volume.name.clone(), g));
            }
            Ok(())
        }
        async fn get_mapped_groups(
            &self,
            volume: &Volume,
            _: &MappingContext,
        ) -> array_provider::Result<Vec<String>> {
            Ok(self
                .mapped()
                .into_iter()
                .filter(|(v, _)| *v == volume.name)
                .map(|(_, g)| g)
                .collect())
        }
        fn context_for_groups(&self, groups: &[String]) -> MappingContext {
            MappingContext::Pure { hosts: groups.to_vec() }
        }
        async fn resolve_cinder_volume_to_lun(
            &self,
            id: &str,
        ) -> array_provider::Result<Volume> {
            if id == "missing" {
                return Err(StorageError::NotFound { kind: "volume", name: id.into() });
            }
            Ok(Volume {
                name: format!("volume-{id}-cinder"),
                size: 1 << 30,
                naa: NAA.into(),
                id: "1".into(),
                catalog_id: Some(id.to_string()),
            })
        }
        fn who_am_i(&self) -> &'static str {
            "fake"
        }
    }

    /// Host answering the esxcli queries the copy issues. `clone_lands`
    /// decides whether the RDM exists once vmkfstools has exited.
    struct FakeHost {
        device_visible: bool,
        clone_lands: bool,
        commands: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn new(device_visible: bool, clone_lands: bool) -> Arc<Self> {
            Arc::new(Self { device_visible, clone_lands, commands: Mutex::default() })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeHost {
        fn host(&self) -> &str {
            "esx01"
        }

        async fn run(&self, command: &str) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            let stdout = match command {
                "esxcli iscsi adapter list" => "vmhba64  iscsi_vmk  online\n".to_string(),
                c if c.starts_with("esxcli iscsi adapter get") => {
                    "   Name: iqn.1998-01.com.vmware:esx01\n".to_string()
                }
                "esxcli storage core device list" if self.device_visible => {
                    format!("{NAA}\n   Size: 1024\n")
                }
                c if c.starts_with("esxcli storage core device vaai") => {
                    "   Clone Status: supported\n".to_string()
                }
                c if c.starts_with("nohup vmkfstools") => "31337\n".to_string(),
                c if c.starts_with("kill -0") => "stopped\n".to_string(),
                c if c.starts_with("test -e") && self.clone_lands => "present\n".to_string(),
                c if c.starts_with("test -e") => "absent\n".to_string(),
                _ => String::new(),
            };
            Ok(CommandOutput { status: 0, stdout, stderr: String::new() })
        }
    }

    fn polling() -> v2v_config::Polling {
        v2v_config::Polling {
            device_attempts: 5,
            device_interval_secs: 0,
            power_off_attempts: 3,
            power_off_interval_secs: 0,
            clone_interval_secs: 0,
            ..Default::default()
        }
    }

    fn esx01() -> HostRef {
        HostRef { name: "esx01".into(), management_ip: "10.0.0.11".into() }
    }

    fn vm_manager(disks: Vec<VmDisk>) -> MockVmManager {
        let mut vms = MockVmManager::new();
        vms.expect_power_state().returning(|_| Ok(PowerState::PoweredOff));
        vms.expect_disks().returning(move |_| Ok(disks.clone()));
        vms.expect_host_of().returning(|_| Ok(esx01()));
        vms
    }

    fn disk() -> VmDisk {
        VmDisk {
            name: "disk0".into(),
            size: 3 * (1 << 30) + 200,
            boot: true,
            backing_path: "[ds1] web01/web01.vmdk".into(),
            ..Default::default()
        }
    }

    fn catalog(id: &'static str) -> MockVolumeCatalog {
        let mut catalog = MockVolumeCatalog::new();
        catalog.expect_import().returning(move |_, _, _| Ok(id.to_string()));
        catalog.expect_wait_available().returning(|_, _| Ok(()));
        catalog
    }

    fn orchestrator(
        vms: MockVmManager,
        array: &FakeArray,
        host: &Arc<FakeHost>,
        catalog: MockVolumeCatalog,
        provisioner: MockProvisioner,
    ) -> XcopyOrchestrator {
        let runner: Arc<dyn CommandRunner> = host.clone();
        let mut hosts = MockHostConnector::new();
        hosts.expect_open().returning(move |_| Ok(runner.clone()));
        let mut progress = MockProgressSink::new();
        progress.expect_report().return_const(());
        XcopyOrchestrator::new(
            Arc::new(vms),
            Box::new(array.clone()),
            Arc::new(catalog),
            Arc::new(provisioner),
            Arc::new(hosts),
            Arc::new(progress),
            polling(),
            &Logger::root(slog::Discard, o!()),
        )
    }

    #[test]
    fn naming() {
        assert_eq!(volume_name("web 01", "Hard disk 1"), "web-01-Hard-disk-1");
        assert_eq!(
            rdm_location("/vmfs/volumes/ds1/web01/web01.vmdk"),
            (
                "/vmfs/volumes/ds1/web01/web01-v2v-rdm.vmdk".to_string(),
                "/vmfs/volumes/ds1/web01".to_string()
            )
        );
    }

    #[tokio::test]
    async fn copies_disk_and_unmaps() {
        let array = FakeArray::default();
        let host = FakeHost::new(true, true);
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_attach_volume()
            .withf(|id| id == "c0ffee")
            .times(1)
            .returning(|_| Ok(PathBuf::from("/dev/vdb")));

        let mut x = orchestrator(
            vm_manager(vec![disk()]),
            &array,
            &host,
            catalog("c0ffee"),
            provisioner,
        );
        let copied = x.copy_disks("web01").await.unwrap();

        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].volume.name, "volume-c0ffee-cinder");
        assert_eq!(copied[0].catalog_id, "c0ffee");
        assert_eq!(copied[0].device_path, PathBuf::from("/dev/vdb"));
        assert!(array.mapped().is_empty());
        assert_eq!(
            array.calls(),
            vec![
                format!("create web01-disk0 {}", 3u64 * (1 << 30) + 200),
                "map volume-c0ffee-cinder esx01".to_string(),
                "unmap volume-c0ffee-cinder esx01".to_string(),
                "disconnect".to_string(),
            ]
        );

        let commands = host.commands();
        assert!(commands.iter().any(|c| c.starts_with(
            "nohup vmkfstools -i '/vmfs/volumes/ds1/web01/web01.vmdk' \
             -d rdm:/vmfs/devices/disks/naa.624a93704d1c8a3bb6e04d2b00011a40 \
             '/vmfs/volumes/ds1/web01/web01-v2v-rdm.vmdk'"
        )));
        assert!(commands
            .iter()
            .any(|c| c == "vmkfstools -U '/vmfs/volumes/ds1/web01/web01-v2v-rdm.vmdk'"));
    }

    #[tokio::test]
    async fn device_timeout_still_unmaps() {
        let array = FakeArray::default();
        let host = FakeHost::new(false, true);
        let mut provisioner = MockProvisioner::new();
        provisioner.expect_attach_volume().never();

        let mut x = orchestrator(
            vm_manager(vec![disk()]),
            &array,
            &host,
            catalog("c0ffee"),
            provisioner,
        );
        let err = x.copy_disks("web01").await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
        assert!(array.mapped().is_empty());
        assert!(array.calls().contains(&"unmap volume-c0ffee-cinder esx01".to_string()));
        assert_eq!(array.calls().last().map(String::as_str), Some("disconnect"));

        let commands = host.commands();
        let lists = commands
            .iter()
            .filter(|c| *c == "esxcli storage core device list")
            .count();
        assert_eq!(lists, 5);
        assert!(!commands.iter().any(|c| c.contains("vmkfstools")));
    }

    #[tokio::test]
    async fn lost_import_is_reported_with_its_catalog_id() {
        let array = FakeArray::default();
        let host = FakeHost::new(true, true);
        let mut x = orchestrator(
            vm_manager(vec![disk()]),
            &array,
            &host,
            catalog("missing"),
            MockProvisioner::new(),
        );
        let err = x.copy_disks("web01").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        match &err {
            V2vError::Stranded { volume, catalog_id, .. } => {
                assert_eq!(volume, "web01-disk0");
                assert_eq!(catalog_id, "missing");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!array.calls().iter().any(|c| c.starts_with("map")));
        assert!(!array.calls().iter().any(|c| c.starts_with("delete")));
    }

    #[tokio::test]
    async fn refused_import_deletes_the_volume() {
        let array = FakeArray::default();
        let mut catalog = MockVolumeCatalog::new();
        catalog.expect_import().times(1).returning(|_, _, _| {
            Err(StorageError::Api {
                op: "manage volume",
                target: "web01-disk0".into(),
                status: 400,
                body: "Manage existing volume failed".into(),
            }
            .into())
        });
        catalog.expect_wait_available().never();
        let mut x = orchestrator(
            vm_manager(vec![disk()]),
            &array,
            &FakeHost::new(true, true),
            catalog,
            MockProvisioner::new(),
        );

        let err = x.copy_disks("web01").await.unwrap_err();
        assert!(matches!(err, V2vError::Storage(StorageError::Api { status: 400, .. })));
        assert_eq!(
            array.calls(),
            vec![
                format!("create web01-disk0 {}", 3u64 * (1 << 30) + 200),
                "delete web01-disk0".to_string(),
                "disconnect".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn wait_failure_keeps_the_imported_volume() {
        let array = FakeArray::default();
        let mut catalog = MockVolumeCatalog::new();
        catalog.expect_import().returning(|_, _, _| Ok("c0ffee".to_string()));
        catalog.expect_wait_available().returning(|id, _| {
            Err(V2vError::Timeout {
                op: "wait for volume status",
                target: id.to_string(),
                attempts: 3,
            })
        });
        let mut x = orchestrator(
            vm_manager(vec![disk()]),
            &array,
            &FakeHost::new(true, true),
            catalog,
            MockProvisioner::new(),
        );

        let err = x.copy_disks("web01").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
        assert!(err.to_string().contains("catalog id c0ffee"));
        assert!(!array.calls().iter().any(|c| c.starts_with("delete")));
    }

    #[tokio::test]
    async fn catalog_driven_volumes_skip_the_import() {
        let array = FakeArray::catalog_driven();
        let mut catalog = MockVolumeCatalog::new();
        catalog.expect_import().never();
        catalog
            .expect_wait_available()
            .withf(|id, _| id == "gen-1")
            .times(1)
            .returning(|_, _| Ok(()));
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_attach_volume()
            .withf(|id| id == "gen-1")
            .times(1)
            .returning(|_| Ok(PathBuf::from("/dev/vdc")));

        let mut x = orchestrator(
            vm_manager(vec![disk()]),
            &array,
            &FakeHost::new(true, true),
            catalog,
            provisioner,
        );
        let copied = x.copy_disks("web01").await.unwrap();
        assert_eq!(copied[0].catalog_id, "gen-1");
        assert_eq!(copied[0].volume.name, "volume-gen-1-cinder");
        assert!(array.mapped().is_empty());
    }

    #[tokio::test]
    async fn powers_off_and_waits() {
        let mut vms = MockVmManager::new();
        let mut states =
            vec![PowerState::PoweredOn, PowerState::PoweredOn, PowerState::PoweredOff]
                .into_iter();
        vms.expect_power_state()
            .times(3)
            .returning(move |_| Ok(states.next().unwrap_or(PowerState::PoweredOff)));
        vms.expect_power_off().times(1).returning(|_| Ok(()));
        vms.expect_disks().returning(|_| Ok(vec![]));
        vms.expect_host_of().returning(|_| Ok(esx01()));

        let mut x = orchestrator(
            vms,
            &FakeArray::default(),
            &FakeHost::new(true, true),
            catalog("c0ffee"),
            MockProvisioner::new(),
        );
        assert!(x.copy_disks("web01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn power_off_timeout() {
        let mut vms = MockVmManager::new();
        vms.expect_power_state().returning(|_| Ok(PowerState::PoweredOn));
        vms.expect_power_off().returning(|_| Ok(()));
        vms.expect_disks().never();

        let mut x = orchestrator(
            vms,
            &FakeArray::default(),
            &FakeHost::new(true, true),
            catalog("c0ffee"),
            MockProvisioner::new(),
        );
        let err = x.copy_disks("web01").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn existing_volume_mappings_restored() {
        let array = FakeArray::with_mapping("legacy-vol", "prod-hg");
        let mut x = orchestrator(
            vm_manager(vec![]),
            &array,
            &FakeHost::new(true, true),
            catalog("c0ffee"),
            MockProvisioner::new(),
        );

        let vol = x
            .copy_to_existing_volume("web01", &disk(), "legacy-vol")
            .await
            .unwrap();
        assert_eq!(vol.name, "legacy-vol");
        assert_eq!(
            array.calls(),
            vec![
                "unmap legacy-vol prod-hg",
                "map legacy-vol esx01",
                "unmap legacy-vol esx01",
                "map legacy-vol prod-hg",
                "disconnect",
            ]
        );
        assert_eq!(array.mapped(), vec![("legacy-vol".to_string(), "prod-hg".to_string())]);
    }

    #[tokio::test]
    async fn failed_clone_still_restores_mappings() {
        let array = FakeArray::with_mapping("legacy-vol", "prod-hg");
        let mut x = orchestrator(
            vm_manager(vec![]),
            &array,
            &FakeHost::new(true, false),
            catalog("c0ffee"),
            MockProvisioner::new(),
        );

        let err = x
            .copy_to_existing_volume("web01", &disk(), "legacy-vol")
            .await
            .unwrap_err();
        assert!(matches!(err, V2vError::CloneFailed { .. }));
        assert_eq!(array.mapped(), vec![("legacy-vol".to_string(), "prod-hg".to_string())]);
    }

    #[tokio::test]
    async fn partial_detach_restores_every_group() {
        let array = FakeArray::with_mappings("legacy-vol", &["prod-a", "prod-b"])
            .refusing_unmap("prod-b");
        let host = FakeHost::new(true, true);
        let mut x = orchestrator(
            vm_manager(vec![]),
            &array,
            &host,
            catalog("c0ffee"),
            MockProvisioner::new(),
        );

        let err = x
            .copy_to_existing_volume("web01", &disk(), "legacy-vol")
            .await
            .unwrap_err();
        assert!(matches!(err, V2vError::Storage(StorageError::Api { status: 500, .. })));
        assert_eq!(
            array.calls(),
            vec![
                "unmap legacy-vol prod-a",
                "unmap legacy-vol prod-b",
                "map legacy-vol prod-a",
                "map legacy-vol prod-b",
                "disconnect",
            ]
        );
        assert_eq!(
            array.mapped(),
            vec![
                ("legacy-vol".to_string(), "prod-a".to_string()),
                ("legacy-vol".to_string(), "prod-b".to_string()),
            ]
        );
        assert!(!host.commands().iter().any(|c| c.contains("vmkfstools")));
    }
}
