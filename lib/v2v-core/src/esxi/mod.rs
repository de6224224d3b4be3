// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations on a hypervisor host: initiator discovery, storage rescans,
//! device visibility and the array-offloaded clone.

use std::sync::Arc;

use array_provider::naa::normalize_naa;
use array_provider::poll::{poll_until, PollConfig};
use async_trait::async_trait;
use slog::{debug, info, o, Logger};
use tokio_util::sync::CancellationToken;

use crate::collab::HostRef;
use crate::error::{Result, V2vError};

pub mod parse;
pub mod ssh;

pub use ssh::{CommandOutput, CommandRunner, SshAuth, SshCommandRunner};

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Raw device node for a SCSI identifier.
pub fn device_path(naa: &str) -> String {
    format!("/vmfs/devices/disks/{naa}")
}

/// Opens command sessions to hypervisor hosts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostConnector: Send + Sync {
    async fn open(&self, host: &HostRef) -> Result<Arc<dyn CommandRunner>>;
}

/// Connects over ssh to the host's management address.
pub struct SshHostConnector {
    cfg: v2v_config::Esxi,
    log: Logger,
}

impl SshHostConnector {
    pub fn new(cfg: &v2v_config::Esxi, log: &Logger) -> Self {
        Self { cfg: cfg.clone(), log: log.clone() }
    }
}

#[async_trait]
impl HostConnector for SshHostConnector {
    async fn open(&self, host: &HostRef) -> Result<Arc<dyn CommandRunner>> {
        let runner =
            SshCommandRunner::from_config(&host.management_ip, &self.cfg, &self.log);
        runner.connect().await?;
        Ok(Arc::new(runner))
    }
}

/// A clone started with [`EsxiHost::start_clone`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneHandle {
    pub pid: u32,
    /// RDM pointer file the clone writes through.
    pub target: String,
    pub log_file: String,
}

pub struct EsxiHost {
    runner: Arc<dyn CommandRunner>,
    log: Logger,
}

impl EsxiHost {
    pub fn new(runner: Arc<dyn CommandRunner>, log: &Logger) -> Self {
        let log = log.new(o!("host" => runner.host().to_string()));
        Self { runner, log }
    }

    pub fn name(&self) -> &str {
        self.runner.host()
    }

    /// Runs `command`, failing on a non-zero exit.
    async fn run_checked(&self, command: &str) -> Result<String> {
        let out = self.runner.run(command).await?;
        if !out.success() {
            return Err(V2vError::RemoteCommand {
                host: self.name().to_string(),
                command: command.to_string(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    pub async fn iscsi_iqns(&self) -> Result<Vec<String>> {
        let list = self.run_checked("esxcli iscsi adapter list").await?;
        let mut iqns = Vec::new();
        for adapter in parse::iscsi_adapters(&list) {
            let get = self
                .run_checked(&format!("esxcli iscsi adapter get -A {adapter}"))
                .await?;
            match parse::iscsi_adapter_name(&get) {
                Some(iqn) => iqns.push(iqn),
                None => debug!(self.log, "adapter reports no IQN"; "adapter" => adapter),
            }
        }
        Ok(iqns)
    }

    pub async fn fc_wwpns(&self) -> Result<Vec<String>> {
        let out = self.runner.run("esxcli storage san fc list").await?;
        // Hosts without FC HBAs fail this command; that just means none.
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(parse::fc_port_names(&out.stdout))
    }

    /// All storage initiator identifiers of the host, iSCSI first.
    pub async fn initiator_ids(&self) -> Result<Vec<String>> {
        let mut ids = self.iscsi_iqns().await?;
        ids.extend(self.fc_wwpns().await?);
        if ids.is_empty() {
            return Err(V2vError::NotFound {
                kind: "storage initiator on host",
                name: self.name().to_string(),
            });
        }
        info!(self.log, "resolved initiators"; "ids" => ids.join(","));
        Ok(ids)
    }

    pub async fn rescan(&self) -> Result<()> {
        self.run_checked("esxcli storage core adapter rescan --all").await?;
        Ok(())
    }

    pub async fn device_naas(&self) -> Result<Vec<String>> {
        let out = self.run_checked("esxcli storage core device list").await?;
        Ok(parse::device_naas(&out))
    }

    /// Rescans and polls until `naa` shows up in the host's device list.
    pub async fn wait_for_device(
        &self,
        naa: &str,
        cfg: PollConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let want = normalize_naa(naa)?;
        let found = poll_until(cfg, cancel, |attempt| {
            let want = want.as_str();
            async move {
                self.rescan().await?;
                let seen = self.device_naas().await?;
                if seen.iter().any(|d| d == want) {
                    return Ok(Some(device_path(want)));
                }
                debug!(self.log, "device not visible yet";
                    "naa" => want, "attempt" => attempt);
                Ok::<_, V2vError>(None)
            }
        })
        .await
        .map_err(|e| V2vError::from_poll(e, "wait for device", &want))?;
        info!(self.log, "device visible"; "path" => &found);
        Ok(found)
    }

    /// Queries whether the array advertises the clone primitive for `naa`.
    pub async fn vaai_clone_supported(&self, naa: &str) -> Result<Option<bool>> {
        let out = self
            .runner
            .run(&format!("esxcli storage core device vaai status get -d {naa}"))
            .await?;
        Ok(parse::vaai_clone_supported(&out.stdout))
    }

    /// Starts `vmkfstools -i` from `source` onto the raw device `naa`
    /// through the RDM pointer `rdm`, detached from the session.
    pub async fn start_clone(
        &self,
        source: &str,
        naa: &str,
        rdm: &str,
    ) -> Result<CloneHandle> {
        let log_file = format!("/tmp/v2v-clone-{}.log", uuid::Uuid::new_v4());
        let cmd = format!(
            "nohup vmkfstools -i {} -d rdm:{} {} > {} 2>&1 < /dev/null & echo $!",
            shell_quote(source),
            device_path(naa),
            shell_quote(rdm),
            log_file,
        );
        let out = self.run_checked(&cmd).await?;
        let pid = parse::background_pid(&out).ok_or_else(|| V2vError::Parse {
            op: "start clone",
            target: rdm.to_string(),
            detail: format!("no pid in {:?}", out.trim()),
        })?;
        info!(self.log, "clone started";
            "source" => source, "target" => rdm, "pid" => pid);
        Ok(CloneHandle { pid, target: rdm.to_string(), log_file })
    }

    pub async fn is_running(&self, pid: u32) -> Result<bool> {
        let out = self
            .run_checked(&format!(
                "kill -0 {pid} 2>/dev/null && echo running || echo stopped"
            ))
            .await?;
        Ok(parse::is_running(&out))
    }

    /// Space used under `path` in bytes.
    pub async fn used_bytes(&self, path: &str) -> Result<u64> {
        let out = self.run_checked(&format!("du -k {}", shell_quote(path))).await?;
        parse::du_bytes(&out).ok_or_else(|| V2vError::Parse {
            op: "measure",
            target: path.to_string(),
            detail: format!("unexpected du output {:?}", out.trim()),
        })
    }

    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        let out = self
            .run_checked(&format!(
                "test -e {} && echo present || echo absent",
                shell_quote(path)
            ))
            .await?;
        Ok(parse::exists(&out))
    }

    /// Deletes an RDM pointer file, leaving the device untouched.
    pub async fn remove_rdm(&self, rdm: &str) -> Result<()> {
        self.run_checked(&format!("vmkfstools -U {}", shell_quote(rdm))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ssh::MockCommandRunner;

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput { status: 0, stdout: stdout.to_string(), stderr: String::new() }
    }

    fn host(runner: MockCommandRunner) -> EsxiHost {
        EsxiHost::new(Arc::new(runner), &Logger::root(slog::Discard, o!()))
    }

    fn runner() -> MockCommandRunner {
        let mut r = MockCommandRunner::new();
        r.expect_host().return_const("esx01".to_string());
        r
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/vmfs/volumes/ds 1/a.vmdk"), "'/vmfs/volumes/ds 1/a.vmdk'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn initiators_from_iscsi_and_fc() {
        let mut r = runner();
        r.expect_run().returning(|cmd| {
            Ok(match cmd {
                "esxcli iscsi adapter list" => ok("vmhba64  iscsi_vmk  online\n"),
                "esxcli iscsi adapter get -A vmhba64" => {
                    ok("vmhba64\n   Name: iqn.1998-01.com.vmware:esx01\n")
                }
                "esxcli storage san fc list" => ok("   Port Name: 21:00:00:24:ff:4c:aa:01\n"),
                other => panic!("unexpected command {other}"),
            })
        });
        let ids = host(r).initiator_ids().await.unwrap();
        assert_eq!(ids, vec!["iqn.1998-01.com.vmware:esx01", "21000024ff4caa01"]);
    }

    #[tokio::test]
    async fn no_initiators_is_not_found() {
        let mut r = runner();
        r.expect_run().returning(|cmd| {
            Ok(match cmd {
                "esxcli storage san fc list" => CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "no FC adapters".into(),
                },
                _ => ok(""),
            })
        });
        let err = host(r).initiator_ids().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn device_appears_after_rescans() {
        let mut r = runner();
        let mut lists = 0;
        r.expect_run().returning(move |cmd| {
            Ok(match cmd {
                "esxcli storage core adapter rescan --all" => ok(""),
                "esxcli storage core device list" => {
                    lists += 1;
                    if lists < 3 {
                        ok("mpx.vmhba32:C0:T0:L0\n")
                    } else {
                        ok("naa.624a93704d1c8a3bb6e04d2b00011a40\n   Size: 10240\n")
                    }
                }
                other => panic!("unexpected command {other}"),
            })
        });
        let path = host(r)
            .wait_for_device(
                "naa.3624A93704D1C8A3BB6E04D2B00011A40",
                PollConfig::new(5, Duration::from_millis(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(path, "/vmfs/devices/disks/naa.624a93704d1c8a3bb6e04d2b00011a40");
    }

    #[tokio::test]
    async fn device_wait_times_out() {
        let mut r = runner();
        r.expect_run().times(10).returning(|_| Ok(ok("")));
        let err = host(r)
            .wait_for_device(
                "naa.624a93704d1c8a3bb6e04d2b00011a40",
                PollConfig::new(5, Duration::from_millis(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn clone_is_backgrounded() {
        let mut r = runner();
        r.expect_run()
            .withf(|cmd| {
                cmd.starts_with("nohup vmkfstools -i '/vmfs/volumes/ds1/web01/web01.vmdk' -d rdm:/vmfs/devices/disks/naa.624a93704d1c8a3bb6e04d2b00011a40 '/vmfs/volumes/ds1/web01/rdm-0.vmdk' > /tmp/v2v-clone-")
                    && cmd.ends_with("& echo $!")
            })
            .returning(|_| Ok(ok("48213\n")));
        let handle = host(r)
            .start_clone(
                "/vmfs/volumes/ds1/web01/web01.vmdk",
                "naa.624a93704d1c8a3bb6e04d2b00011a40",
                "/vmfs/volumes/ds1/web01/rdm-0.vmdk",
            )
            .await
            .unwrap();
        assert_eq!(handle.pid, 48213);
    }

    #[tokio::test]
    async fn failing_command_names_host_and_command() {
        let mut r = runner();
        r.expect_run().returning(|_| {
            Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "Unknown command or namespace\n".into(),
            })
        });
        let err = host(r).rescan().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "esx01: `esxcli storage core adapter rescan --all` exited with 1: \
             Unknown command or namespace"
        );
    }
}
