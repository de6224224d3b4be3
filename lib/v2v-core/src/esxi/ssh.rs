// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command execution over the system `ssh` client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, o, Logger};
use tokio::process::Command;

use crate::error::{Result, V2vError};

/// Exit status 255 is reserved by ssh for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Ceiling for retrying an unreachable host.
const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs shell command lines on one remote host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Name of the host commands run on.
    fn host(&self) -> &str;

    /// Runs `command` through the remote shell. A non-zero exit is not an
    /// error at this layer; failure to reach the host is.
    async fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// How to authenticate to the host.
#[derive(Clone, Debug)]
pub enum SshAuth {
    /// Key from the agent or the default identities.
    Agent,
    Key(PathBuf),
    /// Password fed to `sshpass` through its environment.
    Password(String),
}

pub struct SshCommandRunner {
    host: String,
    user: String,
    port: u16,
    auth: SshAuth,
    connect_timeout: Duration,
    log: Logger,
}

impl SshCommandRunner {
    pub fn new(
        host: &str,
        user: &str,
        port: u16,
        auth: SshAuth,
        connect_timeout: Duration,
        log: &Logger,
    ) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            auth,
            connect_timeout,
            log: log.new(o!("esxi" => host.to_string())),
        }
    }

    /// Builds a runner from the `[esxi]` configuration section.
    pub fn from_config(host: &str, cfg: &v2v_config::Esxi, log: &Logger) -> Self {
        let auth = match (&cfg.identity_file, &cfg.password) {
            (Some(key), _) => SshAuth::Key(key.clone()),
            (None, Some(pw)) => SshAuth::Password(pw.clone()),
            (None, None) => SshAuth::Agent,
        };
        Self::new(
            host,
            &cfg.username,
            cfg.port,
            auth,
            Duration::from_secs(cfg.connect_timeout_secs),
            log,
        )
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = match &self.auth {
            SshAuth::Password(pw) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", pw).arg("-e").arg("ssh");
                cmd
            }
            _ => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-p")
            .arg(self.port.to_string());
        if let SshAuth::Key(key) = &self.auth {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg("--")
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_once(&self, remote: &str) -> Result<CommandOutput> {
        let out = self.command(remote).output().await.map_err(|e| {
            V2vError::HostUnreachable {
                host: self.host.clone(),
                detail: format!("failed to spawn ssh: {e}"),
            }
        })?;
        let status = out.status.code().unwrap_or(-1);
        let output = CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        };
        if status == SSH_TRANSPORT_FAILURE {
            return Err(V2vError::HostUnreachable {
                host: self.host.clone(),
                detail: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Checks the host accepts the session, retrying with exponential
    /// backoff while it is unreachable.
    pub async fn connect(&self) -> Result<()> {
        let attempt = || async {
            self.run_once("true").await.map_err(|e| {
                debug!(self.log, "host not reachable yet"; "error" => %e);
                backoff::Error::transient(e)
            })
        };
        backoff::future::retry(
            backoff::ExponentialBackoff {
                max_elapsed_time: Some(CONNECT_RETRY_WINDOW),
                ..Default::default()
            },
            attempt,
        )
        .await?;
        info!(self.log, "ssh session ready"; "user" => &self.user);
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(self.log, "running remote command"; "command" => command);
        let out = self.run_once(command).await?;
        if !out.success() {
            debug!(self.log, "remote command failed";
                "command" => command,
                "status" => out.status,
                "stderr" => out.stderr.trim(),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn args(runner: &SshCommandRunner) -> Vec<String> {
        let cmd = runner.command("esxcli iscsi adapter list");
        let std = cmd.as_std();
        std::iter::once(std.get_program())
            .chain(std.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn key_auth_uses_batch_mode() {
        let log = Logger::root(slog::Discard, o!());
        let runner = SshCommandRunner::new(
            "esx01.lab",
            "root",
            2222,
            SshAuth::Key("/etc/v2v/id_ed25519".into()),
            Duration::from_secs(10),
            &log,
        );
        let argv = args(&runner);
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.contains(&"ConnectTimeout=10".to_string()));
        assert!(argv.contains(&"/etc/v2v/id_ed25519".to_string()));
        assert!(argv.contains(&"2222".to_string()));
        assert_eq!(argv[argv.len() - 3], "root@esx01.lab");
        assert_eq!(argv.last().unwrap(), "esxcli iscsi adapter list");
    }

    #[test]
    fn password_auth_goes_through_sshpass() {
        let log = Logger::root(slog::Discard, o!());
        let cfg = v2v_config::Esxi {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let runner = SshCommandRunner::from_config("esx02", &cfg, &log);
        let argv = args(&runner);
        assert_eq!(&argv[..3], &["sshpass", "-e", "ssh"]);
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
        assert!(!argv.iter().any(|a| a.contains("hunter2")));
        assert_eq!(runner.host(), "esx02");
    }
}
