// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming access to a disk inside a VM snapshot.
//!
//! Each disk gets its own nbdkit process running the VDDK plugin against the
//! current snapshot, exported on a unix socket. Full copies are handed to
//! `nbdcopy`; changed extents are read with the in-process NBD client and
//! written at the same offsets of the target device.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use array_provider::poll::{poll_until, PollConfig};
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::disk::{total_bytes, ChangedRegion, SnapshotRef, VmDisk};
use crate::error::{NbdError, Result, V2vError};
use crate::nbd::NbdClient;

/// How often to look for the nbdkit socket while it starts.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A per-disk channel to snapshot content.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockTransport: Send {
    /// Token that stops any wait the transport is blocked in.
    fn set_cancellation(&mut self, cancel: CancellationToken);

    /// Binds a session for `disk` to `snapshot`, replacing any existing one.
    async fn start(&mut self, disk: &VmDisk, snapshot: &SnapshotRef) -> Result<()>;

    /// Tears down the session for `disk`, if any.
    async fn stop(&mut self, disk: &VmDisk) -> Result<()>;

    /// Tears down every open session.
    async fn stop_all(&mut self) -> Result<()>;

    /// Copies the whole disk to its target path. Returns bytes copied.
    async fn copy_full(&mut self, disk: &VmDisk) -> Result<u64>;

    /// Copies only `regions` to the same offsets of the target path.
    async fn copy_regions(
        &mut self,
        disk: &VmDisk,
        regions: &[ChangedRegion],
    ) -> Result<u64>;
}

/// The VM whose disks are exported, as VDDK addresses it.
#[derive(Clone, Debug)]
pub struct VddkSource {
    pub vcenter: v2v_config::VCenter,
    /// Managed object reference of the VM, e.g. `vm-1042`.
    pub vm_moref: String,
}

struct Session {
    child: Child,
    socket: PathBuf,
    snapshot: String,
}

pub struct NbdkitTransport {
    cfg: v2v_config::Transport,
    source: VddkSource,
    sessions: BTreeMap<String, Session>,
    cancel: CancellationToken,
    log: Logger,
}

/// Arguments for an nbdkit instance serving `backing` from `snapshot`. The
/// password is read from stdin so it never appears in the process table.
pub(crate) fn nbdkit_args(
    cfg: &v2v_config::Transport,
    source: &VddkSource,
    socket: &Path,
    snapshot: &str,
    backing: &str,
) -> Vec<String> {
    vec![
        "--foreground".to_string(),
        "--readonly".to_string(),
        "--exit-with-parent".to_string(),
        "--unix".to_string(),
        socket.display().to_string(),
        "vddk".to_string(),
        format!("libdir={}", cfg.vddk_libdir.display()),
        format!("server={}", source.vcenter.server),
        format!("user={}", source.vcenter.username),
        "password=-".to_string(),
        format!("thumbprint={}", source.vcenter.thumbprint),
        format!("vm=moref={}", source.vm_moref),
        format!("snapshot={snapshot}"),
        "transports=file:nbdssl:nbd".to_string(),
        format!("file={backing}"),
    ]
}

/// Splits `regions` into reads of at most `chunk` bytes.
pub(crate) fn chunked(
    regions: &[ChangedRegion],
    chunk: u64,
) -> impl Iterator<Item = ChangedRegion> + '_ {
    regions.iter().flat_map(move |r| {
        let pieces = r.length.div_ceil(chunk);
        (0..pieces).map(move |i| {
            let start = r.start + i * chunk;
            ChangedRegion::new(start, chunk.min(r.end() - start))
        })
    })
}

impl NbdkitTransport {
    pub fn new(cfg: v2v_config::Transport, source: VddkSource, log: &Logger) -> Self {
        let log = log.new(o!("vm" => source.vm_moref.clone()));
        Self {
            cfg,
            source,
            sessions: BTreeMap::new(),
            cancel: CancellationToken::new(),
            log,
        }
    }

    fn socket_for(&self, disk: &VmDisk) -> PathBuf {
        let safe: String = disk
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.cfg
            .socket_dir
            .join(format!("nbdkit-{}-{safe}.sock", self.source.vm_moref))
    }

    fn session(&self, disk: &VmDisk) -> Result<&Session> {
        self.sessions.get(&disk.name).ok_or_else(|| {
            V2vError::StateMismatch(format!("no transport session for disk {}", disk.name))
        })
    }

    fn nbd_uri(socket: &Path) -> String {
        format!("nbd+unix:///?socket={}", socket.display())
    }

    async fn wait_for_socket(&self, disk: &str, socket: &Path) -> Result<()> {
        let attempts = (self.cfg.startup_timeout().as_millis()
            / SOCKET_POLL_INTERVAL.as_millis())
        .max(1) as u32;
        let cfg = PollConfig::new(attempts, SOCKET_POLL_INTERVAL);
        poll_until(cfg, &self.cancel, move |_| async move {
            Ok::<_, V2vError>(socket.exists().then_some(()))
        })
        .await
        .map_err(|e| V2vError::from_poll(e, "start nbdkit", disk))
    }

    async fn kill(&self, disk: &str, mut session: Session) {
        if let Err(e) = session.child.kill().await {
            warn!(self.log, "failed to stop nbdkit"; "disk" => disk, "error" => %e);
        }
        if let Err(e) = tokio::fs::remove_file(&session.socket).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(self.log, "failed to remove socket";
                    "socket" => %session.socket.display(), "error" => %e);
            }
        }
        debug!(self.log, "transport session stopped";
            "disk" => disk, "snapshot" => session.snapshot);
    }
}

#[async_trait]
impl BlockTransport for NbdkitTransport {
    fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    async fn start(&mut self, disk: &VmDisk, snapshot: &SnapshotRef) -> Result<()> {
        self.stop(disk).await?;

        let backing = disk.snapshot_backing.as_deref().unwrap_or(&disk.backing_path);
        let socket = self.socket_for(disk);
        let args = nbdkit_args(&self.cfg, &self.source, &socket, &snapshot.handle, backing);
        let mut child = Command::new(&self.cfg.nbdkit)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| V2vError::Io {
                op: "spawn nbdkit",
                target: disk.name.clone(),
                source: e,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let pw = format!("{}\n", self.source.vcenter.password);
            stdin.write_all(pw.as_bytes()).await.map_err(|e| V2vError::Io {
                op: "pass credentials to nbdkit",
                target: disk.name.clone(),
                source: e,
            })?;
        }

        let session = Session { child, socket: socket.clone(), snapshot: snapshot.handle.clone() };
        if let Err(e) = self.wait_for_socket(&disk.name, &socket).await {
            self.kill(&disk.name, session).await;
            return Err(e);
        }
        info!(self.log, "transport session started";
            "disk" => &disk.name, "snapshot" => &snapshot.handle, "file" => backing);
        self.sessions.insert(disk.name.clone(), session);
        Ok(())
    }

    async fn stop(&mut self, disk: &VmDisk) -> Result<()> {
        if let Some(session) = self.sessions.remove(&disk.name) {
            self.kill(&disk.name, session).await;
        }
        Ok(())
    }

    async fn stop_all(&mut self) -> Result<()> {
        let sessions = std::mem::take(&mut self.sessions);
        for (disk, session) in sessions {
            self.kill(&disk, session).await;
        }
        Ok(())
    }

    async fn copy_full(&mut self, disk: &VmDisk) -> Result<u64> {
        let target = disk.target()?;
        let session = self.session(disk)?;
        let out = Command::new(&self.cfg.nbdcopy)
            .arg(Self::nbd_uri(&session.socket))
            .arg(target)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| V2vError::Io {
                op: "spawn nbdcopy",
                target: disk.name.clone(),
                source: e,
            })?;
        if !out.status.success() {
            return Err(V2vError::Tool {
                tool: "nbdcopy".to_string(),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        info!(self.log, "full copy done";
            "disk" => &disk.name, "target" => %target.display(), "bytes" => disk.size);
        Ok(disk.size)
    }

    async fn copy_regions(
        &mut self,
        disk: &VmDisk,
        regions: &[ChangedRegion],
    ) -> Result<u64> {
        let target = disk.target()?;
        let session = self.session(disk)?;
        let nbd_err = |op: &'static str, source: NbdError| V2vError::Nbd {
            op,
            target: disk.name.clone(),
            source,
        };
        let io_err = |op: &'static str, source: std::io::Error| V2vError::Io {
            op,
            target: disk.name.clone(),
            source,
        };

        let stream = UnixStream::connect(&session.socket)
            .await
            .map_err(|e| io_err("connect to nbdkit", e))?;
        let mut nbd = NbdClient::connect(stream, "")
            .await
            .map_err(|e| nbd_err("negotiate", e))?;
        let mut out = OpenOptions::new()
            .write(true)
            .open(target)
            .await
            .map_err(|e| io_err("open target", e))?;

        let chunk = u64::from(self.cfg.read_chunk_bytes);
        let mut buf = vec![0u8; self.cfg.read_chunk_bytes as usize];
        for piece in chunked(regions, chunk) {
            let buf = &mut buf[..piece.length as usize];
            nbd.read_at(piece.start, buf)
                .await
                .map_err(|e| nbd_err("read changed region", e))?;
            out.seek(std::io::SeekFrom::Start(piece.start))
                .await
                .map_err(|e| io_err("seek target", e))?;
            out.write_all(buf).await.map_err(|e| io_err("write target", e))?;
        }
        out.sync_data().await.map_err(|e| io_err("sync target", e))?;
        nbd.disconnect().await.map_err(|e| nbd_err("disconnect", e))?;

        let bytes = total_bytes(regions);
        debug!(self.log, "changed regions copied";
            "disk" => &disk.name, "regions" => regions.len(), "bytes" => bytes);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> VddkSource {
        VddkSource {
            vcenter: v2v_config::VCenter {
                server: "vcenter.lab".into(),
                username: "administrator@vsphere.local".into(),
                password: "s3cret".into(),
                thumbprint: "AA:BB".into(),
            },
            vm_moref: "vm-1042".into(),
        }
    }

    #[test]
    fn nbdkit_command_line() {
        let cfg = v2v_config::Transport::default();
        let args = nbdkit_args(
            &cfg,
            &source(),
            Path::new("/tmp/nbdkit-vm-1042-disk0.sock"),
            "snapshot-7",
            "[ds1] web01/web01-000001.vmdk",
        );
        assert!(args.contains(&"vm=moref=vm-1042".to_string()));
        assert!(args.contains(&"snapshot=snapshot-7".to_string()));
        assert!(args.contains(&"file=[ds1] web01/web01-000001.vmdk".to_string()));
        assert!(args.contains(&"password=-".to_string()));
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        let unix = args.iter().position(|a| a == "--unix").unwrap();
        assert_eq!(args[unix + 1], "/tmp/nbdkit-vm-1042-disk0.sock");
    }

    #[test]
    fn regions_split_into_chunks() {
        let regions = [ChangedRegion::new(0, 10), ChangedRegion::new(100, 4)];
        let pieces: Vec<_> = chunked(&regions, 4).collect();
        assert_eq!(
            pieces,
            vec![
                ChangedRegion::new(0, 4),
                ChangedRegion::new(4, 4),
                ChangedRegion::new(8, 2),
                ChangedRegion::new(100, 4),
            ]
        );
    }

    #[test]
    fn socket_names_are_per_disk() {
        let log = Logger::root(slog::Discard, o!());
        let t = NbdkitTransport::new(v2v_config::Transport::default(), source(), &log);
        let disk = VmDisk { name: "Hard disk 1".into(), ..Default::default() };
        assert_eq!(
            t.socket_for(&disk),
            PathBuf::from("/tmp/nbdkit-vm-1042-Hard_disk_1.sock")
        );
    }

    #[tokio::test]
    async fn copy_without_session_is_state_mismatch() {
        let log = Logger::root(slog::Discard, o!());
        let mut t = NbdkitTransport::new(v2v_config::Transport::default(), source(), &log);
        let disk = VmDisk {
            name: "disk0".into(),
            target_path: Some("/dev/vdb".into()),
            ..Default::default()
        };
        let err = t.copy_regions(&disk, &[]).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StateMismatch);
        t.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn missing_nbdkit_leaves_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = v2v_config::Transport {
            nbdkit: dir.path().join("nbdkit"),
            socket_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let log = Logger::root(slog::Discard, o!());
        let mut t = NbdkitTransport::new(cfg, source(), &log);
        let disk = VmDisk {
            name: "disk0".into(),
            backing_path: "[ds1] web01/web01.vmdk".into(),
            target_path: Some(dir.path().join("target")),
            ..Default::default()
        };
        let snap = SnapshotRef { handle: "snapshot-7".into(), name: "migration-snap".into() };

        let err = t.start(&disk, &snap).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(t.sessions.is_empty());
        assert!(!t.socket_for(&disk).exists());
    }

    #[tokio::test]
    async fn socket_wait_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let log = Logger::root(slog::Discard, o!());
        let mut transport =
            NbdkitTransport::new(v2v_config::Transport::default(), source(), &log);
        let cancel = CancellationToken::new();
        transport.set_cancellation(cancel.clone());
        cancel.cancel();

        let err = transport
            .wait_for_socket("disk0", &dir.path().join("never.sock"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn socket_wait_sees_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ready.sock");
        std::fs::write(&socket, b"").unwrap();
        let log = Logger::root(slog::Discard, o!());
        let transport =
            NbdkitTransport::new(v2v_config::Transport::default(), source(), &log);
        transport.wait_for_socket("disk0", &socket).await.unwrap();
    }
}
