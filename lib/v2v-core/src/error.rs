// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use array_provider::poll::PollError;
use array_provider::StorageError;
use thiserror::Error;

pub use array_provider::ErrorKind;

/// Errors from the NBD wire protocol.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("bad magic {found:#x}, expected {expected:#x}")]
    BadMagic { expected: u64, found: u64 },

    #[error("server does not speak fixed newstyle negotiation")]
    NotFixedNewstyle,

    #[error("option {option} refused: {reply_type:#x} {message}")]
    OptionRefused { option: u32, reply_type: u32, message: String },

    #[error("server never announced the export size")]
    MissingExportInfo,

    #[error("reply handle {found} does not match request {expected}")]
    HandleMismatch { expected: u64, found: u64 },

    #[error("request at {offset} failed with errno {errno}")]
    Request { offset: u64, errno: u32 },

    #[error("request [{offset}, +{len}) lies beyond export size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the migration data-plane.
#[derive(Debug, Error)]
pub enum V2vError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{op} {target}: {source}")]
    Nbd {
        op: &'static str,
        target: String,
        #[source]
        source: NbdError,
    },

    #[error("{op} {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{host}: `{command}` exited with {status}: {stderr}")]
    RemoteCommand { host: String, command: String, status: i32, stderr: String },

    #[error("{host}: cannot reach host: {detail}")]
    HostUnreachable { host: String, detail: String },

    #[error("{op} {target}: cannot parse output: {detail}")]
    Parse { op: &'static str, target: String, detail: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{op} {target}: timed out after {attempts} attempts")]
    Timeout { op: &'static str, target: String, attempts: u32 },

    #[error("{op} {target}: cancelled")]
    Cancelled { op: &'static str, target: String },

    #[error("state mismatch: {0}")]
    StateMismatch(String),

    #[error("clone of {target}: process ended but target missing")]
    CloneFailed { target: String },

    #[error("{tool} exited with {status}: {stderr}")]
    Tool { tool: String, status: String, stderr: String },

    /// A step after the array volume was created and imported failed; the
    /// volume still exists under `catalog_id`.
    #[error("volume {volume} (catalog id {catalog_id}) left behind: {source}")]
    Stranded {
        volume: String,
        catalog_id: String,
        #[source]
        source: Box<V2vError>,
    },
}

impl V2vError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            V2vError::Storage(e) => e.kind(),
            V2vError::Nbd { source: NbdError::Io(_), .. } => ErrorKind::Io,
            V2vError::Nbd { .. } | V2vError::Parse { .. } => ErrorKind::Protocol,
            V2vError::Io { .. } | V2vError::Tool { .. } => ErrorKind::Io,
            V2vError::HostUnreachable { .. } => ErrorKind::Connectivity,
            V2vError::RemoteCommand { .. } => ErrorKind::Protocol,
            V2vError::NotFound { .. } => ErrorKind::NotFound,
            V2vError::Timeout { .. } => ErrorKind::Timeout,
            V2vError::Cancelled { .. } => ErrorKind::Cancelled,
            V2vError::StateMismatch(_) | V2vError::CloneFailed { .. } => {
                ErrorKind::StateMismatch
            }
            V2vError::Stranded { source, .. } => source.kind(),
        }
    }

    /// Converts the outcome of a bounded poll, naming the wait for the error
    /// message.
    pub(crate) fn from_poll(
        err: PollError<V2vError>,
        op: &'static str,
        target: &str,
    ) -> Self {
        match err {
            PollError::Failed(e) => e,
            PollError::Timeout { attempts } => {
                V2vError::Timeout { op, target: target.to_string(), attempts }
            }
            PollError::Cancelled => {
                V2vError::Cancelled { op, target: target.to_string() }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, V2vError>;
