// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Coarse classification of a failure, recoverable from any error produced
/// by the migration data-plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Session or authentication failure talking to an array, catalog or
    /// hypervisor host.
    Connectivity,
    /// A named volume, group, host or device does not exist.
    NotFound,
    /// An expected object never became visible within the retry ceiling.
    Timeout,
    /// The system is not in a state the operation can act on.
    StateMismatch,
    /// The caller asked for the operation to stop.
    Cancelled,
    /// The remote side answered with something we could not understand.
    Protocol,
    /// Local I/O failure.
    Io,
}

/// Errors returned by storage providers and the catalog client.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} {target}: connection failed: {detail}")]
    Connectivity { op: &'static str, target: String, detail: String },

    #[error("{op} {target}: not authenticated")]
    NotConnected { op: &'static str, target: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{op} {target}: HTTP {status}: {body}")]
    Api { op: &'static str, target: String, status: u16, body: String },

    #[error("{op} {target}: cannot decode response: {detail}")]
    Decode { op: &'static str, target: String, detail: String },

    #[error("{op} {target}: timed out after {attempts} attempts")]
    Timeout { op: &'static str, target: String, attempts: u32 },

    #[error("{op} {target}: cancelled")]
    Cancelled { op: &'static str, target: String },

    #[error("state mismatch: {0}")]
    StateMismatch(String),

    #[error("invalid NAA identifier {naa:?}: {reason}")]
    InvalidNaa { naa: String, reason: &'static str },

    #[error("unknown storage vendor {0:?}")]
    UnknownVendor(String),

    #[error("invalid provider configuration: {0}")]
    Config(String),

    #[error("size of {0} bytes cannot be rounded up to whole GiB")]
    SizeOverflow(u64),

    #[error("{op} is not supported by the {driver} driver: {detail}")]
    Unsupported { op: &'static str, driver: &'static str, detail: String },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Connectivity { .. }
            | StorageError::NotConnected { .. } => ErrorKind::Connectivity,
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::Api { status: 404, .. } => ErrorKind::NotFound,
            StorageError::Api { status: 401 | 403, .. } => {
                ErrorKind::Connectivity
            }
            StorageError::Api { .. }
            | StorageError::Decode { .. }
            | StorageError::InvalidNaa { .. } => ErrorKind::Protocol,
            StorageError::Timeout { .. } => ErrorKind::Timeout,
            StorageError::Cancelled { .. } => ErrorKind::Cancelled,
            StorageError::StateMismatch(_)
            | StorageError::UnknownVendor(_)
            | StorageError::Config(_)
            | StorageError::SizeOverflow(_)
            | StorageError::Unsupported { .. } => ErrorKind::StateMismatch,
        }
    }

    /// True if this is an API error with the given status whose body
    /// mentions `needle` (case-insensitively).
    pub fn api_says(&self, status: u16, needle: &str) -> bool {
        match self {
            StorageError::Api { status: s, body, .. } if *s == status => {
                body.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            StorageError::Api { status: 401, .. }
                | StorageError::NotConnected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
