// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a migration helper config which may be parsed from a TOML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the migration data-plane.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub replication: Replication,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub vcenter: Option<VCenter>,

    #[serde(default)]
    pub esxi: Esxi,

    #[serde(default)]
    pub polling: Polling,

    #[serde(default)]
    pub catalog: Option<Catalog>,

    #[serde(default, rename = "array")]
    pub arrays: BTreeMap<String, Array>,
}

impl Config {
    /// Looks up the array table named `name`.
    pub fn array(&self, name: &str) -> Result<&Array, ParseError> {
        self.arrays.get(name).ok_or_else(|| {
            ParseError::KeyNotFound(name.to_string(), "array".to_string())
        })
    }

    /// Finds the array table serving the catalog backend `backend`, if any.
    pub fn array_for_backend(&self, backend: &str) -> Option<(&str, &Array)> {
        self.arrays
            .iter()
            .find(|(_, a)| a.backend.as_deref() == Some(backend))
            .map(|(name, a)| (name.as_str(), a))
    }
}

/// Tunables for the changed-block-tracking replication loop.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Replication {
    /// Upper bound on incremental passes after the initial full copy.
    pub max_iterations: u32,

    /// Name given to the rotating migration snapshot.
    pub snapshot_name: String,
}

impl Default for Replication {
    fn default() -> Self {
        Self { max_iterations: 20, snapshot_name: "migration-snap".to_string() }
    }
}

/// Locations of the NBD tooling used to stream disk content.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Transport {
    pub nbdkit: PathBuf,
    pub nbdcopy: PathBuf,
    pub vddk_libdir: PathBuf,
    pub socket_dir: PathBuf,

    /// Largest single NBD read issued while copying changed regions.
    pub read_chunk_bytes: u32,

    /// Seconds to wait for the nbdkit socket to appear.
    pub startup_timeout_secs: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            nbdkit: PathBuf::from("/usr/sbin/nbdkit"),
            nbdcopy: PathBuf::from("/usr/bin/nbdcopy"),
            vddk_libdir: PathBuf::from("/opt/vmware-vix-disklib-distrib"),
            socket_dir: PathBuf::from("/tmp"),
            read_chunk_bytes: 4 * 1024 * 1024,
            startup_timeout_secs: 30,
        }
    }
}

impl Transport {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Connection facts handed to the VDDK plugin.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct VCenter {
    pub server: String,
    pub username: String,
    pub password: String,
    pub thumbprint: String,
}

/// SSH access to hypervisor hosts.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Esxi {
    pub username: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for Esxi {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            port: 22,
            identity_file: None,
            password: None,
            connect_timeout_secs: 30,
        }
    }
}

/// Bounded wait parameters. Every wait is `attempts` polls spaced by the
/// matching interval.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Polling {
    pub device_attempts: u32,
    pub device_interval_secs: u64,
    pub volume_attempts: u32,
    pub volume_interval_secs: u64,
    pub power_off_attempts: u32,
    pub power_off_interval_secs: u64,
    pub clone_interval_secs: u64,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            device_attempts: 5,
            device_interval_secs: 5,
            volume_attempts: 60,
            volume_interval_secs: 5,
            power_off_attempts: 60,
            power_off_interval_secs: 5,
            clone_interval_secs: 10,
        }
    }
}

impl Polling {
    pub fn device_interval(&self) -> Duration {
        Duration::from_secs(self.device_interval_secs)
    }

    pub fn volume_interval(&self) -> Duration {
        Duration::from_secs(self.volume_interval_secs)
    }

    pub fn power_off_interval(&self) -> Duration {
        Duration::from_secs(self.power_off_interval_secs)
    }

    pub fn clone_interval(&self) -> Duration {
        Duration::from_secs(self.clone_interval_secs)
    }
}

/// The block-storage catalog that array volumes are imported into.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Catalog {
    pub endpoint: String,
    pub token: String,

    /// Fully-qualified `<host>@<backend>#<pool>` string. When absent it is
    /// discovered from the pool listing using `backend_name`.
    #[serde(default)]
    pub backend_host: Option<String>,

    #[serde(default)]
    pub backend_name: Option<String>,

    #[serde(default)]
    pub volume_type: Option<String>,

    #[serde(default)]
    pub insecure: bool,
}

/// A storage array reachable from the migration helper.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Array {
    pub vendor: String,
    pub endpoint: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Catalog backend name whose volumes live on this array.
    #[serde(default)]
    pub backend: Option<String>,

    #[serde(flatten, default)]
    pub options: BTreeMap<String, toml::Value>,
}

impl Array {
    /// Flattens vendor options into plain strings.
    pub fn string_options(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key {0} not found in {1}")]
    KeyNotFound(String, String),

    #[error("Invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

/// Parses TOML text into a configuration object and checks the values that
/// serde alone cannot.
pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ParseError> {
    let attempts = [
        ("device_attempts", cfg.polling.device_attempts),
        ("volume_attempts", cfg.polling.volume_attempts),
        ("power_off_attempts", cfg.polling.power_off_attempts),
    ];
    for (key, value) in attempts {
        if value == 0 {
            return Err(ParseError::Invalid(
                format!("polling.{key}"),
                "must be at least 1".to_string(),
            ));
        }
    }
    if cfg.transport.read_chunk_bytes == 0 {
        return Err(ParseError::Invalid(
            "transport.read_chunk_bytes".to_string(),
            "must be nonzero".to_string(),
        ));
    }
    for (name, array) in cfg.arrays.iter() {
        if array.endpoint.is_empty() {
            return Err(ParseError::Invalid(
                format!("array.{name}.endpoint"),
                "must not be empty".to_string(),
            ));
        }
    }
    Ok(())
}
