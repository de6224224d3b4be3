// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Explicit vendor dispatch.
//!
//! Drivers are registered by the composing binary at startup rather than by
//! import side effects; [`ProviderRegistry::with_builtin`] is the usual
//! starting point.

use std::collections::BTreeMap;
use std::str::FromStr;

use slog::Logger;

use crate::error::{Result, StorageError};
use crate::{generic, netapp, pure, StorageProvider};

/// Array families with a built-in driver.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Vendor {
    #[strum(to_string = "pure", serialize = "purestorage")]
    Pure,
    #[strum(to_string = "netapp", serialize = "ontap")]
    Netapp,
    Generic,
}

/// Connection details a driver needs. Vendor-specific settings (ONTAP SVM,
/// catalog volume type, ...) travel in `options`.
#[derive(Clone, Debug, Default)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_token: Option<String>,
    /// Skip TLS certificate verification. Off unless explicitly requested.
    pub insecure: bool,
    pub options: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn require_option(&self, key: &str) -> Result<&str> {
        self.option(key).ok_or_else(|| {
            StorageError::Config(format!("missing option {key:?}"))
        })
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.option(key), Some("true" | "yes" | "1"))
    }
}

pub type Constructor =
    fn(ProviderConfig, &Logger) -> Result<Box<dyn StorageProvider>>;

/// Name → driver constructor table.
#[derive(Default)]
pub struct ProviderRegistry {
    ctors: BTreeMap<String, Constructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every driver shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        for vendor in <Vendor as strum::IntoEnumIterator>::iter() {
            reg.register(&vendor.to_string(), builtin_constructor(vendor));
        }
        reg
    }

    /// Adds (or replaces) the constructor for `name`. Names are matched
    /// case-insensitively.
    pub fn register(&mut self, name: &str, ctor: Constructor) {
        self.ctors.insert(name.to_ascii_lowercase(), ctor);
    }

    pub fn vendors(&self) -> impl Iterator<Item = &str> {
        self.ctors.keys().map(String::as_str)
    }

    /// Constructs the driver registered under `name`. Aliases accepted by
    /// [`Vendor`] resolve to their canonical name.
    pub fn create(
        &self,
        name: &str,
        cfg: ProviderConfig,
        log: &Logger,
    ) -> Result<Box<dyn StorageProvider>> {
        let key = match Vendor::from_str(name) {
            Ok(vendor) => vendor.to_string(),
            Err(_) => name.to_ascii_lowercase(),
        };
        let ctor = self
            .ctors
            .get(&key)
            .ok_or_else(|| StorageError::UnknownVendor(name.to_string()))?;
        ctor(cfg, log)
    }
}

fn builtin_constructor(vendor: Vendor) -> Constructor {
    match vendor {
        Vendor::Pure => new_pure,
        Vendor::Netapp => new_netapp,
        Vendor::Generic => new_generic,
    }
}

fn new_pure(cfg: ProviderConfig, log: &Logger) -> Result<Box<dyn StorageProvider>> {
    Ok(Box::new(pure::PureProvider::new(cfg, log)?))
}

fn new_netapp(
    cfg: ProviderConfig,
    log: &Logger,
) -> Result<Box<dyn StorageProvider>> {
    Ok(Box::new(netapp::NetAppProvider::new(cfg, log)?))
}

fn new_generic(
    cfg: ProviderConfig,
    log: &Logger,
) -> Result<Box<dyn StorageProvider>> {
    Ok(Box::new(generic::GenericProvider::new(cfg, log)?))
}

/// Constructs a built-in driver without going through a registry.
pub fn create_provider(
    vendor: Vendor,
    cfg: ProviderConfig,
    log: &Logger,
) -> Result<Box<dyn StorageProvider>> {
    builtin_constructor(vendor)(cfg, log)
}
