// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use array_provider::cinder::CinderClient;
use array_provider::naa::normalize_naa;
use array_provider::{ProviderConfig, ProviderRegistry, StorageProvider};
use clap::{Parser, Subcommand};
use slog::{info, o, Drain, Logger};
use tokio::net::UnixStream;
use v2v_core::esxi::{EsxiHost, HostConnector, SshHostConnector};
use v2v_core::nbd::NbdClient;
use v2v_core::HostRef;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Diagnostics for the VM disk migration data-plane
struct Opt {
    /// Migration helper config file
    #[clap(short, long, default_value = "/etc/v2v/config.toml", action)]
    config: PathBuf,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the array drivers this build knows about
    Vendors,

    /// Print the canonical form of a SCSI identifier
    Naa {
        #[clap(action)]
        raw: String,
    },

    /// Log in to a configured array and count its volumes
    CheckArray {
        /// Name of the `[array.<name>]` table
        #[clap(action)]
        array: String,
    },

    /// Find the array volume behind a catalog volume
    Resolve {
        #[clap(action)]
        array: String,

        #[clap(action)]
        catalog_id: String,
    },

    /// Show the storage initiators of a hypervisor host
    HostInitiators {
        /// Management address of the host
        #[clap(action)]
        host: String,
    },

    /// Print the catalog backend host that imports are sent to
    BackendHost,

    /// Negotiate with an NBD server on a unix socket and print the export
    NbdCheck {
        #[clap(action)]
        socket: PathBuf,

        #[clap(long, default_value = "", action)]
        export: String,
    },
}

fn build_logger(level: slog::Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("v2v-util", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered = slog::LevelFilter::new(main_drain, level);
    Logger::root(filtered.fuse(), o!())
}

/// Driver settings for one `[array.<name>]` table. Catalog-driven arrays
/// fall back to the catalog's endpoint and token.
fn provider_config(
    cfg: &v2v_config::Config,
    name: &str,
) -> anyhow::Result<(String, ProviderConfig)> {
    let array = cfg.array(name)?;
    let mut pc = ProviderConfig {
        endpoint: array.endpoint.clone(),
        username: array.username.clone(),
        password: array.password.clone(),
        api_token: array.api_token.clone(),
        insecure: array.insecure,
        options: array.string_options(),
    };
    if pc.api_token.is_none() && array.vendor.eq_ignore_ascii_case("generic") {
        pc.api_token = cfg.catalog.as_ref().map(|c| c.token.clone());
    }
    if let Some(vt) = cfg.catalog.as_ref().and_then(|c| c.volume_type.clone()) {
        pc.options.entry("volume_type".to_string()).or_insert(vt);
    }
    Ok((array.vendor.clone(), pc))
}

fn load_config(path: &Path) -> anyhow::Result<v2v_config::Config> {
    v2v_config::parse(path)
        .with_context(|| format!("failed to load {}", path.display()))
}

async fn open_array(
    cfg: &v2v_config::Config,
    name: &str,
    log: &Logger,
) -> anyhow::Result<Box<dyn StorageProvider>> {
    let (vendor, pc) = provider_config(cfg, name)?;
    let mut provider = ProviderRegistry::with_builtin()
        .create(&vendor, pc, log)
        .with_context(|| format!("array {name}"))?;
    provider.connect().await.with_context(|| format!("connect to {name}"))?;
    Ok(provider)
}

async fn check_array(
    cfg: &v2v_config::Config,
    name: &str,
    log: &Logger,
) -> anyhow::Result<()> {
    let mut provider = open_array(cfg, name, log).await?;
    let res = provider.get_all_volume_naas().await;
    provider.disconnect().await?;
    let naas = res?;
    println!("{name} ({}): {} volumes", provider.who_am_i(), naas.len());
    Ok(())
}

async fn resolve(
    cfg: &v2v_config::Config,
    name: &str,
    catalog_id: &str,
    log: &Logger,
) -> anyhow::Result<()> {
    let mut provider = open_array(cfg, name, log).await?;
    let res = provider.resolve_cinder_volume_to_lun(catalog_id).await;
    provider.disconnect().await?;
    println!("{}", serde_json::to_string_pretty(&res?)?);
    Ok(())
}

async fn host_initiators(
    cfg: &v2v_config::Config,
    host: &str,
    log: &Logger,
) -> anyhow::Result<()> {
    let connector = SshHostConnector::new(&cfg.esxi, log);
    let host_ref =
        HostRef { name: host.to_string(), management_ip: host.to_string() };
    let runner = connector.open(&host_ref).await?;
    let esxi = EsxiHost::new(Arc::clone(&runner), log);
    for id in esxi.initiator_ids().await? {
        println!("{id}");
    }
    Ok(())
}

async fn backend_host(
    cfg: &v2v_config::Config,
    log: &Logger,
) -> anyhow::Result<()> {
    let catalog = cfg
        .catalog
        .as_ref()
        .ok_or_else(|| anyhow!("no [catalog] section in config"))?;
    if let Some(host) = &catalog.backend_host {
        println!("{host} (configured)");
        return Ok(());
    }
    let client = CinderClient::new(
        &catalog.endpoint,
        &catalog.token,
        catalog.insecure,
        log,
    )?;
    let host =
        client.discover_backend_host(catalog.backend_name.as_deref()).await?;
    println!("{host}");
    Ok(())
}

async fn nbd_check(socket: &Path, export: &str, log: &Logger) -> anyhow::Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect to {}", socket.display()))?;
    let nbd = NbdClient::connect(stream, export).await?;
    info!(log, "negotiated"; "socket" => %socket.display());
    println!("size={} flags={:#06x}", nbd.size(), nbd.flags());
    nbd.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = build_logger(opt.log_level);

    match opt.cmd {
        Command::Vendors => {
            for vendor in ProviderRegistry::with_builtin().vendors() {
                println!("{vendor}");
            }
        }
        Command::Naa { raw } => println!("{}", normalize_naa(&raw)?),
        Command::CheckArray { array } => {
            check_array(&load_config(&opt.config)?, &array, &log).await?
        }
        Command::Resolve { array, catalog_id } => {
            resolve(&load_config(&opt.config)?, &array, &catalog_id, &log)
                .await?
        }
        Command::HostInitiators { host } => {
            host_initiators(&load_config(&opt.config)?, &host, &log).await?
        }
        Command::BackendHost => {
            backend_host(&load_config(&opt.config)?, &log).await?
        }
        Command::NbdCheck { socket, export } => {
            nbd_check(&socket, &export, &log).await?
        }
    }

    Ok(())
}
