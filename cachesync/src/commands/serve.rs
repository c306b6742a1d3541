//! Entrypoint for a cachesync server

use std::str::FromStr;
use std::sync::Arc;

use cachesync_clap_blocks::{object_store::ObjectStoreConfig, sync::SyncConfig};
use cachesync_id::{EntityId, RefresherId};
use cachesync_instruction::Payload;
use cachesync_logging::cli::LoggingConfig;
use cachesync_service::{
    CacheRefresher, CacheRefresherRegistry, CacheSync, CacheSyncArgs, FileWatermarkStore,
    LocalIdentity, RefreshError,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::common::instruction_service;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] cachesync_clap_blocks::object_store::ParseError),

    #[error("Cache sync error: {0}")]
    Sync(#[from] cachesync_service::Error),

    #[error("failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// object store options
    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    /// cache sync options
    #[clap(flatten)]
    sync_config: SyncConfig,

    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// A cache refresher to register, as `<uuid>=<name>`.
    ///
    /// Every instruction addressed to it is logged as it is applied. Can be given more than once
    /// or as a comma separated list.
    #[clap(
        long = "refresher",
        env = "CACHESYNC_REFRESHERS",
        value_delimiter = ',',
        action = clap::ArgAction::Append
    )]
    refreshers: Vec<RefresherSpec>,
}

/// `<uuid>=<name>` given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RefresherSpec {
    id: RefresherId,
    name: String,
}

#[derive(Debug, Error)]
#[error("invalid refresher {0:?}, expected <uuid>=<name>")]
pub(crate) struct InvalidRefresherSpec(String);

impl FromStr for RefresherSpec {
    type Err = InvalidRefresherSpec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRefresherSpec(s.to_string());
        let (id, name) = s.split_once('=').ok_or_else(invalid)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            id: id.parse().map_err(|_| invalid())?,
            name: name.to_string(),
        })
    }
}

/// Stands in for a cache this process does not hold: it logs every operation it is asked to
/// apply.
#[derive(Debug)]
struct LoggingRefresher {
    spec: RefresherSpec,
}

impl CacheRefresher for LoggingRefresher {
    fn refresher_id(&self) -> RefresherId {
        self.spec.id
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn refresh_all(&self) -> Result<(), RefreshError> {
        info!(refresher = %self.spec.name, "refresh all");
        Ok(())
    }

    fn refresh(&self, payload: &Payload) -> Result<(), RefreshError> {
        info!(refresher = %self.spec.name, payload = payload.as_str(), "refresh by payload");
        Ok(())
    }

    fn refresh_by_ids(&self, ids: &[EntityId]) -> Result<(), RefreshError> {
        info!(refresher = %self.spec.name, ?ids, "refresh by ids");
        Ok(())
    }

    fn remove_by_ids(&self, ids: &[EntityId]) -> Result<(), RefreshError> {
        info!(refresher = %self.spec.name, ?ids, "remove by ids");
        Ok(())
    }
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let Config {
        object_store_config,
        sync_config,
        logging_config: _,
        refreshers,
    } = config;

    let service = instruction_service(&object_store_config, sync_config.instruction_config())?;

    let registry = Arc::new(CacheRefresherRegistry::new());
    for spec in refreshers {
        let id = spec.id;
        if let Some(replaced) = registry.register(Arc::new(LoggingRefresher { spec })) {
            warn!(refresher_id = %id, replaced = replaced.name(), "refresher registered twice");
        }
    }
    if registry.is_empty() {
        warn!("no refresher registered, every instruction will be skipped");
    }

    let identity = LocalIdentity::new(&sync_config.server_name);
    info!(
        %identity,
        role = %sync_config.role,
        refreshers = registry.len(),
        prefix = %object_store_config.instruction_log_prefix,
        "starting cache sync"
    );

    let sync = Arc::new(CacheSync::new(CacheSyncArgs {
        service,
        registry,
        role_provider: Arc::new(sync_config.role),
        watermark_store: Arc::new(FileWatermarkStore::new(sync_config.watermark_file.clone())),
        identity,
        config: sync_config.sync_config(),
    }));

    let boot = sync.boot().await?;
    info!(
        cold_boot_required = boot.cold_boot_required(),
        max_id = %boot.max_id(),
        last_id = %boot.last_id(),
        "cache sync initialized"
    );

    let shutdown = CancellationToken::new();
    let background = sync.spawn_background(sync_config.sync_interval, shutdown.clone());

    let signal = wait_for_signal().await;
    shutdown.cancel();
    if sync.release(sync_config.release_timeout).await {
        if let Err(error) = background.await {
            warn!(%error, "cache sync background task failed");
        }
    } else {
        warn!("shutting down with a cache sync cycle still running");
        background.abort();
    }
    signal
}

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).map_err(Error::Signal)?;
    let mut int = signal(SignalKind::interrupt()).map_err(Error::Signal)?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
    info!("Received SIGINT");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    const CONTENT: &str = "1f0c6a54-5e2b-4a59-8a5e-3c1d8f7b9a10";

    #[test]
    fn parse_refresher_spec() {
        let spec: RefresherSpec = format!("{CONTENT}= content ").parse().unwrap();
        assert_eq!(spec.id, CONTENT.parse().unwrap());
        assert_eq!(spec.name, "content");

        assert!("content".parse::<RefresherSpec>().is_err());
        assert!(format!("{CONTENT}=").parse::<RefresherSpec>().is_err());
        assert!("not-a-uuid=content".parse::<RefresherSpec>().is_err());
    }

    #[test]
    fn refreshers_accept_lists_and_repeats() {
        let other = "0b7e0c5a-61a4-4c39-9d0d-1a6f7d7f1d22";
        let config = Config::try_parse_from([
            "serve",
            "--object-store",
            "memory",
            "--refresher",
            &format!("{CONTENT}=content,{other}=menus"),
            "--refresher",
            &format!("{other}=footer"),
        ])
        .unwrap();
        let names: Vec<_> = config.refreshers.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["content", "menus", "footer"]);
    }
}
