use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use spaces_integrations::ids::{DBUS_NAME_SYNC, DBUS_OBJECT_PATH_SYNC};
use tokio_util::sync::CancellationToken;
use zbus::connection::Builder as ConnectionBuilder;
use zbus::object_server::SignalEmitter;

use crate::dbus_api::SyncDbusService;
use crate::sync::backoff::RetryPolicy;
use crate::sync::engine::{EngineChannels, EngineSettings, EntryView, SyncEngine};
use crate::sync::index::IndexStore;
use crate::sync::local_watcher::{RenameSupport, WatchConfig, start_notify_watcher};
use crate::sync::paths::TreeRoots;
use crate::sync::queue::WorkReason;
use crate::sync::transfer::{DEFAULT_CHUNK_BYTES, TransferConfig, sweep_tmp_files};

const DEFAULT_ARCHIVES_DIR_NAME: &str = "Archives";
const DEFAULT_MIRROR_DIR_NAME: &str = "Spaces";
const DEFAULT_SETTLE_MS: u64 = 300;
const DEFAULT_STUCK_SECS: u64 = 900;
const DEFAULT_RESCAN_SECS: u64 = 60;
const STATUS_POLL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub archives_root: PathBuf,
    pub mirror_root: PathBuf,
    pub db_path: Option<PathBuf>,
    pub settle: Duration,
    pub chunk_bytes: usize,
    pub stuck_after: Duration,
    pub rescan_interval: Duration,
    pub rename_support: RenameSupport,
    pub enable_dbus: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let archives_root = std::env::var("SPACES_ARCHIVES_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_ARCHIVES_DIR_NAME));
        let mirror_root = std::env::var("SPACES_MIRROR_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_MIRROR_DIR_NAME));
        let db_path = std::env::var("SPACES_DB_PATH")
            .ok()
            .map(|value| expand_with_home(&value, &home));
        let settle = Duration::from_millis(read_u64_env("SPACES_SETTLE_MS", DEFAULT_SETTLE_MS));
        let chunk_bytes = usize::try_from(read_u64_env(
            "SPACES_CHUNK_BYTES",
            DEFAULT_CHUNK_BYTES as u64,
        ))
        .unwrap_or(DEFAULT_CHUNK_BYTES);
        let stuck_after = Duration::from_secs(read_u64_env("SPACES_STUCK_SECS", DEFAULT_STUCK_SECS));
        let rescan_interval =
            Duration::from_secs(read_u64_env("SPACES_RESCAN_SECS", DEFAULT_RESCAN_SECS));
        let rename_support = match std::env::var("SPACES_RENAME_MODE") {
            Ok(value) => RenameSupport::parse(&value)
                .with_context(|| format!("unknown SPACES_RENAME_MODE: {value}"))?,
            Err(_) => RenameSupport::default(),
        };
        let enable_dbus = read_bool_env("SPACES_ENABLE_DBUS", true);

        Ok(Self {
            archives_root,
            mirror_root,
            db_path,
            settle,
            chunk_bytes,
            stuck_after,
            rescan_interval,
            rename_support,
            enable_dbus,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            transfer: TransferConfig {
                chunk_bytes: self.chunk_bytes,
            },
            retry: RetryPolicy::default(),
            stuck_after: self.stuck_after,
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            settle: self.settle,
            rename_support: self.rename_support,
            ..WatchConfig::default()
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    roots: TreeRoots,
    engine: SyncEngine,
    channels: EngineChannels,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let roots = prepare_roots(&config).await?;
        let index = open_index(config.db_path.as_deref()).await?;
        let cleared = index
            .clear_transient()
            .await
            .context("failed to clear in-flight bookkeeping")?;
        if cleared > 0 {
            tracing::info!(entries = cleared, "cleared interrupted operations");
        }
        let swept = sweep_trees(&roots).await?;
        if swept > 0 {
            tracing::info!(files = swept, "removed leftover temp files");
        }

        let (engine, channels) = SyncEngine::new(index, roots.clone(), config.engine_settings());
        Ok(Self {
            config,
            roots,
            engine,
            channels,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            roots,
            engine,
            channels,
        } = self;
        tracing::info!(
            archives = %roots.source.display(),
            mirror = %roots.mirror.display(),
            rename_support = ?config.rename_support,
            dbus = config.enable_dbus,
            "spacesd started"
        );

        let shutdown = CancellationToken::new();

        // Attach before scanning so nothing changed during the scan is lost.
        let (watcher, batches) = match start_notify_watcher(&roots, config.watch_config()) {
            Ok((watcher, batches)) => (Some(watcher), Some(batches)),
            Err(err) => {
                tracing::warn!(error = %err, "failed to start watcher; relying on rescans");
                (None, None)
            }
        };

        let scanned = engine
            .full_scan(WorkReason::Rescan)
            .await
            .context("initial scan failed")?;
        tracing::info!(paths = scanned, "initial scan queued");

        let EngineChannels { worker, triggers } = channels;
        let reconciler_engine = engine.clone();
        let reconciler_shutdown = shutdown.clone();
        let reconciler_handle = tokio::spawn(async move {
            reconciler_engine
                .run_reconciler(triggers, batches, reconciler_shutdown)
                .await;
        });
        let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

        let rescan_engine = engine.clone();
        let rescan_shutdown = shutdown.clone();
        let rescan_interval = config.rescan_interval;
        let rescan_handle = tokio::spawn(async move {
            rescan_engine
                .run_rescans(rescan_interval, rescan_shutdown)
                .await;
        });

        let signal_handle = if config.enable_dbus {
            let connection = ConnectionBuilder::session()?
                .name(DBUS_NAME_SYNC)?
                .serve_at(DBUS_OBJECT_PATH_SYNC, SyncDbusService::new(engine.clone()))?
                .build()
                .await
                .context("failed to start D-Bus object server")?;
            let emitter = SignalEmitter::new(&connection, DBUS_OBJECT_PATH_SYNC)
                .context("failed to create D-Bus signal emitter")?
                .into_owned();
            let signal_engine = engine.clone();
            let signal_shutdown = shutdown.clone();
            Some((
                connection,
                tokio::spawn(async move {
                    publish_status_changes(signal_engine, emitter, signal_shutdown).await;
                }),
            ))
        } else {
            None
        };

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutting down");
        shutdown.cancel();

        let _ = reconciler_handle.await;
        let _ = worker_handle.await;
        let _ = rescan_handle.await;
        if let Some((_connection, handle)) = signal_handle {
            let _ = handle.await;
        }
        drop(watcher);
        Ok(())
    }
}

/// Removes leftover temp files from both trees without starting the daemon.
pub async fn sweep_only(config: &DaemonConfig) -> anyhow::Result<usize> {
    let roots = prepare_roots(config).await?;
    sweep_trees(&roots).await
}

async fn publish_status_changes(
    engine: SyncEngine,
    emitter: SignalEmitter<'static>,
    shutdown: CancellationToken,
) {
    let mut known: HashMap<String, String> = HashMap::new();
    let mut ticker = tokio::time::interval(STATUS_POLL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let views = match engine.list_entries(None).await {
            Ok(views) => views,
            Err(err) => {
                tracing::debug!(error = %err, "status poll failed");
                continue;
            }
        };
        for (path, status) in status_changes(&mut known, &views) {
            if let Err(err) = SyncDbusService::status_changed(&emitter, &path, &status).await {
                tracing::debug!(path = %path, error = %err, "failed to emit StatusChanged");
            }
        }
    }
}

async fn prepare_roots(config: &DaemonConfig) -> anyhow::Result<TreeRoots> {
    let archives = canonical_dir(&config.archives_root).await?;
    let mirror = canonical_dir(&config.mirror_root).await?;
    if archives.starts_with(&mirror) || mirror.starts_with(&archives) {
        anyhow::bail!(
            "archives and mirror trees must not nest: {} / {}",
            archives.display(),
            mirror.display()
        );
    }
    Ok(TreeRoots::new(archives, mirror))
}

async fn canonical_dir(path: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create {:?}", path))?;
    tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("failed to resolve {:?}", path))
}

async fn open_index(db_path: Option<&Path>) -> anyhow::Result<IndexStore> {
    let index = match db_path {
        Some(path) => IndexStore::open(path).await,
        None => IndexStore::new_default().await,
    };
    index.context("failed to initialize index store")
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
