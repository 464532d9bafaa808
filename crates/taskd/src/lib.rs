//! taskd - agent task orchestration daemon
//!
//! Library components for the daemon process: the task store and its
//! persistence, the agent process manager, the workspace and merge pipeline,
//! and the HTTP control plane.

pub mod git;
pub mod locks;
pub mod persist;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tail;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use task_core::{Config, MergeResolution};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use locks::{FileLock, MergeLock, RepoLock};
use persist::Persister;
use registry::ProcessRegistry;
use resolver::{ConflictResolver, ResolverConfig};
use runner::{PipelineManager, RunnerConfig};
use server::AppState;
use storage::{LoadSource, SnapshotStore, StorageError, TaskStorage};
use store::{StoreConfig, StoreError, StoreParts, TaskCache, TaskStore};
use sync::{SyncConfig, SyncService};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Engine settings (data dir, agent command, timeouts, sync policy).
    pub engine: Config,
    /// HTTP server port.
    pub port: u16,
    /// Bearer token for the HTTP API.
    pub auth_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine: Config::default(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("TASKD_AUTH_TOKEN").ok(),
        }
    }
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    store: TaskStore,
    snapshots: SnapshotStore,
    cancel: CancellationToken,
}

impl Daemon {
    /// Load persisted state, recover from the previous run and wire components.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let engine = &config.engine;
        let data_dir = engine.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;

        let file_lock = FileLock::new(Duration::from_secs(engine.lock_timeout_sec));
        let snapshots = SnapshotStore::new(&data_dir, engine.snapshot_limit, file_lock.clone());
        let storage = TaskStorage::new(&data_dir, file_lock.clone(), snapshots.clone());
        let loaded = storage.load().await?;
        info!(count = loaded.tasks.len(), source = ?loaded.source, "loaded tasks");

        let cache = Arc::new(TaskCache::new(loaded.tasks));
        let persister = Persister::new(
            storage,
            Arc::clone(&cache) as Arc<dyn persist::TaskSource>,
            Duration::from_millis(engine.debounce_ms),
        );
        if matches!(loaded.source, LoadSource::Backup | LoadSource::Snapshot(_)) {
            warn!(source = ?loaded.source, "tasks.json was unusable; rewriting it from recovered state");
            persister.save_now().await?;
        }

        let pipelines = PipelineManager::new(
            RunnerConfig::from_config(engine),
            ProcessRegistry::new(&data_dir, file_lock),
        );
        let store = TaskStore::new(StoreParts {
            config: StoreConfig::from_config(engine),
            cache,
            persister,
            pipelines,
            resolver: ConflictResolver::new(ResolverConfig::from_config(engine)),
            repo_lock: RepoLock::new(Duration::from_secs(engine.lock_timeout_sec)),
            merge_lock: MergeLock::new(),
        });

        remove_staging_refs(&store).await;
        store.adopt_running().await?;

        Ok(Self {
            config,
            store,
            snapshots,
            cancel: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            store: self.store.clone(),
            auth_token: self.config.auth_token.clone(),
            default_resolution: if self.config.engine.auto_resolve {
                MergeResolution::Auto
            } else {
                MergeResolution::Manual
            },
        })
    }

    pub fn router(&self) -> Router {
        server::create_router(self.app_state())
    }

    /// Request an orderly shutdown of [`Daemon::run`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until shutdown, then write a final snapshot and flush tasks.
    ///
    /// Running agents are left alive; the next start adopts them.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(
            port = self.config.port,
            data_dir = %self.config.engine.data_dir.display(),
            auth = self.config.auth_token.is_some(),
            "taskd starting"
        );

        let persist_cancel = CancellationToken::new();
        let persist_handle = tokio::spawn(
            Arc::clone(self.store.persister()).run(persist_cancel.clone()),
        );

        let sync = SyncService::new(
            self.store.clone(),
            self.snapshots.clone(),
            SyncConfig::from_config(&self.config.engine),
        );
        let sync_handle = tokio::spawn(sync.run(self.cancel.clone()));

        let served = server::start_server(self.app_state(), self.config.port, self.cancel.clone()).await;
        if let Err(e) = &served {
            error!(error = %e, "HTTP server error");
        }

        // Whatever ended the server, wind everything down.
        self.cancel.cancel();
        if let Err(e) = sync_handle.await {
            error!(error = %e, "sync task panicked");
        }
        persist_cancel.cancel();
        if let Err(e) = persist_handle.await {
            error!(error = %e, "persistence task panicked");
        }
        info!(running_agents = self.store.pipelines().running_count(), "taskd stopped");
        served.map_err(DaemonError::from)
    }
}

/// Delete merge staging refs an interrupted merge may have left in any known repository.
async fn remove_staging_refs(store: &TaskStore) {
    let repos: BTreeSet<PathBuf> = store
        .list()
        .into_iter()
        .map(|t| PathBuf::from(t.repo_path))
        .filter(|p| p.is_dir())
        .collect();
    for repo in repos {
        let repo_display = repo.display().to_string();
        match tokio::task::spawn_blocking(move || git::remove_staging_refs(&repo)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => info!(repo = %repo_display, removed, "removed stale merge staging refs"),
            Ok(Err(e)) => warn!(repo = %repo_display, error = %e, "failed to clean merge staging refs"),
            Err(e) => warn!(repo = %repo_display, error = %e, "staging ref cleanup panicked"),
        }
    }
}
