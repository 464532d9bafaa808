//! Periodic state sync: snapshots, cache/disk reconciliation, orphan reaping
//! and cleanup of workspaces left by merged tasks.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use task_core::{Config, ConflictPolicy, Id, Task};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::persist::SaveState;
use crate::registry::RegistryError;
use crate::storage::{SnapshotStore, StateSnapshot, StorageError};
use crate::store::TaskStore;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub policy: ConflictPolicy,
}

impl SyncConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.sync_interval_sec.max(1)),
            policy: config.conflict_policy,
        }
    }
}

/// Outcome of comparing the cache with the on-disk task list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Disk copies to install in memory.
    pub from_disk: Vec<Task>,
    /// Whether disk disagrees with memory after `from_disk` is applied.
    pub disk_stale: bool,
}

/// Decide, per task, whether the memory or disk copy survives.
///
/// Memory-only tasks are always kept. Tasks in `running` always keep their
/// memory copy. `newest_wins` compares `updated_at` and keeps memory on a tie.
pub fn reconcile(
    memory: &[Task],
    disk: &[Task],
    policy: ConflictPolicy,
    running: &HashSet<Id>,
) -> Reconciliation {
    let in_memory: HashMap<&Id, &Task> = memory.iter().map(|t| (&t.id, t)).collect();
    let on_disk: HashSet<&Id> = disk.iter().map(|t| &t.id).collect();
    let mut out = Reconciliation::default();

    if in_memory.keys().any(|id| !on_disk.contains(*id)) {
        out.disk_stale = true;
    }

    for disk_task in disk {
        let take_disk = match in_memory.get(&disk_task.id) {
            Some(mem_task) if *mem_task == disk_task => continue,
            _ if running.contains(&disk_task.id) => false,
            Some(mem_task) => match policy {
                ConflictPolicy::MemoryWins => false,
                ConflictPolicy::DiskWins => true,
                ConflictPolicy::NewestWins => disk_task.updated_at > mem_task.updated_at,
            },
            None => policy != ConflictPolicy::MemoryWins,
        };
        if take_disk {
            out.from_disk.push(disk_task.clone());
        } else {
            out.disk_stale = true;
        }
    }
    out
}

/// Result of one sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub snapshot: Option<u64>,
    pub installed: usize,
    pub reaped: usize,
    /// Leftover workspaces of merged tasks removed.
    pub cleaned: usize,
}

pub struct SyncService {
    store: TaskStore,
    snapshots: SnapshotStore,
    config: SyncConfig,
}

impl SyncService {
    pub fn new(store: TaskStore, snapshots: SnapshotStore, config: SyncConfig) -> Self {
        Self {
            store,
            snapshots,
            config,
        }
    }

    /// Write a snapshot of the current tasks and registered processes.
    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        let processes = self.store.pipelines().registry().list().await?;
        let snapshot = self.snapshots.write(self.store.list(), processes).await?;
        Ok(snapshot)
    }

    /// Reconcile the cache with `tasks.json`.
    ///
    /// Skipped while a save is outstanding, since disk is known to lag.
    /// Tasks that change while the file is read keep their memory copy.
    pub async fn reconcile_with_disk(&self) -> Result<usize> {
        let persister = self.store.persister();
        let loaded_at = Utc::now();
        if persister.state() != SaveState::Idle {
            debug!(state = ?persister.state(), "save outstanding; skipping reconcile");
            return Ok(0);
        }

        let disk = persister.storage().load_primary().await?;
        if persister.state() != SaveState::Idle {
            debug!(state = ?persister.state(), "tasks changed during load; skipping reconcile");
            return Ok(0);
        }
        let memory = self.store.list();
        let running: HashSet<Id> = memory
            .iter()
            .filter(|t| self.store.pipelines().is_running(&t.id))
            .map(|t| t.id.clone())
            .collect();

        let plan = reconcile(&memory, &disk, self.config.policy, &running);
        let offered = plan.from_disk.len();
        let installed = self.store.apply_reconciled(plan.from_disk, loaded_at);
        if plan.disk_stale || installed < offered {
            persister.mark_dirty();
        }
        if installed > 0 {
            info!(installed, policy = self.config.policy.as_str(), "reconciled tasks from disk");
        }
        Ok(installed)
    }

    /// One full pass: snapshot, reconcile, reap orphaned agents and remove
    /// workspaces merged tasks left behind.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let snapshot = self.snapshot().await?;
        let installed = self.reconcile_with_disk().await?;
        let known = self.store.cache().ids();
        let reaped = self
            .store
            .pipelines()
            .registry()
            .reap_orphans(&known)
            .await?;
        for orphan in &reaped {
            warn!(task_id = %orphan.task_id, pid = orphan.pid, "reaped orphaned agent registration");
        }
        let cleaned = self.store.clean_merged_workspaces().await;
        Ok(SyncReport {
            snapshot: Some(snapshot.payload.sequence),
            installed,
            reaped: reaped.len(),
            cleaned,
        })
    }

    /// Sync on an interval until cancelled, then take a final snapshot.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) => debug!(?report, "sync pass complete"),
                        Err(e) => error!(error = %e, "sync pass failed"),
                    }
                }
            }
        }

        match self.snapshot().await {
            Ok(snapshot) => info!(sequence = snapshot.payload.sequence, "final snapshot written"),
            Err(e) => error!(error = %e, "failed to write final snapshot"),
        }
    }
}
