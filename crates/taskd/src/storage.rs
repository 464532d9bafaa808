//! JSON document storage.
//!
//! - `tasks.json`: every task record, rewritten wholesale. The previous
//!   version is copied to `tasks.json.bak` before each write.
//! - `snapshots/snapshot-NNNNNN.json`: numbered, checksummed recovery points.
//!
//! Writes go to a temp file that is renamed into place, under the file lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use task_core::{ProcessRegistration, Task};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::locks::{FileLock, LockError};

/// Version of the on-disk document formats.
pub const SCHEMA_VERSION: u32 = 1;

const TASKS_FILE: &str = "tasks.json";
const TASKS_BACKUP_FILE: &str = "tasks.json.bak";
const SNAPSHOT_PREFIX: &str = "snapshot-";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("corrupt document {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("unsupported schema version {found} in {path}")]
    SchemaVersion { path: String, found: u32 },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Write `bytes` to `path` via a temp file and rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    let mut file = tokio::fs::File::create(&temp_path).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    match tokio::fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(e)
        }
    }
}

/// Read and parse a JSON document. A missing file is `Ok(None)`.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

#[derive(Debug, Serialize, Deserialize)]
struct TasksDocument {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    tasks: Vec<Task>,
}

/// Where a task load was satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    Snapshot(u64),
    Empty,
}

#[derive(Debug)]
pub struct LoadedTasks {
    pub tasks: Vec<Task>,
    pub source: LoadSource,
}

/// Persistent task records.
#[derive(Clone)]
pub struct TaskStorage {
    path: PathBuf,
    backup_path: PathBuf,
    file_lock: FileLock,
    snapshots: SnapshotStore,
}

impl TaskStorage {
    pub fn new(data_dir: &Path, file_lock: FileLock, snapshots: SnapshotStore) -> Self {
        Self {
            path: data_dir.join(TASKS_FILE),
            backup_path: data_dir.join(TASKS_BACKUP_FILE),
            file_lock,
            snapshots,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite `tasks.json` with `tasks`, keeping the previous version as backup.
    pub async fn save_all(&self, tasks: &[Task]) -> Result<()> {
        let document = TasksDocument {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            tasks: tasks.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let _guard = self.file_lock.acquire(&self.path).await?;
        if tokio::fs::try_exists(&self.path).await? {
            tokio::fs::copy(&self.path, &self.backup_path).await?;
        }
        write_atomic(&self.path, &bytes).await?;
        debug!(count = tasks.len(), path = %self.path.display(), "saved tasks");
        Ok(())
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Vec<Task>>> {
        let Some(document) = read_json::<TasksDocument>(path).await? else {
            return Ok(None);
        };
        if document.schema_version > SCHEMA_VERSION {
            return Err(StorageError::SchemaVersion {
                path: path.display().to_string(),
                found: document.schema_version,
            });
        }
        Ok(Some(document.tasks))
    }

    /// Records currently in `tasks.json`, without fallback.
    pub async fn load_primary(&self) -> Result<Vec<Task>> {
        let _guard = self.file_lock.acquire(&self.path).await?;
        Ok(self.read_document(&self.path).await?.unwrap_or_default())
    }

    /// Load tasks, falling back to the backup and then the newest valid snapshot.
    pub async fn load(&self) -> Result<LoadedTasks> {
        let guard = self.file_lock.acquire(&self.path).await?;
        let primary = self.read_document(&self.path).await;
        match primary {
            Ok(Some(tasks)) => {
                return Ok(LoadedTasks {
                    tasks,
                    source: LoadSource::Primary,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "tasks.json unreadable, trying backup"),
        }

        match self.read_document(&self.backup_path).await {
            Ok(Some(tasks)) => {
                info!(count = tasks.len(), "restored tasks from backup");
                return Ok(LoadedTasks {
                    tasks,
                    source: LoadSource::Backup,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "tasks.json.bak unreadable, trying snapshots"),
        }
        drop(guard);

        if let Some(snapshot) = self.snapshots.latest_valid().await? {
            info!(
                sequence = snapshot.payload.sequence,
                count = snapshot.payload.tasks.len(),
                "restored tasks from snapshot"
            );
            return Ok(LoadedTasks {
                source: LoadSource::Snapshot(snapshot.payload.sequence),
                tasks: snapshot.payload.tasks,
            });
        }

        Ok(LoadedTasks {
            tasks: Vec::new(),
            source: LoadSource::Empty,
        })
    }
}

// --- Snapshots ---

/// Snapshot contents covered by the checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub schema_version: u32,
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub processes: Vec<ProcessRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Hex SHA-256 of the serialized payload.
    pub checksum: String,
    pub payload: SnapshotPayload,
}

impl StateSnapshot {
    pub fn new(payload: SnapshotPayload) -> Result<Self> {
        let checksum = checksum(&payload)?;
        Ok(Self { checksum, payload })
    }

    pub fn verify(&self) -> Result<bool> {
        Ok(checksum(&self.payload)? == self.checksum)
    }
}

fn checksum(payload: &SnapshotPayload) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Numbered snapshot files with a bounded count.
#[derive(Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    limit: usize,
    file_lock: FileLock,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path, limit: usize, file_lock: FileLock) -> Self {
        Self {
            dir: data_dir.join("snapshots"),
            limit: limit.max(1),
            file_lock,
        }
    }

    fn snapshot_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_PREFIX}{sequence:06}.json"))
    }

    /// Existing snapshots, oldest first.
    pub async fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let sequence = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                found.push((sequence, entry.path()));
            }
        }
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found)
    }

    /// Write a new snapshot and prune the oldest beyond the limit.
    pub async fn write(
        &self,
        tasks: Vec<Task>,
        processes: Vec<ProcessRegistration>,
    ) -> Result<StateSnapshot> {
        let _guard = self.file_lock.acquire(&self.dir).await?;
        let existing = self.list().await?;
        let sequence = existing.last().map_or(1, |(seq, _)| seq + 1);
        let snapshot = StateSnapshot::new(SnapshotPayload {
            schema_version: SCHEMA_VERSION,
            sequence,
            taken_at: Utc::now(),
            tasks,
            processes,
        })?;
        let path = self.snapshot_path(sequence);
        write_atomic(&path, &serde_json::to_vec_pretty(&snapshot)?).await?;

        let total = existing.len() + 1;
        if total > self.limit {
            for (seq, old) in existing.iter().take(total - self.limit) {
                if let Err(e) = tokio::fs::remove_file(old).await {
                    warn!(sequence = seq, error = %e, "failed to prune snapshot");
                }
            }
        }
        debug!(sequence, path = %path.display(), "wrote snapshot");
        Ok(snapshot)
    }

    pub async fn read(&self, path: &Path) -> Result<Option<StateSnapshot>> {
        read_json(path).await
    }

    /// Newest snapshot whose checksum verifies.
    pub async fn latest_valid(&self) -> Result<Option<StateSnapshot>> {
        for (sequence, path) in self.list().await?.into_iter().rev() {
            match self.read(&path).await {
                Ok(Some(snapshot)) => match snapshot.verify() {
                    Ok(true) => return Ok(Some(snapshot)),
                    _ => warn!(sequence, "snapshot checksum mismatch, skipping"),
                },
                Ok(None) => {}
                Err(e) => warn!(sequence, error = %e, "unreadable snapshot, skipping"),
            }
        }
        Ok(None)
    }
}
