//! Persistent registry of live agent processes (`processes.json`).
//!
//! One registration per task. A registration is written right after the
//! wrapper process spawns and removed once its phase has been settled, so
//! after a daemon restart every entry is either a still-running agent to
//! adopt or a finished one whose exit file holds its status.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use task_core::{Id, ProcessRegistration};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::locks::{FileLock, LockError};
use crate::storage::{self, StorageError};

const REGISTRY_FILE: &str = "processes.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    processes: Vec<ProcessRegistration>,
}

/// Whether `pid` names a live process we could signal.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `signal` to the process group led by `pid`. A vanished group is not an error.
pub fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(());
    };
    if raw <= 1 {
        return Ok(());
    }
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[derive(Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
    file_lock: FileLock,
}

impl ProcessRegistry {
    pub fn new(data_dir: &Path, file_lock: FileLock) -> Self {
        Self {
            path: data_dir.join(REGISTRY_FILE),
            file_lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<RegistryDocument> {
        match storage::read_json::<RegistryDocument>(&self.path).await {
            Ok(doc) => Ok(doc.unwrap_or_default()),
            Err(StorageError::Corrupt { path, reason }) => {
                warn!(%path, %reason, "process registry unreadable, starting empty");
                Ok(RegistryDocument::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, doc: &RegistryDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        storage::write_atomic(&self.path, &bytes).await?;
        Ok(())
    }

    /// Record a spawned process, replacing any earlier entry for the task.
    pub async fn register(&self, registration: ProcessRegistration) -> Result<()> {
        let _guard = self.file_lock.acquire(&self.path).await?;
        let mut doc = self.read().await?;
        doc.processes.retain(|p| p.task_id != registration.task_id);
        debug!(
            task_id = %registration.task_id,
            pid = registration.pid,
            phase = %registration.phase,
            "registered process"
        );
        doc.processes.push(registration);
        self.write(&doc).await
    }

    pub async fn unregister(&self, task_id: &Id) -> Result<Option<ProcessRegistration>> {
        let _guard = self.file_lock.acquire(&self.path).await?;
        let mut doc = self.read().await?;
        let Some(pos) = doc.processes.iter().position(|p| &p.task_id == task_id) else {
            return Ok(None);
        };
        let removed = doc.processes.remove(pos);
        self.write(&doc).await?;
        debug!(%task_id, pid = removed.pid, "unregistered process");
        Ok(Some(removed))
    }

    pub async fn find(&self, task_id: &Id) -> Result<Option<ProcessRegistration>> {
        let _guard = self.file_lock.acquire(&self.path).await?;
        Ok(self
            .read()
            .await?
            .processes
            .into_iter()
            .find(|p| &p.task_id == task_id))
    }

    pub async fn list(&self) -> Result<Vec<ProcessRegistration>> {
        let _guard = self.file_lock.acquire(&self.path).await?;
        Ok(self.read().await?.processes)
    }

    /// Terminate and drop registrations whose task is not in `known`.
    ///
    /// Returns the reaped registrations.
    pub async fn reap_orphans(&self, known: &HashSet<Id>) -> Result<Vec<ProcessRegistration>> {
        let _guard = self.file_lock.acquire(&self.path).await?;
        let mut doc = self.read().await?;
        let (orphans, kept): (Vec<_>, Vec<_>) = doc
            .processes
            .into_iter()
            .partition(|p| !known.contains(&p.task_id));
        doc.processes = kept;
        if orphans.is_empty() {
            return Ok(orphans);
        }

        for orphan in &orphans {
            if is_process_running(orphan.pid) && !Path::new(&orphan.exit_code_path).exists() {
                info!(task_id = %orphan.task_id, pid = orphan.pid, "terminating orphaned agent");
                if let Err(e) = signal_group(orphan.pid, Signal::SIGTERM) {
                    warn!(pid = orphan.pid, error = %e, "failed to signal orphaned agent");
                }
            }
        }
        self.write(&doc).await?;
        Ok(orphans)
    }
}
