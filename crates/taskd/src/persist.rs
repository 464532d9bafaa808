//! Debounced persistence of the in-memory task list.
//!
//! Routine changes call [`Persister::mark_dirty`]; a background worker writes
//! once changes have been quiet for the debounce delay (or the maximum delay
//! has passed). Operations that must be durable before they return call
//! [`Persister::save_now`]. A merge wraps itself in a [`CriticalSection`]:
//! while any is open, save triggers are absorbed, and closing the last one
//! performs an explicit save.
//!
//! Saves never overlap, and a change that lands while a save is running is
//! picked up by a later save.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use task_core::Task;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::storage::{Result, TaskStorage};

/// Upper bound on how long a burst of changes can postpone a save, as a
/// multiple of the debounce delay.
const MAX_DELAY_FACTOR: u32 = 5;

/// Supplies the tasks to persist.
pub trait TaskSource: Send + Sync + 'static {
    fn tasks(&self) -> Vec<Task>;
}

/// Save scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    /// Nothing unsaved.
    Idle,
    /// Unsaved changes; the worker is waiting out the debounce delay.
    Pending,
    /// The worker is writing; `dirty` records changes made meanwhile.
    Saving { dirty: bool },
    /// Merges in progress; triggers only set `pending`.
    Critical { depth: usize, pending: bool },
}

pub struct Persister {
    storage: TaskStorage,
    source: Arc<dyn TaskSource>,
    delay: Duration,
    state: Mutex<SaveState>,
    changed: Notify,
    save_lock: tokio::sync::Mutex<()>,
}

impl Persister {
    pub fn new(storage: TaskStorage, source: Arc<dyn TaskSource>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            storage,
            source,
            delay,
            state: Mutex::new(SaveState::Idle),
            changed: Notify::new(),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SaveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SaveState {
        *self.lock_state()
    }

    pub fn storage(&self) -> &TaskStorage {
        &self.storage
    }

    /// Schedule a debounced save.
    pub fn mark_dirty(&self) {
        let mut state = self.lock_state();
        *state = match *state {
            SaveState::Idle | SaveState::Pending => SaveState::Pending,
            SaveState::Saving { .. } => SaveState::Saving { dirty: true },
            SaveState::Critical { depth, .. } => SaveState::Critical {
                depth,
                pending: true,
            },
        };
        drop(state);
        self.changed.notify_one();
    }

    /// Open a critical window; automatic saves wait until it closes.
    pub fn enter_critical(self: &Arc<Self>) -> CriticalSection {
        let mut state = self.lock_state();
        *state = match *state {
            SaveState::Idle => SaveState::Critical {
                depth: 1,
                pending: false,
            },
            SaveState::Pending => SaveState::Critical {
                depth: 1,
                pending: true,
            },
            SaveState::Saving { dirty } => SaveState::Critical {
                depth: 1,
                pending: dirty,
            },
            SaveState::Critical { depth, pending } => SaveState::Critical {
                depth: depth + 1,
                pending,
            },
        };
        CriticalSection {
            persister: Arc::clone(self),
            closed: false,
        }
    }

    /// Leave a critical window. Returns whether this was the last one.
    fn leave_critical(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            SaveState::Critical { depth, pending } if depth > 1 => {
                *state = SaveState::Critical {
                    depth: depth - 1,
                    pending,
                };
                false
            }
            SaveState::Critical { .. } => {
                *state = SaveState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Save immediately, waiting for any save in flight first.
    ///
    /// Changes marked while the write runs leave a debounced save pending.
    /// Inside a critical window the window's own bookkeeping is left alone.
    pub async fn save_now(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        {
            let mut state = self.lock_state();
            if matches!(*state, SaveState::Idle | SaveState::Pending) {
                *state = SaveState::Saving { dirty: false };
            }
        }
        self.write().await
    }

    /// Perform a pending debounced save, if the state allows one.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        {
            let mut state = self.lock_state();
            if *state != SaveState::Pending {
                return Ok(());
            }
            *state = SaveState::Saving { dirty: false };
        }
        self.write().await
    }

    /// Write the current tasks. Must hold `save_lock`.
    async fn write(&self) -> Result<()> {
        let tasks = self.source.tasks();
        let result = self.storage.save_all(&tasks).await;

        let retry = {
            let mut state = self.lock_state();
            if let SaveState::Saving { dirty } = *state {
                *state = if dirty || result.is_err() {
                    SaveState::Pending
                } else {
                    SaveState::Idle
                };
            }
            *state == SaveState::Pending
        };
        if retry {
            self.changed.notify_one();
        }
        result?;
        debug!(count = tasks.len(), "persisted tasks");
        Ok(())
    }

    /// Run the debounce loop until `cancel` fires, then flush.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let max_delay = self.delay * MAX_DELAY_FACTOR;
        loop {
            tokio::select! {
                () = self.changed.notified() => {}
                () = cancel.cancelled() => break,
            }

            let first_change = Instant::now();
            let mut cancelled = false;
            loop {
                let until_max = max_delay.saturating_sub(first_change.elapsed());
                if until_max.is_zero() {
                    break;
                }
                tokio::select! {
                    () = self.changed.notified() => continue,
                    () = tokio::time::sleep(self.delay.min(until_max)) => break,
                    () = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                }
            }

            if let Err(e) = self.flush().await {
                error!(error = %e, "debounced save failed");
                // Back off before the retry the failed flush scheduled.
                tokio::select! {
                    () = tokio::time::sleep(self.delay) => {}
                    () = cancel.cancelled() => cancelled = true,
                }
            }
            if cancelled {
                break;
            }
        }

        if let Err(e) = self.flush().await {
            error!(error = %e, "final save failed");
        }
    }
}

/// An open critical window. Close it with [`CriticalSection::finish`].
///
/// Dropping it unfinished closes the window and schedules a debounced save.
pub struct CriticalSection {
    persister: Arc<Persister>,
    closed: bool,
}

impl CriticalSection {
    /// Close the window; the last window to close saves explicitly.
    pub async fn finish(mut self) -> Result<()> {
        self.closed = true;
        if self.persister.leave_critical() {
            self.persister.save_now().await
        } else {
            Ok(())
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if !self.closed && self.persister.leave_critical() {
            self.persister.mark_dirty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::FileLock;
    use crate::storage::SnapshotStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingSource {
        reads: AtomicUsize,
    }

    impl TaskSource for CountingSource {
        fn tasks(&self) -> Vec<Task> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    fn persister(dir: &TempDir, delay: Duration) -> (Arc<Persister>, Arc<CountingSource>) {
        let lock = FileLock::new(Duration::from_secs(5));
        let snapshots = SnapshotStore::new(dir.path(), 3, lock.clone());
        let storage = TaskStorage::new(dir.path(), lock, snapshots);
        let source = Arc::new(CountingSource::default());
        (Persister::new(storage, source.clone(), delay), source)
    }

    fn reads(source: &CountingSource) -> usize {
        source.reads.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn burst_of_changes_coalesces_into_one_save() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(persister.clone().run(cancel.clone()));

        for _ in 0..10 {
            persister.mark_dirty();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(persister.state(), SaveState::Pending);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(reads(&source), 1);
        assert_eq!(persister.state(), SaveState::Idle);
        assert!(dir.path().join("tasks.json").exists());

        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(reads(&source), 1);
    }

    #[tokio::test]
    async fn save_now_bypasses_debounce() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_secs(60));
        persister.mark_dirty();
        persister.save_now().await.unwrap();
        assert_eq!(reads(&source), 1);
        assert!(dir.path().join("tasks.json").exists());
        assert_eq!(persister.state(), SaveState::Idle);
    }

    /// Marks the persister dirty the first time its tasks are read.
    #[derive(Default)]
    struct ChangingSource {
        persister: std::sync::OnceLock<std::sync::Weak<Persister>>,
        reads: AtomicUsize,
    }

    impl TaskSource for ChangingSource {
        fn tasks(&self) -> Vec<Task> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(persister) = self.persister.get().and_then(std::sync::Weak::upgrade) {
                    persister.mark_dirty();
                }
            }
            Vec::new()
        }
    }

    #[tokio::test]
    async fn change_during_save_now_is_saved_later() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(Duration::from_secs(5));
        let snapshots = SnapshotStore::new(dir.path(), 3, lock.clone());
        let storage = TaskStorage::new(dir.path(), lock, snapshots);
        let source = Arc::new(ChangingSource::default());
        let persister = Persister::new(storage, source.clone(), Duration::from_millis(100));
        source.persister.set(Arc::downgrade(&persister)).unwrap();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(persister.clone().run(cancel.clone()));

        persister.mark_dirty();
        persister.save_now().await.unwrap();
        assert_eq!(persister.state(), SaveState::Pending);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
        assert_eq!(persister.state(), SaveState::Idle);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn save_now_inside_critical_window_keeps_window() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_secs(60));
        let section = persister.enter_critical();
        persister.mark_dirty();
        persister.save_now().await.unwrap();
        assert_eq!(reads(&source), 1);
        assert_eq!(
            persister.state(),
            SaveState::Critical {
                depth: 1,
                pending: true
            }
        );
        section.finish().await.unwrap();
        assert_eq!(persister.state(), SaveState::Idle);
    }

    #[tokio::test]
    async fn flush_is_a_noop_when_idle() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_secs(60));
        persister.flush().await.unwrap();
        assert_eq!(reads(&source), 0);

        persister.mark_dirty();
        persister.flush().await.unwrap();
        persister.flush().await.unwrap();
        assert_eq!(reads(&source), 1);
    }

    #[tokio::test]
    async fn critical_window_absorbs_triggers_then_saves() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(persister.clone().run(cancel.clone()));

        let section = persister.enter_critical();
        persister.mark_dirty();
        persister.mark_dirty();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reads(&source), 0);
        assert_eq!(
            persister.state(),
            SaveState::Critical {
                depth: 1,
                pending: true
            }
        );

        section.finish().await.unwrap();
        assert_eq!(reads(&source), 1);
        assert_eq!(persister.state(), SaveState::Idle);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn nested_critical_windows_save_once_at_the_end() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_secs(60));
        let outer = persister.enter_critical();
        let inner = persister.enter_critical();
        inner.finish().await.unwrap();
        assert_eq!(reads(&source), 0);
        outer.finish().await.unwrap();
        assert_eq!(reads(&source), 1);
    }

    #[tokio::test]
    async fn dropped_critical_window_schedules_save() {
        let dir = TempDir::new().unwrap();
        let (persister, _source) = persister(&dir, Duration::from_secs(60));
        drop(persister.enter_critical());
        assert_eq!(persister.state(), SaveState::Pending);
    }

    #[tokio::test]
    async fn cancellation_flushes_pending_changes() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(persister.clone().run(cancel.clone()));

        persister.mark_dirty();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(reads(&source), 1);
        assert_eq!(persister.state(), SaveState::Idle);
    }

    #[tokio::test]
    async fn concurrent_saves_are_serialized() {
        let dir = TempDir::new().unwrap();
        let (persister, source) = persister(&dir, Duration::from_secs(60));
        let a = persister.clone();
        let b = persister.clone();
        let (ra, rb) = tokio::join!(a.save_now(), b.save_now());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(reads(&source), 2);
    }
}
