//! Lock primitives.
//!
//! - [`FileLock`]: per-absolute-path mutual exclusion with a timeout; a holder
//!   older than the timeout is treated as stale and force-cleared.
//! - [`RepoLock`]: per-repository mutual exclusion keyed by canonical path,
//!   with the same stale-holder clearing.
//! - [`MergeLock`]: one global FIFO queue for the merge pipeline, with owner ids.
//! - [`CreationQueue`]: serializes task creation.
//!
//! All locks are in-memory and reset when the daemon restarts.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock on {key}")]
    Timeout { key: String, timeout: Duration },
    #[error("merge already in progress for {0}")]
    MergeInProgress(String),
    #[error("merge lock was cleared while {0} was waiting")]
    Cleared(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

fn lock_state<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- Keyed locks ---

struct Slot {
    mutex: Arc<Mutex<()>>,
    held_since: Option<Instant>,
    generation: u64,
}

struct KeyedInner {
    slots: StdMutex<HashMap<String, Slot>>,
    timeout: Duration,
    /// Holders older than this are force-cleared. `None` disables stale clearing.
    stale_after: Option<Duration>,
}

/// Async mutexes keyed by string, created on demand.
#[derive(Clone)]
struct KeyedLocks {
    inner: Arc<KeyedInner>,
}

/// Held keyed lock; released on drop.
pub struct KeyedGuard {
    inner: Arc<KeyedInner>,
    key: String,
    generation: u64,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut slots = lock_state(&self.inner.slots);
        if let Some(slot) = slots.get_mut(&self.key) {
            if slot.generation != self.generation {
                return;
            }
            slot.held_since = None;
            // Only the map and this guard reference the mutex: nobody is waiting.
            if Arc::strong_count(&slot.mutex) <= 2 {
                slots.remove(&self.key);
            }
        }
    }
}

impl KeyedLocks {
    fn new(timeout: Duration, stale_after: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(KeyedInner {
                slots: StdMutex::new(HashMap::new()),
                timeout,
                stale_after,
            }),
        }
    }

    fn current(&self, key: &str) -> (Arc<Mutex<()>>, u64) {
        let mut slots = lock_state(&self.inner.slots);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            mutex: Arc::new(Mutex::new(())),
            held_since: None,
            generation: 0,
        });
        (Arc::clone(&slot.mutex), slot.generation)
    }

    async fn acquire(&self, key: &str) -> Result<KeyedGuard> {
        loop {
            let (mutex, generation) = self.current(key);
            match tokio::time::timeout(self.inner.timeout, mutex.lock_owned()).await {
                Ok(guard) => {
                    let mut slots = lock_state(&self.inner.slots);
                    match slots.get_mut(key) {
                        Some(slot) if slot.generation == generation => {
                            slot.held_since = Some(Instant::now());
                            return Ok(KeyedGuard {
                                inner: Arc::clone(&self.inner),
                                key: key.to_string(),
                                generation,
                                _guard: guard,
                            });
                        }
                        // The slot was replaced while we waited; retry on the new one.
                        _ => continue,
                    }
                }
                Err(_) => {
                    let mut slots = lock_state(&self.inner.slots);
                    let Some(slot) = slots.get_mut(key) else {
                        continue;
                    };
                    if slot.generation != generation {
                        continue;
                    }
                    let stale = match (self.inner.stale_after, slot.held_since) {
                        (Some(limit), Some(since)) => since.elapsed() >= limit,
                        _ => false,
                    };
                    if !stale {
                        return Err(LockError::Timeout {
                            key: key.to_string(),
                            timeout: self.inner.timeout,
                        });
                    }
                    warn!(key, held_for = ?slot.held_since.map(|s| s.elapsed()), "force-clearing stale lock");
                    slot.mutex = Arc::new(Mutex::new(()));
                    slot.held_since = None;
                    slot.generation += 1;
                }
            }
        }
    }

    fn is_held(&self, key: &str) -> bool {
        lock_state(&self.inner.slots)
            .get(key)
            .is_some_and(|slot| slot.held_since.is_some())
    }
}

/// Per-absolute-path lock guarding on-disk JSON documents.
#[derive(Clone)]
pub struct FileLock {
    locks: KeyedLocks,
}

impl FileLock {
    /// Holders older than `timeout` are considered stale.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: KeyedLocks::new(timeout, Some(timeout)),
        }
    }

    pub async fn acquire(&self, path: &Path) -> Result<KeyedGuard> {
        let key = absolute(path).to_string_lossy().to_string();
        debug!(path = %key, "acquiring file lock");
        self.locks.acquire(&key).await
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.locks.is_held(&absolute(path).to_string_lossy())
    }
}

/// Per-repository lock. Different repositories never block each other.
#[derive(Clone)]
pub struct RepoLock {
    locks: KeyedLocks,
}

impl RepoLock {
    /// Holders older than `timeout` are considered stale.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: KeyedLocks::new(timeout, Some(timeout)),
        }
    }

    pub async fn acquire(&self, repo: &Path) -> Result<KeyedGuard> {
        let key = canonical(repo).to_string_lossy().to_string();
        debug!(repo = %key, "acquiring repository lock");
        self.locks.acquire(&key).await
    }

    pub fn is_held(&self, repo: &Path) -> bool {
        self.locks.is_held(&canonical(repo).to_string_lossy())
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| absolute(path))
}

// --- Merge lock ---

#[derive(Default)]
struct MergeState {
    holder: Option<(String, u64)>,
    queue: VecDeque<(String, u64)>,
    next_ticket: u64,
}

struct MergeInner {
    state: StdMutex<MergeState>,
    notify: Notify,
}

/// Global FIFO queue: one merge in flight system-wide.
#[derive(Clone)]
pub struct MergeLock {
    inner: Arc<MergeInner>,
}

/// Held merge ownership; released on drop.
pub struct MergeGuard {
    inner: Arc<MergeInner>,
    owner: String,
    ticket: u64,
}

impl MergeGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        let mut state = lock_state(&self.inner.state);
        if state.holder.as_ref().is_some_and(|(_, t)| *t == self.ticket) {
            state.holder = None;
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }
}

/// Removes a queued ticket if the waiting future is dropped.
struct QueuedTicket<'a> {
    inner: &'a MergeInner,
    ticket: u64,
    claimed: bool,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let mut state = lock_state(&self.inner.state);
        state.queue.retain(|(_, t)| *t != self.ticket);
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

impl Default for MergeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MergeInner {
                state: StdMutex::new(MergeState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Wait for merge ownership in FIFO order.
    ///
    /// Fails immediately with [`LockError::MergeInProgress`] if `owner` already
    /// holds or is queued for the lock.
    pub async fn acquire(&self, owner: &str) -> Result<MergeGuard> {
        let ticket = {
            let mut state = lock_state(&self.inner.state);
            let duplicate = state.holder.iter().any(|(o, _)| o == owner)
                || state.queue.iter().any(|(o, _)| o == owner);
            if duplicate {
                return Err(LockError::MergeInProgress(owner.to_string()));
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            if state.holder.is_none() && state.queue.is_empty() {
                state.holder = Some((owner.to_string(), ticket));
                return Ok(self.guard(owner, ticket));
            }
            state.queue.push_back((owner.to_string(), ticket));
            ticket
        };
        debug!(owner, ticket, "queued for merge lock");

        let mut queued = QueuedTicket {
            inner: &self.inner,
            ticket,
            claimed: false,
        };
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock_state(&self.inner.state);
                if !state.queue.iter().any(|(_, t)| *t == ticket) {
                    queued.claimed = true;
                    return Err(LockError::Cleared(owner.to_string()));
                }
                let at_front = state.queue.front().is_some_and(|(_, t)| *t == ticket);
                if state.holder.is_none() && at_front {
                    state.queue.pop_front();
                    state.holder = Some((owner.to_string(), ticket));
                    queued.claimed = true;
                    return Ok(self.guard(owner, ticket));
                }
            }
            notified.await;
        }
    }

    fn guard(&self, owner: &str, ticket: u64) -> MergeGuard {
        MergeGuard {
            inner: Arc::clone(&self.inner),
            owner: owner.to_string(),
            ticket,
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<String> {
        lock_state(&self.inner.state)
            .holder
            .as_ref()
            .map(|(o, _)| o.clone())
    }

    pub fn queue_len(&self) -> usize {
        lock_state(&self.inner.state).queue.len()
    }

    /// Drop the holder and every queued waiter. Returns the owners cleared.
    pub fn force_clear(&self) -> Vec<String> {
        let mut state = lock_state(&self.inner.state);
        let mut cleared: Vec<String> = state.holder.take().into_iter().map(|(o, _)| o).collect();
        cleared.extend(state.queue.drain(..).map(|(o, _)| o));
        drop(state);
        self.inner.notify.notify_waiters();
        warn!(owners = ?cleared, "merge lock force-cleared");
        cleared
    }
}

// --- Creation queue ---

/// FIFO serialization of task creation.
#[derive(Default)]
pub struct CreationQueue {
    mutex: Mutex<()>,
}

impl CreationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn repo_lock_blocks_same_repository() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RepoLock::new(Duration::from_secs(60));
        let held = lock.acquire(dir.path()).await.unwrap();
        assert!(lock.is_held(dir.path()));

        let contender = lock.clone();
        let path = dir.path().to_path_buf();
        let acquired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&acquired);
        let handle = tokio::spawn(async move {
            let _g = contender.acquire(&path).await.unwrap();
            flag.store(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        drop(held);
        handle.await.unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repo_lock_does_not_block_other_repositories() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let lock = RepoLock::new(Duration::from_secs(1));
        let _held = lock.acquire(a.path()).await.unwrap();
        let other = lock.acquire(b.path()).await.unwrap();
        assert!(other.key().ends_with(b.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn repo_lock_clears_holder_that_outlives_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RepoLock::new(Duration::from_secs(5));
        let stale = lock.acquire(dir.path()).await.unwrap();

        let started = Instant::now();
        let fresh = lock.acquire(dir.path()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(lock.is_held(dir.path()));

        drop(stale);
        assert!(lock.is_held(dir.path()));
        drop(fresh);
        assert!(!lock.is_held(dir.path()));
    }

    #[tokio::test(start_paused = true)]
    async fn repo_lock_times_out_behind_a_fresh_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RepoLock::new(Duration::from_secs(5));
        let first = lock.acquire(dir.path()).await.unwrap();

        // Handed over just before the waiter gives up, so the holder is not stale.
        let handover = {
            let lock = lock.clone();
            let path = dir.path().to_path_buf();
            tokio::spawn(async move {
                let guard = lock.acquire(&path).await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let waiter = {
            let lock = lock.clone();
            let path = dir.path().to_path_buf();
            tokio::spawn(async move { lock.acquire(&path).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(first);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(LockError::Timeout { .. })
        ));
        handover.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn file_lock_clears_stale_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let lock = FileLock::new(Duration::from_secs(5));
        let stale = lock.acquire(&path).await.unwrap();

        let fresh = lock.acquire(&path).await.unwrap();
        assert!(lock.is_held(&path));

        // The stale holder finally releasing must not release the fresh one.
        drop(stale);
        assert!(lock.is_held(&path));
        drop(fresh);
        assert!(!lock.is_held(&path));
    }

    #[tokio::test]
    async fn merge_lock_rejects_same_owner() {
        let lock = MergeLock::new();
        let _held = lock.acquire("task-a").await.unwrap();
        assert!(matches!(
            lock.acquire("task-a").await,
            Err(LockError::MergeInProgress(_))
        ));
        assert_eq!(lock.holder().as_deref(), Some("task-a"));
    }

    #[tokio::test]
    async fn merge_lock_is_fifo() {
        let lock = MergeLock::new();
        let first = lock.acquire("a").await.unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for owner in ["b", "c", "d"] {
            let waiter_lock = lock.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let guard = waiter_lock.acquire(owner).await.unwrap();
                order.lock().unwrap().push(guard.owner().to_string());
            }));
            // Let each waiter enqueue before the next.
            while lock.queue_len() < handles.len() {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn merge_lock_force_clear_releases_waiters() {
        let lock = MergeLock::new();
        let held = lock.acquire("a").await.unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("b").await.map(|_| ()) })
        };
        while lock.queue_len() == 0 {
            tokio::task::yield_now().await;
        }

        let cleared = lock.force_clear();
        assert_eq!(cleared, vec!["a", "b"]);
        assert!(matches!(waiter.await.unwrap(), Err(LockError::Cleared(_))));
        assert!(lock.holder().is_none());

        // A fresh merge proceeds, and the old guard's drop leaves it alone.
        let fresh = lock.acquire("c").await.unwrap();
        drop(held);
        assert_eq!(lock.holder().as_deref(), Some("c"));
        drop(fresh);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_queue() {
        let lock = MergeLock::new();
        let held = lock.acquire("a").await.unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("b").await.map(|_| ()) })
        };
        while lock.queue_len() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(lock.queue_len(), 0);
        drop(held);
        assert!(lock.acquire("b").await.is_ok());
    }

    #[tokio::test]
    async fn creation_queue_serializes() {
        let queue = Arc::new(CreationQueue::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let queue = Arc::clone(&queue);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let _turn = queue.enter().await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
