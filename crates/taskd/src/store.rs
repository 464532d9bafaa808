//! Task store: the authoritative in-memory task set and every task operation.
//!
//! Mutations go through the cache, request a save from the [`Persister`] and
//! publish a [`TaskEvent`]. Phase pipelines report back over their own
//! channel; one consumer task per pipeline applies those events here.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use task_core::prompt::{change_request_prompt, slugify};
use task_core::{
    Config, CycleOutcome, Id, MergeResolution, OutputEntry, OutputKind, Phase, PhaseEvent,
    Preview, PromptCycle, Task, TaskEvent, TaskMode, TaskState, TaskStatus, TransitionError,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::git::{self, GitError};
use crate::locks::{CreationQueue, LockError, MergeLock, RepoLock};
use crate::persist::{Persister, TaskSource};
use crate::registry::RegistryError;
use crate::resolver::{ConflictResolver, ResolveRequest, ResolverError};
use crate::runner::{PipelineManager, PipelineSpec, RunnerError};
use crate::storage::StorageError;

const EVENT_BUFFER: usize = 1024;

/// Longest first-line summary used as a default commit message.
const COMMIT_SUMMARY_MAX: usize = 72;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(Id),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("cannot {action} task {id} while it is {status}")]
    InvalidState {
        id: Id,
        status: TaskStatus,
        action: &'static str,
    },
    #[error("task {0} has a running agent")]
    Busy(Id),
    #[error("task {0} has no commit")]
    NoCommit(Id),
    #[error("task {0} has an active preview")]
    PreviewActive(Id),
    #[error("task {0} has no active preview")]
    NoPreview(Id),
    #[error("merge already in progress for task {0}")]
    MergeInProgress(Id),
    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),
    #[error("background task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Run a blocking git operation off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> git::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
        .map_err(StoreError::from)
}

// --- Cache ---

/// The in-memory task set.
#[derive(Debug, Default)]
pub struct TaskCache {
    tasks: RwLock<HashMap<Id, Task>>,
    /// Ids removed this run; reconciliation never brings them back.
    removed: std::sync::Mutex<HashSet<Id>>,
}

impl TaskCache {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
            removed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn removed(&self) -> std::sync::MutexGuard<'_, HashSet<Id>> {
        self.removed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Id, Task>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Id, Task>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &Id) -> Option<Task> {
        self.read().get(id).cloned()
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn ids(&self) -> HashSet<Id> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn insert(&self, task: Task) -> Option<Task> {
        let mut tasks = self.write();
        self.removed().remove(&task.id);
        tasks.insert(task.id.clone(), task)
    }

    pub fn remove(&self, id: &Id) -> Option<Task> {
        let mut tasks = self.write();
        let removed = tasks.remove(id);
        if removed.is_some() {
            self.removed().insert(id.clone());
        }
        removed
    }

    /// Apply `f` to the task, returning its result or `None` when absent.
    pub fn update<R>(&self, id: &Id, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.write().get_mut(id).map(f)
    }
}

impl TaskSource for TaskCache {
    fn tasks(&self) -> Vec<Task> {
        self.list()
    }
}

// --- Store ---

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub branch_prefix: String,
    pub output_tail_lines: usize,
    /// Merge target; defaults to each task's base branch.
    pub merge_target_branch: Option<String>,
}

impl StoreConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            branch_prefix: config.branch_prefix.clone(),
            output_tail_lines: config.output_tail_lines,
            merge_target_branch: config.merge_target_branch.clone(),
        }
    }
}

/// Components the store is built from.
pub struct StoreParts {
    pub config: StoreConfig,
    pub cache: Arc<TaskCache>,
    pub persister: Arc<Persister>,
    pub pipelines: PipelineManager,
    pub resolver: ConflictResolver,
    pub repo_lock: RepoLock,
    pub merge_lock: MergeLock,
}

/// Parameters for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub prompt: String,
    pub repo_path: PathBuf,
    pub mode: TaskMode,
    pub image_path: Option<PathBuf>,
}

/// Which kind of pipeline a consumer is applying.
#[derive(Debug, Clone, Copy)]
enum PipelineKind {
    /// The task's own phases; drives its status.
    Phases,
    /// A follow-up prompt on a stable task; recorded as cycle `cycle`.
    FollowUp { cycle: usize },
}

#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    cache: Arc<TaskCache>,
    persister: Arc<Persister>,
    pipelines: PipelineManager,
    resolver: ConflictResolver,
    repo_lock: RepoLock,
    merge_lock: MergeLock,
    creation: CreationQueue,
    events: broadcast::Sender<TaskEvent>,
}

fn commit_summary(prompt: &str) -> String {
    let first = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("Task changes");
    let first = first.trim();
    if first.chars().count() <= COMMIT_SUMMARY_MAX {
        first.to_string()
    } else {
        let cut: String = first.chars().take(COMMIT_SUMMARY_MAX - 3).collect();
        format!("{cut}...")
    }
}

fn lifecycle_entry(phase: Phase, text: impl Into<String>) -> OutputEntry {
    OutputEntry {
        at: Utc::now(),
        phase,
        kind: OutputKind::Lifecycle,
        text: text.into(),
        historical: false,
    }
}

impl TaskStore {
    pub fn new(parts: StoreParts) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(StoreInner {
                config: parts.config,
                cache: parts.cache,
                persister: parts.persister,
                pipelines: parts.pipelines,
                resolver: parts.resolver,
                repo_lock: parts.repo_lock,
                merge_lock: parts.merge_lock,
                creation: CreationQueue::new(),
                events,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<TaskCache> {
        &self.inner.cache
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.inner.persister
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.inner.pipelines
    }

    pub fn merge_lock(&self) -> &MergeLock {
        &self.inner.merge_lock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn list(&self) -> Vec<Task> {
        self.inner.cache.list()
    }

    pub fn get(&self, id: &Id) -> Result<Task> {
        self.inner
            .cache
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub(crate) fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn publish_task(&self, task: &Task) {
        self.publish(TaskEvent::TaskUpdated {
            task_id: task.id.clone(),
            task: Box::new(task.clone()),
        });
    }

    /// Mutate a task, then schedule a save and publish the result.
    fn update<F>(&self, id: &Id, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let task = self
            .inner
            .cache
            .update(id, |task| {
                f(task)?;
                task.updated_at = Utc::now();
                Ok::<Task, StoreError>(task.clone())
            })
            .ok_or_else(|| StoreError::NotFound(id.clone()))??;
        self.inner.persister.mark_dirty();
        self.publish_task(&task);
        Ok(task)
    }

    async fn save_now_logged(&self) {
        if let Err(e) = self.inner.persister.save_now().await {
            error!(error = %e, "failed to save tasks; will retry");
            self.inner.persister.mark_dirty();
        }
    }

    fn require_status(task: &Task, allowed: &[TaskStatus], action: &'static str) -> Result<()> {
        if allowed.contains(&task.status()) {
            Ok(())
        } else {
            Err(StoreError::InvalidState {
                id: task.id.clone(),
                status: task.status(),
                action,
            })
        }
    }

    fn require_idle(&self, task: &Task) -> Result<()> {
        if self.inner.pipelines.is_running(&task.id) {
            Err(StoreError::Busy(task.id.clone()))
        } else {
            Ok(())
        }
    }

    // --- Creation ---

    /// Create a task with its own workspace. The task starts in `starting`.
    pub async fn create(&self, request: NewTask) -> Result<Task> {
        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(StoreError::Validation("prompt must not be empty".to_string()));
        }
        let image_path = match request.image_path {
            Some(path) => {
                git::check_path(&path)?;
                if !path.is_file() {
                    return Err(StoreError::Validation(format!(
                        "image not found: {}",
                        path.display()
                    )));
                }
                Some(path.display().to_string())
            }
            None => None,
        };
        let repo_arg = request.repo_path.clone();
        let repo = blocking(move || git::validate_repo(&repo_arg)).await?;

        let _queue = self.inner.creation.enter().await;
        let repo_for_base = repo.clone();
        let base = blocking(move || git::current_base(&repo_for_base)).await?;
        let task = self
            .create_in_workspace(Id::new(), prompt.clone(), &slugify(&prompt), &repo, &base, request.mode)
            .await
            .map(|mut task| {
                task.image_path = image_path;
                task
            })?;

        self.inner.cache.insert(task.clone());
        self.save_now_logged().await;
        self.publish_task(&task);
        info!(task_id = %task.id, branch = %task.branch, mode = %task.mode.as_str(), "task created");
        Ok(task)
    }

    async fn create_in_workspace(
        &self,
        id: Id,
        prompt: String,
        slug: &str,
        repo: &Path,
        base: &str,
        mode: TaskMode,
    ) -> Result<Task> {
        let layout = git::workspace_layout(
            &self.inner.config.data_dir,
            repo,
            &self.inner.config.branch_prefix,
            slug,
            id.short(),
        )?;

        {
            let _repo_guard = self.inner.repo_lock.acquire(repo).await?;
            let (repo, layout, base) = (repo.to_path_buf(), layout.clone(), base.to_string());
            blocking(move || git::create_workspace(&repo, &layout, &base)).await?;
        }

        let now = Utc::now();
        Ok(Task {
            id,
            prompt,
            mode,
            state: TaskState::Starting,
            repo_path: repo.display().to_string(),
            workspace_path: layout.path.display().to_string(),
            branch: layout.branch,
            base_branch: base.to_string(),
            image_path: None,
            preview: None,
            cycles: Vec::new(),
            predecessor: None,
            output: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    // --- Pipelines ---

    /// Launch the task's phase pipeline.
    pub async fn start(&self, id: &Id) -> Result<Task> {
        let task = self.get(id)?;
        Self::require_status(&task, &[TaskStatus::Starting], "start")?;
        self.require_idle(&task)?;

        let first = task.mode.first_phase();
        let rx = self.inner.pipelines.start(PipelineSpec::for_task(&task))?;
        let task = self.update(id, |task| {
            task.begin_phase(first)?;
            Ok(())
        })?;
        self.spawn_consumer(id.clone(), rx, PipelineKind::Phases);
        info!(task_id = %id, phase = %first, "task started");
        Ok(task)
    }

    /// Run one editor phase with `text` on a stable task.
    pub async fn send_prompt(&self, id: &Id, text: &str) -> Result<Task> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Validation("prompt must not be empty".to_string()));
        }
        let task = self.get(id)?;
        Self::require_status(&task, &[TaskStatus::Finished, TaskStatus::Failed], "prompt")?;
        self.require_idle(&task)?;

        let rx = self.inner.pipelines.start(PipelineSpec::follow_up(&task, text))?;
        let mut cycle = 0;
        let task = self.update(id, |task| {
            task.cycles.push(PromptCycle {
                prompt: text.to_string(),
                change_request: None,
                successor: None,
                outcome: CycleOutcome::Pending,
                recorded_at: Utc::now(),
            });
            cycle = task.cycles.len() - 1;
            Ok(())
        })?;
        self.spawn_consumer(id.clone(), rx, PipelineKind::FollowUp { cycle });
        info!(task_id = %id, "follow-up prompt started");
        Ok(task)
    }

    fn spawn_consumer(&self, id: Id, rx: mpsc::Receiver<PhaseEvent>, kind: PipelineKind) {
        let store = self.clone();
        tokio::spawn(async move { store.consume(id, rx, kind).await });
    }

    async fn consume(&self, id: Id, mut rx: mpsc::Receiver<PhaseEvent>, kind: PipelineKind) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.apply(&id, event, kind) {
                match e {
                    StoreError::NotFound(_) => {
                        debug!(task_id = %id, "task removed; dropping pipeline events");
                        return;
                    }
                    e => warn!(task_id = %id, error = %e, "failed to apply pipeline event"),
                }
            }
        }
    }

    fn append_output(&self, id: &Id, entry: OutputEntry) -> Result<()> {
        let limit = self.inner.config.output_tail_lines;
        let appended = entry.clone();
        self.inner
            .cache
            .update(id, |task| {
                task.push_output(entry, limit);
                task.updated_at = Utc::now();
            })
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.inner.persister.mark_dirty();
        self.publish(TaskEvent::TaskOutputAppended {
            task_id: id.clone(),
            entry: appended,
        });
        Ok(())
    }

    fn apply(&self, id: &Id, event: PhaseEvent, kind: PipelineKind) -> Result<()> {
        match (event, kind) {
            (PhaseEvent::PhaseStarted { phase }, PipelineKind::Phases) => {
                self.update(id, |task| Ok(task.begin_phase(phase)?))?;
                self.append_output(id, lifecycle_entry(phase, format!("{phase} phase started")))
            }
            (PhaseEvent::PhaseStarted { phase }, PipelineKind::FollowUp { .. }) => {
                self.append_output(id, lifecycle_entry(phase, "follow-up prompt started"))
            }
            (
                PhaseEvent::Output {
                    phase,
                    line,
                    historical,
                },
                _,
            ) => {
                let (kind, text) = line.render();
                self.append_output(
                    id,
                    OutputEntry {
                        at: Utc::now(),
                        phase,
                        kind,
                        text,
                        historical,
                    },
                )
            }
            (
                PhaseEvent::Stderr {
                    phase,
                    text,
                    historical,
                },
                _,
            ) => self.append_output(
                id,
                OutputEntry {
                    at: Utc::now(),
                    phase,
                    kind: OutputKind::Stderr,
                    text,
                    historical,
                },
            ),
            (PhaseEvent::Reconnected { phase }, _) => {
                info!(task_id = %id, %phase, "reconnected to running agent");
                self.append_output(id, lifecycle_entry(phase, "reconnected to running agent"))
            }
            (PhaseEvent::PhaseCompleted { phase }, _) => {
                debug!(task_id = %id, %phase, "phase completed");
                self.append_output(id, lifecycle_entry(phase, format!("{phase} phase completed")))
            }
            (PhaseEvent::Completed, PipelineKind::Phases) => {
                let task = self.update(id, |task| Ok(task.finish()?))?;
                info!(task_id = %id, "task finished");
                self.settle_predecessor(&task, CycleOutcome::Succeeded);
                Ok(())
            }
            (PhaseEvent::Failed { phase, reason }, PipelineKind::Phases) => {
                warn!(task_id = %id, %phase, %reason, "task failed");
                let task = self.update(id, |task| Ok(task.fail(phase, reason.clone())?))?;
                self.settle_predecessor(&task, CycleOutcome::Failed);
                Ok(())
            }
            (PhaseEvent::Completed, PipelineKind::FollowUp { cycle }) => {
                info!(task_id = %id, "follow-up prompt finished");
                self.set_cycle_outcome(id, cycle, CycleOutcome::Succeeded)
            }
            (PhaseEvent::Failed { phase, reason }, PipelineKind::FollowUp { cycle }) => {
                warn!(task_id = %id, %phase, %reason, "follow-up prompt failed");
                self.append_output(id, lifecycle_entry(phase, format!("follow-up failed: {reason}")))?;
                self.set_cycle_outcome(id, cycle, CycleOutcome::Failed)
            }
        }
    }

    fn set_cycle_outcome(&self, id: &Id, cycle: usize, outcome: CycleOutcome) -> Result<()> {
        self.update(id, |task| {
            if let Some(entry) = task.cycles.get_mut(cycle) {
                entry.outcome = outcome;
            }
            Ok(())
        })
        .map(|_| ())
    }

    /// Record the outcome of a change-request task on the task it came from.
    fn settle_predecessor(&self, task: &Task, outcome: CycleOutcome) {
        let Some(predecessor) = &task.predecessor else {
            return;
        };
        let result = self.update(predecessor, |original| {
            for cycle in &mut original.cycles {
                if cycle.successor.as_ref() == Some(&task.id) {
                    cycle.outcome = outcome;
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            debug!(task_id = %task.id, %predecessor, error = %e, "predecessor not updated");
        }
    }

    // --- Workspace operations ---

    /// Commit the workspace of a finished task; returns the commit id.
    pub async fn commit(&self, id: &Id, message: Option<&str>) -> Result<String> {
        let task = self.get(id)?;
        Self::require_status(&task, &[TaskStatus::Finished], "commit")?;
        self.require_idle(&task)?;

        let message = match message.map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => commit_summary(&task.prompt),
        };
        let sha = {
            let _repo_guard = self.inner.repo_lock.acquire(Path::new(&task.repo_path)).await?;
            let workspace = PathBuf::from(&task.workspace_path);
            blocking(move || git::commit(&workspace, &message)).await?
        };
        let recorded = sha.clone();
        self.update(id, move |task| Ok(task.record_commit(recorded)?))?;
        info!(task_id = %id, commit = %sha, "task committed");
        Ok(sha)
    }

    /// Create a follow-up task carrying `text` on top of this task's work.
    ///
    /// The original keeps its status and records the request as a cycle.
    pub async fn request_changes(&self, id: &Id, text: &str) -> Result<Task> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Validation("change request must not be empty".to_string()));
        }
        let original = self.get(id)?;
        Self::require_status(
            &original,
            &[TaskStatus::Finished, TaskStatus::Failed],
            "request changes on",
        )?;
        self.require_idle(&original)?;

        let _queue = self.inner.creation.enter().await;
        let repo = PathBuf::from(&original.repo_path);

        // Uncommitted work must be on the branch for the new workspace to see it.
        let checkpoint = {
            let _repo_guard = self.inner.repo_lock.acquire(&repo).await?;
            let workspace = PathBuf::from(&original.workspace_path);
            let message = format!("Checkpoint before change request for task {}", original.id);
            blocking(move || {
                if git::is_working_tree_clean(&workspace)? {
                    Ok(None)
                } else {
                    git::commit(&workspace, &message).map(Some)
                }
            })
            .await?
        };

        let prompt = change_request_prompt(&original.prompt, &original.cycles, text);
        let mut successor = self
            .create_in_workspace(Id::new(), prompt.clone(), &slugify(text), &repo, &original.branch, original.mode)
            .await?;
        successor.predecessor = Some(original.id.clone());
        successor.image_path = original.image_path.clone();
        self.inner.cache.insert(successor.clone());

        let successor_id = successor.id.clone();
        self.update(id, move |task| {
            if let Some(sha) = checkpoint {
                if task.status() == TaskStatus::Finished {
                    task.record_commit(sha)?;
                }
            }
            task.cycles.push(PromptCycle {
                prompt,
                change_request: Some(text.to_string()),
                successor: Some(successor_id),
                outcome: CycleOutcome::Pending,
                recorded_at: Utc::now(),
            });
            Ok(())
        })?;
        self.save_now_logged().await;
        self.publish_task(&successor);
        info!(task_id = %id, successor = %successor.id, "change request created");
        Ok(successor)
    }

    // --- Preview ---

    /// Apply the task's commit onto the repository's checked-out branch.
    pub async fn start_preview(&self, id: &Id) -> Result<Task> {
        let task = self.get(id)?;
        Self::require_status(&task, &[TaskStatus::Finished], "preview")?;
        if task.preview.is_some() {
            return Err(StoreError::PreviewActive(task.id));
        }
        let commit = task
            .commit()
            .map(str::to_string)
            .ok_or_else(|| StoreError::NoCommit(task.id.clone()))?;
        if let Some(other) = self
            .inner
            .cache
            .list()
            .into_iter()
            .find(|t| t.repo_path == task.repo_path && t.preview.is_some())
        {
            return Err(StoreError::PreviewActive(other.id));
        }

        let repo = PathBuf::from(&task.repo_path);
        let (original_head, preview_commit) = {
            let _repo_guard = self.inner.repo_lock.acquire(&repo).await?;
            blocking(move || {
                let branch = git::current_branch(&repo)?.ok_or_else(|| {
                    GitError::CommandFailed("repository HEAD is detached".to_string())
                })?;
                let original_head = git::head_commit(&repo)?;
                let preview_commit = git::cherry_pick(&repo, &commit, &branch)?;
                Ok((original_head, preview_commit))
            })
            .await?
        };

        let task = self.update(id, |task| {
            task.preview = Some(Preview {
                original_head,
                preview_commit,
                started_at: Utc::now(),
            });
            Ok(())
        })?;
        info!(task_id = %id, "preview started");
        Ok(task)
    }

    pub async fn stop_preview(&self, id: &Id) -> Result<Task> {
        let task = self.get(id)?;
        let preview = task
            .preview
            .clone()
            .ok_or_else(|| StoreError::NoPreview(task.id.clone()))?;

        let repo = PathBuf::from(&task.repo_path);
        {
            let _repo_guard = self.inner.repo_lock.acquire(&repo).await?;
            blocking(move || {
                git::revert_preview(&repo, &preview.original_head, &preview.preview_commit)
            })
            .await?;
        }

        let task = self.update(id, |task| {
            task.preview = None;
            Ok(())
        })?;
        info!(task_id = %id, "preview stopped");
        Ok(task)
    }

    // --- Merge ---

    /// Merge a finished, committed task into its target branch.
    ///
    /// Merging an already merged task returns it unchanged.
    pub async fn merge(&self, id: &Id, resolution: MergeResolution) -> Result<Task> {
        let _merge_guard = self
            .inner
            .merge_lock
            .acquire(id.as_ref())
            .await
            .map_err(|e| match e {
                LockError::MergeInProgress(_) => StoreError::MergeInProgress(id.clone()),
                other => StoreError::Lock(other),
            })?;

        let task = self.get(id)?;
        if task.status() == TaskStatus::Merged {
            debug!(task_id = %id, "task already merged");
            return Ok(task);
        }
        Self::require_status(&task, &[TaskStatus::Finished], "merge")?;
        self.require_idle(&task)?;
        if task.commit().is_none() {
            return Err(StoreError::NoCommit(task.id));
        }
        if task.preview.is_some() {
            return Err(StoreError::PreviewActive(task.id));
        }

        let critical = self.inner.persister.enter_critical();
        let repo = PathBuf::from(&task.repo_path);
        let target = self
            .inner
            .config
            .merge_target_branch
            .clone()
            .unwrap_or_else(|| task.base_branch.clone());
        info!(task_id = %id, branch = %task.branch, %target, ?resolution, "merging task");

        let checkout = {
            let (repo, branch, target) = (repo.clone(), task.branch.clone(), target.clone());
            blocking(move || git::begin_merge(&repo, &branch, &target)).await?
        };
        if checkout.is_conflicted() {
            match resolution {
                MergeResolution::Manual => return Err(checkout.conflict_error().into()),
                MergeResolution::Auto => {
                    let request = ResolveRequest {
                        task_id: task.id.clone(),
                        task_prompt: task.prompt.clone(),
                    };
                    self.inner.resolver.resolve(&checkout, &request).await?;
                }
            }
        }

        let merged_commit = {
            let _repo_guard = self.inner.repo_lock.acquire(&repo).await?;
            blocking(move || checkout.complete()).await?
        };

        let task = self.update(id, |task| Ok(task.mark_merged(Utc::now())?))?;
        info!(task_id = %id, commit = %merged_commit, "task merged");

        // The merge stands from here on; cleanup failures are retried by sync.
        if let Err(e) = self.remove_workspace(&task).await {
            warn!(task_id = %id, error = %e, "failed to remove merged workspace");
        }
        if let Err(e) = critical.finish().await {
            error!(task_id = %id, error = %e, "failed to save merged task; will retry");
        }
        Ok(task)
    }

    async fn remove_workspace(&self, task: &Task) -> Result<()> {
        let repo = PathBuf::from(&task.repo_path);
        let _repo_guard = self.inner.repo_lock.acquire(&repo).await?;
        let (workspace, branch) = (PathBuf::from(&task.workspace_path), task.branch.clone());
        blocking(move || git::remove_workspace(&repo, &workspace, Some(&branch))).await
    }

    /// Remove workspaces and branches merged tasks still hold. Returns how
    /// many were cleaned up.
    pub async fn clean_merged_workspaces(&self) -> usize {
        let mut cleaned = 0;
        for task in self.list() {
            if task.status() != TaskStatus::Merged || !Path::new(&task.repo_path).is_dir() {
                continue;
            }
            let leftover = Path::new(&task.workspace_path).exists() || {
                let (repo, branch) = (PathBuf::from(&task.repo_path), task.branch.clone());
                blocking(move || git::branch_exists(&repo, &branch))
                    .await
                    .unwrap_or(false)
            };
            if !leftover {
                continue;
            }
            match self.remove_workspace(&task).await {
                Ok(()) => {
                    info!(task_id = %task.id, "removed leftover workspace of merged task");
                    cleaned += 1;
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "leftover workspace still not removed"),
            }
        }
        cleaned
    }

    // --- Removal ---

    /// Stop, clean up and forget a task. On failure the task stays.
    pub async fn remove(&self, id: &Id) -> Result<()> {
        let task = self.get(id)?;
        if self.inner.merge_lock.holder().as_deref() == Some(id.as_ref()) {
            return Err(StoreError::MergeInProgress(id.clone()));
        }
        if task.preview.is_some() {
            self.stop_preview(id).await?;
        }

        self.inner.pipelines.stop(id).await?;

        if task.status() != TaskStatus::Merged {
            self.remove_workspace(&task).await?;
        }

        let Some(removed) = self.inner.cache.remove(id) else {
            return Err(StoreError::NotFound(id.clone()));
        };
        if let Err(e) = self.inner.persister.save_now().await {
            self.inner.cache.insert(removed);
            return Err(e.into());
        }

        let runs = self.inner.config.data_dir.join("runs").join(id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&runs).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(task_id = %id, error = %e, "failed to remove run files");
            }
        }

        self.publish(TaskEvent::TaskRemoved { task_id: id.clone() });
        info!(task_id = %id, "task removed");
        Ok(())
    }

    // --- Recovery ---

    /// Re-attach to agents that outlived the previous daemon.
    ///
    /// In-progress tasks whose agent is gone are failed. Returns the number
    /// of adopted processes.
    pub async fn adopt_running(&self) -> Result<usize> {
        let registrations = self.inner.pipelines.registry().list().await?;
        let mut adopted = 0;
        let mut attached = HashSet::new();

        for registration in registrations {
            let Some(task) = self.inner.cache.get(&registration.task_id) else {
                continue;
            };
            let kind = match task.status() {
                TaskStatus::InProgress => PipelineKind::Phases,
                TaskStatus::Finished | TaskStatus::Failed => {
                    let pending = task
                        .cycles
                        .iter()
                        .rposition(|c| c.change_request.is_none() && c.outcome == CycleOutcome::Pending);
                    match pending {
                        Some(cycle) => PipelineKind::FollowUp { cycle },
                        None => {
                            warn!(task_id = %task.id, "agent registered for a settled task; stopping it");
                            self.inner.pipelines.stop(&task.id).await?;
                            continue;
                        }
                    }
                }
                TaskStatus::Starting | TaskStatus::Merged => {
                    warn!(task_id = %task.id, status = %task.status(), "unexpected agent registration; stopping it");
                    self.inner.pipelines.stop(&task.id).await?;
                    continue;
                }
            };
            let spec = match kind {
                PipelineKind::Phases => PipelineSpec::after_phase(&task, registration.phase),
                PipelineKind::FollowUp { .. } => {
                    let mut spec = PipelineSpec::follow_up(&task, "");
                    spec.phases.clear();
                    spec
                }
            };
            // The output files are replayed in full; forget this run's lines seen so far.
            let (phase, since) = (registration.phase, registration.started_at);
            self.update(&task.id, |t| {
                t.output
                    .retain(|e| !(e.phase == phase && e.at >= since && e.kind.is_agent_output()));
                Ok(())
            })?;
            let rx = self.inner.pipelines.adopt(spec, registration)?;
            self.spawn_consumer(task.id.clone(), rx, kind);
            attached.insert(task.id);
            adopted += 1;
        }

        for task in self.inner.cache.list() {
            if attached.contains(&task.id) {
                continue;
            }
            if task.status() == TaskStatus::InProgress {
                let phase = task.phase();
                warn!(task_id = %task.id, %phase, "agent lost across restart");
                self.update(&task.id, |t| Ok(t.fail(phase, "agent process lost across restart")?))?;
            } else if task
                .cycles
                .iter()
                .any(|c| c.change_request.is_none() && c.outcome == CycleOutcome::Pending)
            {
                self.update(&task.id, |t| {
                    for cycle in &mut t.cycles {
                        if cycle.change_request.is_none() && cycle.outcome == CycleOutcome::Pending {
                            cycle.outcome = CycleOutcome::Failed;
                        }
                    }
                    Ok(())
                })?;
            }
        }

        if adopted > 0 {
            info!(count = adopted, "adopted running agents");
        }
        Ok(adopted)
    }

    /// Install tasks taken from disk during reconciliation.
    ///
    /// `loaded_at` is when the disk copy was read. A disk copy is skipped when
    /// its task has a running pipeline, changed in memory since `loaded_at`,
    /// was removed, or sits at a status the memory copy cannot reach. Returns
    /// how many were installed.
    pub(crate) fn apply_reconciled(&self, replaced: Vec<Task>, loaded_at: DateTime<Utc>) -> usize {
        let mut installed = Vec::new();
        {
            let mut tasks = self.inner.cache.write();
            let removed = self.inner.cache.removed();
            for task in replaced {
                if self.inner.pipelines.is_running(&task.id) || removed.contains(&task.id) {
                    continue;
                }
                if let Some(current) = tasks.get(&task.id) {
                    if current.updated_at > loaded_at {
                        debug!(task_id = %task.id, "task changed while disk was read; keeping memory copy");
                        continue;
                    }
                    if !current.status().can_reach(task.status()) {
                        warn!(
                            task_id = %task.id,
                            memory = %current.status(),
                            disk = %task.status(),
                            "disk copy would move task backwards; keeping memory copy"
                        );
                        continue;
                    }
                }
                tasks.insert(task.id.clone(), task.clone());
                installed.push(task);
            }
        }
        for task in &installed {
            self.publish_task(task);
        }
        installed.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::git::tests::{commit_all, setup_test_repo};
    use crate::locks::FileLock;
    use crate::registry::ProcessRegistry;
    use crate::resolver::ResolverConfig;
    use crate::runner::RunnerConfig;
    use crate::storage::{SnapshotStore, TaskStorage};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    pub(crate) struct Harness {
        pub repo_dir: TempDir,
        pub data: TempDir,
        pub store: TaskStore,
        pub cancel: CancellationToken,
    }

    impl Harness {
        pub(crate) fn repo(&self) -> PathBuf {
            git::validate_repo(self.repo_dir.path()).unwrap()
        }

        pub(crate) fn new_task(&self, prompt: &str, mode: TaskMode) -> NewTask {
            NewTask {
                prompt: prompt.to_string(),
                repo_path: self.repo(),
                mode,
                image_path: None,
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// A store over a fresh repository whose agent runs `agent_body`.
    pub(crate) fn harness(agent_body: &str, resolver_body: &str) -> Harness {
        let repo_dir = setup_test_repo();
        let data = TempDir::new().unwrap();
        write_script(data.path(), "agent.sh", agent_body);
        write_script(data.path(), "resolver.sh", resolver_body);
        let cancel = CancellationToken::new();
        let store = store_over(data.path(), Vec::new(), &cancel);
        Harness {
            repo_dir,
            data,
            store,
            cancel,
        }
    }

    /// A store over `data` holding `tasks`, as a restarted daemon would see it.
    pub(crate) fn store_over(data: &Path, tasks: Vec<Task>, cancel: &CancellationToken) -> TaskStore {
        let file_lock = FileLock::new(Duration::from_secs(5));
        let snapshots = SnapshotStore::new(data, 5, file_lock.clone());
        let storage = TaskStorage::new(data, file_lock.clone(), snapshots);
        let cache = Arc::new(TaskCache::new(tasks));
        let persister = Persister::new(storage, cache.clone(), Duration::from_millis(50));
        tokio::spawn(persister.clone().run(cancel.clone()));

        let registry = ProcessRegistry::new(data, file_lock);
        let pipelines = PipelineManager::new(
            RunnerConfig {
                agent_bin: data.join("agent.sh").display().to_string(),
                agent_args: Vec::new(),
                phase_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(50),
                grace_period: Duration::from_millis(500),
                runs_dir: data.join("runs"),
            },
            registry,
        );
        let resolver = ConflictResolver::new(ResolverConfig {
            agent_bin: data.join("resolver.sh").display().to_string(),
            agent_args: Vec::new(),
            timeout: Duration::from_secs(30),
            diff_max_bytes: 10_000,
        });
        TaskStore::new(StoreParts {
            config: StoreConfig {
                data_dir: data.to_path_buf(),
                branch_prefix: "task/".to_string(),
                output_tail_lines: 100,
                merge_target_branch: None,
            },
            cache,
            persister,
            pipelines,
            resolver,
            repo_lock: RepoLock::new(Duration::from_secs(30)),
            merge_lock: MergeLock::new(),
        })
    }

    /// Agent that edits a file named after the phase prompt's role.
    pub(crate) const EDITING_AGENT: &str = r#"prompt=$(cat)
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"on it"}]}}'
case "$prompt" in
  *"You are the editor"*) echo "hello from the agent" > feature.txt ;;
esac
exit 0"#;

    pub(crate) async fn wait_for_status(store: &TaskStore, id: &Id, status: TaskStatus) -> Task {
        for _ in 0..400 {
            let task = store.get(id).unwrap();
            if task.status() == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {id} never reached {status}: {:?}", store.get(id).unwrap().state);
    }

    async fn finished_task(h: &Harness, prompt: &str) -> Task {
        let task = h.store.create(h.new_task(prompt, TaskMode::Edit)).await.unwrap();
        h.store.start(&task.id).await.unwrap();
        wait_for_status(&h.store, &task.id, TaskStatus::Finished).await
    }

    fn read_disk(h: &Harness) -> Vec<Task> {
        let raw = std::fs::read_to_string(h.data.path().join("tasks.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        serde_json::from_value(doc["tasks"].clone()).unwrap()
    }

    #[test]
    fn commit_summary_uses_first_line() {
        assert_eq!(commit_summary("\nAdd login\nmore detail"), "Add login");
        let long = "x".repeat(100);
        assert_eq!(commit_summary(&long).chars().count(), COMMIT_SUMMARY_MAX);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let h = harness("exit 0", "exit 0");
        let empty = h.store.create(h.new_task("   ", TaskMode::Edit)).await;
        assert!(matches!(empty, Err(StoreError::Validation(_))));

        let mut relative = h.new_task("x", TaskMode::Edit);
        relative.repo_path = PathBuf::from("relative/repo");
        assert!(matches!(
            h.store.create(relative).await,
            Err(StoreError::Git(GitError::InvalidPath(_)))
        ));

        let mut image = h.new_task("x", TaskMode::Edit);
        image.image_path = Some(h.repo().join("../escape.png"));
        assert!(matches!(
            h.store.create(image).await,
            Err(StoreError::Git(GitError::InvalidPath(_)))
        ));
        assert!(h.store.list().is_empty());
    }

    #[tokio::test]
    async fn full_pipeline_finishes_and_commits() {
        let h = harness(EDITING_AGENT, "exit 0");
        let mut events = h.store.subscribe();
        let task = h
            .store
            .create(h.new_task("Add a feature file", TaskMode::Edit))
            .await
            .unwrap();
        assert_eq!(task.status(), TaskStatus::Starting);
        assert!(Path::new(&task.workspace_path).is_dir());
        assert!(task.branch.starts_with("task/add-a-feature-file-"));

        let started = h.store.start(&task.id).await.unwrap();
        assert_eq!(started.status(), TaskStatus::InProgress);
        assert!(matches!(
            h.store.start(&task.id).await,
            Err(StoreError::InvalidState { .. })
        ));

        let finished = wait_for_status(&h.store, &task.id, TaskStatus::Finished).await;
        assert_eq!(finished.phase(), Phase::Done);
        assert!(finished.output.iter().any(|e| e.text == "on it" && e.phase == Phase::Reviewer));

        let sha = h.store.commit(&task.id, None).await.unwrap();
        assert!(!sha.is_empty());
        assert_eq!(h.store.get(&task.id).unwrap().commit(), Some(sha.as_str()));

        let mut saw_output = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TaskEvent::TaskOutputAppended { .. }) {
                saw_output = true;
            }
        }
        assert!(saw_output);
    }

    #[tokio::test]
    async fn edit_only_skips_review() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = h
            .store
            .create(h.new_task("quick fix", TaskMode::EditOnly))
            .await
            .unwrap();
        h.store.start(&task.id).await.unwrap();
        let done = wait_for_status(&h.store, &task.id, TaskStatus::Finished).await;
        assert!(done.output.iter().all(|e| e.phase != Phase::Reviewer));
    }

    #[tokio::test]
    async fn reviewer_failure_fails_task() {
        let h = harness(
            r#"prompt=$(cat)
case "$prompt" in
  *"You are the reviewer"*) echo 'review blew up' >&2; exit 2 ;;
esac
exit 0"#,
            "exit 0",
        );
        let task = h.store.create(h.new_task("x", TaskMode::Edit)).await.unwrap();
        h.store.start(&task.id).await.unwrap();
        let failed = wait_for_status(&h.store, &task.id, TaskStatus::Failed).await;
        match failed.state {
            TaskState::Failed { phase, reason } => {
                assert_eq!(phase, Phase::Reviewer);
                assert!(reason.contains("code 2"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(failed.output.iter().any(|e| e.kind == OutputKind::Stderr));
        assert!(matches!(
            h.store.commit(&task.id, None).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn merge_requires_commit_and_is_idempotent() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = finished_task(&h, "feature").await;
        assert!(matches!(
            h.store.merge(&task.id, MergeResolution::Manual).await,
            Err(StoreError::NoCommit(_))
        ));

        h.store.commit(&task.id, Some("Add feature")).await.unwrap();
        let merged = h.store.merge(&task.id, MergeResolution::Manual).await.unwrap();
        assert_eq!(merged.status(), TaskStatus::Merged);
        assert!(!Path::new(&merged.workspace_path).exists());
        assert!(h.repo().join("feature.txt").exists());

        let again = h.store.merge(&task.id, MergeResolution::Manual).await.unwrap();
        assert_eq!(again, merged);
        assert_eq!(read_disk(&h).iter().find(|t| t.id == task.id).unwrap().status(), TaskStatus::Merged);
    }

    #[tokio::test]
    async fn concurrent_merges_of_one_task() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = finished_task(&h, "feature").await;
        h.store.commit(&task.id, None).await.unwrap();

        let (a, b) = tokio::join!(
            h.store.merge(&task.id, MergeResolution::Manual),
            h.store.merge(&task.id, MergeResolution::Manual)
        );
        let results = [a, b];
        let merged = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::MergeInProgress(_))))
            .count();
        assert!(merged >= 1);
        assert_eq!(merged + rejected, 2);
        assert_eq!(h.store.get(&task.id).unwrap().status(), TaskStatus::Merged);
    }

    async fn conflicting_task(h: &Harness) -> Task {
        let task = finished_task(h, "feature").await;
        h.store.commit(&task.id, None).await.unwrap();
        std::fs::write(h.repo().join("feature.txt"), "upstream\n").unwrap();
        commit_all(&h.repo(), "upstream feature");
        task
    }

    #[tokio::test]
    async fn manual_merge_conflict_leaves_repo_clean() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = conflicting_task(&h).await;
        let head = git::head_commit(&h.repo()).unwrap();

        match h.store.merge(&task.id, MergeResolution::Manual).await {
            Err(StoreError::Git(GitError::Conflict { paths, .. })) => {
                assert_eq!(paths, vec!["feature.txt".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(git::head_commit(&h.repo()).unwrap(), head);
        assert!(git::is_working_tree_clean(&h.repo()).unwrap());
        assert_eq!(h.store.get(&task.id).unwrap().status(), TaskStatus::Finished);
        assert!(h.store.merge_lock().holder().is_none());
    }

    #[tokio::test]
    async fn auto_merge_with_failing_resolver_leaves_repo_clean() {
        let h = harness(EDITING_AGENT, "cat > /dev/null; exit 1");
        let task = conflicting_task(&h).await;
        let head = git::head_commit(&h.repo()).unwrap();

        assert!(matches!(
            h.store.merge(&task.id, MergeResolution::Auto).await,
            Err(StoreError::Resolver(ResolverError::AgentFailed { .. }))
        ));
        assert_eq!(git::head_commit(&h.repo()).unwrap(), head);
        assert!(git::is_working_tree_clean(&h.repo()).unwrap());
        assert!(git::conflicted_paths(&h.repo()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_merge_resolves_conflict() {
        let h = harness(
            EDITING_AGENT,
            "cat > /dev/null\nprintf 'resolved\\n' > feature.txt\ngit add feature.txt",
        );
        let task = conflicting_task(&h).await;
        let merged = h.store.merge(&task.id, MergeResolution::Auto).await.unwrap();
        assert_eq!(merged.status(), TaskStatus::Merged);
        assert_eq!(
            std::fs::read_to_string(h.repo().join("feature.txt")).unwrap(),
            "resolved\n"
        );
    }

    #[tokio::test]
    async fn concurrent_creates_then_merge_all_persisted() {
        let h = harness(EDITING_AGENT, "exit 0");
        let mut handles = Vec::new();
        for i in 0..5u64 {
            let store = h.store.clone();
            let request = h.new_task(&format!("task number {i}"), TaskMode::EditOnly);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 10)).await;
                store.create(request).await.unwrap()
            }));
        }
        let mut created = Vec::new();
        for handle in handles {
            created.push(handle.await.unwrap());
        }
        let names: HashSet<String> = created.iter().map(|t| t.workspace_path.clone()).collect();
        assert_eq!(names.len(), 5);

        let first = &created[0];
        h.store.start(&first.id).await.unwrap();
        wait_for_status(&h.store, &first.id, TaskStatus::Finished).await;
        h.store.commit(&first.id, None).await.unwrap();
        h.store.merge(&first.id, MergeResolution::Manual).await.unwrap();

        let disk = read_disk(&h);
        assert_eq!(disk.len(), 5);
        assert_eq!(h.store.list().len(), 5);
        for task in &created {
            assert!(disk.iter().any(|t| t.id == task.id));
        }
        assert_eq!(
            disk.iter().find(|t| t.id == first.id).unwrap().status(),
            TaskStatus::Merged
        );
    }

    #[tokio::test]
    async fn request_changes_links_tasks() {
        let h = harness(EDITING_AGENT, "exit 0");
        let original = finished_task(&h, "add feature").await;

        let successor = h
            .store
            .request_changes(&original.id, "also add docs")
            .await
            .unwrap();
        assert_eq!(successor.predecessor.as_ref(), Some(&original.id));
        assert_eq!(successor.status(), TaskStatus::Starting);
        assert_eq!(successor.base_branch, original.branch);
        assert!(successor.prompt.contains("add feature"));
        assert!(successor.prompt.contains("also add docs"));
        // The uncommitted work was checkpointed onto the branch.
        assert!(Path::new(&successor.workspace_path).join("feature.txt").exists());

        let original = h.store.get(&original.id).unwrap();
        assert_eq!(original.status(), TaskStatus::Finished);
        assert_eq!(original.cycles.len(), 1);
        assert_eq!(original.cycles[0].successor.as_ref(), Some(&successor.id));

        h.store.start(&successor.id).await.unwrap();
        wait_for_status(&h.store, &successor.id, TaskStatus::Finished).await;
        let original = h.store.get(&original.id).unwrap();
        assert_eq!(original.cycles[0].outcome, CycleOutcome::Succeeded);
    }

    #[tokio::test]
    async fn send_prompt_records_cycle_without_status_change() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = finished_task(&h, "feature").await;
        assert!(matches!(
            h.store.send_prompt(&task.id, "  ").await,
            Err(StoreError::Validation(_))
        ));

        let running = h.store.send_prompt(&task.id, "tweak it").await.unwrap();
        assert_eq!(running.status(), TaskStatus::Finished);
        for _ in 0..200 {
            if h.store.get(&task.id).unwrap().cycles[0].outcome != CycleOutcome::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let task = h.store.get(&task.id).unwrap();
        assert_eq!(task.status(), TaskStatus::Finished);
        assert_eq!(task.cycles[0].outcome, CycleOutcome::Succeeded);
        assert_eq!(task.cycles[0].prompt, "tweak it");
    }

    #[tokio::test]
    async fn preview_round_trip() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = finished_task(&h, "feature").await;
        h.store.commit(&task.id, None).await.unwrap();
        let head = git::head_commit(&h.repo()).unwrap();

        let previewing = h.store.start_preview(&task.id).await.unwrap();
        assert!(previewing.preview.is_some());
        assert!(h.repo().join("feature.txt").exists());
        assert!(matches!(
            h.store.start_preview(&task.id).await,
            Err(StoreError::PreviewActive(_))
        ));
        assert!(matches!(
            h.store.merge(&task.id, MergeResolution::Manual).await,
            Err(StoreError::PreviewActive(_))
        ));

        let stopped = h.store.stop_preview(&task.id).await.unwrap();
        assert!(stopped.preview.is_none());
        assert_eq!(git::head_commit(&h.repo()).unwrap(), head);
        assert!(!h.repo().join("feature.txt").exists());
        assert!(matches!(
            h.store.stop_preview(&task.id).await,
            Err(StoreError::NoPreview(_))
        ));
    }

    #[tokio::test]
    async fn remove_stops_agent_and_deletes_everything() {
        let h = harness("sleep 30", "exit 0");
        let mut events = h.store.subscribe();
        let task = h.store.create(h.new_task("slow", TaskMode::Edit)).await.unwrap();
        h.store.start(&task.id).await.unwrap();

        h.store.remove(&task.id).await.unwrap();
        assert!(matches!(h.store.get(&task.id), Err(StoreError::NotFound(_))));
        assert!(!Path::new(&task.workspace_path).exists());
        assert!(read_disk(&h).is_empty());
        assert!(h.store.pipelines().registry().list().await.unwrap().is_empty());

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TaskEvent::TaskRemoved { .. }) {
                removed = true;
            }
        }
        assert!(removed);
        assert!(matches!(h.store.remove(&task.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn restart_fails_in_progress_task_without_agent() {
        let h = harness("exit 0", "exit 0");
        let task = h.store.create(h.new_task("x", TaskMode::Edit)).await.unwrap();
        h.store
            .update(&task.id, |t| Ok(t.begin_phase(Phase::Editor)?))
            .unwrap();

        assert_eq!(h.store.adopt_running().await.unwrap(), 0);
        match h.store.get(&task.id).unwrap().state {
            TaskState::Failed { phase, reason } => {
                assert_eq!(phase, Phase::Editor);
                assert!(reason.contains("restart"));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn adoption_replays_prior_output_exactly_once() {
        let h = harness(
            "cat > /dev/null\necho editor-marker\nsleep 3\necho after-restart\nexit 0",
            "exit 0",
        );
        let task = h
            .store
            .create(h.new_task("slow edit", TaskMode::EditOnly))
            .await
            .unwrap();
        h.store.start(&task.id).await.unwrap();
        for _ in 0..100 {
            let output = h.store.get(&task.id).unwrap().output;
            if output.iter().any(|e| e.text == "editor-marker") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let restarted = store_over(h.data.path(), h.store.list(), &h.cancel);
        assert_eq!(restarted.adopt_running().await.unwrap(), 1);
        let done = wait_for_status(&restarted, &task.id, TaskStatus::Finished).await;

        let position = |text: &str| done.output.iter().position(|e| e.text == text).unwrap();
        let markers: Vec<&OutputEntry> =
            done.output.iter().filter(|e| e.text == "editor-marker").collect();
        assert_eq!(markers.len(), 1);
        assert!(markers[0].historical);
        assert_eq!(
            done.output.iter().filter(|e| e.text == "editor phase started").count(),
            1
        );
        let reconnected = position("reconnected to running agent");
        assert!(position("editor-marker") < reconnected);
        let live = position("after-restart");
        assert!(live > reconnected);
        assert!(!done.output[live].historical);
    }

    #[tokio::test]
    async fn leftover_workspace_of_merged_task_is_cleaned() {
        let h = harness(EDITING_AGENT, "exit 0");
        let task = finished_task(&h, "feature").await;
        h.store.commit(&task.id, None).await.unwrap();
        let merged = h.store.merge(&task.id, MergeResolution::Manual).await.unwrap();
        assert_eq!(h.store.clean_merged_workspaces().await, 0);

        // What an interrupted cleanup leaves behind.
        let out = std::process::Command::new("git")
            .args(["worktree", "add", "-b", merged.branch.as_str()])
            .args([merged.workspace_path.as_str(), "main"])
            .current_dir(h.repo())
            .output()
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

        assert_eq!(h.store.clean_merged_workspaces().await, 1);
        assert!(!Path::new(&merged.workspace_path).exists());
        assert!(!git::branch_exists(&h.repo(), &merged.branch).unwrap());
        assert_eq!(h.store.clean_merged_workspaces().await, 0);
        assert_eq!(h.store.get(&task.id).unwrap().status(), TaskStatus::Merged);
    }
}
