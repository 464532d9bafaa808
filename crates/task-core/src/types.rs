//! Core types for the task orchestrator.
//!
//! A task is modelled in memory as a tagged state per status (`TaskState`)
//! and collapsed into a flat `TaskRecord` only when it is serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for tasks.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid task id: {0}")]
pub struct InvalidId(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse an externally supplied id, rejecting anything that is not a UUID.
    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        Uuid::parse_str(s.trim())
            .map(|u| Self(u.to_string()))
            .map_err(|_| InvalidId(s.to_string()))
    }

    /// Trailing eight characters, used to keep workspace names unique.
    ///
    /// The leading characters of a v7 id are a timestamp, so the tail is used.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(8);
        &self.0[start..]
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Starting,
    InProgress,
    Finished,
    Failed,
    Merged,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Merged => "merged",
        }
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// `in_progress -> in_progress` is allowed for phase changes.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::InProgress)
                | (Self::InProgress, Self::InProgress)
                | (Self::InProgress, Self::Finished)
                | (Self::InProgress, Self::Failed)
                | (Self::Finished, Self::Merged)
        )
    }

    /// Whether `target` is this status or lies further along the state machine.
    pub fn can_reach(self, target: TaskStatus) -> bool {
        const ALL: [TaskStatus; 5] = [
            TaskStatus::Starting,
            TaskStatus::InProgress,
            TaskStatus::Finished,
            TaskStatus::Failed,
            TaskStatus::Merged,
        ];
        self == target
            || ALL
                .into_iter()
                .any(|next| next != self && self.can_transition_to(next) && next.can_reach(target))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planner,
    Editor,
    Reviewer,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Editor => "editor",
            Self::Reviewer => "reviewer",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which phases a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// planner -> editor -> reviewer
    Plan,
    /// editor -> reviewer
    #[default]
    Edit,
    /// editor only; review is skipped.
    EditOnly,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Edit => "edit",
            Self::EditOnly => "edit_only",
        }
    }

    /// Ordered phases for this mode.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Self::Plan => &[Phase::Planner, Phase::Editor, Phase::Reviewer],
            Self::Edit => &[Phase::Editor, Phase::Reviewer],
            Self::EditOnly => &[Phase::Editor],
        }
    }

    pub fn first_phase(&self) -> Phase {
        self.phases()[0]
    }

    /// Phase that follows `phase`, or `None` when `phase` is the last one.
    pub fn next_phase(&self, phase: Phase) -> Option<Phase> {
        let phases = self.phases();
        phases
            .iter()
            .position(|p| *p == phase)
            .and_then(|idx| phases.get(idx + 1).copied())
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "edit" => Ok(Self::Edit),
            "edit_only" | "edit-only" => Ok(Self::EditOnly),
            other => Err(format!(
                "mode must be 'plan', 'edit', or 'edit_only', got '{other}'"
            )),
        }
    }
}

/// How a merge conflict is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeResolution {
    /// Surface the conflict to the caller.
    #[default]
    Manual,
    /// Hand the conflict to the conflict resolver agent.
    Auto,
}

/// Policy for reconciling the in-memory cache with the on-disk copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    MemoryWins,
    DiskWins,
    NewestWins,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryWins => "memory_wins",
            Self::DiskWins => "disk_wins",
            Self::NewestWins => "newest_wins",
        }
    }
}

/// Kind of a rendered output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    Tool,
    /// Agent-reported session events.
    System,
    Stderr,
    /// Recorded by the daemon itself (phase started, reconnected, ...).
    Lifecycle,
}

impl OutputKind {
    /// Whether the line came from the agent's own output files.
    pub fn is_agent_output(self) -> bool {
        !matches!(self, Self::Lifecycle)
    }
}

/// Outcome of a prompt cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Pending,
    Succeeded,
    Failed,
}

// --- Task ---

/// Status-specific task state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Starting,
    InProgress {
        phase: Phase,
    },
    Finished {
        commit: Option<String>,
    },
    Failed {
        phase: Phase,
        reason: String,
    },
    Merged {
        commit: String,
        merged_at: DateTime<Utc>,
    },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Starting => TaskStatus::Starting,
            Self::InProgress { .. } => TaskStatus::InProgress,
            Self::Finished { .. } => TaskStatus::Finished,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::Merged { .. } => TaskStatus::Merged,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid state transition: {from} -> {to}")]
    Invalid { from: TaskStatus, to: TaskStatus },
    #[error("task {0} has no commit")]
    MissingCommit(Id),
}

/// An active live preview of a task's commit in the source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    /// Repository HEAD before the preview was applied.
    pub original_head: String,
    /// Commit created in the repository by the cherry-pick.
    pub preview_commit: String,
    pub started_at: DateTime<Utc>,
}

/// A previous prompt and what came of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptCycle {
    pub prompt: String,
    /// Change request text, when the cycle was created by a change request.
    pub change_request: Option<String>,
    /// Task spawned to carry out the change request.
    pub successor: Option<Id>,
    pub outcome: CycleOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// One rendered output line kept on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub kind: OutputKind,
    pub text: String,
    /// Replayed from disk after a reconnect rather than observed live.
    #[serde(default)]
    pub historical: bool,
}

/// A unit of agent-performed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "TaskRecord", try_from = "TaskRecord")]
pub struct Task {
    pub id: Id,
    pub prompt: String,
    pub mode: TaskMode,
    pub state: TaskState,
    /// Absolute path to the source repository.
    pub repo_path: String,
    /// Absolute path to the isolated worktree.
    pub workspace_path: String,
    pub branch: String,
    pub base_branch: String,
    pub image_path: Option<String>,
    pub preview: Option<Preview>,
    pub cycles: Vec<PromptCycle>,
    pub predecessor: Option<Id>,
    pub output: Vec<OutputEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            TaskState::Starting => self.mode.first_phase(),
            TaskState::InProgress { phase } | TaskState::Failed { phase, .. } => *phase,
            TaskState::Finished { .. } | TaskState::Merged { .. } => Phase::Done,
        }
    }

    pub fn commit(&self) -> Option<&str> {
        match &self.state {
            TaskState::Finished { commit } => commit.as_deref(),
            TaskState::Merged { commit, .. } => Some(commit),
            _ => None,
        }
    }

    fn transition(&mut self, next: TaskState) -> Result<(), TransitionError> {
        let from = self.status();
        let to = next.status();
        if !from.can_transition_to(to) {
            return Err(TransitionError::Invalid { from, to });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter (or move within) `in_progress` at the given phase.
    pub fn begin_phase(&mut self, phase: Phase) -> Result<(), TransitionError> {
        self.transition(TaskState::InProgress { phase })
    }

    pub fn finish(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Finished { commit: None })
    }

    /// Fail the task at `phase`.
    ///
    /// A task still `starting` passes through `in_progress` first, so the
    /// observed sequence stays on the state machine's edges.
    pub fn fail(&mut self, phase: Phase, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status() == TaskStatus::Starting {
            self.begin_phase(phase)?;
        }
        self.transition(TaskState::Failed {
            phase,
            reason: reason.into(),
        })
    }

    /// Record the commit created in the workspace. Only finished tasks commit.
    pub fn record_commit(&mut self, commit: impl Into<String>) -> Result<(), TransitionError> {
        match &mut self.state {
            TaskState::Finished { commit: slot } => {
                *slot = Some(commit.into());
                self.updated_at = Utc::now();
                Ok(())
            }
            other => Err(TransitionError::Invalid {
                from: other.status(),
                to: TaskStatus::Finished,
            }),
        }
    }

    pub fn mark_merged(&mut self, merged_at: DateTime<Utc>) -> Result<(), TransitionError> {
        let commit = self
            .commit()
            .map(str::to_string)
            .ok_or_else(|| TransitionError::MissingCommit(self.id.clone()))?;
        self.transition(TaskState::Merged { commit, merged_at })
    }

    /// Append an output line, keeping at most `limit` entries.
    pub fn push_output(&mut self, entry: OutputEntry, limit: usize) {
        self.output.push(entry);
        if self.output.len() > limit {
            let excess = self.output.len() - limit;
            self.output.drain(..excess);
        }
    }
}

/// Flat persisted form of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Id,
    pub prompt: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub phase: Phase,
    pub repo_path: String,
    pub workspace_path: String,
    pub branch: String,
    pub base_branch: String,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub preview: Option<Preview>,
    #[serde(default)]
    pub cycles: Vec<PromptCycle>,
    #[serde(default)]
    pub predecessor: Option<Id>,
    #[serde(default)]
    pub output: Vec<OutputEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("invalid task record {id}: {reason}")]
pub struct RecordError {
    pub id: Id,
    pub reason: String,
}

impl From<Task> for TaskRecord {
    fn from(task: Task) -> Self {
        let status = task.status();
        let phase = task.phase();
        let (commit, merged_at, failure) = match task.state {
            TaskState::Starting | TaskState::InProgress { .. } => (None, None, None),
            TaskState::Finished { commit } => (commit, None, None),
            TaskState::Failed { reason, .. } => (None, None, Some(reason)),
            TaskState::Merged { commit, merged_at } => (Some(commit), Some(merged_at), None),
        };
        Self {
            id: task.id,
            prompt: task.prompt,
            mode: task.mode,
            status,
            phase,
            repo_path: task.repo_path,
            workspace_path: task.workspace_path,
            branch: task.branch,
            base_branch: task.base_branch,
            image_path: task.image_path,
            commit,
            merged_at,
            failure,
            preview: task.preview,
            cycles: task.cycles,
            predecessor: task.predecessor,
            output: task.output,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

impl TryFrom<TaskRecord> for Task {
    type Error = RecordError;

    fn try_from(record: TaskRecord) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| RecordError {
            id: record.id.clone(),
            reason: reason.to_string(),
        };
        let state = match record.status {
            TaskStatus::Starting => TaskState::Starting,
            TaskStatus::InProgress => TaskState::InProgress {
                phase: record.phase,
            },
            TaskStatus::Finished => TaskState::Finished {
                commit: record.commit.clone(),
            },
            TaskStatus::Failed => TaskState::Failed {
                phase: record.phase,
                reason: record
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            },
            TaskStatus::Merged => TaskState::Merged {
                commit: record
                    .commit
                    .clone()
                    .ok_or_else(|| invalid("merged task without commit"))?,
                merged_at: record
                    .merged_at
                    .ok_or_else(|| invalid("merged task without merge timestamp"))?,
            },
        };
        Ok(Self {
            id: record.id,
            prompt: record.prompt,
            mode: record.mode,
            state,
            repo_path: record.repo_path,
            workspace_path: record.workspace_path,
            branch: record.branch,
            base_branch: record.base_branch,
            image_path: record.image_path,
            preview: record.preview,
            cycles: record.cycles,
            predecessor: record.predecessor,
            output: record.output,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// A live agent subprocess, persisted so a restarted daemon can adopt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRegistration {
    pub pid: u32,
    pub task_id: Id,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub working_dir: String,
    pub prompt: String,
    pub stdin_path: String,
    pub stdout_path: String,
    pub stderr_path: String,
    /// File the wrapper writes the agent's exit status to.
    pub exit_code_path: String,
    /// Wrapper script that launched the agent.
    pub script_path: String,
}
