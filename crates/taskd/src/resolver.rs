//! Agent-driven merge conflict resolution.
//!
//! Runs the agent inside the temporary merge clone with a directive prompt,
//! then checks that no conflict remains and commits the merge there. The
//! shared repository is only touched afterwards, by
//! [`MergeCheckout::complete`](crate::git::MergeCheckout::complete).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use task_core::prompt::{conflict_resolution_prompt, truncate_for_prompt};
use task_core::stream::parse_line;
use task_core::{Config, Id, StreamLine};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::git::{self, GitError, MergeCheckout};
use crate::registry::signal_group;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Bytes of agent stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent command not found: {0}")]
    AgentNotFound(String),
    #[error("resolver agent failed (exit code {code:?}): {detail}")]
    AgentFailed { code: Option<i32>, detail: String },
    #[error("resolver timed out after {0} seconds")]
    TimedOut(u64),
    #[error("conflict markers remain in: {}", .0.join(", "))]
    MarkersRemain(Vec<String>),
    #[error("resolver task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, ResolverError>;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub agent_bin: String,
    pub agent_args: Vec<String>,
    pub timeout: Duration,
    /// Cap on the task diff embedded in the prompt.
    pub diff_max_bytes: usize,
}

impl ResolverConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_bin: config.agent_bin.clone(),
            agent_args: config.agent_command_args(),
            timeout: Duration::from_secs(config.resolver_timeout_sec),
            diff_max_bytes: config.resolver_diff_max_bytes,
        }
    }
}

/// What the resolver needs to know about the task being merged.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub task_id: Id,
    pub task_prompt: String,
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    config: ResolverConfig,
}

/// Files among `paths` that still contain conflict markers.
fn files_with_markers(dir: &Path, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|path| match std::fs::read_to_string(dir.join(path)) {
            Ok(content) => content
                .lines()
                .any(|l| l.starts_with("<<<<<<< ") || l.starts_with(">>>>>>> ")),
            Err(_) => false,
        })
        .cloned()
        .collect()
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve the conflicts in `checkout` and commit the merge in the clone.
    ///
    /// Returns the merge commit id inside the clone.
    pub async fn resolve(&self, checkout: &MergeCheckout, request: &ResolveRequest) -> Result<String> {
        let clone: PathBuf = checkout.path().to_path_buf();
        let conflicts = checkout.conflicts().to_vec();
        info!(
            task_id = %request.task_id,
            branch = checkout.branch(),
            files = conflicts.len(),
            "resolving merge conflicts with agent"
        );

        let diff = match checkout.task_diff() {
            Ok(diff) => diff,
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "failed to diff task branch");
                String::new()
            }
        };
        let prompt = conflict_resolution_prompt(
            &request.task_prompt,
            checkout.branch(),
            &conflicts,
            &truncate_for_prompt(&diff, self.config.diff_max_bytes),
        );

        self.run_agent(&clone, &prompt, &request.task_id).await?;

        let message = format!("Resolve merge conflicts for task {}", request.task_id);
        let commit = tokio::task::spawn_blocking(move || -> Result<String> {
            let remaining = files_with_markers(&clone, &conflicts);
            if !remaining.is_empty() {
                return Err(ResolverError::MarkersRemain(remaining));
            }
            Ok(git::conclude_merge(&clone, &message)?)
        })
        .await
        .map_err(|e| ResolverError::Join(e.to_string()))??;

        info!(task_id = %request.task_id, %commit, "merge conflicts resolved");
        Ok(commit)
    }

    async fn run_agent(&self, dir: &Path, prompt: &str, task_id: &Id) -> Result<()> {
        let mut child = Command::new(&self.config.agent_bin)
            .args(&self.config.agent_args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ResolverError::AgentNotFound(self.config.agent_bin.clone())
                } else {
                    ResolverError::Io(e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if stdin.write_all(prompt.as_bytes()).await.is_ok() {
                    let _ = stdin.shutdown().await;
                }
            });
        }

        let stdout_task = child.stdout.take().map(|stdout| {
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    for item in parse_line(&line) {
                        if let StreamLine::ToolUse { summary, .. } = item {
                            debug!(%task_id, %summary, "resolver tool use");
                        }
                    }
                }
            })
        });
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let started = Instant::now();
        let status = loop {
            let remaining = self.config.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(%task_id, timeout_sec = self.config.timeout.as_secs(), "resolver timed out; killing");
                if let Some(pid) = child.id() {
                    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                        warn!(%task_id, error = %e, "failed to kill resolver process group");
                    }
                }
                let _ = child.kill().await;
                return Err(ResolverError::TimedOut(self.config.timeout.as_secs()));
            }

            tokio::select! {
                result = child.wait() => break result?,
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(%task_id, elapsed_sec = started.elapsed().as_secs(), "resolver still running");
                }
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            let text = String::from_utf8_lossy(&stderr);
            let text = text.trim();
            let start = text
                .char_indices()
                .rev()
                .nth(STDERR_TAIL_BYTES)
                .map_or(0, |(idx, _)| idx);
            return Err(ResolverError::AgentFailed {
                code: status.code(),
                detail: text[start..].to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::{commit_all, setup_test_repo};
    use tempfile::TempDir;

    struct Conflict {
        _repo_dir: TempDir,
        _data: TempDir,
        repo: PathBuf,
        branch: String,
    }

    /// A repository whose task branch conflicts with `main` on README.md.
    fn conflicting_repo() -> Conflict {
        let repo_dir = setup_test_repo();
        let repo = git::validate_repo(repo_dir.path()).unwrap();
        let data = TempDir::new().unwrap();
        let layout = git::workspace_layout(data.path(), &repo, "task/", "clash", "0000beef").unwrap();
        git::create_workspace(&repo, &layout, "main").unwrap();
        std::fs::write(layout.path.join("README.md"), "# From task\n").unwrap();
        git::commit(&layout.path, "task edit").unwrap();
        std::fs::write(repo.join("README.md"), "# From upstream\n").unwrap();
        commit_all(&repo, "upstream edit");
        Conflict {
            _repo_dir: repo_dir,
            _data: data,
            repo,
            branch: layout.branch,
        }
    }

    fn resolver(dir: &Path, body: &str, timeout: Duration) -> ConflictResolver {
        let agent = dir.join("resolver-agent.sh");
        std::fs::write(&agent, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ConflictResolver::new(ResolverConfig {
            agent_bin: agent.display().to_string(),
            agent_args: Vec::new(),
            timeout,
            diff_max_bytes: 10_000,
        })
    }

    fn request() -> ResolveRequest {
        ResolveRequest {
            task_id: Id::new(),
            task_prompt: "reword the readme".to_string(),
        }
    }

    #[test]
    fn marker_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "<<<<<<< HEAD\nx\n=======\ny\n>>>>>>> b\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "clean\n=======\n").unwrap();
        let found = files_with_markers(
            dir.path(),
            &["a.txt".to_string(), "b.txt".to_string(), "gone.txt".to_string()],
        );
        assert_eq!(found, vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn agent_resolution_is_committed_and_published() {
        let conflict = conflicting_repo();
        let tools = TempDir::new().unwrap();
        let resolver = resolver(
            tools.path(),
            "cat > /dev/null\nprintf '# Merged\\n' > README.md\ngit add README.md",
            Duration::from_secs(30),
        );

        let checkout = git::begin_merge(&conflict.repo, &conflict.branch, "main").unwrap();
        assert!(checkout.is_conflicted());
        resolver.resolve(&checkout, &request()).await.unwrap();
        let merged = checkout.complete().unwrap();

        assert_eq!(git::head_commit(&conflict.repo).unwrap(), merged);
        assert_eq!(
            std::fs::read_to_string(conflict.repo.join("README.md")).unwrap(),
            "# Merged\n"
        );
    }

    #[tokio::test]
    async fn agent_that_leaves_markers_fails() {
        let conflict = conflicting_repo();
        let tools = TempDir::new().unwrap();
        let resolver = resolver(tools.path(), "cat > /dev/null", Duration::from_secs(30));
        let checkout = git::begin_merge(&conflict.repo, &conflict.branch, "main").unwrap();
        let err = resolver.resolve(&checkout, &request()).await.unwrap_err();
        assert!(matches!(err, ResolverError::MarkersRemain(ref paths) if paths == &["README.md".to_string()]));
    }

    #[tokio::test]
    async fn failing_agent_reports_stderr() {
        let conflict = conflicting_repo();
        let tools = TempDir::new().unwrap();
        let resolver = resolver(
            tools.path(),
            "cat > /dev/null\necho 'model overloaded' >&2\nexit 4",
            Duration::from_secs(30),
        );
        let checkout = git::begin_merge(&conflict.repo, &conflict.branch, "main").unwrap();
        match resolver.resolve(&checkout, &request()).await {
            Err(ResolverError::AgentFailed { code, detail }) => {
                assert_eq!(code, Some(4));
                assert!(detail.contains("model overloaded"));
            }
            other => panic!("expected agent failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let conflict = conflicting_repo();
        let tools = TempDir::new().unwrap();
        let resolver = resolver(tools.path(), "sleep 30", Duration::from_millis(500));
        let checkout = git::begin_merge(&conflict.repo, &conflict.branch, "main").unwrap();
        assert!(matches!(
            resolver.resolve(&checkout, &request()).await,
            Err(ResolverError::TimedOut(_))
        ));
    }

    #[tokio::test]
    async fn missing_agent_is_reported() {
        let conflict = conflicting_repo();
        let resolver = ConflictResolver::new(ResolverConfig {
            agent_bin: "/nonexistent/agent".to_string(),
            agent_args: Vec::new(),
            timeout: Duration::from_secs(5),
            diff_max_bytes: 100,
        });
        let checkout = git::begin_merge(&conflict.repo, &conflict.branch, "main").unwrap();
        assert!(matches!(
            resolver.resolve(&checkout, &request()).await,
            Err(ResolverError::AgentNotFound(_))
        ));
    }
}
