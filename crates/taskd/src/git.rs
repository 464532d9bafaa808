//! Git operations for task workspaces.
//!
//! Every call shells out to the `git` CLI with discrete arguments. Workspaces
//! are linked worktrees on their own branch; merges happen in a temporary
//! clone so the shared repository never enters a conflicted state.

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};

use task_core::prompt::sanitize_branch_name;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Namespace for refs pushed back from merge clones.
const STAGING_REF_PREFIX: &str = "refs/taskd/merge/";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("conflict merging {branch}: {}", .paths.join(", "))]
    Conflict { branch: String, paths: Vec<String> },
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    debug!(dir = %dir.display(), ?args, "git");
    Ok(Command::new("git").args(args).current_dir(dir).output()?)
}

/// Run git and require success, returning trimmed stdout.
fn git_ok(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Reject relative paths and `..` components.
pub fn check_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(GitError::InvalidPath(format!(
            "{} is not absolute",
            path.display()
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(GitError::InvalidPath(format!(
            "{} contains '..'",
            path.display()
        )));
    }
    Ok(())
}

/// Validate a source repository and return its canonical top-level path.
pub fn validate_repo(path: &Path) -> Result<PathBuf> {
    check_path(path)?;
    if !path.is_dir() {
        return Err(GitError::NotARepo(path.display().to_string()));
    }
    let output = git(path, &["rev-parse", "--show-toplevel"])?;
    if !output.status.success() {
        return Err(GitError::NotARepo(path.display().to_string()));
    }
    let top = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    let top = PathBuf::from(top.trim());
    Ok(top.canonicalize().unwrap_or(top))
}

/// Get the repository directory name.
pub fn repo_name(repo: &Path) -> String {
    repo.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Branch checked out in `dir`, or `None` when HEAD is detached.
pub fn current_branch(dir: &Path) -> Result<Option<String>> {
    let output = git(dir, &["symbolic-ref", "--quiet", "--short", "HEAD"])?;
    if !output.status.success() {
        return Ok(None);
    }
    let branch = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(Some(branch.trim().to_string()))
}

/// Branch name, or the HEAD commit when detached.
pub fn current_base(dir: &Path) -> Result<String> {
    match current_branch(dir)? {
        Some(branch) => Ok(branch),
        None => head_commit(dir),
    }
}

pub fn head_commit(dir: &Path) -> Result<String> {
    git_ok(dir, &["rev-parse", "HEAD"])
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = git(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

/// Location and branch of a task workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub name: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Derive the workspace name, branch and path for a task.
///
/// Workspaces live under `<data_dir>/worktrees/<repo>/<slug>-<short-id>`.
pub fn workspace_layout(
    data_dir: &Path,
    repo: &Path,
    branch_prefix: &str,
    slug: &str,
    short_id: &str,
) -> Result<WorkspaceLayout> {
    let name = sanitize_branch_name(&format!("{slug}-{short_id}"));
    if name.is_empty() || name.contains("..") || name.starts_with('.') {
        return Err(GitError::InvalidPath(format!("invalid workspace name: {name}")));
    }
    let path = data_dir.join("worktrees").join(repo_name(repo)).join(&name);
    check_path(&path)?;
    Ok(WorkspaceLayout {
        branch: format!("{branch_prefix}{name}"),
        name,
        path,
    })
}

/// Create an isolated worktree on a fresh branch cut from `base`.
///
/// The source repository's working tree is not touched.
pub fn create_workspace(repo: &Path, layout: &WorkspaceLayout, base: &str) -> Result<()> {
    check_path(&layout.path)?;
    if layout.path.exists() {
        return Err(GitError::InvalidPath(format!(
            "workspace {} already exists",
            layout.path.display()
        )));
    }
    if let Some(parent) = layout.path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GitError::CommandFailed(format!("failed to create parent directory: {e}"))
        })?;
    }

    let path = layout.path.to_string_lossy();
    git_ok(
        repo,
        &["worktree", "add", "-b", &layout.branch, path.as_ref(), base],
    )?;
    info!(branch = %layout.branch, path = %layout.path.display(), base, "created workspace");
    Ok(())
}

/// Remove a workspace and delete its branch.
///
/// Branch deletion is best-effort. A workspace directory that is already gone
/// is pruned instead of treated as an error.
pub fn remove_workspace(repo: &Path, workspace: &Path, branch: Option<&str>) -> Result<()> {
    let path = workspace.to_string_lossy();
    let output = git(repo, &["worktree", "remove", "--force", path.as_ref()])?;
    if !output.status.success() {
        if workspace.exists() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed(format!(
                "git worktree remove --force: {}",
                stderr.trim()
            )));
        }
        git_ok(repo, &["worktree", "prune"])?;
    }

    if let Some(branch) = branch {
        if let Err(e) = git_ok(repo, &["branch", "-D", branch]) {
            warn!(branch, error = %e, "failed to delete workspace branch");
        }
    }
    info!(path = %workspace.display(), "removed workspace");
    Ok(())
}

/// Stage everything and commit, creating an empty commit when nothing changed.
///
/// Returns the new HEAD commit id.
pub fn commit(workspace: &Path, message: &str) -> Result<String> {
    git_ok(workspace, &["add", "-A"])?;
    git_ok(workspace, &["commit", "--allow-empty", "-m", message])?;
    head_commit(workspace)
}

/// Check if the working tree is clean (no uncommitted changes).
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    Ok(git_ok(dir, &["status", "--porcelain"])?.is_empty())
}

/// Paths with unresolved conflicts.
pub fn conflicted_paths(dir: &Path) -> Result<Vec<String>> {
    let out = git_ok(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Diff of `head` against its merge base with `base`.
pub fn diff_against_base(dir: &Path, base: &str, head: &str) -> Result<String> {
    git_ok(dir, &["diff", &format!("{base}...{head}")])
}

// --- Preview ---

/// Apply `commit` onto the repository's checked-out branch for live preview.
///
/// Requires a clean tree. On conflict the cherry-pick is aborted and
/// [`GitError::Conflict`] names `branch` and the conflicting paths.
/// Returns the new HEAD commit id.
pub fn cherry_pick(repo: &Path, commit: &str, branch: &str) -> Result<String> {
    if !is_working_tree_clean(repo)? {
        return Err(GitError::DirtyWorkingTree(
            "cannot preview with uncommitted changes".to_string(),
        ));
    }

    let output = git(repo, &["cherry-pick", "--keep-redundant-commits", commit])?;
    if !output.status.success() {
        let paths = conflicted_paths(repo).unwrap_or_default();
        let _ = git(repo, &["cherry-pick", "--abort"]);
        if paths.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed(format!(
                "git cherry-pick {commit}: {}",
                stderr.trim()
            )));
        }
        return Err(GitError::Conflict {
            branch: branch.to_string(),
            paths,
        });
    }
    head_commit(repo)
}

/// Undo a preview.
///
/// If the preview commit is still HEAD the branch is reset to
/// `original_head`; otherwise the preview commit is reverted.
pub fn revert_preview(repo: &Path, original_head: &str, preview_commit: &str) -> Result<()> {
    if !is_working_tree_clean(repo)? {
        return Err(GitError::DirtyWorkingTree(
            "cannot stop preview with uncommitted changes".to_string(),
        ));
    }

    if head_commit(repo)? == preview_commit {
        git_ok(repo, &["reset", "--hard", original_head])?;
        return Ok(());
    }

    let output = git(repo, &["revert", "--no-edit", preview_commit])?;
    if !output.status.success() {
        let paths = conflicted_paths(repo).unwrap_or_default();
        let _ = git(repo, &["revert", "--abort"]);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if paths.is_empty() {
            return Err(GitError::CommandFailed(format!(
                "git revert {preview_commit}: {}",
                stderr.trim()
            )));
        }
        return Err(GitError::Conflict {
            branch: current_base(repo).unwrap_or_default(),
            paths,
        });
    }
    Ok(())
}

// --- Merge ---

/// A merge performed in a temporary clone.
///
/// The clone is deleted when this value is dropped, whatever the outcome.
#[derive(Debug)]
pub struct MergeCheckout {
    dir: TempDir,
    repo: PathBuf,
    branch: String,
    target: String,
    /// Target commit the clone started from.
    target_commit: String,
    conflicts: Vec<String>,
}

impl MergeCheckout {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The task branch's changes relative to the target it is merged into.
    pub fn task_diff(&self) -> Result<String> {
        diff_against_base(
            self.dir.path(),
            &self.target_commit,
            &format!("origin/{}", self.branch),
        )
    }

    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }

    pub fn is_conflicted(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn conflict_error(&self) -> GitError {
        GitError::Conflict {
            branch: self.branch.clone(),
            paths: self.conflicts.clone(),
        }
    }

    /// Publish the merge result to the shared repository.
    ///
    /// The clone's HEAD is pushed to a staging ref, the target branch is
    /// fast-forwarded to it and the staging ref is deleted. Returns the
    /// merged commit id.
    pub fn complete(self) -> Result<String> {
        let clone = self.dir.path();
        let remaining = conflicted_paths(clone)?;
        if !remaining.is_empty() || clone.join(".git").join("MERGE_HEAD").exists() {
            return Err(GitError::Conflict {
                branch: self.branch.clone(),
                paths: remaining,
            });
        }

        let merged = head_commit(clone)?;
        let staging = format!("{STAGING_REF_PREFIX}{}", sanitize_branch_name(&self.branch));
        git_ok(clone, &["push", "--force", "origin", &format!("HEAD:{staging}")])?;

        let result = fast_forward(&self.repo, &self.target, &staging, &merged, &self.target_commit);
        if let Err(e) = git_ok(&self.repo, &["update-ref", "-d", &staging]) {
            warn!(staging, error = %e, "failed to delete staging ref");
        }
        result?;

        info!(branch = %self.branch, target = %self.target, commit = %merged, "merged task branch");
        Ok(merged)
    }
}

/// Move `target` in the shared repository to `merged`.
fn fast_forward(repo: &Path, target: &str, staging: &str, merged: &str, expected: &str) -> Result<()> {
    if current_branch(repo)?.as_deref() == Some(target) {
        git_ok(repo, &["merge", "--ff-only", staging])?;
    } else {
        git_ok(
            repo,
            &["update-ref", &format!("refs/heads/{target}"), merged, expected],
        )?;
    }
    Ok(())
}

/// Copy the committer identity from the source repository into the clone.
fn inherit_identity(repo: &Path, clone: &Path) -> Result<()> {
    for (key, fallback) in [("user.name", "taskd"), ("user.email", "taskd@localhost")] {
        let value = git_ok(repo, &["config", "--get", key]).unwrap_or_default();
        let value = if value.is_empty() { fallback.to_string() } else { value };
        git_ok(clone, &["config", key, &value])?;
    }
    Ok(())
}

/// Clone the repository and merge `branch` into `target` with `--no-ff`.
///
/// A conflicting merge is left in progress inside the clone so a resolver can
/// work on it; check [`MergeCheckout::is_conflicted`].
pub fn begin_merge(repo: &Path, branch: &str, target: &str) -> Result<MergeCheckout> {
    let dir = tempfile::Builder::new().prefix("taskd-merge-").tempdir()?;
    let clone = dir.path();
    let repo_str = repo.to_string_lossy();
    let clone_str = clone.to_string_lossy();
    git_ok(
        repo,
        &["clone", "--quiet", "--branch", target, repo_str.as_ref(), clone_str.as_ref()],
    )?;
    inherit_identity(repo, clone)?;
    let target_commit = head_commit(clone)?;

    let message = format!("Merge task branch {branch}");
    let output = git(
        clone,
        &["merge", "--no-ff", "-m", &message, &format!("origin/{branch}")],
    )?;
    let conflicts = if output.status.success() {
        Vec::new()
    } else {
        let paths = conflicted_paths(clone)?;
        if paths.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed(format!(
                "git merge {branch}: {}",
                stderr.trim()
            )));
        }
        warn!(branch, target, paths = ?paths, "merge conflict in temporary clone");
        paths
    };

    Ok(MergeCheckout {
        dir,
        repo: repo.to_path_buf(),
        branch: branch.to_string(),
        target: target.to_string(),
        target_commit,
        conflicts,
    })
}

/// Stage everything in `dir` and commit the in-progress merge.
pub fn conclude_merge(dir: &Path, message: &str) -> Result<String> {
    git_ok(dir, &["add", "-A"])?;
    let remaining = conflicted_paths(dir)?;
    if !remaining.is_empty() {
        return Err(GitError::Conflict {
            branch: current_branch(dir)?.unwrap_or_default(),
            paths: remaining,
        });
    }
    git_ok(dir, &["commit", "--no-edit", "-m", message])?;
    head_commit(dir)
}

/// Delete staging refs left behind by an interrupted merge.
pub fn remove_staging_refs(repo: &Path) -> Result<usize> {
    let refs = git_ok(
        repo,
        &["for-each-ref", "--format=%(refname)", STAGING_REF_PREFIX],
    )?;
    let mut removed = 0;
    for name in refs.lines().filter(|l| !l.is_empty()) {
        git_ok(repo, &["update-ref", "-d", name])?;
        removed += 1;
    }
    Ok(removed)
}
