//! Paused-rebase protocol.
//!
//! Integration rebases an issue branch onto its base in three steps that
//! may span separate process lifetimes:
//!
//! 1. `rebase_start` — detects a rebase left paused by a prior run (the
//!    git-dir contains `rebase-merge/` or `rebase-apply/`) and reports the
//!    conflicted files without fetching or rebasing again. Otherwise it
//!    fetches and starts the rebase, leaving it paused on conflict.
//! 2. `rebase_continue` — after an agent has edited the conflicted files,
//!    stages everything and continues with `GIT_EDITOR=true`. "No rebase in
//!    progress" counts as success: the agent already finished it.
//! 3. `rebase_abort` — restores the pre-rebase state.

use crate::errors::WorktreeError;
use crate::worktree::WorktreeManager;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of `rebase_start`.
#[derive(Debug, Clone, PartialEq)]
pub enum RebaseStart {
    /// Rebase applied cleanly; nothing to resolve.
    Clean,
    /// Rebase is paused with these files conflicted.
    Conflict { files: Vec<String> },
}

/// Outcome of `rebase_continue`.
#[derive(Debug, Clone, PartialEq)]
pub enum RebaseContinue {
    /// The rebase finished (including the "no rebase in progress" case).
    Completed,
    /// Conflict markers are still present in these files.
    Unresolved { files: Vec<String> },
}

impl WorktreeManager {
    /// Absolute git-dir of a worktree.
    async fn git_dir(&self, worktree: &Path) -> Result<PathBuf, WorktreeError> {
        let output = self
            .git(worktree, &["rev-parse", "--absolute-git-dir"])
            .await?;
        Ok(PathBuf::from(
            String::from_utf8_lossy(&output.stdout).trim(),
        ))
    }

    /// True when the worktree's git-dir shows a paused rebase.
    pub async fn rebase_in_progress(&self, worktree: &Path) -> Result<bool, WorktreeError> {
        let git_dir = self.git_dir(worktree).await?;
        Ok(git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists())
    }

    /// Start (or re-detect) a rebase of the worktree branch onto `onto`.
    pub async fn rebase_start(
        &self,
        worktree: &Path,
        onto: &str,
    ) -> Result<RebaseStart, WorktreeError> {
        if self.rebase_in_progress(worktree).await? {
            // A prior run left the rebase paused; report state as-is.
            let files = self.conflicted_files(worktree).await?;
            info!(files = files.len(), "found paused rebase from a prior run");
            return Ok(RebaseStart::Conflict { files });
        }

        // Fetch is best-effort: a repository without the remote still
        // rebases onto local refs.
        if let Ok(out) = self.git_unchecked(worktree, &["fetch", self.remote()]).await
            && !out.status.success()
        {
            debug!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "fetch before rebase failed; continuing with local refs"
            );
        }

        let rebase = self.git_unchecked(worktree, &["rebase", onto]).await?;
        if rebase.status.success() {
            return Ok(RebaseStart::Clean);
        }

        let files = self.conflicted_files(worktree).await?;
        if files.is_empty() {
            // Not a content conflict; surface the git failure.
            return Err(WorktreeError::GitCommand {
                command: format!("rebase {onto}"),
                stderr: String::from_utf8_lossy(&rebase.stderr).trim().to_string(),
            });
        }
        info!(files = files.len(), "rebase paused on conflicts");
        Ok(RebaseStart::Conflict { files })
    }

    /// Stage everything and continue a paused rebase.
    pub async fn rebase_continue(
        &self,
        worktree: &Path,
    ) -> Result<RebaseContinue, WorktreeError> {
        self.git(worktree, &["add", "-A"]).await?;

        let output = tokio::process::Command::new("git")
            .args(["rebase", "--continue"])
            .env("GIT_EDITOR", "true")
            .current_dir(worktree)
            .output()
            .await
            .map_err(WorktreeError::Io)?;

        if output.status.success() {
            return Ok(RebaseContinue::Completed);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        let stdout = String::from_utf8_lossy(&output.stdout).to_lowercase();
        if stderr.contains("no rebase in progress") || stdout.contains("no rebase in progress") {
            // The agent already ran the continue itself.
            return Ok(RebaseContinue::Completed);
        }

        let files = self.conflicted_files(worktree).await?;
        if !files.is_empty() {
            return Ok(RebaseContinue::Unresolved { files });
        }
        Err(WorktreeError::GitCommand {
            command: "rebase --continue".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Abort a paused rebase, restoring the pre-rebase state.
    pub async fn rebase_abort(&self, worktree: &Path) -> Result<(), WorktreeError> {
        self.git(worktree, &["rebase", "--abort"]).await?;
        Ok(())
    }
}
