//! Commit management: staging, internal-artefact exclusion, pushing, and
//! history rewriting for the PR step.
//!
//! Agents run with full write access inside the worktree, so internal
//! scratch files (`.cadre/`, `task-*.md`, synced agent instruction files)
//! can end up staged or even committed. `commit_all` unstages them before
//! every commit; `strip_cadre_files` rewrites the branch history to drop
//! them entirely while preserving authorship of the surviving commits.

use crate::errors::WorktreeError;
use crate::worktree::WorktreeManager;
use std::path::Path;
use tracing::{debug, info};

/// Patterns that never belong in a commit, beyond the per-run synced
/// agent instruction files.
const INTERNAL_PATTERNS: &[&str] = &[".cadre/", "task-*.md"];

/// Result of a history rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct StripSummary {
    /// Commits replayed and kept.
    pub kept: usize,
    /// Commits dropped because nothing non-internal remained.
    pub dropped: usize,
}

/// Stages, commits (optionally signed, always `--no-verify`), pushes and
/// rewrites commits in a single worktree.
#[derive(Debug, Clone)]
pub struct CommitManager {
    sign: bool,
}

impl CommitManager {
    pub fn new(sign: bool) -> Self {
        Self { sign }
    }

    fn internal_patterns<'a>(synced_agent_files: &'a [String]) -> Vec<&'a str> {
        INTERNAL_PATTERNS
            .iter()
            .copied()
            .chain(synced_agent_files.iter().map(|s| s.as_str()))
            .collect()
    }

    /// Stage all changes, unstage internal artefacts, and commit.
    /// Returns the commit sha, or `None` when nothing remained to commit.
    pub async fn commit_all(
        &self,
        manager: &WorktreeManager,
        worktree: &Path,
        message: &str,
        synced_agent_files: &[String],
    ) -> Result<Option<String>, WorktreeError> {
        manager.git(worktree, &["add", "-A"]).await?;

        // Each pattern is restored individually: a pathspec miss on one
        // must not abort the rest.
        for pattern in Self::internal_patterns(synced_agent_files) {
            let _ = manager
                .git_unchecked(worktree, &["reset", "-q", "HEAD", "--", pattern])
                .await;
        }

        let staged = manager
            .git_unchecked(worktree, &["diff", "--cached", "--quiet"])
            .await?;
        if staged.status.success() {
            debug!("nothing to commit after internal files were unstaged");
            return Ok(None);
        }

        let mut args = vec!["commit", "-m", message, "--no-verify"];
        if self.sign {
            args.push("-S");
        }
        manager.git(worktree, &args).await?;

        let sha = manager
            .git(worktree, &["rev-parse", "HEAD"])
            .await
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())?;
        info!(sha = %sha, "committed agent changes");
        Ok(Some(sha))
    }

    /// Push the branch, setting the upstream.
    pub async fn push(
        &self,
        manager: &WorktreeManager,
        worktree: &Path,
        branch: &str,
    ) -> Result<(), WorktreeError> {
        manager
            .git(worktree, &["push", "-u", manager.remote(), branch, "--no-verify"])
            .await?;
        Ok(())
    }

    /// Squash everything since `base_commit` into a single conventional
    /// commit, with internal artefacts removed from the result. The
    /// alternative final-history mode to `strip_cadre_files` for the PR
    /// step. Returns the squashed commit sha, or `None` when nothing
    /// non-internal survived.
    pub async fn squash(
        &self,
        manager: &WorktreeManager,
        worktree: &Path,
        base_commit: &str,
        message: &str,
        synced_agent_files: &[String],
    ) -> Result<Option<String>, WorktreeError> {
        manager
            .git(worktree, &["reset", "--soft", base_commit])
            .await?;

        // Internal files that were committed along the way are now staged;
        // drop them from the index and working tree, pattern by pattern.
        for pattern in Self::internal_patterns(synced_agent_files) {
            let _ = manager
                .git_unchecked(
                    worktree,
                    &["rm", "-r", "-f", "-q", "--cached", "--ignore-unmatch", "--", pattern],
                )
                .await;
        }

        let staged = manager
            .git_unchecked(worktree, &["diff", "--cached", "--quiet"])
            .await?;
        if staged.status.success() {
            debug!("nothing non-internal to squash");
            return Ok(None);
        }

        let mut args = vec!["commit", "-m", message, "--no-verify"];
        if self.sign {
            args.push("-S");
        }
        manager.git(worktree, &args).await?;

        let sha = manager
            .git(worktree, &["rev-parse", "HEAD"])
            .await
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())?;
        info!(sha = %sha, "squashed branch into one commit");
        Ok(Some(sha))
    }

    /// Rewrite every commit between `base_commit` and HEAD, removing
    /// internal artefacts. Each original commit is replayed with
    /// `cherry-pick --no-commit`; surviving content is committed with
    /// `-C <sha>` so author, date and message are preserved. Commits with
    /// nothing non-internal left are dropped.
    pub async fn strip_cadre_files(
        &self,
        manager: &WorktreeManager,
        worktree: &Path,
        base_commit: &str,
        synced_agent_files: &[String],
    ) -> Result<StripSummary, WorktreeError> {
        let range = format!("{base_commit}..HEAD");
        let shas = manager
            .git(worktree, &["rev-list", "--reverse", &range])
            .await
            .map(|o| WorktreeManager::stdout_lines(&o))?;
        if shas.is_empty() {
            return Ok(StripSummary { kept: 0, dropped: 0 });
        }

        manager
            .git(worktree, &["reset", "--hard", base_commit])
            .await?;

        let mut summary = StripSummary { kept: 0, dropped: 0 };
        for sha in &shas {
            manager
                .git(worktree, &["cherry-pick", "--no-commit", sha])
                .await?;

            // Remove internal artefacts from the staged index and the
            // working tree, pattern by pattern.
            for pattern in Self::internal_patterns(synced_agent_files) {
                let _ = manager
                    .git_unchecked(
                        worktree,
                        &["rm", "-r", "-f", "-q", "--ignore-unmatch", "--", pattern],
                    )
                    .await;
            }

            let staged = manager
                .git_unchecked(worktree, &["diff", "--cached", "--quiet"])
                .await?;
            if staged.status.success() {
                // Nothing non-internal survived; drop the commit entirely.
                let _ = manager
                    .git_unchecked(worktree, &["cherry-pick", "--quit"])
                    .await;
                manager.git(worktree, &["reset", "--hard", "HEAD"]).await?;
                summary.dropped += 1;
                debug!(sha = %sha, "dropped all-internal commit");
                continue;
            }

            let mut args = vec!["commit", "-C", sha.as_str(), "--no-verify"];
            if self.sign {
                args.push("-S");
            }
            manager.git(worktree, &args).await?;
            summary.kept += 1;
        }

        info!(kept = summary.kept, dropped = summary.dropped, "stripped internal files from history");
        Ok(summary)
    }
}
