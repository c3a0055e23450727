//! Typed error hierarchy for the cadre orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `CadreError` — pipeline and fleet-level failures
//! - `QueueError` — task-queue construction and transition failures
//! - `WorktreeError` — git worktree, merge and rebase failures
//!
//! Expected failures (agent timeouts, gate rejections, merge conflicts) are
//! carried as values inside `AgentResult`/`PhaseResult`/`IssueResult`; only
//! cancellation and programming errors propagate as `Err` across component
//! boundaries.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors crossing phase or issue boundaries.
#[derive(Debug, Error)]
pub enum CadreError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Fleet budget exceeded")]
    BudgetExceeded,

    #[error("Gate before phase {phase} failed: {reason}")]
    GateFailed { phase: u8, reason: String },

    #[error("Phase {phase} ({name}) failed: {message}")]
    PhaseFailed {
        phase: u8,
        name: &'static str,
        message: String,
    },

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CadreError {
    /// True only for cooperative cancellation, the sole error kind allowed
    /// to unwind past an issue boundary.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from the dependency-aware task queue. Unknown ids and cycles are
/// programming errors in the plan, not runtime conditions to retry.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Cycle detected in session dependencies involving: {id}")]
    CycleDetected { id: String },

    #[error("Session {session} depends on unknown session {dependency}")]
    UnknownDependency { session: String, dependency: String },

    #[error("Unknown session id: {id}")]
    UnknownSession { id: String },

    #[error("Failed to parse implementation plan: {message}")]
    PlanParse { message: String },
}

/// Structured descriptor for a dependency-branch merge conflict. Written to
/// `.cadre/issues/<N>/dep-conflict.json` and carried in `WorktreeError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflictInfo {
    pub conflicted_files: Vec<String>,
    pub deps_branch: String,
    pub issue_branch: String,
}

/// Errors from worktree provisioning, merging and rebasing.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Remote branch {branch} not found; cannot resume issue {issue}")]
    RemoteBranchMissing { issue: u64, branch: String },

    #[error(
        "Merge conflict merging {} into {}: {} file(s) conflicted",
        info.deps_branch,
        info.issue_branch,
        info.conflicted_files.len()
    )]
    MergeConflict { info: MergeConflictInfo },

    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Failed to open repository at {path}: {source}")]
    RepoOpen {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Cannot resolve base commit for {base}: {source}")]
    BaseCommit {
        base: String,
        #[source]
        source: git2::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
