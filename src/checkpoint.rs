//! Durable checkpoint stores for fleet and per-issue progress.
//!
//! Both stores serialize to JSON and persist atomically (write `<file>.tmp`,
//! fsync, rename). Every state-changing call persists before returning so a
//! restart resumes from the last observed transition. Persistence is
//! best-effort: an IO error is retried once and then logged; it never aborts
//! the pipeline.

use crate::util::{now_ms, write_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Schema version written into every checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Token subtotals carried inside a per-issue checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSummary {
    pub total: u64,
    #[serde(default)]
    pub by_phase: BTreeMap<String, u64>,
    #[serde(default)]
    pub by_agent: BTreeMap<String, u64>,
}

/// Per-issue progress state, persisted after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    pub version: u32,
    pub issue_number: u64,
    pub current_phase: u8,
    pub current_task: Option<String>,
    #[serde(default)]
    pub completed_phases: Vec<u8>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub failed_tasks: Vec<String>,
    #[serde(default)]
    pub blocked_tasks: Vec<String>,
    #[serde(default)]
    pub phase_outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub token_usage: TokenUsageSummary,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub base_commit: Option<String>,
    pub started_at: u64,
    pub last_checkpoint: u64,
    #[serde(default)]
    pub resume_count: u32,
}

impl CheckpointState {
    fn new(issue_number: u64) -> Self {
        let now = now_ms();
        Self {
            version: CHECKPOINT_VERSION,
            issue_number,
            current_phase: 1,
            current_task: None,
            completed_phases: Vec::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            blocked_tasks: Vec::new(),
            phase_outputs: BTreeMap::new(),
            token_usage: TokenUsageSummary::default(),
            worktree_path: None,
            branch_name: None,
            base_commit: None,
            started_at: now,
            last_checkpoint: now,
            resume_count: 0,
        }
    }
}

/// Handle to one issue's checkpoint file. Exclusively owned by that issue's
/// pipeline; the internal lock only serializes against the persist path.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<CheckpointState>,
}

impl CheckpointStore {
    /// Open an existing checkpoint (bumping `resume_count`) or start fresh.
    /// Returns the store and whether a prior checkpoint was found.
    pub async fn load_or_new(path: PathBuf, issue_number: u64) -> Result<(Self, bool)> {
        let existing = match tokio::fs::read(&path).await {
            Ok(raw) => Some(
                serde_json::from_slice::<CheckpointState>(&raw)
                    .with_context(|| format!("Corrupt checkpoint at {}", path.display()))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read checkpoint {}", path.display()));
            }
        };

        let resumed = existing.is_some();
        let mut state = existing.unwrap_or_else(|| CheckpointState::new(issue_number));
        if resumed {
            state.resume_count += 1;
        }

        let store = Self {
            path,
            state: Mutex::new(state),
        };
        if resumed {
            store.persist().await;
        }
        Ok((store, resumed))
    }

    pub fn snapshot(&self) -> CheckpointState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn issue_number(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .issue_number
    }

    pub fn is_phase_completed(&self, phase: u8) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed_phases
            .contains(&phase)
    }

    /// `(phase, task)` to resume from: the current phase and, within the
    /// implementation phase, the in-flight task if one was recorded.
    pub fn resume_point(&self) -> (u8, Option<String>) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.current_phase, state.current_task.clone())
    }

    pub async fn set_worktree(&self, path: &str, branch: &str, base_commit: &str) {
        self.mutate(|s| {
            s.worktree_path = Some(path.to_string());
            s.branch_name = Some(branch.to_string());
            s.base_commit = Some(base_commit.to_string());
        })
        .await;
    }

    pub async fn begin_phase(&self, phase: u8) {
        self.mutate(|s| {
            s.current_phase = phase;
            s.current_task = None;
        })
        .await;
    }

    pub async fn phase_completed(&self, phase: u8, output_path: Option<&str>) {
        self.mutate(|s| {
            if !s.completed_phases.contains(&phase) {
                s.completed_phases.push(phase);
            }
            if let Some(output) = output_path {
                s.phase_outputs.insert(phase.to_string(), output.to_string());
            }
            s.current_task = None;
        })
        .await;
    }

    pub fn phase_output(&self, phase: u8) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .phase_outputs
            .get(&phase.to_string())
            .cloned()
    }

    pub async fn task_started(&self, task: &str) {
        self.mutate(|s| s.current_task = Some(task.to_string())).await;
    }

    pub async fn task_completed(&self, task: &str) {
        self.mutate(|s| {
            if !s.completed_tasks.iter().any(|t| t == task) {
                s.completed_tasks.push(task.to_string());
            }
            s.failed_tasks.retain(|t| t != task);
            if s.current_task.as_deref() == Some(task) {
                s.current_task = None;
            }
        })
        .await;
    }

    pub async fn task_failed(&self, task: &str) {
        self.mutate(|s| {
            if !s.failed_tasks.iter().any(|t| t == task) {
                s.failed_tasks.push(task.to_string());
            }
        })
        .await;
    }

    pub async fn task_blocked(&self, task: &str) {
        self.mutate(|s| {
            if !s.blocked_tasks.iter().any(|t| t == task) {
                s.blocked_tasks.push(task.to_string());
            }
            if s.current_task.as_deref() == Some(task) {
                s.current_task = None;
            }
        })
        .await;
    }

    pub async fn record_tokens(&self, agent: &str, phase: u8, tokens: u64) {
        self.mutate(|s| {
            s.token_usage.total += tokens;
            *s.token_usage
                .by_phase
                .entry(phase.to_string())
                .or_default() += tokens;
            *s.token_usage
                .by_agent
                .entry(agent.to_string())
                .or_default() += tokens;
        })
        .await;
    }

    async fn mutate(&self, f: impl FnOnce(&mut CheckpointState)) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut state);
            state.last_checkpoint = now_ms();
        }
        self.persist().await;
    }

    /// Serialize and write atomically. One retry, then log and move on;
    /// checkpoint IO never aborts the pipeline.
    async fn persist(&self) {
        let bytes = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match serde_json::to_vec_pretty(&*state) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to serialize checkpoint");
                    return;
                }
            }
        };
        if let Err(first) = write_atomic(&self.path, &bytes).await
            && let Err(second) = write_atomic(&self.path, &bytes).await
        {
            warn!(
                path = %self.path.display(),
                first = %first,
                second = %second,
                "checkpoint persist failed after retry"
            );
        }
    }
}

/// Fleet-level status of one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    BudgetExceeded,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::BudgetExceeded => "budget-exceeded",
        };
        write!(f, "{s}")
    }
}

/// Per-issue entry in the fleet checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetIssueState {
    pub status: IssueStatus,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub last_phase: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens: u64,
}

/// Fleet-wide token subtotals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetTokenUsage {
    pub total: u64,
    #[serde(default)]
    pub by_issue: BTreeMap<String, u64>,
}

/// Fleet checkpoint: the map of issue statuses plus run-level counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetCheckpointState {
    #[serde(default)]
    pub issues: BTreeMap<u64, FleetIssueState>,
    #[serde(default)]
    pub token_usage: FleetTokenUsage,
    pub last_checkpoint: u64,
    #[serde(default)]
    pub resume_count: u32,
    pub project_name: String,
}

/// Handle to the fleet checkpoint file.
#[derive(Debug)]
pub struct FleetCheckpointStore {
    path: PathBuf,
    state: Mutex<FleetCheckpointState>,
}

impl FleetCheckpointStore {
    pub async fn load_or_new(path: PathBuf, project_name: &str) -> Result<(Self, bool)> {
        let existing = match tokio::fs::read(&path).await {
            Ok(raw) => Some(
                serde_json::from_slice::<FleetCheckpointState>(&raw)
                    .with_context(|| format!("Corrupt fleet checkpoint at {}", path.display()))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read fleet checkpoint {}", path.display()));
            }
        };

        let resumed = existing.is_some();
        let mut state = existing.unwrap_or_else(|| FleetCheckpointState {
            issues: BTreeMap::new(),
            token_usage: FleetTokenUsage::default(),
            last_checkpoint: now_ms(),
            resume_count: 0,
            project_name: project_name.to_string(),
        });
        if resumed {
            state.resume_count += 1;
        }

        let store = Self {
            path,
            state: Mutex::new(state),
        };
        if resumed {
            store.persist().await;
        }
        Ok((store, resumed))
    }

    pub fn snapshot(&self) -> FleetCheckpointState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn issue_status(&self, issue: u64) -> IssueStatus {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .issues
            .get(&issue)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub async fn update_issue(&self, issue: u64, f: impl FnOnce(&mut FleetIssueState)) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            f(state.issues.entry(issue).or_default());
            let total: u64 = state.issues.values().map(|s| s.tokens).sum();
            state.token_usage.total = total;
            state.token_usage.by_issue = state
                .issues
                .iter()
                .filter(|(_, s)| s.tokens > 0)
                .map(|(n, s)| (n.to_string(), s.tokens))
                .collect();
            state.last_checkpoint = now_ms();
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let bytes = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match serde_json::to_vec_pretty(&*state) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to serialize fleet checkpoint");
                    return;
                }
            }
        };
        if let Err(first) = write_atomic(&self.path, &bytes).await
            && let Err(second) = write_atomic(&self.path, &bytes).await
        {
            warn!(
                path = %self.path.display(),
                first = %first,
                second = %second,
                "fleet checkpoint persist failed after retry"
            );
        }
    }
}
