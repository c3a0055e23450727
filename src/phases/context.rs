//! The context handed to every phase executor.

use crate::agent::{AgentInvocation, AgentLauncher, AgentResult};
use crate::budget::{BudgetGuard, BudgetStatus, TokenTracker};
use crate::checkpoint::CheckpointStore;
use crate::config::CadreConfig;
use crate::errors::CadreError;
use crate::events::{Event, EventBus};
use crate::host::{HostPlatform, Issue};
use crate::worktree::commit::CommitManager;
use crate::worktree::{WorktreeInfo, WorktreeManager};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Everything a phase needs: the issue, its worktree, the shared services,
/// and the cancellation token polled at every suspension point.
pub struct PhaseContext {
    pub issue: Issue,
    pub config: Arc<CadreConfig>,
    pub worktree: WorktreeInfo,
    pub worktrees: Arc<WorktreeManager>,
    pub commits: CommitManager,
    pub checkpoint: Arc<CheckpointStore>,
    pub launcher: AgentLauncher,
    pub tokens: TokenTracker,
    pub budget: BudgetGuard,
    pub events: EventBus,
    pub host: Arc<dyn HostPlatform>,
    pub cancel: CancellationToken,
    last_budget: Mutex<BudgetStatus>,
}

impl PhaseContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        issue: Issue,
        config: Arc<CadreConfig>,
        worktree: WorktreeInfo,
        worktrees: Arc<WorktreeManager>,
        commits: CommitManager,
        checkpoint: Arc<CheckpointStore>,
        launcher: AgentLauncher,
        tokens: TokenTracker,
        budget: BudgetGuard,
        events: EventBus,
        host: Arc<dyn HostPlatform>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            issue,
            config,
            worktree,
            worktrees,
            commits,
            checkpoint,
            launcher,
            tokens,
            budget,
            events,
            host,
            cancel,
            last_budget: Mutex::new(BudgetStatus::Ok),
        }
    }

    /// Run-scoped directory for this issue, inside the worktree.
    pub fn issue_dir(&self) -> PathBuf {
        self.worktree.issue_dir()
    }

    pub fn contexts_dir(&self) -> PathBuf {
        self.issue_dir().join("contexts")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.issue_dir().join("outputs")
    }

    /// Typed cancellation check, called at the head of every loop and
    /// before every agent launch.
    pub fn ensure_not_cancelled(&self) -> Result<(), CadreError> {
        if self.cancel.is_cancelled() {
            Err(CadreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record usage in both the fleet tracker and the issue checkpoint.
    pub async fn record_tokens(&self, agent: &str, phase: u8, tokens: u64) {
        if tokens == 0 {
            return;
        }
        self.tokens.record(self.issue.number, agent, phase, tokens);
        self.checkpoint.record_tokens(agent, phase, tokens).await;
        self.emit_budget_transition();
    }

    /// Worst of the fleet-wide and per-issue budget answers.
    pub fn check_budget(&self) -> BudgetStatus {
        self.budget.check(self.issue.number)
    }

    /// Emit budget-warning / budget-exceeded once per upward transition.
    fn emit_budget_transition(&self) {
        let status = self.check_budget();
        let mut last = self.last_budget.lock().unwrap_or_else(|e| e.into_inner());
        if status > *last {
            let used = self.tokens.issue_total(self.issue.number);
            let budget = if self.budget.check_issue(self.issue.number) >= status {
                self.budget.issue_budget()
            } else {
                self.budget.fleet_budget()
            };
            let event = match status {
                BudgetStatus::Warning => Some(Event::BudgetWarning {
                    issue: Some(self.issue.number),
                    used,
                    budget,
                }),
                BudgetStatus::Exceeded => Some(Event::BudgetExceeded {
                    issue: Some(self.issue.number),
                    used,
                    budget,
                }),
                BudgetStatus::Ok => None,
            };
            if let Some(event) = event {
                self.events.emit(event);
            }
        }
        *last = status;
    }

    /// Serialize a context document for the agent into `contexts/`.
    pub async fn write_context_file(
        &self,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<PathBuf, CadreError> {
        let path = self.contexts_dir().join(name);
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| CadreError::Other(anyhow::anyhow!("context serialization: {e}")))?;
        crate::util::write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Launch one agent invocation for this issue, emitting the agent
    /// lifecycle events and recording token usage.
    pub async fn invoke_agent(
        &self,
        phase: u8,
        session_id: Option<String>,
        prompt: String,
        context_path: PathBuf,
        output_name: &str,
    ) -> Result<AgentResult, CadreError> {
        self.ensure_not_cancelled()?;

        let invocation = AgentInvocation {
            agent: self.launcher.backend_name().to_string(),
            issue_number: self.issue.number,
            phase,
            session_id: session_id.clone(),
            prompt,
            context_path,
            output_path: self.outputs_dir().join(output_name),
            timeout_ms: None,
        };

        self.events.emit(Event::AgentLaunched {
            issue: self.issue.number,
            agent: invocation.agent.clone(),
            phase,
            session: session_id,
        });

        let result = self
            .launcher
            .launch(&invocation, &self.worktree.path, &self.cancel)
            .await;

        self.record_tokens(&result.agent, phase, result.token_usage).await;

        if result.success {
            self.events.emit(Event::AgentCompleted {
                issue: self.issue.number,
                agent: result.agent.clone(),
                phase,
                tokens: result.token_usage,
                duration_ms: result.duration_ms,
            });
        } else {
            self.events.emit(Event::AgentFailed {
                issue: self.issue.number,
                agent: result.agent.clone(),
                phase,
                timed_out: result.timed_out,
                error: result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "agent failed".to_string()),
            });
        }
        Ok(result)
    }
}
