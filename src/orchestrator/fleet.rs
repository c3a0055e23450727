//! Fleet orchestration: bounded-concurrency execution of issue pipelines.
//!
//! At most `max_parallel_issues` pipelines are in flight; new ones start as
//! slots free. Per-issue failures are isolated: no failure cancels a
//! sibling. Crossing the fleet token budget sets a latch that
//! short-circuits every still-pending issue with status `budget-exceeded`.

use crate::agent::AgentLauncher;
use crate::budget::{BudgetGuard, BudgetStatus, TokenTracker};
use crate::checkpoint::{CheckpointStore, FleetCheckpointStore, IssueStatus};
use crate::config::CadreConfig;
use crate::errors::CadreError;
use crate::events::{Event, EventBus};
use crate::host::HostPlatform;
use crate::orchestrator::issue::{IssueOrchestrator, IssueResult};
use crate::phases::{PhaseContext, PhaseRegistry};
use crate::process::ProcessSupervisor;
use crate::worktree::WorktreeManager;
use crate::worktree::commit::CommitManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Brief wait between cooperative cancellation and the hard group-kill.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Aggregate outcome of one fleet run.
#[derive(Debug, Clone)]
pub struct FleetResult {
    pub run_id: String,
    pub success: bool,
    pub interrupted: bool,
    pub issues: Vec<IssueResult>,
    pub prs_created: Vec<String>,
    pub failed_issues: Vec<u64>,
    pub total_tokens: u64,
    pub duration_ms: u64,
}

/// Shared services threaded into every issue pipeline.
struct FleetShared {
    config: Arc<CadreConfig>,
    host: Arc<dyn HostPlatform>,
    registry: Arc<PhaseRegistry>,
    launcher: AgentLauncher,
    supervisor: Arc<ProcessSupervisor>,
    worktrees: Arc<WorktreeManager>,
    tokens: TokenTracker,
    budget: BudgetGuard,
    events: EventBus,
    fleet_checkpoint: Arc<FleetCheckpointStore>,
    cancel: CancellationToken,
    budget_latch: AtomicBool,
    budget_event_sent: AtomicBool,
}

pub struct FleetOrchestrator {
    shared: Arc<FleetShared>,
}

impl FleetOrchestrator {
    pub async fn new(
        config: Arc<CadreConfig>,
        host: Arc<dyn HostPlatform>,
        registry: Arc<PhaseRegistry>,
        launcher: AgentLauncher,
        supervisor: Arc<ProcessSupervisor>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let tokens = TokenTracker::new();
        let budget = BudgetGuard::new(
            tokens.clone(),
            config.fleet.fleet_token_budget,
            config.fleet.issue_token_budget,
        );
        let worktrees = Arc::new(WorktreeManager::new(
            config.repo_dir.clone(),
            config.worktree_root(),
            config.project.base_branch.clone(),
            config.project.branch_template.clone(),
            config.project.agent_files.clone(),
        ));
        let (fleet_checkpoint, resumed) = FleetCheckpointStore::load_or_new(
            config.state_dir.join("fleet.json"),
            &config.project_name(),
        )
        .await?;
        if resumed {
            info!("resuming from existing fleet checkpoint");
        }

        Ok(Self {
            shared: Arc::new(FleetShared {
                config,
                host,
                registry,
                launcher,
                supervisor,
                worktrees,
                tokens,
                budget,
                events,
                fleet_checkpoint: Arc::new(fleet_checkpoint),
                cancel,
                budget_latch: AtomicBool::new(false),
                budget_event_sent: AtomicBool::new(false),
            }),
        })
    }

    pub fn events(&self) -> EventBus {
        self.shared.events.clone()
    }

    pub fn tokens(&self) -> TokenTracker {
        self.shared.tokens.clone()
    }

    pub fn supervisor(&self) -> Arc<ProcessSupervisor> {
        self.shared.supervisor.clone()
    }

    /// Run pipelines for `issue_numbers` under the fleet concurrency cap.
    pub async fn run(&self, issue_numbers: &[u64]) -> FleetResult {
        let shared = &self.shared;
        let run_id = uuid::Uuid::new_v4().to_string();
        let start = Instant::now();
        shared.events.emit(Event::FleetStarted {
            run_id: run_id.clone(),
            issues: issue_numbers.to_vec(),
        });
        info!(run_id, issues = issue_numbers.len(), "fleet run started");

        let semaphore = Arc::new(Semaphore::new(shared.config.fleet.max_parallel_issues.max(1)));
        let mut join_set: JoinSet<IssueResult> = JoinSet::new();
        for &number in issue_numbers {
            let shared = self.shared.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move { run_one_issue(shared, semaphore, number).await });
        }

        let mut issues: Vec<IssueResult> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    self.after_issue(&result).await;
                    issues.push(result);
                }
                Err(e) => error!(error = %e, "issue task panicked"),
            }
        }
        issues.sort_by_key(|r| r.issue_number);

        let interrupted = shared.cancel.is_cancelled();
        if interrupted {
            shared.events.emit(Event::FleetInterrupted {
                reason: "shutdown signal".to_string(),
            });
            // Cooperative cancellation has been observed by the pipelines;
            // wait briefly, then hard-kill surviving agent process groups.
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            shared.supervisor.kill_all_tracked().await;
        }

        let total_tokens = shared.tokens.total();
        let prs_created: Vec<String> = issues.iter().filter_map(|r| r.pr_url.clone()).collect();
        let failed_issues: Vec<u64> = issues
            .iter()
            .filter(|r| r.status == IssueStatus::Failed)
            .map(|r| r.issue_number)
            .collect();
        let succeeded = issues.iter().filter(|r| r.success).count();
        let success = !interrupted && failed_issues.is_empty();

        if !interrupted {
            shared.events.emit(Event::FleetCompleted {
                succeeded,
                failed: failed_issues.len(),
                total_tokens,
            });
        }
        info!(
            run_id,
            succeeded,
            failed = failed_issues.len(),
            total_tokens,
            interrupted,
            "fleet run finished"
        );

        FleetResult {
            run_id,
            success,
            interrupted,
            issues,
            prs_created,
            failed_issues,
            total_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Post-issue bookkeeping: fleet checkpoint and the budget latch.
    async fn after_issue(&self, result: &IssueResult) {
        let shared = &self.shared;
        let last_phase = result.phases.last().map(|p| p.phase);
        shared
            .fleet_checkpoint
            .update_issue(result.issue_number, |s| {
                s.status = result.status;
                s.last_phase = last_phase;
                s.error = result.error.clone();
                s.tokens = result.tokens;
            })
            .await;

        if shared.budget.check_fleet() == BudgetStatus::Exceeded {
            shared.budget_latch.store(true, Ordering::SeqCst);
            if !shared.budget_event_sent.swap(true, Ordering::SeqCst) {
                warn!(
                    used = shared.tokens.total(),
                    budget = shared.budget.fleet_budget(),
                    "fleet budget exceeded; pending issues will be short-circuited"
                );
                shared.events.emit(Event::BudgetExceeded {
                    issue: None,
                    used: shared.tokens.total(),
                    budget: shared.budget.fleet_budget(),
                });
            }
        }
    }
}

/// One issue pipeline: acquire a slot, provision, run, record.
async fn run_one_issue(
    shared: Arc<FleetShared>,
    semaphore: Arc<Semaphore>,
    number: u64,
) -> IssueResult {
    let cancelled_result = |phases| IssueResult {
        issue_number: number,
        status: IssueStatus::Failed,
        success: false,
        phases,
        tokens: shared.tokens.issue_total(number),
        pr_url: None,
        error: Some(CadreError::Cancelled.to_string()),
    };

    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return cancelled_result(Vec::new()),
        },
        _ = shared.cancel.cancelled() => return cancelled_result(Vec::new()),
    };

    // The budget check happens after the slot is acquired so issues that
    // were pending when the budget was crossed spawn no agents at all. The
    // tracker is consulted directly as well as the latch: a sibling may
    // have pushed usage over the line before the fleet loop processed its
    // result.
    if shared.budget_latch.load(Ordering::SeqCst)
        || shared.budget.check_fleet() == BudgetStatus::Exceeded
    {
        shared.budget_latch.store(true, Ordering::SeqCst);
        let result = IssueResult::budget_exceeded(number);
        shared
            .fleet_checkpoint
            .update_issue(number, |s| {
                s.status = IssueStatus::BudgetExceeded;
                s.error = result.error.clone();
            })
            .await;
        return result;
    }
    if shared.cancel.is_cancelled() {
        return cancelled_result(Vec::new());
    }

    let failed = |error: String| IssueResult {
        issue_number: number,
        status: IssueStatus::Failed,
        success: false,
        phases: Vec::new(),
        tokens: shared.tokens.issue_total(number),
        pr_url: None,
        error: Some(error),
    };

    let issue = match shared.host.fetch_issue(number).await {
        Ok(issue) => issue,
        Err(e) => {
            let result = failed(format!("failed to fetch issue: {e}"));
            record_failure(&shared, number, &result).await;
            return result;
        }
    };

    // A worktree that vanished between runs is resumed from its remote
    // branch; everything else goes through plain provisioning.
    let known_branch = shared
        .fleet_checkpoint
        .snapshot()
        .issues
        .get(&number)
        .is_some_and(|s| s.branch.is_some());
    shared
        .fleet_checkpoint
        .update_issue(number, |s| s.status = IssueStatus::InProgress)
        .await;

    let dependency_branches: Vec<String> = issue
        .dependencies()
        .iter()
        .map(|&dep| shared.worktrees.branch_for_issue(dep))
        .collect();
    let provisioned = if known_branch && !shared.worktrees.path_for_issue(number).exists() {
        shared.worktrees.resume(number).await
    } else if !dependency_branches.is_empty() {
        shared
            .worktrees
            .provision_with_deps(number, &dependency_branches, None)
            .await
    } else {
        shared.worktrees.provision(number).await
    };
    let worktree = match provisioned {
        Ok(worktree) => worktree,
        Err(e) => {
            let result = failed(format!("worktree provisioning failed: {e}"));
            record_failure(&shared, number, &result).await;
            return result;
        }
    };
    shared
        .fleet_checkpoint
        .update_issue(number, |s| {
            s.worktree_path = Some(worktree.path.to_string_lossy().to_string());
            s.branch = Some(worktree.branch.clone());
        })
        .await;

    let checkpoint_path = shared.config.state_dir.join(format!("issue-{number}.json"));
    let checkpoint = match CheckpointStore::load_or_new(checkpoint_path, number).await {
        Ok((store, resumed)) => {
            if resumed {
                info!(issue = number, "resuming from issue checkpoint");
            }
            Arc::new(store)
        }
        Err(e) => {
            let result = failed(format!("checkpoint load failed: {e}"));
            record_failure(&shared, number, &result).await;
            return result;
        }
    };
    checkpoint
        .set_worktree(
            &worktree.path.to_string_lossy(),
            &worktree.branch,
            &worktree.base_commit,
        )
        .await;

    let ctx = PhaseContext::new(
        issue,
        shared.config.clone(),
        worktree,
        shared.worktrees.clone(),
        CommitManager::new(shared.config.fleet.sign_commits),
        checkpoint,
        shared.launcher.clone(),
        shared.tokens.clone(),
        shared.budget.clone(),
        shared.events.clone(),
        shared.host.clone(),
        shared.cancel.clone(),
    );

    let orchestrator = IssueOrchestrator::new(ctx, shared.registry.clone());
    match orchestrator.run().await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => cancelled_result(Vec::new()),
        Err(e) => {
            // Nothing but cancellation should unwind out of an issue; treat
            // anything else as an issue failure rather than poisoning the
            // fleet.
            let result = failed(e.to_string());
            shared.events.emit(Event::IssueFailed {
                issue: number,
                error: result.error.clone().unwrap_or_default(),
            });
            result
        }
    }
}

async fn record_failure(shared: &FleetShared, number: u64, result: &IssueResult) {
    shared.events.emit(Event::IssueFailed {
        issue: number,
        error: result.error.clone().unwrap_or_default(),
    });
    shared
        .fleet_checkpoint
        .update_issue(number, |s| {
            s.status = IssueStatus::Failed;
            s.error = result.error.clone();
        })
        .await;
}
