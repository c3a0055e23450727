//! Per-issue pipeline: runs the five phases in order with gates between
//! them, persisting a checkpoint after every transition.
//!
//! Failure policy: a gate failure or a critical-phase (1–3) failure aborts
//! the pipeline; a non-critical-phase (4–5) failure is recorded and the
//! pipeline continues and the issue can still count as a success. Only
//! cancellation unwinds out of `run`.

use crate::checkpoint::IssueStatus;
use crate::errors::CadreError;
use crate::events::Event;
use crate::phases::{PhaseContext, PhaseRegistry, PhaseResult, GateVerdict, is_critical, phase_name};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of one issue pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResult {
    pub issue_number: u64,
    pub status: IssueStatus,
    pub success: bool,
    pub phases: Vec<PhaseResult>,
    pub tokens: u64,
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IssueResult {
    /// Short-circuit result for an issue that never started because the
    /// fleet budget latch was already set.
    pub fn budget_exceeded(issue_number: u64) -> Self {
        Self {
            issue_number,
            status: IssueStatus::BudgetExceeded,
            success: false,
            phases: Vec::new(),
            tokens: 0,
            pr_url: None,
            error: Some("Fleet budget exceeded".to_string()),
        }
    }
}

/// Drives one issue through the phase registry.
pub struct IssueOrchestrator {
    ctx: PhaseContext,
    registry: Arc<PhaseRegistry>,
}

impl IssueOrchestrator {
    pub fn new(ctx: PhaseContext, registry: Arc<PhaseRegistry>) -> Self {
        Self { ctx, registry }
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    /// Run the pipeline. `Err` is returned only for cancellation; every
    /// other failure is captured in the `IssueResult`.
    pub async fn run(&self) -> Result<IssueResult, CadreError> {
        let ctx = &self.ctx;
        let issue = ctx.issue.number;
        ctx.events.emit(Event::IssueStarted { issue });
        info!(issue, title = %ctx.issue.title, "issue pipeline started");

        let mut phases: Vec<PhaseResult> = Vec::new();
        let mut pipeline_error: Option<String> = None;
        let mut pipeline_failed = false;

        for executor in self.registry.executors() {
            let id = executor.id();
            ctx.ensure_not_cancelled()?;

            if ctx.checkpoint.is_phase_completed(id) {
                ctx.events.emit(Event::PhaseSkipped { issue, phase: id });
                info!(issue, phase = id, "phase already completed; skipping");
                continue;
            }

            if let Some(gate) = self.registry.gate_for(id)
                && let GateVerdict::Fail { reason } = gate.check(ctx).await
            {
                let err = CadreError::GateFailed { phase: id, reason };
                error!(issue, phase = id, error = %err, "gate failed; aborting pipeline");
                pipeline_error = Some(err.to_string());
                pipeline_failed = true;
                break;
            }

            ctx.checkpoint.begin_phase(id).await;
            ctx.events.emit(Event::PhaseStarted {
                issue,
                phase: id,
                name: executor.name().to_string(),
            });

            let start = Instant::now();
            let tokens_before = ctx.tokens.issue_total(issue);
            let outcome = executor.execute(ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            let token_usage = ctx.tokens.issue_total(issue).saturating_sub(tokens_before);

            match outcome {
                Ok(output_path) => {
                    ctx.checkpoint
                        .phase_completed(id, output_path.to_str())
                        .await;
                    phases.push(PhaseResult {
                        phase: id,
                        phase_name: executor.name().to_string(),
                        success: true,
                        duration_ms,
                        token_usage,
                        output_path: Some(output_path),
                        error: None,
                    });
                    ctx.events.emit(Event::PhaseCompleted {
                        issue,
                        phase: id,
                        success: true,
                        duration_ms,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(CadreError::Cancelled),
                Err(e) => {
                    let message = e.to_string();
                    phases.push(PhaseResult {
                        phase: id,
                        phase_name: executor.name().to_string(),
                        success: false,
                        duration_ms,
                        token_usage,
                        output_path: None,
                        error: Some(message.clone()),
                    });
                    ctx.events.emit(Event::PhaseCompleted {
                        issue,
                        phase: id,
                        success: false,
                        duration_ms,
                    });

                    if is_critical(id) {
                        error!(issue, phase = id, error = %message, "critical phase failed");
                        pipeline_error = Some(message);
                        pipeline_failed = true;
                        break;
                    }
                    // Non-critical: log and continue; the issue may still
                    // succeed overall.
                    warn!(
                        issue,
                        phase = id,
                        error = %message,
                        "non-critical phase {} failed; continuing",
                        phase_name(id)
                    );
                }
            }

            if ctx.config.dry_run && id > 2 {
                info!(issue, phase = id, "dry-run: stopping after phase {id}");
                break;
            }
        }

        let tokens = ctx.tokens.issue_total(issue);
        let pr_url = ctx.events.events().iter().rev().find_map(|e| match e {
            Event::PrCreated { issue: n, url } if *n == issue => Some(url.clone()),
            _ => None,
        });

        let result = if pipeline_failed {
            let error = pipeline_error.unwrap_or_else(|| "pipeline failed".to_string());
            ctx.events.emit(Event::IssueFailed {
                issue,
                error: error.clone(),
            });
            IssueResult {
                issue_number: issue,
                status: IssueStatus::Failed,
                success: false,
                phases,
                tokens,
                pr_url,
                error: Some(error),
            }
        } else {
            ctx.events.emit(Event::IssueCompleted { issue, tokens });
            info!(issue, tokens, "issue pipeline completed");
            IssueResult {
                issue_number: issue,
                status: IssueStatus::Completed,
                success: true,
                phases,
                tokens,
                pr_url,
                error: None,
            }
        };
        Ok(result)
    }
}
