//! Phase 3 — implementation.
//!
//! The scheduler-rich phase: loads the planner's session list, builds the
//! dependency-aware task queue, and repeatedly launches file-disjoint
//! batches of sessions concurrently under the per-issue agent semaphore.
//! Failed sessions are retried up to `max_retries_per_task`, then blocked.
//! The phase terminates when every session is completed or blocked.

use crate::agent::AgentResult;
use crate::errors::CadreError;
use crate::events::Event;
use crate::phases::{PHASE_IMPLEMENTATION, PHASE_PLANNING, PhaseContext, PhaseExecutor};
use crate::queue::plan::parse_plan;
use crate::queue::{Session, TaskQueue};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const OUTPUT_NAME: &str = "implementation.md";

pub struct ImplementationPhase;

impl ImplementationPhase {
    async fn run_session(
        ctx: &PhaseContext,
        session: &Session,
        semaphore: Arc<Semaphore>,
    ) -> Result<AgentResult, CadreError> {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| CadreError::Cancelled)?;
        ctx.ensure_not_cancelled()?;

        let context = json!({
            "issue": ctx.issue.number,
            "session": session,
        });
        let context_name = format!("session-{}.json", session.id);
        let context_path = ctx.write_context_file(&context_name, &context).await?;

        let output_name = format!("session-{}.md", session.id);
        let files: Vec<&str> = session.files.iter().map(|f| f.as_str()).collect();
        let criteria: Vec<&str> = session
            .steps
            .iter()
            .flat_map(|s| s.acceptance_criteria.iter().map(|c| c.as_str()))
            .collect();
        let prompt = format!(
            "Implement session `{id}` of issue #{number}: {name}\n\n{description}\n\n\
             Only touch these files: {files}.\n\
             Acceptance criteria:\n{criteria}\n\n\
             The session context is in {context}. Commit nothing; write a summary \
             of what you changed to {output}.",
            id = session.id,
            number = ctx.issue.number,
            name = session.name,
            description = session.description,
            files = files.join(", "),
            criteria = criteria
                .iter()
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n"),
            context = context_path.display(),
            output = ctx.outputs_dir().join(&output_name).display(),
        );

        ctx.invoke_agent(
            PHASE_IMPLEMENTATION,
            Some(session.id.clone()),
            prompt,
            context_path,
            &output_name,
        )
        .await
    }
}

#[async_trait]
impl PhaseExecutor for ImplementationPhase {
    fn id(&self) -> u8 {
        PHASE_IMPLEMENTATION
    }

    fn name(&self) -> &'static str {
        "implementation"
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError> {
        let plan_path = ctx.checkpoint.phase_output(PHASE_PLANNING).ok_or_else(|| {
            CadreError::PhaseFailed {
                phase: PHASE_IMPLEMENTATION,
                name: "implementation",
                message: "no plan recorded by the planning phase".to_string(),
            }
        })?;
        let markdown =
            tokio::fs::read_to_string(&plan_path)
                .await
                .map_err(|e| CadreError::PhaseFailed {
                    phase: PHASE_IMPLEMENTATION,
                    name: "implementation",
                    message: format!("cannot read plan {plan_path}: {e}"),
                })?;
        let sessions = parse_plan(&markdown).map_err(CadreError::Queue)?;
        let total = sessions.len();

        let mut queue = TaskQueue::new(sessions).map_err(CadreError::Queue)?;

        // Resume: rehydrate terminal sets from the checkpoint.
        let snapshot = ctx.checkpoint.snapshot();
        queue.restore_state(&snapshot.completed_tasks, &snapshot.blocked_tasks);

        let max_parallel = ctx.config.fleet.max_parallel_agents.max(1);
        let max_retries = ctx.config.fleet.max_retries_per_task;
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut attempts: HashMap<String, u32> = HashMap::new();

        while !queue.is_complete() {
            ctx.ensure_not_cancelled()?;
            if ctx.check_budget() == crate::budget::BudgetStatus::Exceeded {
                return Err(CadreError::BudgetExceeded);
            }

            let ready = queue.ready();
            let batch: Vec<Session> = queue
                .select_non_overlapping_batch(&ready, max_parallel)
                .into_iter()
                .cloned()
                .collect();
            if batch.is_empty() {
                // No batch while incomplete means the plan wedged itself;
                // surface it instead of spinning.
                return Err(CadreError::PhaseFailed {
                    phase: PHASE_IMPLEMENTATION,
                    name: "implementation",
                    message: "no ready sessions but queue is not complete".to_string(),
                });
            }

            for session in &batch {
                queue.start(&session.id).map_err(CadreError::Queue)?;
                ctx.checkpoint.task_started(&session.id).await;
                ctx.events.emit(Event::TaskStarted {
                    issue: ctx.issue.number,
                    session: session.id.clone(),
                });
            }

            let launches = batch.iter().map(|session| {
                let semaphore = semaphore.clone();
                async move {
                    let result = Self::run_session(ctx, session, semaphore).await;
                    (session.id.clone(), result)
                }
            });
            let results = join_all(launches).await;

            for (id, result) in results {
                match result {
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(issue = ctx.issue.number, session = %id, error = %e, "session launch failed");
                        Self::handle_failure(ctx, &mut queue, &mut attempts, &id, max_retries)
                            .await?;
                    }
                    Ok(result) if result.success => {
                        queue.complete(&id).map_err(CadreError::Queue)?;
                        ctx.checkpoint.task_completed(&id).await;
                        ctx.events.emit(Event::TaskCompleted {
                            issue: ctx.issue.number,
                            session: id,
                        });
                    }
                    Ok(_) => {
                        Self::handle_failure(ctx, &mut queue, &mut attempts, &id, max_retries)
                            .await?;
                    }
                }
            }
        }

        let state = queue.state();
        info!(
            issue = ctx.issue.number,
            completed = state.completed.len(),
            blocked = state.blocked.len(),
            "implementation queue complete"
        );

        if state.completed.is_empty() && total > 0 {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_IMPLEMENTATION,
                name: "implementation",
                message: format!("all {total} sessions blocked; nothing was implemented"),
            });
        }

        let output_path = ctx.outputs_dir().join(OUTPUT_NAME);
        let summary = format!(
            "# Implementation summary\n\n- completed: {}\n- blocked: {}\n\n\
             ## Completed sessions\n{}\n\n## Blocked sessions\n{}\n",
            state.completed.len(),
            state.blocked.len(),
            bullet_list(&state.completed),
            bullet_list(&state.blocked),
        );
        crate::util::write_atomic(&output_path, summary.as_bytes()).await?;
        Ok(output_path)
    }
}

impl ImplementationPhase {
    async fn handle_failure(
        ctx: &PhaseContext,
        queue: &mut TaskQueue,
        attempts: &mut HashMap<String, u32>,
        id: &str,
        max_retries: u32,
    ) -> Result<(), CadreError> {
        ctx.checkpoint.task_failed(id).await;
        let attempt = attempts.entry(id.to_string()).or_insert(0);
        *attempt += 1;
        if *attempt <= max_retries {
            queue.requeue(id).map_err(CadreError::Queue)?;
            ctx.events.emit(Event::TaskRetry {
                issue: ctx.issue.number,
                session: id.to_string(),
                attempt: *attempt,
            });
        } else {
            queue.mark_blocked(id).map_err(CadreError::Queue)?;
            ctx.checkpoint.task_blocked(id).await;
            ctx.events.emit(Event::TaskBlocked {
                issue: ctx.issue.number,
                session: id.to_string(),
                reason: format!("failed after {} attempts", *attempt),
            });
        }
        Ok(())
    }
}

fn bullet_list(ids: &[String]) -> String {
    if ids.is_empty() {
        "- (none)".to_string()
    } else {
        ids.iter()
            .map(|id| format!("- {id}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
