//! Phase 4 — integration (non-critical).
//!
//! Rebases the issue branch onto the current base via the paused-rebase
//! protocol, delegating conflict resolution to an agent invocation, then
//! commits any remaining agent-produced changes with the internal scratch
//! files excluded.

use crate::errors::CadreError;
use crate::events::Event;
use crate::phases::{PHASE_INTEGRATION, PhaseContext, PhaseExecutor};
use crate::worktree::rebase::{RebaseContinue, RebaseStart};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

const OUTPUT_NAME: &str = "integration.md";

pub struct IntegrationPhase;

impl IntegrationPhase {
    async fn resolve_conflicts(
        &self,
        ctx: &PhaseContext,
        files: Vec<String>,
    ) -> Result<(), CadreError> {
        let context = json!({
            "issue": ctx.issue.number,
            "conflictedFiles": files,
            "baseBranch": ctx.worktrees.base_branch(),
        });
        let context_path = ctx
            .write_context_file("rebase-conflict.json", &context)
            .await?;

        let output_name = "rebase-resolution.md";
        let prompt = format!(
            "A rebase of this worktree onto `{base}` is paused with conflicts in: \
             {files}.\n\nResolve every conflict marker in place, keeping the intent \
             of both sides. Do not run any git rebase command; only edit the files. \
             Write a summary of the resolutions to {output}.",
            base = ctx.worktrees.base_branch(),
            files = files.join(", "),
            output = ctx.outputs_dir().join(output_name).display(),
        );

        let result = ctx
            .invoke_agent(PHASE_INTEGRATION, None, prompt, context_path, output_name)
            .await?;
        if !result.success {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_INTEGRATION,
                name: "integration",
                message: result
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "conflict-resolution agent failed".to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseExecutor for IntegrationPhase {
    fn id(&self) -> u8 {
        PHASE_INTEGRATION
    }

    fn name(&self) -> &'static str {
        "integration"
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError> {
        ctx.ensure_not_cancelled()?;
        let worktree = ctx.worktree.path.clone();
        let base = ctx.worktrees.base_branch().to_string();

        let mut rebased = false;
        match ctx.worktrees.rebase_start(&worktree, &base).await? {
            RebaseStart::Clean => {
                rebased = true;
                info!(issue = ctx.issue.number, "rebase applied cleanly");
            }
            RebaseStart::Conflict { files } => {
                info!(
                    issue = ctx.issue.number,
                    conflicts = files.len(),
                    "rebase paused; delegating resolution to agent"
                );
                self.resolve_conflicts(ctx, files).await?;
                match ctx.worktrees.rebase_continue(&worktree).await? {
                    RebaseContinue::Completed => {
                        rebased = true;
                    }
                    RebaseContinue::Unresolved { files } => {
                        ctx.worktrees.rebase_abort(&worktree).await?;
                        return Err(CadreError::PhaseFailed {
                            phase: PHASE_INTEGRATION,
                            name: "integration",
                            message: format!(
                                "conflicts still unresolved after agent pass: {}",
                                files.join(", ")
                            ),
                        });
                    }
                }
            }
        }

        // Commit anything the agents left uncommitted, minus internal files.
        let message = format!("chore: integrate issue #{}", ctx.issue.number);
        let sha = ctx
            .commits
            .commit_all(
                &ctx.worktrees,
                &worktree,
                &message,
                &ctx.worktree.synced_agent_files,
            )
            .await?;
        if let Some(sha) = &sha {
            ctx.events.emit(Event::GitCommit {
                issue: ctx.issue.number,
                sha: sha.clone(),
            });
        }

        let output_path = ctx.outputs_dir().join(OUTPUT_NAME);
        let summary = format!(
            "# Integration summary\n\n- rebased onto {base}: {rebased}\n- final commit: {}\n",
            sha.as_deref().unwrap_or("(no new changes)"),
        );
        crate::util::write_atomic(&output_path, summary.as_bytes()).await?;
        Ok(output_path)
    }
}
