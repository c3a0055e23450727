//! Phase 5 — pull-request composition (non-critical).
//!
//! Prepares the final branch history (either squashed into one conventional
//! commit or rewritten commit-by-commit with internal artefacts stripped),
//! pushes, and opens the pull request through the host platform.

use crate::errors::CadreError;
use crate::events::Event;
use crate::phases::{PHASE_IMPLEMENTATION, PHASE_PR, PhaseContext, PhaseExecutor};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

const OUTPUT_NAME: &str = "pr.md";

pub struct PullRequestPhase;

#[async_trait]
impl PhaseExecutor for PullRequestPhase {
    fn id(&self) -> u8 {
        PHASE_PR
    }

    fn name(&self) -> &'static str {
        "pull-request"
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError> {
        ctx.ensure_not_cancelled()?;
        let worktree = ctx.worktree.path.clone();

        // Two final-history modes: squash everything into one conventional
        // commit, or replay each commit with internal artefacts stripped.
        let history = if ctx.config.fleet.squash_before_pr {
            let message = format!("feat: {} (#{})", ctx.issue.title, ctx.issue.number);
            let sha = ctx
                .commits
                .squash(
                    &ctx.worktrees,
                    &worktree,
                    &ctx.worktree.base_commit,
                    &message,
                    &ctx.worktree.synced_agent_files,
                )
                .await?;
            match sha {
                Some(sha) => {
                    ctx.events.emit(Event::GitCommit {
                        issue: ctx.issue.number,
                        sha,
                    });
                    "squashed into 1 commit".to_string()
                }
                None => {
                    return Err(CadreError::PhaseFailed {
                        phase: PHASE_PR,
                        name: "pull-request",
                        message: "no non-internal commits to open a pull request from"
                            .to_string(),
                    });
                }
            }
        } else {
            let summary = ctx
                .commits
                .strip_cadre_files(
                    &ctx.worktrees,
                    &worktree,
                    &ctx.worktree.base_commit,
                    &ctx.worktree.synced_agent_files,
                )
                .await?;
            if summary.kept == 0 {
                return Err(CadreError::PhaseFailed {
                    phase: PHASE_PR,
                    name: "pull-request",
                    message: "no non-internal commits to open a pull request from".to_string(),
                });
            }
            format!(
                "kept {} commit(s), dropped {}",
                summary.kept, summary.dropped
            )
        };

        ctx.commits
            .push(&ctx.worktrees, &worktree, &ctx.worktree.branch)
            .await?;
        ctx.events.emit(Event::GitPush {
            issue: ctx.issue.number,
            branch: ctx.worktree.branch.clone(),
        });

        let title = format!("{} (#{})", ctx.issue.title, ctx.issue.number);
        let implementation_summary = match ctx.checkpoint.phase_output(PHASE_IMPLEMENTATION) {
            Some(path) => tokio::fs::read_to_string(&path).await.unwrap_or_default(),
            None => String::new(),
        };
        let body = format!(
            "Closes #{number}.\n\n{summary}\n",
            number = ctx.issue.number,
            summary = implementation_summary.trim(),
        );

        let pr = ctx
            .host
            .create_pull_request(ctx.issue.number, &ctx.worktree.branch, &title, &body)
            .await
            .map_err(|e| CadreError::PhaseFailed {
                phase: PHASE_PR,
                name: "pull-request",
                message: format!("failed to open pull request: {e}"),
            })?;
        info!(issue = ctx.issue.number, url = %pr.url, "pull request created");
        ctx.events.emit(Event::PrCreated {
            issue: ctx.issue.number,
            url: pr.url.clone(),
        });

        let output_path = ctx.outputs_dir().join(OUTPUT_NAME);
        let doc = format!(
            "# Pull request\n\n- url: {}\n- branch: {}\n- history: {}\n",
            pr.url, pr.branch, history,
        );
        crate::util::write_atomic(&output_path, doc.as_bytes()).await?;
        Ok(output_path)
    }
}
