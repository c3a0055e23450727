//! Phase 2 — planning.
//!
//! The agent turns the analysis into an implementation plan: prose task
//! sections plus the machine-readable `cadre-json` session block the
//! implementation phase schedules from. The plan must parse before the
//! phase counts as done.

use crate::errors::CadreError;
use crate::events::Event;
use crate::phases::{PHASE_PLANNING, PhaseContext, PhaseExecutor};
use crate::queue::plan::parse_plan;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

const OUTPUT_NAME: &str = "plan.md";

/// Scan an output document for `<ambiguity>...</ambiguity>` tags and emit
/// one event per occurrence.
pub(crate) async fn emit_ambiguity_signals(ctx: &PhaseContext, output: &Path) {
    let Ok(contents) = tokio::fs::read_to_string(output).await else {
        return;
    };
    let mut rest = contents.as_str();
    while let Some(start) = rest.find("<ambiguity>") {
        let after = &rest[start + "<ambiguity>".len()..];
        let (description, remaining) = match after.find("</ambiguity>") {
            Some(end) => (&after[..end], &after[end + "</ambiguity>".len()..]),
            None => (after, ""),
        };
        let description = description.trim();
        if !description.is_empty() {
            debug!(issue = ctx.issue.number, "ambiguity flagged by agent");
            ctx.events.emit(Event::AmbiguityDetected {
                issue: ctx.issue.number,
                description: description.to_string(),
            });
        }
        rest = remaining;
    }
}

pub struct PlanningPhase;

#[async_trait]
impl PhaseExecutor for PlanningPhase {
    fn id(&self) -> u8 {
        PHASE_PLANNING
    }

    fn name(&self) -> &'static str {
        "planning"
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError> {
        let analysis_path = ctx
            .checkpoint
            .phase_output(crate::phases::PHASE_ANALYSIS)
            .unwrap_or_default();
        let context = json!({
            "issue": ctx.issue,
            "analysisPath": analysis_path,
            "maxParallelAgents": ctx.config.fleet.max_parallel_agents,
        });
        let context_path = ctx.write_context_file("plan-context.json", &context).await?;

        let output_path = ctx.outputs_dir().join(OUTPUT_NAME);
        let prompt = format!(
            "Plan the implementation of issue #{number}: {title}\n\n\
             Read the analysis at {analysis} and write an implementation plan to \
             {output}. The plan must contain a fenced code block tagged `cadre-json` \
             holding a JSON array of sessions, each with fields id, name, \
             description, files, dependencies, complexity (simple|moderate|complex) \
             and acceptanceCriteria. Sessions that can run in parallel must not \
             share files; dependencies must form a DAG.",
            number = ctx.issue.number,
            title = ctx.issue.title,
            analysis = analysis_path,
            output = output_path.display(),
        );

        let result = ctx
            .invoke_agent(PHASE_PLANNING, None, prompt, context_path, OUTPUT_NAME)
            .await?;

        if !result.success {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_PLANNING,
                name: "planning",
                message: result
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "agent failed".to_string()),
            });
        }
        if !result.output_exists {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_PLANNING,
                name: "planning",
                message: format!("agent produced no plan at {}", result.output_path.display()),
            });
        }

        // A plan that does not parse fails the phase now rather than at the
        // head of phase 3.
        let markdown = tokio::fs::read_to_string(&result.output_path)
            .await
            .map_err(|e| CadreError::PhaseFailed {
                phase: PHASE_PLANNING,
                name: "planning",
                message: format!("cannot read plan: {e}"),
            })?;
        parse_plan(&markdown).map_err(CadreError::Queue)?;

        emit_ambiguity_signals(ctx, &result.output_path).await;
        Ok(result.output_path)
    }
}
