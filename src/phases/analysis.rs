//! Phase 1 — analysis.
//!
//! The agent reads the issue and the repository and writes a structured
//! analysis document. Critical: without an analysis the rest of the
//! pipeline has nothing to plan from.

use crate::errors::CadreError;
use crate::phases::{PHASE_ANALYSIS, PhaseContext, PhaseExecutor};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;

const OUTPUT_NAME: &str = "analysis.md";

pub struct AnalysisPhase;

#[async_trait]
impl PhaseExecutor for AnalysisPhase {
    fn id(&self) -> u8 {
        PHASE_ANALYSIS
    }

    fn name(&self) -> &'static str {
        "analysis"
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError> {
        let context = json!({
            "issue": ctx.issue,
            "branch": ctx.worktree.branch,
            "baseCommit": ctx.worktree.base_commit,
        });
        let context_path = ctx.write_context_file("analysis-context.json", &context).await?;

        let output_path = ctx.outputs_dir().join(OUTPUT_NAME);
        let prompt = format!(
            "Analyze issue #{number}: {title}\n\n\
             The issue context is in {context}. Explore the repository, identify the \
             affected modules, risks and open questions, and write a structured \
             analysis to {output}. Flag anything genuinely ambiguous with an \
             <ambiguity>...</ambiguity> tag.",
            number = ctx.issue.number,
            title = ctx.issue.title,
            context = context_path.display(),
            output = output_path.display(),
        );

        let result = ctx
            .invoke_agent(PHASE_ANALYSIS, None, prompt, context_path, OUTPUT_NAME)
            .await?;

        if !result.success {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_ANALYSIS,
                name: "analysis",
                message: result
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "agent failed".to_string()),
            });
        }
        if !result.output_exists {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_ANALYSIS,
                name: "analysis",
                message: format!("agent produced no output at {}", result.output_path.display()),
            });
        }

        crate::phases::planning::emit_ambiguity_signals(ctx, &result.output_path).await;
        Ok(result.output_path)
    }
}
