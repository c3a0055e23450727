//! Implementation-plan parsing.
//!
//! The planner phase produces a markdown document with prose task sections
//! plus one fenced code block tagged `cadre-json` holding the
//! machine-readable session list. Only the fenced block is consumed here; a
//! missing or malformed block fails the phase with a parse error.

use crate::errors::QueueError;
use crate::queue::{Session, Step};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Fence tag marking the machine-readable block inside the plan markdown.
const PLAN_FENCE_TAG: &str = "cadre-json";

/// Session object shape inside the `cadre-json` block.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanSession {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    complexity: crate::queue::Complexity,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

/// Extract the contents of the first fenced block tagged `cadre-json`.
fn extract_plan_block(markdown: &str) -> Option<String> {
    let mut in_block = false;
    let mut block = String::new();
    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if !in_block {
            if let Some(tag) = trimmed.strip_prefix("```")
                && tag.trim() == PLAN_FENCE_TAG
            {
                in_block = true;
            }
        } else if trimmed.starts_with("```") {
            return Some(block);
        } else {
            block.push_str(line);
            block.push('\n');
        }
    }
    None
}

/// Parse the planner's markdown output into the session list the task
/// queue schedules.
pub fn parse_plan(markdown: &str) -> Result<Vec<Session>, QueueError> {
    let block = extract_plan_block(markdown).ok_or_else(|| QueueError::PlanParse {
        message: format!("no `{PLAN_FENCE_TAG}` fenced block found in plan"),
    })?;

    let entries: Vec<PlanSession> =
        serde_json::from_str(&block).map_err(|e| QueueError::PlanParse {
            message: format!("invalid session JSON: {e}"),
        })?;

    if entries.is_empty() {
        return Err(QueueError::PlanParse {
            message: "plan contains no sessions".to_string(),
        });
    }

    Ok(entries
        .into_iter()
        .map(|entry| {
            let files: BTreeSet<String> = entry.files.iter().cloned().collect();
            Session {
                steps: vec![Step {
                    id: format!("{}-step-1", entry.id),
                    files: entry.files,
                    complexity: entry.complexity,
                    acceptance_criteria: entry.acceptance_criteria,
                }],
                id: entry.id,
                name: entry.name,
                description: entry.description,
                dependencies: entry.dependencies,
                files,
            }
        })
        .collect())
}
