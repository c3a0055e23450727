//! The five-phase pipeline: analysis → planning → implementation →
//! integration → pull-request composition.
//!
//! Each phase is a `PhaseExecutor` registered in a `PhaseRegistry` and run
//! in order by the issue orchestrator. Phases 1–3 are critical (a failure
//! aborts the pipeline); phases 4–5 are non-critical (logged, pipeline
//! continues). Gates sit between phases and can abort the transition.

pub mod analysis;
pub mod context;
pub mod implementation;
pub mod integration;
pub mod pr;
pub mod planning;

pub use context::PhaseContext;

use crate::errors::CadreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const PHASE_ANALYSIS: u8 = 1;
pub const PHASE_PLANNING: u8 = 2;
pub const PHASE_IMPLEMENTATION: u8 = 3;
pub const PHASE_INTEGRATION: u8 = 4;
pub const PHASE_PR: u8 = 5;

/// Human name for a phase id.
pub fn phase_name(phase: u8) -> &'static str {
    match phase {
        PHASE_ANALYSIS => "analysis",
        PHASE_PLANNING => "planning",
        PHASE_IMPLEMENTATION => "implementation",
        PHASE_INTEGRATION => "integration",
        PHASE_PR => "pull-request",
        _ => "unknown",
    }
}

/// Phases 1–3 abort the pipeline on failure; 4–5 do not.
pub fn is_critical(phase: u8) -> bool {
    phase <= PHASE_IMPLEMENTATION
}

/// Result of one executed phase, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub phase: u8,
    pub phase_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub token_usage: u64,
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One pipeline phase.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;

    /// Run the phase; returns the path of the phase's primary output.
    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError>;
}

/// Verdict of a gate guarding a phase transition.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Proceed,
    Fail { reason: String },
}

/// Predicate run before a phase starts.
#[async_trait]
pub trait PhaseGate: Send + Sync {
    async fn check(&self, ctx: &PhaseContext) -> GateVerdict;
}

/// Gate requiring the recorded output of an earlier phase to exist on disk.
pub struct OutputExistsGate {
    pub producing_phase: u8,
}

#[async_trait]
impl PhaseGate for OutputExistsGate {
    async fn check(&self, ctx: &PhaseContext) -> GateVerdict {
        let Some(output) = ctx.checkpoint.phase_output(self.producing_phase) else {
            return GateVerdict::Fail {
                reason: format!(
                    "{} produced no recorded output",
                    phase_name(self.producing_phase)
                ),
            };
        };
        if std::path::Path::new(&output).exists() {
            GateVerdict::Proceed
        } else {
            GateVerdict::Fail {
                reason: format!(
                    "{} output {} is missing on disk",
                    phase_name(self.producing_phase),
                    output
                ),
            }
        }
    }
}

/// Gate requiring the plan file to parse into a valid session list.
pub struct PlanParsesGate;

#[async_trait]
impl PhaseGate for PlanParsesGate {
    async fn check(&self, ctx: &PhaseContext) -> GateVerdict {
        let Some(plan_path) = ctx.checkpoint.phase_output(PHASE_PLANNING) else {
            return GateVerdict::Fail {
                reason: "planning produced no recorded output".to_string(),
            };
        };
        let markdown = match tokio::fs::read_to_string(&plan_path).await {
            Ok(m) => m,
            Err(e) => {
                return GateVerdict::Fail {
                    reason: format!("cannot read plan {plan_path}: {e}"),
                };
            }
        };
        match crate::queue::plan::parse_plan(&markdown) {
            Ok(_) => GateVerdict::Proceed,
            Err(e) => GateVerdict::Fail {
                reason: e.to_string(),
            },
        }
    }
}

/// Ordered executors plus the gates preceding them.
pub struct PhaseRegistry {
    executors: Vec<Arc<dyn PhaseExecutor>>,
    gates: HashMap<u8, Arc<dyn PhaseGate>>,
}

impl PhaseRegistry {
    /// The standard five-phase pipeline.
    pub fn standard() -> Self {
        let executors: Vec<Arc<dyn PhaseExecutor>> = vec![
            Arc::new(analysis::AnalysisPhase),
            Arc::new(planning::PlanningPhase),
            Arc::new(implementation::ImplementationPhase),
            Arc::new(integration::IntegrationPhase),
            Arc::new(pr::PullRequestPhase),
        ];
        let mut gates: HashMap<u8, Arc<dyn PhaseGate>> = HashMap::new();
        gates.insert(
            PHASE_PLANNING,
            Arc::new(OutputExistsGate {
                producing_phase: PHASE_ANALYSIS,
            }),
        );
        gates.insert(PHASE_IMPLEMENTATION, Arc::new(PlanParsesGate));
        Self { executors, gates }
    }

    /// Replace or add an executor (keyed by phase id). Used by tests to
    /// substitute scripted phases.
    pub fn with_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        if let Some(slot) = self.executors.iter_mut().find(|e| e.id() == executor.id()) {
            *slot = executor;
        } else {
            self.executors.push(executor);
            self.executors.sort_by_key(|e| e.id());
        }
        self
    }

    /// Remove the gate preceding a phase.
    pub fn without_gate(mut self, phase: u8) -> Self {
        self.gates.remove(&phase);
        self
    }

    pub fn executors(&self) -> &[Arc<dyn PhaseExecutor>] {
        &self.executors
    }

    pub fn gate_for(&self, phase: u8) -> Option<&Arc<dyn PhaseGate>> {
        self.gates.get(&phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_split() {
        assert!(is_critical(PHASE_ANALYSIS));
        assert!(is_critical(PHASE_PLANNING));
        assert!(is_critical(PHASE_IMPLEMENTATION));
        assert!(!is_critical(PHASE_INTEGRATION));
        assert!(!is_critical(PHASE_PR));
    }

    #[test]
    fn standard_registry_is_ordered_one_to_five() {
        let registry = PhaseRegistry::standard();
        let ids: Vec<u8> = registry.executors().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(registry.gate_for(PHASE_PLANNING).is_some());
        assert!(registry.gate_for(PHASE_IMPLEMENTATION).is_some());
        assert!(registry.gate_for(PHASE_INTEGRATION).is_none());
    }

    #[test]
    fn phase_names() {
        assert_eq!(phase_name(1), "analysis");
        assert_eq!(phase_name(5), "pull-request");
        assert_eq!(phase_name(9), "unknown");
    }
}
