//! Copilot-style agent CLI backend.
//!
//! This CLI exits 0 even for some usage errors, so success detection also
//! scans stderr for the known failure signatures.

use crate::agent::{
    AgentBackend, AgentFailure, AgentInvocation, AgentResult, assemble_result, run_agent_process,
};
use crate::config::AgentConfig;
use crate::process::ProcessSupervisor;
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stderr signatures that mark a failed invocation regardless of exit code.
const FAILURE_SIGNATURES: &[&str] = &[
    "no such agent:",
    "error: option",
    "is invalid. allowed choices are",
    "unknown option",
];

pub struct CopilotBackend {
    supervisor: Arc<ProcessSupervisor>,
    cmd: String,
    agent_name: String,
    model: Option<String>,
    default_timeout_ms: u64,
    path_extras: Vec<PathBuf>,
}

impl CopilotBackend {
    pub fn new(config: &AgentConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            cmd: config.copilot_cmd.clone(),
            agent_name: config.copilot_agent.clone(),
            model: config.model.clone(),
            default_timeout_ms: config.timeout_ms,
            path_extras: config.path_extras.clone(),
        }
    }

    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "--agent".to_string(),
            self.agent_name.clone(),
            "-p".to_string(),
            invocation.prompt.clone(),
            "--allow-all-tools".to_string(),
            "--allow-all-paths".to_string(),
            "--no-ask-user".to_string(),
            "-s".to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    fn stderr_failure(stderr: &str) -> Option<AgentFailure> {
        if stderr.contains("No such agent:") {
            return Some(AgentFailure::NotFound {
                agent: stderr
                    .split("No such agent:")
                    .nth(1)
                    .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
                    .unwrap_or_default(),
            });
        }
        let lowered = stderr.to_lowercase();
        FAILURE_SIGNATURES
            .iter()
            .copied()
            .find(|sig| lowered.contains(sig))
            .map(|sig| AgentFailure::Error {
                message: format!("agent CLI rejected the invocation ({sig})"),
            })
    }
}

#[async_trait]
impl AgentBackend for CopilotBackend {
    fn name(&self) -> &'static str {
        "copilot"
    }

    async fn init(&self) -> anyhow::Result<()> {
        let status = tokio::process::Command::new(&self.cmd)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("agent CLI `{}` is not runnable", self.cmd))?;
        anyhow::ensure!(
            status.status.success(),
            "agent CLI `{}` --version exited with {:?}",
            self.cmd,
            status.status.code()
        );
        Ok(())
    }

    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> AgentResult {
        let args = self.build_args(invocation);
        let output = run_agent_process(
            &self.supervisor,
            &self.cmd,
            args,
            &self.path_extras,
            self.default_timeout_ms,
            invocation,
            worktree,
            cancel,
        )
        .await;

        let stderr_failure = Self::stderr_failure(&output.stderr);
        let success = output.clean_exit() && stderr_failure.is_none();
        let error = if success {
            None
        } else if output.timed_out {
            Some(AgentFailure::Timeout)
        } else if let Some(failure) = stderr_failure {
            Some(failure)
        } else {
            let message = if output.stderr.trim().is_empty() {
                format!("agent exited with {:?}", output.exit_code)
            } else {
                output.stderr.trim().to_string()
            };
            Some(AgentFailure::Error { message })
        };
        assemble_result(invocation, output, success, error)
    }
}
