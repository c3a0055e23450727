//! Claude-style agent CLI backend.

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

/// Tool allowlist handed to the CLI on every invocation.
const ALLOWED_TOOLS: &str =
    "Bash,Read,Write,Edit,MultiEdit,Glob,Grep,TodoRead,TodoWrite,mcp__*";

pub struct ClaudeBackend {
    supervisor: Arc<ProcessSupervisor>,
    cmd: String,
    model: Option<String>,
    default_timeout_ms: u64,
    path_extras: Vec<PathBuf>,
}

impl ClaudeBackend {
    pub fn new(config: &AgentConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            cmd: config.claude_cmd.clone(),
            model: config.model.clone(),
            default_timeout_ms: config.timeout_ms,
            path_extras: config.path_extras.clone(),
        }
    }

    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            invocation.prompt.clone(),
            "--allowedTools".to_string(),
            ALLOWED_TOOLS.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
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

        let success = output.clean_exit();
        let error = if success {
            None
        } else if output.timed_out {
            Some(AgentFailure::Timeout)
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
