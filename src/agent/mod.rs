//! Agent invocation: the polymorphic front-end over the two external agent
//! CLIs.
//!
//! Both backends share one launch pipeline (environment construction,
//! process supervision, log capture, token parsing, output-file check) and
//! differ only in argument shape and success detection. Backend selection
//! is static, from configuration.

pub mod claude;
pub mod copilot;
pub mod tokens;

use crate::config::{AgentConfig, AgentKind};
use crate::process::{ProcessOutput, ProcessSupervisor, SpawnSpec};
use crate::util::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Host-IDE-injected environment variables are stripped from agent
/// children so a CLI spawned from inside an editor behaves like one
/// spawned from a terminal.
const IDE_ENV_PREFIX: &str = "VSCODE_";

/// One requested agent run. Never reused.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub agent: String,
    pub issue_number: u64,
    pub phase: u8,
    pub session_id: Option<String>,
    pub prompt: String,
    pub context_path: PathBuf,
    pub output_path: PathBuf,
    pub timeout_ms: Option<u64>,
}

/// Categorized agent failure, carried inside `AgentResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AgentFailure {
    Timeout,
    NotFound { agent: String },
    Error { message: String },
}

impl std::fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "agent timed out"),
            Self::NotFound { agent } => write!(f, "agent not found: {agent}"),
            Self::Error { message } => write!(f, "{message}"),
        }
    }
}

/// Outcome of one invocation. Produced exactly once.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub agent: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub token_usage: u64,
    pub output_path: PathBuf,
    pub output_exists: bool,
    pub error: Option<AgentFailure>,
}

/// One of the two external agent CLIs.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time readiness probe. Failures surface at launch time, not at
    /// construction.
    async fn init(&self) -> anyhow::Result<()>;

    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> AgentResult;
}

/// Build the child environment: parent env minus IDE-injected variables,
/// `PATH` prepended with configured extras, plus the `CADRE_*` contract
/// variables.
pub(crate) fn build_env(
    path_extras: &[PathBuf],
    invocation: &AgentInvocation,
    worktree: &Path,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(name, _)| !name.starts_with(IDE_ENV_PREFIX))
        .collect();

    if !path_extras.is_empty() {
        let mut parts: Vec<String> = path_extras
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        if let Some(existing) = env.get("PATH") {
            parts.push(existing.clone());
        }
        let sep = if cfg!(windows) { ";" } else { ":" };
        env.insert("PATH".to_string(), parts.join(sep));
    }

    env.insert(
        "CADRE_ISSUE_NUMBER".to_string(),
        invocation.issue_number.to_string(),
    );
    env.insert(
        "CADRE_WORKTREE_PATH".to_string(),
        worktree.to_string_lossy().to_string(),
    );
    env.insert("CADRE_PHASE".to_string(), invocation.phase.to_string());
    if let Some(session) = &invocation.session_id {
        env.insert("CADRE_SESSION_ID".to_string(), session.clone());
    }
    env
}

/// Directory for this invocation's log file, inside the worktree.
fn log_dir(worktree: &Path, invocation: &AgentInvocation) -> PathBuf {
    worktree
        .join(".cadre")
        .join("issues")
        .join(invocation.issue_number.to_string())
        .join("logs")
}

/// Write the full invocation log. Best-effort: a log-write failure never
/// fails the invocation.
pub(crate) async fn write_invocation_log(
    worktree: &Path,
    invocation: &AgentInvocation,
    args: &[String],
    output: &ProcessOutput,
) {
    let name = match &invocation.session_id {
        Some(session) => format!("{}-{}-{}.log", invocation.agent, session, now_ms()),
        None => format!("{}-{}.log", invocation.agent, now_ms()),
    };
    let path = log_dir(worktree, invocation).join(name);

    let contents = format!(
        "agent: {}\nphase: {}\nissue: {}\nargs: {}\nexit: {:?}\ntimed_out: {}\nduration_ms: {}\n\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        invocation.agent,
        invocation.phase,
        invocation.issue_number,
        args.join(" "),
        output.exit_code,
        output.timed_out,
        output.duration.as_millis(),
        output.stdout,
        output.stderr,
    );
    if let Err(e) = crate::util::write_atomic(&path, contents.as_bytes()).await {
        warn!(path = %path.display(), error = %e, "failed to write agent log");
    }
}

/// Spawn the agent CLI via the supervisor with the shared environment
/// contract applied.
pub(crate) async fn run_agent_process(
    supervisor: &ProcessSupervisor,
    program: &str,
    args: Vec<String>,
    path_extras: &[PathBuf],
    default_timeout_ms: u64,
    invocation: &AgentInvocation,
    worktree: &Path,
    cancel: &CancellationToken,
) -> ProcessOutput {
    let timeout_ms = invocation.timeout_ms.unwrap_or(default_timeout_ms);
    let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
    let spec = SpawnSpec {
        program: program.to_string(),
        args: args.clone(),
        cwd: worktree.to_path_buf(),
        env: build_env(path_extras, invocation, worktree),
        timeout,
    };
    debug!(
        agent = %invocation.agent,
        issue = invocation.issue_number,
        phase = invocation.phase,
        session = ?invocation.session_id,
        "launching agent"
    );
    let output = supervisor.spawn(spec, cancel).await;
    write_invocation_log(worktree, invocation, &args, &output).await;
    output
}

/// Fill in the shared fields of an `AgentResult` from the raw process
/// output; `success` and `error` come from backend-specific detection.
pub(crate) fn assemble_result(
    invocation: &AgentInvocation,
    output: ProcessOutput,
    success: bool,
    error: Option<AgentFailure>,
) -> AgentResult {
    let token_usage = tokens::parse_token_usage(&output.stdout, &output.stderr);
    let output_exists = invocation.output_path.exists();
    AgentResult {
        agent: invocation.agent.clone(),
        success,
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        duration_ms: output.duration.as_millis() as u64,
        stdout: output.stdout,
        stderr: output.stderr,
        token_usage,
        output_path: invocation.output_path.clone(),
        output_exists,
        error,
    }
}

/// Front-end the phases call. Holds the statically-selected backend.
#[derive(Clone)]
pub struct AgentLauncher {
    backend: Arc<dyn AgentBackend>,
}

impl AgentLauncher {
    /// Select and build the backend from configuration.
    pub fn from_config(config: &AgentConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        let backend: Arc<dyn AgentBackend> = match config.backend {
            AgentKind::Copilot => Arc::new(copilot::CopilotBackend::new(config, supervisor)),
            AgentKind::Claude => Arc::new(claude::ClaudeBackend::new(config, supervisor)),
        };
        Self { backend }
    }

    /// Use a caller-supplied backend (tests, alternative CLIs).
    pub fn with_backend(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        self.backend.init().await
    }

    /// Run one invocation inside the worktree.
    pub async fn launch(
        &self,
        invocation: &AgentInvocation,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> AgentResult {
        if let Err(e) = tokio::fs::create_dir_all(log_dir(worktree, invocation)).await {
            warn!(error = %e, "failed to create agent log directory");
        }
        self.backend.invoke(invocation, worktree, cancel).await
    }
}
