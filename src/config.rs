//! Unified configuration for cadre.
//!
//! Reads `.cadre/cadre.toml` from the orchestrated repository and overlays
//! CLI flags on top. Every section has sensible defaults so a bare
//! repository works with zero configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//! base_branch = "main"
//! worktree_root = ".cadre/worktrees"
//!
//! [agent]
//! backend = "claude"
//! claude_cmd = "claude"
//! copilot_cmd = "copilot"
//! copilot_agent = "implementor"
//! model = "sonnet"
//! timeout_ms = 1800000
//! path_extras = ["/usr/local/bin"]
//!
//! [fleet]
//! max_parallel_issues = 3
//! max_parallel_agents = 2
//! max_retries_per_task = 2
//! fleet_token_budget = 0        # 0 = no budget
//! issue_token_budget = 0
//! delete_remote_on_cleanup = false
//! squash_before_pr = false
//!
//! [triage]
//! min_severity = "medium"
//! max_issues_per_run = 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which agent CLI backend drives the pipeline. Selection is static, from
/// configuration; the two backends share a launch pipeline but differ in
/// argument shape and success detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Copilot-style CLI (`--agent <name> -p <prompt> ...`)
    Copilot,
    /// Claude-style CLI (`-p <prompt> --allowedTools ...`)
    #[default]
    Claude,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Copilot => write!(f, "copilot"),
            AgentKind::Claude => write!(f, "claude"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copilot" => Ok(AgentKind::Copilot),
            "claude" => Ok(AgentKind::Claude),
            _ => anyhow::bail!("Invalid agent backend '{}'. Valid values: copilot, claude", s),
        }
    }
}

/// Minimum severity of a triage topic that gets filed as an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinSeverity {
    Low,
    #[default]
    Medium,
    High,
    Severe,
    Critical,
}

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (defaults to the repository directory name)
    #[serde(default)]
    pub name: Option<String>,
    /// Base branch worktrees are cut from
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Branch name template; `{issue}` is replaced with the issue number
    #[serde(default = "default_branch_template")]
    pub branch_template: String,
    /// Directory (relative to the repo) under which worktrees are created
    #[serde(default = "default_worktree_root")]
    pub worktree_root: PathBuf,
    /// Agent instruction files synced into each worktree and excluded from
    /// commits (relative paths)
    #[serde(default)]
    pub agent_files: Vec<String>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_template() -> String {
    "cadre/issue-{issue}".to_string()
}

fn default_worktree_root() -> PathBuf {
    PathBuf::from(".cadre/worktrees")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: None,
            base_branch: default_base_branch(),
            branch_template: default_branch_template(),
            worktree_root: default_worktree_root(),
            agent_files: Vec::new(),
        }
    }
}

/// Agent CLI settings shared by both backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub backend: AgentKind,
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    #[serde(default = "default_copilot_cmd")]
    pub copilot_cmd: String,
    /// Agent name passed to the copilot backend's `--agent` flag
    #[serde(default = "default_copilot_agent")]
    pub copilot_agent: String,
    /// Optional model override passed through to the CLI
    #[serde(default)]
    pub model: Option<String>,
    /// Default invocation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra directories prepended to the child PATH
    #[serde(default)]
    pub path_extras: Vec<PathBuf>,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_copilot_cmd() -> String {
    "copilot".to_string()
}

fn default_copilot_agent() -> String {
    "implementor".to_string()
}

fn default_timeout_ms() -> u64 {
    30 * 60 * 1000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: AgentKind::default(),
            claude_cmd: default_claude_cmd(),
            copilot_cmd: default_copilot_cmd(),
            copilot_agent: default_copilot_agent(),
            model: None,
            timeout_ms: default_timeout_ms(),
            path_extras: Vec::new(),
        }
    }
}

/// Fleet scheduling and budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_parallel_issues")]
    pub max_parallel_issues: usize,
    #[serde(default = "default_parallel_agents")]
    pub max_parallel_agents: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_task: u32,
    /// Token budget for the whole run; 0 means no budget
    #[serde(default)]
    pub fleet_token_budget: u64,
    /// Token budget per issue; 0 means no budget
    #[serde(default)]
    pub issue_token_budget: u64,
    /// When false, prune deletes local branches only and leaves remote refs
    #[serde(default)]
    pub delete_remote_on_cleanup: bool,
    /// Sign commits with GPG
    #[serde(default)]
    pub sign_commits: bool,
    /// Collapse the branch into a single conventional commit before the PR
    /// instead of rewriting each commit individually
    #[serde(default)]
    pub squash_before_pr: bool,
}

fn default_parallel_issues() -> usize {
    3
}

fn default_parallel_agents() -> usize {
    2
}

fn default_max_retries() -> u32 {
    2
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_parallel_issues: default_parallel_issues(),
            max_parallel_agents: default_parallel_agents(),
            max_retries_per_task: default_max_retries(),
            fleet_token_budget: 0,
            issue_token_budget: 0,
            delete_remote_on_cleanup: false,
            sign_commits: false,
            squash_before_pr: false,
        }
    }
}

/// End-of-run triage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub min_severity: MinSeverity,
    #[serde(default = "default_max_issues")]
    pub max_issues_per_run: usize,
}

fn default_max_issues() -> usize {
    3
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            min_severity: MinSeverity::default(),
            max_issues_per_run: default_max_issues(),
        }
    }
}

/// The whole configuration tree as loaded from `cadre.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadreToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub triage: TriageConfig,
}

/// Runtime configuration: the file contents plus resolved paths and CLI
/// overlays. This is what the orchestrator components consume.
#[derive(Debug, Clone)]
pub struct CadreConfig {
    pub repo_dir: PathBuf,
    pub state_dir: PathBuf,
    pub project: ProjectConfig,
    pub agent: AgentConfig,
    pub fleet: FleetConfig,
    pub triage: TriageConfig,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub verbose: bool,
}

impl CadreConfig {
    /// Load `.cadre/cadre.toml` from `repo_dir` if present, falling back to
    /// defaults for anything unspecified.
    pub fn load(repo_dir: &Path) -> Result<Self> {
        let repo_dir = repo_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve repository directory {}", repo_dir.display()))?;

        let config_path = repo_dir.join(".cadre").join("cadre.toml");
        let file: CadreToml = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            CadreToml::default()
        };

        let state_dir = repo_dir.join(".cadre").join("state");
        Ok(Self {
            repo_dir,
            state_dir,
            project: file.project,
            agent: file.agent,
            fleet: file.fleet,
            triage: file.triage,
            dry_run: false,
            skip_validation: false,
            verbose: false,
        })
    }

    /// Project name, defaulting to the repository directory name.
    pub fn project_name(&self) -> String {
        self.project.name.clone().unwrap_or_else(|| {
            self.repo_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unnamed".to_string())
        })
    }

    /// Absolute worktree root directory.
    pub fn worktree_root(&self) -> PathBuf {
        if self.project.worktree_root.is_absolute() {
            self.project.worktree_root.clone()
        } else {
            self.repo_dir.join(&self.project.worktree_root)
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_max_parallel_issues(mut self, max: Option<usize>) -> Self {
        if let Some(max) = max {
            self.fleet.max_parallel_issues = max;
        }
        self
    }
}
