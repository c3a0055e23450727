use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cadre::agent::AgentLauncher;
use cadre::checkpoint::FleetCheckpointStore;
use cadre::config::CadreConfig;
use cadre::events::{Event, EventBus};
use cadre::host::{GhCli, HostPlatform};
use cadre::orchestrator::FleetOrchestrator;
use cadre::phases::PhaseRegistry;
use cadre::process::ProcessSupervisor;
use cadre::triage::TriageCollector;
use cadre::worktree::WorktreeManager;

/// Exit code for preflight validation failures.
const EXIT_VALIDATION: u8 = 2;

#[derive(Parser)]
#[command(name = "cadre")]
#[command(version, about = "Fleet orchestrator for LLM-driven code-change agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to orchestrate (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline for a set of issues
    Run {
        /// Issue numbers to process
        #[arg(required = true)]
        issues: Vec<u64>,
        /// Stop after the implementation phase
        #[arg(long)]
        dry_run: bool,
        /// Override the fleet concurrency cap
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Skip preflight validation
        #[arg(long)]
        skip_validation: bool,
    },
    /// Resume issues from their checkpoints
    Resume {
        #[arg(required = true)]
        issues: Vec<u64>,
        #[arg(long)]
        skip_validation: bool,
    },
    /// Show fleet checkpoint status
    Status,
    /// Remove an issue's worktree and branches
    Prune {
        issue: u64,
        /// Also delete the remote branch
        #[arg(long)]
        delete_remote: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "cadre=debug" } else { "cadre=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = cli.project_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    match run(cli, project_dir).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, project_dir: PathBuf) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            issues,
            dry_run,
            max_parallel,
            skip_validation,
        } => {
            let config = CadreConfig::load(&project_dir)?
                .with_dry_run(dry_run)
                .with_skip_validation(skip_validation)
                .with_verbose(cli.verbose)
                .with_max_parallel_issues(max_parallel);
            run_fleet(config, &issues).await
        }
        Commands::Resume {
            issues,
            skip_validation,
        } => {
            let config = CadreConfig::load(&project_dir)?
                .with_skip_validation(skip_validation)
                .with_verbose(cli.verbose);
            run_fleet(config, &issues).await
        }
        Commands::Status => {
            let config = CadreConfig::load(&project_dir)?;
            show_status(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prune {
            issue,
            delete_remote,
        } => {
            let config = CadreConfig::load(&project_dir)?;
            let worktrees = WorktreeManager::new(
                config.repo_dir.clone(),
                config.worktree_root(),
                config.project.base_branch.clone(),
                config.project.branch_template.clone(),
                config.project.agent_files.clone(),
            );
            let delete_remote = delete_remote || config.fleet.delete_remote_on_cleanup;
            worktrees.prune(issue, delete_remote).await?;
            println!("Pruned worktree for issue #{issue}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_fleet(config: CadreConfig, issues: &[u64]) -> Result<ExitCode> {
    let config = Arc::new(config);
    let supervisor = Arc::new(ProcessSupervisor::new());
    let launcher = AgentLauncher::from_config(&config.agent, supervisor.clone());
    let host: Arc<dyn HostPlatform> = Arc::new(GhCli::new(config.repo_dir.clone()));

    if let Err(e) = preflight(&config, &launcher).await {
        if config.skip_validation {
            tracing::warn!(error = %e, "validation failed; continuing (--skip-validation)");
        } else {
            eprintln!("{} {:#}", style("validation failed:").red().bold(), e);
            return Ok(ExitCode::from(EXIT_VALIDATION));
        }
    }

    let events = EventBus::new();
    spawn_progress_printer(&events);

    let cancel = cadre::shutdown::install_signal_handlers();
    let fleet = FleetOrchestrator::new(
        config.clone(),
        host.clone(),
        Arc::new(PhaseRegistry::standard()),
        launcher,
        supervisor,
        events.clone(),
        cancel,
    )
    .await?;

    let result = fleet.run(issues).await;

    let triage = TriageCollector::new(config.triage.clone());
    let report = triage.run_triage(&events.events(), host.as_ref(), &events).await;

    print_summary(&result, report.filed.len());
    write_run_report(&config, &result).await;

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Preflight checks: the repository opens and the agent CLI answers.
async fn preflight(config: &CadreConfig, launcher: &AgentLauncher) -> Result<()> {
    git2::Repository::open(&config.repo_dir)
        .with_context(|| format!("{} is not a git repository", config.repo_dir.display()))?;
    launcher
        .init()
        .await
        .context("agent backend failed its readiness probe")?;
    Ok(())
}

/// Thin console sink over the event stream.
fn spawn_progress_printer(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                Event::IssueStarted { issue } => {
                    println!("{} issue #{issue}", style("started").cyan())
                }
                Event::PhaseStarted { issue, name, .. } => {
                    println!("  {} #{issue} {name}", style("phase").dim())
                }
                Event::PhaseCompleted {
                    issue,
                    phase,
                    success,
                    ..
                } => {
                    let mark = if *success {
                        style("done").green()
                    } else {
                        style("failed").red()
                    };
                    println!("  {mark} #{issue} phase {phase}");
                }
                Event::TaskBlocked { issue, session, .. } => {
                    println!("  {} #{issue} session {session}", style("blocked").yellow())
                }
                Event::PrCreated { issue, url } => {
                    println!("{} #{issue}: {url}", style("pr").green().bold())
                }
                Event::IssueFailed { issue, error } => {
                    println!("{} issue #{issue}: {error}", style("failed").red().bold())
                }
                Event::BudgetExceeded { .. } => {
                    println!("{}", style("fleet budget exceeded").red().bold())
                }
                _ => {}
            }
        }
    });
}

fn print_summary(result: &cadre::orchestrator::FleetResult, filed: usize) {
    println!();
    println!(
        "{} {} issue(s), {} PR(s), {} failed, {} tokens, triage filed {}",
        if result.success {
            style("fleet ok").green().bold()
        } else {
            style("fleet failed").red().bold()
        },
        result.issues.len(),
        result.prs_created.len(),
        result.failed_issues.len(),
        result.total_tokens,
        filed,
    );
    for issue in &result.issues {
        let mark = if issue.success {
            style("ok".to_string()).green()
        } else {
            style(issue.status.to_string()).red()
        };
        println!(
            "  #{}: {} ({} phases, {} tokens)",
            issue.issue_number,
            mark,
            issue.phases.len(),
            issue.tokens
        );
    }
}

async fn write_run_report(config: &CadreConfig, result: &cadre::orchestrator::FleetResult) {
    let path = config
        .state_dir
        .join(format!("report-{}.json", result.run_id));
    let report = serde_json::json!({
        "runId": result.run_id,
        "success": result.success,
        "interrupted": result.interrupted,
        "totalTokens": result.total_tokens,
        "durationMs": result.duration_ms,
        "prsCreated": result.prs_created,
        "failedIssues": result.failed_issues,
        "issues": result.issues,
    });
    if let Ok(bytes) = serde_json::to_vec_pretty(&report)
        && let Err(e) = cadre::util::write_atomic(&path, &bytes).await
    {
        tracing::warn!(error = %e, "failed to write run report");
    }
}

async fn show_status(config: &CadreConfig) -> Result<()> {
    let path = config.state_dir.join("fleet.json");
    if !path.exists() {
        println!("No fleet checkpoint found at {}", path.display());
        return Ok(());
    }
    let (store, _) = FleetCheckpointStore::load_or_new(path, &config.project_name()).await?;
    let state = store.snapshot();
    println!(
        "{} ({} issue(s), resumed {} time(s))",
        style(&state.project_name).bold(),
        state.issues.len(),
        state.resume_count,
    );
    for (number, issue) in &state.issues {
        let phase = issue
            .last_phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{number}: {} (phase {phase}, {} tokens){}",
            issue.status,
            issue.tokens,
            issue
                .error
                .as_ref()
                .map(|e| format!(" — {e}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
