//! End-to-end fleet scenarios against a scripted agent backend and an
//! in-memory host platform. Real git repositories and worktrees; only the
//! agent CLI and the code-hosting wire protocol are substituted.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use cadre::agent::{AgentBackend, AgentFailure, AgentInvocation, AgentLauncher, AgentResult};
use cadre::checkpoint::IssueStatus;
use cadre::config::CadreConfig;
use cadre::errors::CadreError;
use cadre::events::EventBus;
use cadre::host::{HostPlatform, Issue, IssueState, PrInfo};
use cadre::orchestrator::FleetOrchestrator;
use cadre::phases::{PHASE_INTEGRATION, PhaseContext, PhaseExecutor, PhaseRegistry};
use cadre::process::ProcessSupervisor;
use cadre::queue::TaskQueue;
use cadre::queue::plan::parse_plan;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Host platform stub: serves issue metadata, records PRs and filings.
#[derive(Default)]
struct MockHost {
    issues: Mutex<Vec<Issue>>,
    prs: Mutex<Vec<PrInfo>>,
    filed: Mutex<Vec<String>>,
}

impl MockHost {
    fn with_issues(numbers: &[u64]) -> Self {
        let issues = numbers
            .iter()
            .map(|&number| Issue {
                number,
                title: format!("Issue {number}"),
                body: format!("Do the thing for issue {number}"),
                labels: vec![],
                state: IssueState::Open,
                created_at: None,
                updated_at: None,
            })
            .collect();
        Self {
            issues: Mutex::new(issues),
            ..Self::default()
        }
    }
}

#[async_trait]
impl HostPlatform for MockHost {
    async fn fetch_issue(&self, number: u64) -> Result<Issue> {
        self.issues
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.number == number)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("issue {number} not found"))
    }

    async fn create_pull_request(
        &self,
        issue_number: u64,
        branch: &str,
        _title: &str,
        _body: &str,
    ) -> Result<PrInfo> {
        let pr = PrInfo {
            issue_number,
            branch: branch.to_string(),
            url: format!("https://example.invalid/pr/{issue_number}"),
        };
        self.prs.lock().unwrap().push(pr.clone());
        Ok(pr)
    }

    async fn file_issue(&self, title: &str, _body: &str, _labels: &[String]) -> Result<u64> {
        let mut filed = self.filed.lock().unwrap();
        filed.push(title.to_string());
        Ok(9000 + filed.len() as u64)
    }
}

/// Scripted agent: writes the output file each phase expects and reports a
/// fixed token count via the text the token parser consumes.
struct ScriptedBackend {
    tokens_per_invocation: u64,
    invocations: Mutex<Vec<(u64, u8)>>,
}

impl ScriptedBackend {
    fn new(tokens_per_invocation: u64) -> Self {
        Self {
            tokens_per_invocation,
            invocations: Mutex::new(Vec::new()),
        }
    }

    fn invoked_issues(&self) -> Vec<u64> {
        let mut issues: Vec<u64> = self
            .invocations
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| *n)
            .collect();
        issues.sort_unstable();
        issues.dedup();
        issues
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        worktree: &Path,
        _cancel: &CancellationToken,
    ) -> AgentResult {
        self.invocations
            .lock()
            .unwrap()
            .push((invocation.issue_number, invocation.phase));

        let output = match invocation.phase {
            1 => "# Analysis\n\nStraightforward change.\n".to_string(),
            2 => format!(
                "# Plan\n\n```cadre-json\n[{{\"id\": \"s1\", \"name\": \"apply change\", \
                 \"description\": \"write the change file\", \
                 \"files\": [\"change-{n}.txt\"], \"dependencies\": [], \
                 \"complexity\": \"simple\", \"acceptanceCriteria\": [\"file exists\"]}}]\n```\n",
                n = invocation.issue_number
            ),
            3 => {
                // The implementation session produces a real change in the
                // worktree.
                let change = worktree.join(format!("change-{}.txt", invocation.issue_number));
                std::fs::write(&change, "implemented\n").unwrap();
                "# Session summary\n\nWrote the change file.\n".to_string()
            }
            _ => "# Output\n".to_string(),
        };
        if let Some(parent) = invocation.output_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&invocation.output_path, output).unwrap();

        let stdout = format!("done\ntotal tokens: {}\n", self.tokens_per_invocation);
        let token_usage = cadre::agent::tokens::parse_token_usage(&stdout, "");
        AgentResult {
            agent: self.name().to_string(),
            success: true,
            exit_code: Some(0),
            timed_out: false,
            duration_ms: 3,
            stdout,
            stderr: String::new(),
            token_usage,
            output_path: invocation.output_path.clone(),
            output_exists: invocation.output_path.exists(),
            error: None,
        }
    }
}

/// Wraps the real integration phase but fails for one chosen issue.
struct FailIntegrationFor {
    issue: u64,
    inner: cadre::phases::integration::IntegrationPhase,
}

#[async_trait]
impl PhaseExecutor for FailIntegrationFor {
    fn id(&self) -> u8 {
        PHASE_INTEGRATION
    }

    fn name(&self) -> &'static str {
        "integration"
    }

    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf, CadreError> {
        if ctx.issue.number == self.issue {
            return Err(CadreError::PhaseFailed {
                phase: PHASE_INTEGRATION,
                name: "integration",
                message: "injected integration failure".to_string(),
            });
        }
        self.inner.execute(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Repository scaffolding
// ---------------------------------------------------------------------------

async fn git(dir: &Path, args: &[&str]) {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Repo with one commit on main and a bare `origin` remote.
async fn setup_repo() -> (tempfile::TempDir, tempfile::TempDir) {
    let repo = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    git(repo.path(), &["init", "-b", "main"]).await;
    git(repo.path(), &["config", "user.name", "test"]).await;
    git(repo.path(), &["config", "user.email", "test@test.invalid"]).await;
    std::fs::write(repo.path().join("README.md"), "# demo\n").unwrap();
    git(repo.path(), &["add", "."]).await;
    git(repo.path(), &["commit", "-m", "init", "--no-verify"]).await;
    git(remote.path(), &["init", "--bare"]).await;
    let remote_path = remote.path().to_string_lossy().to_string();
    git(repo.path(), &["remote", "add", "origin", &remote_path]).await;
    git(repo.path(), &["push", "origin", "main"]).await;
    (repo, remote)
}

struct Harness {
    fleet: FleetOrchestrator,
    host: Arc<MockHost>,
    backend: Arc<ScriptedBackend>,
    events: EventBus,
}

async fn harness(
    repo: &Path,
    configure: impl FnOnce(&mut CadreConfig),
    registry: PhaseRegistry,
    backend: Arc<ScriptedBackend>,
    issues: &[u64],
) -> Harness {
    let mut config = CadreConfig::load(repo).unwrap();
    configure(&mut config);
    let config = Arc::new(config);
    let host = Arc::new(MockHost::with_issues(issues));
    let supervisor = Arc::new(ProcessSupervisor::new());
    let launcher = AgentLauncher::with_backend(backend.clone());
    let events = EventBus::new();
    let fleet = FleetOrchestrator::new(
        config,
        host.clone(),
        Arc::new(registry),
        launcher,
        supervisor,
        events.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    Harness {
        fleet,
        host,
        backend,
        events,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

mod two_parallel_issues {
    use super::*;

    /// One issue succeeds through all five phases; the other fails
    /// non-critically at phase 4. The fleet still counts as a success and
    /// exactly one PR is opened.
    #[tokio::test]
    async fn one_succeeds_one_fails_non_critically() {
        let (repo, _remote) = setup_repo().await;
        let registry = PhaseRegistry::standard().with_executor(Arc::new(FailIntegrationFor {
            issue: 2,
            inner: cadre::phases::integration::IntegrationPhase,
        }));
        let h = harness(
            repo.path(),
            |c| c.fleet.max_parallel_issues = 2,
            registry,
            Arc::new(ScriptedBackend::new(100)),
            &[1, 2],
        )
        .await;

        let result = h.fleet.run(&[1, 2]).await;

        assert!(result.success, "fleet should succeed: {result:?}");
        assert!(result.failed_issues.is_empty());
        assert_eq!(result.prs_created.len(), 1);
        assert_eq!(h.host.prs.lock().unwrap().len(), 1);

        let issue1 = result.issues.iter().find(|r| r.issue_number == 1).unwrap();
        assert!(issue1.success);
        assert_eq!(issue1.status, IssueStatus::Completed);
        assert_eq!(issue1.phases.len(), 5);
        assert!(issue1.phases.iter().all(|p| p.success));
        assert!(issue1.pr_url.is_some());

        let issue2 = result.issues.iter().find(|r| r.issue_number == 2).unwrap();
        assert!(issue2.success, "non-critical failure keeps success");
        assert!(!issue2.phases[3].success, "phase 4 failed");
        assert!(issue2.pr_url.is_none());
    }
}

mod squash_before_pr {
    use super::*;

    /// Like the scripted backend, but the implementation session also
    /// commits its work (plus a scratch file) the way a real agent might.
    struct CommittingBackend {
        inner: ScriptedBackend,
    }

    #[async_trait]
    impl AgentBackend for CommittingBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn invoke(
            &self,
            invocation: &AgentInvocation,
            worktree: &Path,
            cancel: &CancellationToken,
        ) -> AgentResult {
            let result = self.inner.invoke(invocation, worktree, cancel).await;
            if invocation.phase == 3 {
                std::fs::write(worktree.join("task-1.md"), "agent scratch\n").unwrap();
                for args in [
                    vec!["add", "-f", "-A"],
                    vec!["commit", "-m", "wip: session work", "--no-verify"],
                ] {
                    let out = std::process::Command::new("git")
                        .args(&args)
                        .current_dir(worktree)
                        .output()
                        .unwrap();
                    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
                }
            }
            result
        }
    }

    /// With `squash_before_pr` set, the PR branch carries exactly one
    /// conventional commit with no internal files, and the PR opens.
    #[tokio::test]
    async fn branch_is_squashed_to_one_clean_commit() {
        let (repo, _remote) = setup_repo().await;
        let backend = Arc::new(CommittingBackend {
            inner: ScriptedBackend::new(10),
        });
        let mut config = CadreConfig::load(repo.path()).unwrap();
        config.fleet.squash_before_pr = true;
        let config = Arc::new(config);
        let host = Arc::new(MockHost::with_issues(&[1]));
        let events = EventBus::new();
        let fleet = FleetOrchestrator::new(
            config,
            host.clone(),
            Arc::new(PhaseRegistry::standard()),
            AgentLauncher::with_backend(backend),
            Arc::new(ProcessSupervisor::new()),
            events.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let result = fleet.run(&[1]).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.prs_created.len(), 1);

        // One commit past the branch point; no scratch files in the tree.
        let wt = repo.path().join(".cadre/worktrees/issue-1");
        let count = std::process::Command::new("git")
            .args(["rev-list", "--count", "origin/main..HEAD"])
            .current_dir(&wt)
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&count.stdout).trim(), "1");
        let files = std::process::Command::new("git")
            .args(["ls-tree", "-r", "--name-only", "HEAD"])
            .current_dir(&wt)
            .output()
            .unwrap();
        let files = String::from_utf8_lossy(&files.stdout).to_string();
        assert!(files.contains("change-1.txt"));
        assert!(!files.contains("task-1.md"));

        let subject = std::process::Command::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(&wt)
            .output()
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&subject.stdout).trim(),
            "feat: Issue 1 (#1)"
        );
    }
}

mod fleet_budget_latch {
    use super::*;

    /// Crossing the fleet budget short-circuits every pending issue with
    /// status budget-exceeded and spawns no further agents.
    #[tokio::test]
    async fn pending_issues_short_circuit() {
        let (repo, _remote) = setup_repo().await;
        // 4,000 tokens per invocation and three invocations in a dry run:
        // issue 1 alone blows the 10,000-token budget.
        let h = harness(
            repo.path(),
            |c| {
                c.fleet.max_parallel_issues = 1;
                c.fleet.fleet_token_budget = 10_000;
                c.dry_run = true;
            },
            PhaseRegistry::standard(),
            Arc::new(ScriptedBackend::new(4_000)),
            &[1, 2, 3],
        )
        .await;

        let result = h.fleet.run(&[1, 2, 3]).await;

        let issue1 = result.issues.iter().find(|r| r.issue_number == 1).unwrap();
        assert!(issue1.success);
        assert!(issue1.tokens > 10_000);

        for n in [2, 3] {
            let r = result.issues.iter().find(|r| r.issue_number == n).unwrap();
            assert_eq!(r.status, IssueStatus::BudgetExceeded, "issue {n}: {r:?}");
            assert_eq!(r.error.as_deref(), Some("Fleet budget exceeded"));
            assert!(r.phases.is_empty());
        }

        // Neither short-circuited issue caused an agent spawn.
        assert_eq!(h.backend.invoked_issues(), vec![1]);

        // The budget-exceeded event reached the stream.
        assert!(
            h.events
                .events()
                .iter()
                .any(|e| e.kind() == "budget-exceeded")
        );
    }
}

mod cyclic_plan {
    use super::*;

    /// A cyclic session list is rejected at queue construction with a
    /// message naming an involved session.
    #[test]
    fn construction_rejects_cycles() {
        let markdown = r#"
```cadre-json
[
  {"id": "A", "files": ["a.rs"], "dependencies": ["B"], "complexity": "simple"},
  {"id": "B", "files": ["b.rs"], "dependencies": ["A"], "complexity": "simple"}
]
```
"#;
        let sessions = parse_plan(markdown).unwrap();
        let err = TaskQueue::new(sessions).unwrap_err().to_string();
        assert!(
            err == "Cycle detected in session dependencies involving: A"
                || err == "Cycle detected in session dependencies involving: B",
            "unexpected: {err}"
        );
    }
}

mod file_collision_batching {
    use super::*;
    use cadre::queue::Session;

    fn session(id: &str, files: &[&str]) -> Session {
        Session {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            dependencies: vec![],
            files: files.iter().map(|f| f.to_string()).collect(),
            steps: vec![],
        }
    }

    /// Greedy batch selection drops the colliding session; collision
    /// detection reports the overlapping pair.
    #[test]
    fn batch_drops_collisions_and_detects_pairs() {
        let s1 = session("s1", &["a.ts"]);
        let s2 = session("s2", &["b.ts"]);
        let s3 = session("s3", &["a.ts"]);
        let queue = TaskQueue::new(vec![s1.clone(), s2.clone(), s3.clone()]).unwrap();

        let ready = queue.ready();
        let batch = queue.select_non_overlapping_batch(&ready, 10);
        let ids: Vec<&str> = batch.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let refs: Vec<&Session> = vec![&s1, &s2, &s3];
        let collisions = TaskQueue::detect_batch_collisions(&refs);
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].file, "a.ts");
        assert_eq!(collisions[0].first, "s1");
        assert_eq!(collisions[0].second, "s3");
    }
}

mod retry_and_block {
    use super::*;
    use cadre::events::Event;

    /// Agent that handles phases 1-2 normally but fails every
    /// implementation session.
    struct FailingSessions {
        inner: ScriptedBackend,
    }

    #[async_trait]
    impl AgentBackend for FailingSessions {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn invoke(
            &self,
            invocation: &AgentInvocation,
            worktree: &Path,
            cancel: &CancellationToken,
        ) -> AgentResult {
            let mut result = self.inner.invoke(invocation, worktree, cancel).await;
            if invocation.phase == 3 {
                result.success = false;
                result.exit_code = Some(1);
                result.error = Some(AgentFailure::Error {
                    message: "session agent crashed".to_string(),
                });
            }
            result
        }
    }

    /// A session failing past `max_retries_per_task` is retried, then
    /// blocked; with every session blocked the implementation phase is a
    /// critical failure and the issue fails.
    #[tokio::test]
    async fn exhausted_retries_block_the_session() {
        let (repo, _remote) = setup_repo().await;
        let inner = ScriptedBackend::new(10);
        let backend = Arc::new(FailingSessions { inner });

        let mut config = CadreConfig::load(repo.path()).unwrap();
        config.fleet.max_retries_per_task = 2;
        let config = Arc::new(config);
        let host = Arc::new(MockHost::with_issues(&[1]));
        let events = EventBus::new();
        let fleet = FleetOrchestrator::new(
            config,
            host,
            Arc::new(PhaseRegistry::standard()),
            AgentLauncher::with_backend(backend.clone()),
            Arc::new(ProcessSupervisor::new()),
            events.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let result = fleet.run(&[1]).await;
        assert!(!result.success);
        assert_eq!(result.failed_issues, vec![1]);

        let issue1 = &result.issues[0];
        let phase3 = issue1.phases.iter().find(|p| p.phase == 3).unwrap();
        assert!(!phase3.success);
        assert!(phase3.error.as_ref().unwrap().contains("blocked"));

        // First attempt + two retries = three phase-3 invocations.
        let session_attempts = backend
            .inner
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, phase)| *phase == 3)
            .count();
        assert_eq!(session_attempts, 3);

        let emitted = events.events();
        let retries = emitted.iter().filter(|e| e.kind() == "task-retry").count();
        assert_eq!(retries, 2);
        assert!(emitted.iter().any(|e| matches!(
            e,
            Event::TaskBlocked { issue: 1, session, .. } if session == "s1"
        )));
    }
}

mod resume_after_restart {
    use super::*;

    /// A second fleet run over the same state dir skips completed phases.
    #[tokio::test]
    async fn completed_phases_are_skipped_on_resume() {
        let (repo, _remote) = setup_repo().await;
        let backend = Arc::new(ScriptedBackend::new(10));
        let h = harness(
            repo.path(),
            |c| c.dry_run = true,
            PhaseRegistry::standard(),
            backend.clone(),
            &[1],
        )
        .await;
        let first = h.fleet.run(&[1]).await;
        assert!(first.success);
        let first_invocations = backend.invocations.lock().unwrap().len();
        assert!(first_invocations >= 3);

        // New orchestrator over the same repo + state dir; phases 1-3 are
        // checkpointed, so no further agent invocations happen.
        let h2 = harness(
            repo.path(),
            |c| c.dry_run = true,
            PhaseRegistry::standard(),
            backend.clone(),
            &[1],
        )
        .await;
        let second = h2.fleet.run(&[1]).await;
        assert!(second.success);
        assert_eq!(
            backend.invocations.lock().unwrap().len(),
            first_invocations,
            "resume must not relaunch completed phases"
        );

        let skipped = h2
            .events
            .events()
            .iter()
            .filter(|e| e.kind() == "phase-skipped")
            .count();
        assert_eq!(skipped, 3);
    }
}

mod interrupted_fleet {
    use super::*;

    /// An armed cancellation token interrupts the run and produces the
    /// fleet-interrupted event; tracked children drain to zero.
    #[tokio::test]
    async fn cancellation_interrupts_and_drains() {
        let (repo, _remote) = setup_repo().await;
        let config = Arc::new(CadreConfig::load(repo.path()).unwrap());
        let host = Arc::new(MockHost::with_issues(&[1]));
        let supervisor = Arc::new(ProcessSupervisor::new());
        let backend = Arc::new(ScriptedBackend::new(10));
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let fleet = FleetOrchestrator::new(
            config,
            host,
            Arc::new(PhaseRegistry::standard()),
            AgentLauncher::with_backend(backend.clone()),
            supervisor.clone(),
            events.clone(),
            cancel,
        )
        .await
        .unwrap();

        let result = fleet.run(&[1]).await;
        assert!(result.interrupted);
        assert!(!result.success);
        assert!(backend.invocations.lock().unwrap().is_empty());
        assert!(
            events
                .events()
                .iter()
                .any(|e| e.kind() == "fleet-interrupted")
        );
        assert_eq!(supervisor.tracked_count(), 0);
    }
}

mod triage_end_to_end {
    use super::*;
    use cadre::triage::TriageCollector;

    /// A failing fleet run produces triage topics and files them against
    /// the host platform.
    #[tokio::test]
    async fn failures_become_filed_topics() {
        let (repo, _remote) = setup_repo().await;
        // Host knows no issues, so every pipeline fails at fetch.
        let mut config = CadreConfig::load(repo.path()).unwrap();
        config.fleet.max_parallel_issues = 2;
        let config = Arc::new(config);
        let host = Arc::new(MockHost::default());
        let events = EventBus::new();
        let fleet = FleetOrchestrator::new(
            config.clone(),
            host.clone(),
            Arc::new(PhaseRegistry::standard()),
            AgentLauncher::with_backend(Arc::new(ScriptedBackend::new(1))),
            Arc::new(ProcessSupervisor::new()),
            events.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let result = fleet.run(&[1, 2]).await;
        assert!(!result.success);
        assert_eq!(result.failed_issues, vec![1, 2]);

        let collector = TriageCollector::new(config.triage.clone());
        let report = collector
            .run_triage(&events.events(), host.as_ref(), &events)
            .await;
        // Two issue-failed topics, both severe (>= 2 failures), both filed.
        assert_eq!(report.filed.len(), 2);
        assert!(h_all_severe(&report));
        assert_eq!(host.filed.lock().unwrap().len(), 2);
    }

    fn h_all_severe(report: &cadre::triage::TriageReport) -> bool {
        report
            .topics
            .iter()
            .filter(|t| t.failure_mode == "issue-failed")
            .all(|t| t.severity == cadre::triage::Severity::Severe)
    }
}
