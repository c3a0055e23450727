//! Typed event stream for the orchestrator.
//!
//! Every component emits `Event`s to the shared `EventBus`. The bus fans
//! events out to live subscribers (notification sinks, the CLI progress
//! printer) over a broadcast channel and keeps a full in-order buffer for
//! the end-of-run triage pass.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Tagged union of everything observable during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    FleetStarted {
        run_id: String,
        issues: Vec<u64>,
    },
    FleetCompleted {
        succeeded: usize,
        failed: usize,
        total_tokens: u64,
    },
    FleetInterrupted {
        reason: String,
    },

    IssueStarted {
        issue: u64,
    },
    IssueCompleted {
        issue: u64,
        tokens: u64,
    },
    IssueFailed {
        issue: u64,
        error: String,
    },

    PhaseStarted {
        issue: u64,
        phase: u8,
        name: String,
    },
    PhaseCompleted {
        issue: u64,
        phase: u8,
        success: bool,
        duration_ms: u64,
    },
    PhaseSkipped {
        issue: u64,
        phase: u8,
    },

    AgentLaunched {
        issue: u64,
        agent: String,
        phase: u8,
        session: Option<String>,
    },
    AgentCompleted {
        issue: u64,
        agent: String,
        phase: u8,
        tokens: u64,
        duration_ms: u64,
    },
    AgentFailed {
        issue: u64,
        agent: String,
        phase: u8,
        timed_out: bool,
        error: String,
    },

    TaskStarted {
        issue: u64,
        session: String,
    },
    TaskCompleted {
        issue: u64,
        session: String,
    },
    TaskBlocked {
        issue: u64,
        session: String,
        reason: String,
    },
    TaskRetry {
        issue: u64,
        session: String,
        attempt: u32,
    },

    GitCommit {
        issue: u64,
        sha: String,
    },
    GitPush {
        issue: u64,
        branch: String,
    },
    PrCreated {
        issue: u64,
        url: String,
    },

    AmbiguityDetected {
        issue: u64,
        description: String,
    },
    BudgetWarning {
        issue: Option<u64>,
        used: u64,
        budget: u64,
    },
    BudgetExceeded {
        issue: Option<u64>,
        used: u64,
        budget: u64,
    },

    DogfoodSignal {
        topic_key: String,
    },
    DogfoodTriageCompleted {
        topics: usize,
        filed: usize,
    },
    DogfoodIssueFiled {
        number: u64,
        topic_key: String,
    },
    DogfoodIssueSkipped {
        topic_key: String,
        reason: String,
    },
}

impl Event {
    /// The kebab-case tag, as serialized. Used for topic derivation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FleetStarted { .. } => "fleet-started",
            Self::FleetCompleted { .. } => "fleet-completed",
            Self::FleetInterrupted { .. } => "fleet-interrupted",
            Self::IssueStarted { .. } => "issue-started",
            Self::IssueCompleted { .. } => "issue-completed",
            Self::IssueFailed { .. } => "issue-failed",
            Self::PhaseStarted { .. } => "phase-started",
            Self::PhaseCompleted { .. } => "phase-completed",
            Self::PhaseSkipped { .. } => "phase-skipped",
            Self::AgentLaunched { .. } => "agent-launched",
            Self::AgentCompleted { .. } => "agent-completed",
            Self::AgentFailed { .. } => "agent-failed",
            Self::TaskStarted { .. } => "task-started",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskBlocked { .. } => "task-blocked",
            Self::TaskRetry { .. } => "task-retry",
            Self::GitCommit { .. } => "git-commit",
            Self::GitPush { .. } => "git-push",
            Self::PrCreated { .. } => "pr-created",
            Self::AmbiguityDetected { .. } => "ambiguity-detected",
            Self::BudgetWarning { .. } => "budget-warning",
            Self::BudgetExceeded { .. } => "budget-exceeded",
            Self::DogfoodSignal { .. } => "dogfood-signal",
            Self::DogfoodTriageCompleted { .. } => "dogfood-triage-completed",
            Self::DogfoodIssueFiled { .. } => "dogfood-issue-filed",
            Self::DogfoodIssueSkipped { .. } => "dogfood-issue-skipped",
        }
    }

    /// Issue number the event pertains to, when it has one.
    pub fn issue_number(&self) -> Option<u64> {
        match self {
            Self::IssueStarted { issue }
            | Self::IssueCompleted { issue, .. }
            | Self::IssueFailed { issue, .. }
            | Self::PhaseStarted { issue, .. }
            | Self::PhaseCompleted { issue, .. }
            | Self::PhaseSkipped { issue, .. }
            | Self::AgentLaunched { issue, .. }
            | Self::AgentCompleted { issue, .. }
            | Self::AgentFailed { issue, .. }
            | Self::TaskStarted { issue, .. }
            | Self::TaskCompleted { issue, .. }
            | Self::TaskBlocked { issue, .. }
            | Self::TaskRetry { issue, .. }
            | Self::GitCommit { issue, .. }
            | Self::GitPush { issue, .. }
            | Self::PrCreated { issue, .. }
            | Self::AmbiguityDetected { issue, .. } => Some(*issue),
            Self::BudgetWarning { issue, .. } | Self::BudgetExceeded { issue, .. } => *issue,
            _ => None,
        }
    }

    /// Pure lifecycle events carry no failure signal and are excluded from
    /// triage clustering.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::FleetStarted { .. }
                | Self::IssueStarted { .. }
                | Self::PhaseStarted { .. }
                | Self::PhaseCompleted { .. }
                | Self::PhaseSkipped { .. }
        )
    }
}

/// Broadcast bus with a run-scoped buffer.
///
/// `emit` never fails: a bus with no live subscribers still records the
/// event for triage.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    buffer: Arc<Mutex<Vec<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn emit(&self, event: Event) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Snapshot of every event emitted so far, in order.
    pub fn events(&self) -> Vec<Event> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_serde_tag() {
        let event = Event::TaskBlocked {
            issue: 3,
            session: "s1".into(),
            reason: "retries exhausted".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }

    #[test]
    fn lifecycle_classification() {
        assert!(
            Event::PhaseStarted {
                issue: 1,
                phase: 2,
                name: "planning".into()
            }
            .is_lifecycle()
        );
        assert!(
            !Event::AgentFailed {
                issue: 1,
                agent: "claude".into(),
                phase: 3,
                timed_out: true,
                error: "timeout".into()
            }
            .is_lifecycle()
        );
        // fleet-completed is reportable, not pure lifecycle
        assert!(
            !Event::FleetCompleted {
                succeeded: 1,
                failed: 0,
                total_tokens: 0
            }
            .is_lifecycle()
        );
    }

    #[test]
    fn issue_number_extraction() {
        let fleet = Event::FleetInterrupted {
            reason: "SIGINT".into(),
        };
        assert_eq!(fleet.issue_number(), None);

        let scoped = Event::BudgetWarning {
            issue: Some(9),
            used: 80,
            budget: 100,
        };
        assert_eq!(scoped.issue_number(), Some(9));
    }

    #[test]
    fn bus_buffers_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(Event::IssueStarted { issue: 1 });
        bus.emit(Event::IssueCompleted {
            issue: 1,
            tokens: 10,
        });
        let events = bus.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "issue-started");
    }

    #[tokio::test]
    async fn bus_broadcasts_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::IssueStarted { issue: 5 });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.issue_number(), Some(5));
    }
}
