//! End-of-run triage: cluster runtime failure signals into deduplicated
//! topics and file a bounded number of high-severity reports.
//!
//! Every non-lifecycle event is a signal. Signals sharing
//! `<subsystem>:<failure-mode>:<impact-scope>` coalesce into one topic;
//! topics are ranked by severity, filtered by the configured minimum, and
//! the top `max_issues_per_run` are filed against the host platform.
//! Filing is best-effort: errors are logged, never propagated.

use crate::config::{MinSeverity, TriageConfig};
use crate::events::{Event, EventBus};
use crate::host::HostPlatform;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Topic severity, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Severe,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Severe => "severe",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl From<MinSeverity> for Severity {
    fn from(min: MinSeverity) -> Self {
        match min {
            MinSeverity::Low => Severity::Low,
            MinSeverity::Medium => Severity::Medium,
            MinSeverity::High => Severity::High,
            MinSeverity::Severe => Severity::Severe,
            MinSeverity::Critical => Severity::Critical,
        }
    }
}

/// A deduplicated cluster of failure signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageTopic {
    pub key: String,
    pub subsystem: String,
    pub failure_mode: String,
    pub impact_scope: String,
    pub severity: Severity,
    pub signals: Vec<Event>,
}

/// Outcome of one triage pass.
#[derive(Debug, Clone, Default)]
pub struct TriageReport {
    pub topics: Vec<TriageTopic>,
    pub filed: Vec<u64>,
    pub below_threshold: usize,
    pub over_cap: usize,
}

fn subsystem_for(event: &Event) -> &'static str {
    let kind = event.kind();
    if kind.starts_with("fleet") {
        "fleet"
    } else if kind.starts_with("agent-") {
        "agent"
    } else if kind.starts_with("issue-") {
        "issue-pipeline"
    } else if kind.starts_with("git-") || kind == "pr-created" {
        "git"
    } else if kind.starts_with("task-") {
        "task-queue"
    } else if kind.starts_with("budget-") {
        "budget"
    } else if kind == "ambiguity-detected" {
        "planning"
    } else {
        "triage"
    }
}

fn failure_mode_for(event: &Event) -> String {
    match event {
        Event::AgentFailed { timed_out: true, .. } => "agent-timeout".to_string(),
        Event::AgentFailed { .. } => "agent-error".to_string(),
        other => other.kind().to_string(),
    }
}

fn impact_scope_for(event: &Event) -> String {
    match event.issue_number() {
        Some(n) => format!("issue-{n}"),
        None => "fleet".to_string(),
    }
}

fn severity_for(event: &Event, issue_failed_total: usize) -> Severity {
    match event {
        Event::FleetInterrupted { .. } => Severity::Critical,
        Event::BudgetExceeded { .. } => Severity::Severe,
        Event::IssueFailed { .. } if issue_failed_total >= 2 => Severity::Severe,
        Event::IssueFailed { .. } | Event::AgentFailed { .. } => Severity::High,
        Event::TaskBlocked { .. } | Event::TaskRetry { .. } | Event::BudgetWarning { .. } => {
            Severity::Medium
        }
        _ => Severity::Low,
    }
}

/// Buffers the run's events and clusters them at end-of-run.
pub struct TriageCollector {
    config: TriageConfig,
}

impl TriageCollector {
    pub fn new(config: TriageConfig) -> Self {
        Self { config }
    }

    /// Cluster `events` into severity-ranked topics. Pure; no I/O.
    pub fn cluster(&self, events: &[Event]) -> Vec<TriageTopic> {
        let signals: Vec<&Event> = events.iter().filter(|e| !e.is_lifecycle()).collect();
        let issue_failed_total = signals
            .iter()
            .filter(|e| matches!(e, Event::IssueFailed { .. }))
            .count();

        let mut order: Vec<String> = Vec::new();
        let mut topics: HashMap<String, TriageTopic> = HashMap::new();
        for event in signals {
            let subsystem = subsystem_for(event);
            let failure_mode = failure_mode_for(event);
            let impact_scope = impact_scope_for(event);
            let key = format!("{subsystem}:{failure_mode}:{impact_scope}");
            let severity = severity_for(event, issue_failed_total);

            let topic = topics.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                TriageTopic {
                    key,
                    subsystem: subsystem.to_string(),
                    failure_mode,
                    impact_scope,
                    severity,
                    signals: Vec::new(),
                }
            });
            topic.severity = topic.severity.max(severity);
            topic.signals.push(event.clone());
        }

        let mut result: Vec<TriageTopic> = order
            .into_iter()
            .filter_map(|key| topics.remove(&key))
            .collect();
        // Descending by severity; first-seen order breaks ties.
        result.sort_by(|a, b| b.severity.cmp(&a.severity));
        result
    }

    /// Full triage pass: cluster, filter, file, report.
    pub async fn run_triage(
        &self,
        events: &[Event],
        host: &dyn HostPlatform,
        bus: &EventBus,
    ) -> TriageReport {
        let topics = self.cluster(events);
        for topic in &topics {
            bus.emit(Event::DogfoodSignal {
                topic_key: topic.key.clone(),
            });
        }

        let min: Severity = self.config.min_severity.into();
        let (eligible, below): (Vec<&TriageTopic>, Vec<&TriageTopic>) =
            topics.iter().partition(|t| t.severity >= min);
        let below_threshold = below.len();
        let cap = self.config.max_issues_per_run;
        let over_cap = eligible.len().saturating_sub(cap);

        let mut filed = Vec::new();
        for topic in eligible.into_iter().take(cap) {
            let title = format!(
                "[cadre triage] {}: {} {} ({})",
                topic.severity, topic.subsystem, topic.failure_mode, topic.impact_scope
            );
            let body = topic_body(topic);
            match host
                .file_issue(&title, &body, &["cadre-triage".to_string()])
                .await
            {
                Ok(number) => {
                    info!(number, key = %topic.key, "filed triage issue");
                    bus.emit(Event::DogfoodIssueFiled {
                        number,
                        topic_key: topic.key.clone(),
                    });
                    filed.push(number);
                }
                Err(e) => {
                    // Best-effort by contract; never propagate.
                    warn!(key = %topic.key, error = %e, "failed to file triage issue");
                    bus.emit(Event::DogfoodIssueSkipped {
                        topic_key: topic.key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        bus.emit(Event::DogfoodTriageCompleted {
            topics: topics.len(),
            filed: filed.len(),
        });
        info!(
            topics = topics.len(),
            filed = filed.len(),
            below_threshold,
            over_cap,
            "triage completed"
        );

        TriageReport {
            topics,
            filed,
            below_threshold,
            over_cap,
        }
    }
}

fn topic_body(topic: &TriageTopic) -> String {
    let mut body = format!(
        "Automated triage report.\n\n- subsystem: {}\n- failure mode: {}\n- impact scope: {}\n- severity: {}\n- supporting signals: {}\n\n## Signals\n",
        topic.subsystem,
        topic.failure_mode,
        topic.impact_scope,
        topic.severity,
        topic.signals.len(),
    );
    for signal in topic.signals.iter().take(20) {
        let line = serde_json::to_string(signal).unwrap_or_else(|_| signal.kind().to_string());
        body.push_str("- `");
        body.push_str(&line);
        body.push_str("`\n");
    }
    if topic.signals.len() > 20 {
        body.push_str(&format!("- ... and {} more\n", topic.signals.len() - 20));
    }
    body
}
