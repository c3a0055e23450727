//! Token accounting and budget enforcement.
//!
//! `TokenTracker` is an append-only record list with O(1) aggregates; a
//! single internal lock serializes `record` against the read paths, which is
//! all the synchronization the workload needs (one write per agent
//! invocation, reads at phase boundaries).

use crate::util::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One recorded agent invocation's token usage. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub issue_number: u64,
    pub agent: String,
    pub phase: u8,
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
struct Aggregates {
    records: Vec<TokenRecord>,
    total: u64,
    by_agent: HashMap<String, u64>,
    by_issue: HashMap<u64, u64>,
    by_phase: HashMap<u8, u64>,
}

/// Thread-safe token usage tracker shared across the fleet.
#[derive(Debug, Clone, Default)]
pub struct TokenTracker {
    inner: Arc<Mutex<Aggregates>>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, issue_number: u64, agent: &str, phase: u8, tokens: u64) {
        self.record_detailed(TokenRecord {
            issue_number,
            agent: agent.to_string(),
            phase,
            tokens,
            input: None,
            output: None,
            timestamp_ms: now_ms(),
        });
    }

    pub fn record_detailed(&self, record: TokenRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total += record.tokens;
        *inner.by_agent.entry(record.agent.clone()).or_default() += record.tokens;
        *inner.by_issue.entry(record.issue_number).or_default() += record.tokens;
        *inner.by_phase.entry(record.phase).or_default() += record.tokens;
        inner.records.push(record);
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    pub fn by_agent(&self) -> HashMap<String, u64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_agent
            .clone()
    }

    pub fn by_issue(&self) -> HashMap<u64, u64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_issue
            .clone()
    }

    pub fn by_phase(&self) -> HashMap<u8, u64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_phase
            .clone()
    }

    pub fn issue_total(&self, issue_number: u64) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_issue
            .get(&issue_number)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all records, in recording order.
    pub fn export_records(&self) -> Vec<TokenRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .clone()
    }

    /// Replay exported records into this tracker. `import(export())` on an
    /// empty tracker reproduces every aggregate exactly.
    pub fn import_records(&self, records: Vec<TokenRecord>) {
        for record in records {
            self.record_detailed(record);
        }
    }
}

/// Budget check outcome. `Ok` below 80%, `Warning` in [80%, 100%),
/// `Exceeded` at or above 100%. No budget (zero) always answers `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Exceeded,
}

fn status_for(used: u64, budget: u64) -> BudgetStatus {
    if budget == 0 {
        return BudgetStatus::Ok;
    }
    if used >= budget {
        BudgetStatus::Exceeded
    } else if used * 5 >= budget * 4 {
        BudgetStatus::Warning
    } else {
        BudgetStatus::Ok
    }
}

/// Answers `ok / warning / exceeded` for the fleet and per-issue budgets.
///
/// The guard itself is stateless over a monotone usage stream: once the
/// tracker's totals cross a threshold they never recede, so neither does
/// the answer. The fleet-level latch lives in the fleet orchestrator.
#[derive(Debug, Clone)]
pub struct BudgetGuard {
    tracker: TokenTracker,
    fleet_budget: u64,
    issue_budget: u64,
}

impl BudgetGuard {
    pub fn new(tracker: TokenTracker, fleet_budget: u64, issue_budget: u64) -> Self {
        Self {
            tracker,
            fleet_budget,
            issue_budget,
        }
    }

    pub fn check_fleet(&self) -> BudgetStatus {
        status_for(self.tracker.total(), self.fleet_budget)
    }

    pub fn check_issue(&self, issue_number: u64) -> BudgetStatus {
        status_for(self.tracker.issue_total(issue_number), self.issue_budget)
    }

    /// Worst of the fleet-wide and per-issue answers, for phase-level gating.
    pub fn check(&self, issue_number: u64) -> BudgetStatus {
        self.check_fleet().max(self.check_issue(issue_number))
    }

    pub fn fleet_budget(&self) -> u64 {
        self.fleet_budget
    }

    pub fn issue_budget(&self) -> u64 {
        self.issue_budget
    }
}
