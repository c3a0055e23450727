//! Orchestration: the per-issue pipeline runner and the fleet driver.

pub mod fleet;
pub mod issue;

pub use fleet::{FleetOrchestrator, FleetResult};
pub use issue::{IssueOrchestrator, IssueResult};
