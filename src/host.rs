//! Minimal contract with the code-hosting platform.
//!
//! The wire protocol is out of scope; the default implementation shells out
//! to the `gh` CLI the same way the git layer shells out to `git`. Tests
//! substitute a mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A tracked issue. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub state: IssueState,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
}

impl Issue {
    /// Issue numbers this issue declares a dependency on, via
    /// `Depends-on: #N` lines in the body. The referenced issues' branches
    /// are merged under this issue's worktree before work starts.
    pub fn dependencies(&self) -> Vec<u64> {
        let mut deps = Vec::new();
        for line in self.body.lines() {
            let lowered = line.trim().to_lowercase();
            let Some(rest) = lowered.strip_prefix("depends-on:") else {
                continue;
            };
            for part in rest.split(|c: char| c == ',' || c.is_whitespace()) {
                if let Some(number) = part.trim().strip_prefix('#')
                    && let Ok(number) = number.parse::<u64>()
                    && !deps.contains(&number)
                {
                    deps.push(number);
                }
            }
        }
        deps
    }
}

/// A pull request opened for an issue branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrInfo {
    pub issue_number: u64,
    pub branch: String,
    pub url: String,
}

/// What the core needs from the code-hosting platform.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Fetch one issue's metadata.
    async fn fetch_issue(&self, number: u64) -> Result<Issue>;

    /// Open a pull request for an already-pushed branch.
    async fn create_pull_request(
        &self,
        issue_number: u64,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrInfo>;

    /// File a new issue (used by triage). Returns the new issue number.
    async fn file_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64>;
}

/// `gh`-CLI-backed implementation.
pub struct GhCli {
    repo_dir: PathBuf,
}

impl GhCli {
    pub fn new(repo_dir: PathBuf) -> Self {
        Self { repo_dir }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("gh")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .context("Failed to run gh")?;
        if !output.status.success() {
            anyhow::bail!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[async_trait]
impl HostPlatform for GhCli {
    async fn fetch_issue(&self, number: u64) -> Result<Issue> {
        let raw = self
            .gh(&[
                "issue",
                "view",
                &number.to_string(),
                "--json",
                "number,title,body,labels,state",
            ])
            .await?;
        let gh: GhIssue = serde_json::from_str(&raw)
            .with_context(|| format!("Unexpected gh issue payload for #{number}"))?;
        Ok(Issue {
            number: gh.number,
            title: gh.title,
            body: gh.body,
            labels: gh.labels.into_iter().map(|l| l.name).collect(),
            state: if gh.state.eq_ignore_ascii_case("closed") {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            created_at: None,
            updated_at: None,
        })
    }

    async fn create_pull_request(
        &self,
        issue_number: u64,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrInfo> {
        let url = self
            .gh(&[
                "pr", "create", "--head", branch, "--title", title, "--body", body,
            ])
            .await?;
        Ok(PrInfo {
            issue_number,
            branch: branch.to_string(),
            url,
        })
    }

    async fn file_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<u64> {
        let mut args: Vec<&str> = vec!["issue", "create", "--title", title, "--body", body];
        let joined = labels.join(",");
        if !labels.is_empty() {
            args.push("--label");
            args.push(&joined);
        }
        let url = self.gh(&args).await?;
        // gh prints the new issue URL; the number is the last path segment.
        url.rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .with_context(|| format!("Could not parse issue number from `{url}`"))
    }
}
