//! Per-issue worktree lifecycle.
//!
//! Each active issue owns exactly one worktree directory under the
//! configured root, checked out on a branch derived from the branch
//! template. Provisioning, dependency-branch merging and pruning all run
//! `git` as a subprocess; repository inspection (base-commit resolution,
//! branch existence) goes through git2.

pub mod commit;
pub mod rebase;

use crate::errors::{MergeConflictInfo, WorktreeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;
use tracing::{debug, info};

/// Maximum sanitized branch-name length.
const MAX_BRANCH_LEN: usize = 100;

/// Internal scratch directory created inside every worktree.
pub const CADRE_DIR: &str = ".cadre";

/// A provisioned worktree, owned by a single issue pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub issue_number: u64,
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
    pub synced_agent_files: Vec<String>,
}

impl WorktreeInfo {
    /// Run-scoped directory for this issue inside the worktree.
    pub fn issue_dir(&self) -> PathBuf {
        self.path
            .join(CADRE_DIR)
            .join("issues")
            .join(self.issue_number.to_string())
    }
}

/// Callback invoked when merging dependency branches conflicts. A resolver
/// that returns `Ok` must leave the index conflict-free; the manager then
/// commits the merge and carries on.
#[async_trait]
pub trait MergeResolver: Send + Sync {
    async fn resolve(
        &self,
        conflict: &MergeConflictInfo,
        worktree: &Path,
    ) -> anyhow::Result<()>;
}

/// Lowercase, map anything outside `[a-z0-9/_-]` to `-`, collapse dash
/// runs, trim stray dashes, cap at 100 chars. Idempotent.
pub fn sanitize_branch(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = false;
    for ch in name.to_lowercase().chars() {
        let mapped = match ch {
            'a'..='z' | '0'..='9' | '/' | '_' => ch,
            _ => '-',
        };
        if mapped == '-' {
            if prev_dash {
                continue;
            }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        out.push(mapped);
    }
    let mut out = out.trim_matches('-').to_string();
    if out.len() > MAX_BRANCH_LEN {
        out.truncate(MAX_BRANCH_LEN);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

/// Provisions, resumes and removes per-issue worktrees.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_dir: PathBuf,
    worktree_root: PathBuf,
    base_branch: String,
    branch_template: String,
    remote: String,
    agent_files: Vec<String>,
}

impl WorktreeManager {
    pub fn new(
        repo_dir: PathBuf,
        worktree_root: PathBuf,
        base_branch: String,
        branch_template: String,
        agent_files: Vec<String>,
    ) -> Self {
        Self {
            repo_dir,
            worktree_root,
            base_branch,
            branch_template,
            remote: "origin".to_string(),
            agent_files,
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Branch name for an issue, from the template, sanitized.
    pub fn branch_for_issue(&self, issue: u64) -> String {
        sanitize_branch(&self.branch_template.replace("{issue}", &issue.to_string()))
    }

    /// Worktree directory for an issue.
    pub fn path_for_issue(&self, issue: u64) -> PathBuf {
        self.worktree_root.join(format!("issue-{issue}"))
    }

    /// Run git with `args` in `cwd`, failing on non-zero exit.
    pub(crate) async fn git(&self, cwd: &Path, args: &[&str]) -> Result<Output, WorktreeError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(WorktreeError::Io)?;
        if !output.status.success() {
            return Err(WorktreeError::GitCommand {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Run git, returning the raw output whether or not it succeeded.
    pub(crate) async fn git_unchecked(
        &self,
        cwd: &Path,
        args: &[&str],
    ) -> Result<Output, WorktreeError> {
        tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(WorktreeError::Io)
    }

    fn stdout_line(output: &Output) -> String {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub(crate) fn stdout_lines(output: &Output) -> Vec<String> {
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Resolve the base commit: prefer `origin/<base>`, fall back to the
    /// local ref.
    pub fn resolve_base_commit(&self) -> Result<String, WorktreeError> {
        let repo = git2::Repository::open(&self.repo_dir).map_err(|source| {
            WorktreeError::RepoOpen {
                path: self.repo_dir.clone(),
                source,
            }
        })?;
        let remote_ref = format!("{}/{}", self.remote, self.base_branch);
        let object = repo
            .revparse_single(&remote_ref)
            .or_else(|_| repo.revparse_single(&self.base_branch))
            .map_err(|source| WorktreeError::BaseCommit {
                base: self.base_branch.clone(),
                source,
            })?;
        Ok(object.id().to_string())
    }

    fn local_branch_exists(&self, branch: &str) -> bool {
        git2::Repository::open(&self.repo_dir)
            .and_then(|repo| repo.find_branch(branch, git2::BranchType::Local).map(|_| ()))
            .is_ok()
    }

    /// Provision the worktree for an issue. If the directory already exists
    /// the existing tree is reused and agent files are re-synced.
    pub async fn provision(&self, issue: u64) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.path_for_issue(issue);
        let branch = self.branch_for_issue(issue);
        let base_commit = self.resolve_base_commit()?;

        if path.exists() {
            debug!(issue, path = %path.display(), "worktree already provisioned");
            let synced = self.sync_agent_files(&path).await?;
            return Ok(WorktreeInfo {
                issue_number: issue,
                path,
                branch,
                base_commit,
                synced_agent_files: synced,
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if !self.local_branch_exists(&branch) {
            self.git(&self.repo_dir, &["branch", &branch, &base_commit])
                .await?;
        }
        let path_str = path.to_string_lossy().to_string();
        self.git(&self.repo_dir, &["worktree", "add", &path_str, &branch])
            .await?;

        info!(issue, branch, path = %path.display(), "provisioned worktree");
        self.init_scratch_dirs(issue, &path).await?;
        self.append_private_excludes(&path).await?;
        let synced = self.sync_agent_files(&path).await?;

        Ok(WorktreeInfo {
            issue_number: issue,
            path,
            branch,
            base_commit,
            synced_agent_files: synced,
        })
    }

    /// Resume an issue whose worktree directory is gone: fetch and track
    /// the remote branch. Fails with `RemoteBranchMissing` when the remote
    /// has no branch to resume from.
    pub async fn resume(&self, issue: u64) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.path_for_issue(issue);
        if path.exists() {
            return self.provision(issue).await;
        }

        let branch = self.branch_for_issue(issue);
        self.git(&self.repo_dir, &["fetch", &self.remote]).await?;

        let remote_exists = self
            .git_unchecked(
                &self.repo_dir,
                &["ls-remote", "--exit-code", "--heads", &self.remote, &branch],
            )
            .await?
            .status
            .success();
        if !remote_exists {
            return Err(WorktreeError::RemoteBranchMissing { issue, branch });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path.to_string_lossy().to_string();
        if self.local_branch_exists(&branch) {
            self.git(&self.repo_dir, &["worktree", "add", &path_str, &branch])
                .await?;
        } else {
            let remote_branch = format!("{}/{}", self.remote, branch);
            self.git(
                &self.repo_dir,
                &["worktree", "add", "--track", "-b", &branch, &path_str, &remote_branch],
            )
            .await?;
        }

        info!(issue, branch, "resumed worktree from remote branch");
        let base_commit = self.resolve_base_commit()?;
        self.init_scratch_dirs(issue, &path).await?;
        self.append_private_excludes(&path).await?;
        let synced = self.sync_agent_files(&path).await?;

        Ok(WorktreeInfo {
            issue_number: issue,
            path,
            branch,
            base_commit,
            synced_agent_files: synced,
        })
    }

    /// Provision an issue worktree on top of merged dependency branches.
    ///
    /// Dependency branches are merged in the given (topological) order onto
    /// a synthetic `cadre/deps-<N>` base; the issue branch is then cut from
    /// the merged head. A merge conflict is routed to `resolver` when one is
    /// supplied, otherwise the merge is aborted and the structured conflict
    /// descriptor is written to `dep-conflict.json` and returned.
    pub async fn provision_with_deps(
        &self,
        issue: u64,
        dependency_branches: &[String],
        resolver: Option<&dyn MergeResolver>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        if dependency_branches.is_empty() {
            return self.provision(issue).await;
        }

        let path = self.path_for_issue(issue);
        if path.exists() {
            return self.provision(issue).await;
        }

        let branch = self.branch_for_issue(issue);
        let deps_branch = sanitize_branch(&format!("cadre/deps-{issue}"));
        let base_commit = self.resolve_base_commit()?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The deps branch is synthetic; recreate it at base every time.
        self.git(&self.repo_dir, &["branch", "-f", &deps_branch, &base_commit])
            .await?;
        let path_str = path.to_string_lossy().to_string();
        self.git(&self.repo_dir, &["worktree", "add", &path_str, &deps_branch])
            .await?;
        self.init_scratch_dirs(issue, &path).await?;

        for dep in dependency_branches {
            let merge = self
                .git_unchecked(&path, &["merge", "--no-ff", "--no-edit", dep])
                .await?;
            if !merge.status.success() {
                let conflicted = self.conflicted_files(&path).await?;
                let info = MergeConflictInfo {
                    conflicted_files: conflicted,
                    deps_branch: deps_branch.clone(),
                    issue_branch: branch.clone(),
                };

                match resolver {
                    Some(resolver) => {
                        resolver
                            .resolve(&info, &path)
                            .await
                            .map_err(|e| WorktreeError::GitCommand {
                                command: format!("merge {dep}"),
                                stderr: format!("resolver failed: {e}"),
                            })?;
                        self.git(&path, &["add", "-A"]).await?;
                        self.git(&path, &["commit", "--no-edit", "--no-verify"])
                            .await?;
                    }
                    None => {
                        let conflict_path = path
                            .join(CADRE_DIR)
                            .join("issues")
                            .join(issue.to_string())
                            .join("dep-conflict.json");
                        if let Ok(json) = serde_json::to_vec_pretty(&info) {
                            let _ = crate::util::write_atomic(&conflict_path, &json).await;
                        }
                        let _ = self.git_unchecked(&path, &["merge", "--abort"]).await;
                        return Err(WorktreeError::MergeConflict { info });
                    }
                }
            }
        }

        // Cut the issue branch from the merged head.
        self.git(&path, &["checkout", "-B", &branch]).await?;

        info!(issue, branch, deps = dependency_branches.len(), "provisioned worktree with merged deps");
        self.append_private_excludes(&path).await?;
        let synced = self.sync_agent_files(&path).await?;

        Ok(WorktreeInfo {
            issue_number: issue,
            path,
            branch,
            base_commit,
            synced_agent_files: synced,
        })
    }

    /// Paths currently in the unmerged (conflicted) state.
    pub(crate) async fn conflicted_files(&self, worktree: &Path) -> Result<Vec<String>, WorktreeError> {
        let output = self
            .git(worktree, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(Self::stdout_lines(&output))
    }

    /// Remove the worktree and local branch. The remote branch is deleted
    /// only when `delete_remote` is set; otherwise stale remote refs are
    /// left alone.
    pub async fn prune(&self, issue: u64, delete_remote: bool) -> Result<(), WorktreeError> {
        let path = self.path_for_issue(issue);
        let branch = self.branch_for_issue(issue);

        if path.exists() {
            let path_str = path.to_string_lossy().to_string();
            self.git(&self.repo_dir, &["worktree", "remove", "--force", &path_str])
                .await?;
        }
        if self.local_branch_exists(&branch) {
            self.git(&self.repo_dir, &["branch", "-D", &branch]).await?;
        }
        let deps_branch = sanitize_branch(&format!("cadre/deps-{issue}"));
        if self.local_branch_exists(&deps_branch) {
            self.git(&self.repo_dir, &["branch", "-D", &deps_branch]).await?;
        }
        if delete_remote {
            self.git(&self.repo_dir, &["push", &self.remote, "--delete", &branch])
                .await?;
        }
        info!(issue, branch, delete_remote, "pruned worktree");
        Ok(())
    }

    async fn init_scratch_dirs(&self, issue: u64, worktree: &Path) -> Result<(), WorktreeError> {
        let issue_dir = worktree.join(CADRE_DIR).join("issues").join(issue.to_string());
        for sub in ["logs", "contexts", "outputs"] {
            tokio::fs::create_dir_all(issue_dir.join(sub)).await?;
        }
        tokio::fs::create_dir_all(worktree.join(CADRE_DIR).join("tasks")).await?;
        Ok(())
    }

    /// Append internal paths to the worktree's *private* git exclude file,
    /// never the repository's tracked `.gitignore`.
    async fn append_private_excludes(&self, worktree: &Path) -> Result<(), WorktreeError> {
        let output = self
            .git(worktree, &["rev-parse", "--git-path", "info/exclude"])
            .await?;
        let raw = Self::stdout_line(&output);
        let exclude_path = {
            let p = PathBuf::from(&raw);
            if p.is_absolute() { p } else { worktree.join(p) }
        };
        if let Some(parent) = exclude_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = tokio::fs::read_to_string(&exclude_path)
            .await
            .unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut wanted = vec![format!("{CADRE_DIR}/")];
        wanted.extend(self.agent_files.iter().cloned());
        for entry in wanted {
            if !existing.lines().any(|l| l.trim() == entry) {
                lines.push(entry);
            }
        }
        if !lines.is_empty() {
            let mut contents = existing;
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&lines.join("\n"));
            contents.push('\n');
            tokio::fs::write(&exclude_path, contents).await?;
        }
        Ok(())
    }

    /// Copy configured agent instruction files from the repository into the
    /// worktree. Returns the relative paths actually synced.
    async fn sync_agent_files(&self, worktree: &Path) -> Result<Vec<String>, WorktreeError> {
        let mut synced = Vec::new();
        for rel in &self.agent_files {
            let src = self.repo_dir.join(rel);
            if !src.exists() {
                continue;
            }
            let dst = worktree.join(rel);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &dst).await?;
            synced.push(rel.clone());
        }
        Ok(synced)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Initialize a repo with one commit on `main` and a configured user.
    pub(crate) async fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-b", "main"]).await;
        run_git(dir, &["config", "user.name", "test"]).await;
        run_git(dir, &["config", "user.email", "test@test.invalid"]).await;
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        run_git(dir, &["add", "."]).await;
        run_git(dir, &["commit", "-m", "init", "--no-verify"]).await;
    }

    pub(crate) async fn run_git(dir: &Path, args: &[&str]) {
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

    pub(crate) fn manager(repo: &Path) -> WorktreeManager {
        WorktreeManager::new(
            repo.to_path_buf(),
            repo.join(".cadre/worktrees"),
            "main".to_string(),
            "cadre/issue-{issue}".to_string(),
            vec![],
        )
    }

    #[test]
    fn sanitize_maps_and_collapses() {
        assert_eq!(sanitize_branch("cadre/issue-42"), "cadre/issue-42");
        assert_eq!(sanitize_branch("Cadre/Issue #42!!"), "cadre/issue-42");
        assert_eq!(sanitize_branch("a   b---c"), "a-b-c");
        assert_eq!(sanitize_branch("--leading-and-trailing--"), "leading-and-trailing");
    }

    #[test]
    fn sanitize_is_idempotent_and_bounded() {
        let inputs = [
            "cadre/issue-{weird NAME}",
            "UPPER/case_branch",
            &"x".repeat(300),
            "émoji 🚀 branch",
        ];
        for input in inputs {
            let once = sanitize_branch(input);
            assert_eq!(sanitize_branch(&once), once, "not idempotent for {input}");
            assert!(once.len() <= MAX_BRANCH_LEN);
            assert!(
                once.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '/' | '_' | '-')),
                "bad chars in {once}"
            );
        }
    }

    #[tokio::test]
    async fn provision_creates_worktree_branch_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let mgr = manager(dir.path());

        let info = mgr.provision(7).await.unwrap();
        assert_eq!(info.branch, "cadre/issue-7");
        assert!(info.path.join(".cadre/issues/7/logs").is_dir());
        assert!(info.path.join(".cadre/tasks").is_dir());

        // Private exclude carries the scratch dir; tracked .gitignore untouched.
        let exclude = mgr
            .git(&info.path, &["rev-parse", "--git-path", "info/exclude"])
            .await
            .unwrap();
        let raw = String::from_utf8_lossy(&exclude.stdout).trim().to_string();
        let exclude_path = if Path::new(&raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            info.path.join(raw)
        };
        let contents = std::fs::read_to_string(exclude_path).unwrap();
        assert!(contents.lines().any(|l| l == ".cadre/"));
        assert!(!dir.path().join(".gitignore").exists());
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let mgr = manager(dir.path());

        let first = mgr.provision(3).await.unwrap();
        let second = mgr.provision(3).await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, second.branch);
    }

    #[tokio::test]
    async fn resume_without_remote_branch_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let remote_dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        run_git(remote_dir.path(), &["init", "--bare"]).await;
        let remote_path = remote_dir.path().to_string_lossy().to_string();
        run_git(dir.path(), &["remote", "add", "origin", &remote_path]).await;
        run_git(dir.path(), &["push", "origin", "main"]).await;

        let mgr = manager(dir.path());
        let err = mgr.resume(9).await.unwrap_err();
        assert!(matches!(
            err,
            WorktreeError::RemoteBranchMissing { issue: 9, .. }
        ));
    }

    #[tokio::test]
    async fn resume_tracks_existing_remote_branch() {
        let dir = tempfile::tempdir().unwrap();
        let remote_dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        run_git(remote_dir.path(), &["init", "--bare"]).await;
        let remote_path = remote_dir.path().to_string_lossy().to_string();
        run_git(dir.path(), &["remote", "add", "origin", &remote_path]).await;
        run_git(dir.path(), &["push", "origin", "main"]).await;
        run_git(dir.path(), &["branch", "cadre/issue-5"]).await;
        run_git(dir.path(), &["push", "origin", "cadre/issue-5"]).await;
        run_git(dir.path(), &["branch", "-D", "cadre/issue-5"]).await;

        let mgr = manager(dir.path());
        let info = mgr.resume(5).await.unwrap();
        assert!(info.path.is_dir());
        assert_eq!(info.branch, "cadre/issue-5");
    }

    #[tokio::test]
    async fn provision_with_deps_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        // Two dependency branches touching different files.
        run_git(dir.path(), &["checkout", "-b", "cadre/issue-1"]).await;
        std::fs::write(dir.path().join("one.txt"), "one\n").unwrap();
        run_git(dir.path(), &["add", "."]).await;
        run_git(dir.path(), &["commit", "-m", "dep one", "--no-verify"]).await;
        run_git(dir.path(), &["checkout", "main"]).await;
        run_git(dir.path(), &["checkout", "-b", "cadre/issue-2"]).await;
        std::fs::write(dir.path().join("two.txt"), "two\n").unwrap();
        run_git(dir.path(), &["add", "."]).await;
        run_git(dir.path(), &["commit", "-m", "dep two", "--no-verify"]).await;
        run_git(dir.path(), &["checkout", "main"]).await;

        let mgr = manager(dir.path());
        let deps = vec!["cadre/issue-1".to_string(), "cadre/issue-2".to_string()];
        let info = mgr.provision_with_deps(3, &deps, None).await.unwrap();
        assert!(info.path.join("one.txt").exists());
        assert!(info.path.join("two.txt").exists());
        assert_eq!(info.branch, "cadre/issue-3");
    }

    #[tokio::test]
    async fn dep_merge_conflict_writes_descriptor_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        // Both branches rewrite README.md differently.
        run_git(dir.path(), &["checkout", "-b", "cadre/issue-1"]).await;
        std::fs::write(dir.path().join("README.md"), "from one\n").unwrap();
        run_git(dir.path(), &["add", "."]).await;
        run_git(dir.path(), &["commit", "-m", "one", "--no-verify"]).await;
        run_git(dir.path(), &["checkout", "main"]).await;
        run_git(dir.path(), &["checkout", "-b", "cadre/issue-2"]).await;
        std::fs::write(dir.path().join("README.md"), "from two\n").unwrap();
        run_git(dir.path(), &["add", "."]).await;
        run_git(dir.path(), &["commit", "-m", "two", "--no-verify"]).await;
        run_git(dir.path(), &["checkout", "main"]).await;

        let mgr = manager(dir.path());
        let deps = vec!["cadre/issue-1".to_string(), "cadre/issue-2".to_string()];
        let err = mgr.provision_with_deps(4, &deps, None).await.unwrap_err();
        match err {
            WorktreeError::MergeConflict { info } => {
                assert_eq!(info.conflicted_files, vec!["README.md"]);
                assert_eq!(info.deps_branch, "cadre/deps-4");
                assert_eq!(info.issue_branch, "cadre/issue-4");
            }
            other => panic!("expected MergeConflict, got {other:?}"),
        }
        let descriptor = mgr
            .path_for_issue(4)
            .join(".cadre/issues/4/dep-conflict.json");
        assert!(descriptor.exists());
    }

    #[tokio::test]
    async fn prune_removes_worktree_and_local_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let mgr = manager(dir.path());

        let info = mgr.provision(6).await.unwrap();
        assert!(info.path.is_dir());
        mgr.prune(6, false).await.unwrap();
        assert!(!info.path.exists());

        let repo = git2::Repository::open(dir.path()).unwrap();
        assert!(repo.find_branch("cadre/issue-6", git2::BranchType::Local).is_err());
    }
}
