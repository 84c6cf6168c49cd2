//! Git plumbing behind trait seams.
//!
//! The engine and actions depend on the narrow traits; `CliGit` implements
//! them by shelling out to `git`, which is the only interface the worktree
//! layout needs. Trait seams keep rebase/push behavior mockable in tests.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait GitPusher: Send + Sync {
    async fn push(&self, repo: &Path, branch: &str, force: bool) -> Result<()>;
}

#[async_trait]
pub trait BranchFetcher: Send + Sync {
    async fn fetch_branch(&self, repo: &Path, branch: &str) -> Result<()>;
}

#[async_trait]
pub trait AncestorChecker: Send + Sync {
    /// Is `ancestor` an ancestor of `descendant`?
    async fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    /// The rebase was aborted; these files conflicted.
    Conflicts(Vec<String>),
}

#[async_trait]
pub trait RebaseRunner: Send + Sync {
    async fn rebase_onto(&self, repo: &Path, onto: &str) -> Result<RebaseOutcome>;
}

/// Worktree and working-copy operations the build setup depends on.
#[async_trait]
pub trait WorktreeGit: Send + Sync {
    async fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, base: &str)
    -> Result<()>;
    async fn pull_ff_only(&self, repo: &Path, branch: &str) -> Result<()>;
    async fn diff_stat(&self, repo: &Path, against: &str) -> Result<String>;
    async fn config_identity(&self, repo: &Path, name: &str, email: &str) -> Result<()>;
}

/// Subprocess-backed implementation of all git seams.
#[derive(Debug, Clone, Default)]
pub struct CliGit;

impl CliGit {
    async fn run(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn run_ok(repo: &Path, args: &[&str]) -> Result<String> {
        let output = Self::run(repo, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

}

#[async_trait]
impl WorktreeGit for CliGit {
    /// `git worktree add -b <branch> <path> <base>`.
    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        Self::run_ok(repo, &["worktree", "add", "-b", branch, path_str, base]).await?;
        Ok(())
    }

    async fn pull_ff_only(&self, repo: &Path, branch: &str) -> Result<()> {
        Self::run_ok(repo, &["pull", "--ff-only", "origin", branch]).await?;
        Ok(())
    }

    async fn diff_stat(&self, repo: &Path, against: &str) -> Result<String> {
        Self::run_ok(repo, &["diff", "--stat", against]).await
    }

    /// Repo-local author identity, set in worktrees before a build.
    async fn config_identity(&self, repo: &Path, name: &str, email: &str) -> Result<()> {
        Self::run_ok(repo, &["config", "user.name", name]).await?;
        Self::run_ok(repo, &["config", "user.email", email]).await?;
        Ok(())
    }
}

#[async_trait]
impl GitPusher for CliGit {
    async fn push(&self, repo: &Path, branch: &str, force: bool) -> Result<()> {
        let mut args = vec!["push", "-u", "origin", branch];
        if force {
            args.insert(1, "--force-with-lease");
        }
        Self::run_ok(repo, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl BranchFetcher for CliGit {
    async fn fetch_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        Self::run_ok(repo, &["fetch", "origin", branch]).await?;
        Ok(())
    }
}

#[async_trait]
impl AncestorChecker for CliGit {
    async fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = Self::run(
            repo,
            &["merge-base", "--is-ancestor", ancestor, descendant],
        )
        .await?;
        // Exit 0: ancestor. Exit 1: not. Anything else is a real error.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("git merge-base failed: {}", stderr.trim())
            }
        }
    }
}

#[async_trait]
impl RebaseRunner for CliGit {
    async fn rebase_onto(&self, repo: &Path, onto: &str) -> Result<RebaseOutcome> {
        let output = Self::run(repo, &["rebase", onto]).await?;
        if output.status.success() {
            return Ok(RebaseOutcome::Clean);
        }
        // Collect the conflicted paths, then abort so the tree is left clean.
        let conflicted = Self::run_ok(repo, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap_or_default();
        let files: Vec<String> = conflicted
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let _ = Self::run(repo, &["rebase", "--abort"]).await;
        if files.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git rebase {} failed: {}", onto, stderr.trim());
        }
        Ok(RebaseOutcome::Conflicts(files))
    }
}
