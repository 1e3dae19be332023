//! Storage backends that materialize isolated working copies.
//!
//! The manager only cares about the contract: create a versioned branch of
//! the base tree at a path, and tear it down later. Git worktrees are the
//! production implementation; tests inject stubs.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ConcordError, Result};

#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    /// Create an isolated working copy at `path`, branched as `branch`.
    async fn create(&self, path: &Path, branch: &str) -> Result<()>;

    /// Tear the working copy down. Must tolerate the copy already being
    /// gone; the caller treats teardown failure as non-fatal.
    async fn remove(&self, path: &Path, branch: &str) -> Result<()>;
}

/// Git-worktree backend: each workspace is `git worktree add -b <branch>`.
pub struct GitWorktreeBackend {
    repo_root: PathBuf,
}

impl GitWorktreeBackend {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.repo_root.display(), "Running git command");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await?;
        Ok(output)
    }

    async fn git_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.git(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConcordError::WorkspaceBackend {
                message: format!("git {}: {}", args.join(" "), stderr.trim()),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl WorkspaceBackend for GitWorktreeBackend {
    async fn create(&self, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path.to_string_lossy();
        let result = self
            .git_checked(&["worktree", "add", "-b", branch, &path_str])
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(first) => {
                // Branch may survive an earlier crashed run; reattach it.
                let retry = self.git(&["worktree", "add", &path_str, branch]).await?;
                if retry.status.success() {
                    Ok(())
                } else {
                    Err(first)
                }
            }
        }
    }

    async fn remove(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        let removed = self
            .git(&["worktree", "remove", "--force", &path_str])
            .await?;
        if !removed.status.success() {
            let stderr = String::from_utf8_lossy(&removed.stderr);
            debug!(path = %path.display(), stderr = %stderr.trim(), "Worktree remove failed, force deleting");
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }
        let deleted = self.git(&["branch", "-D", branch]).await?;
        if !deleted.status.success() {
            let stderr = String::from_utf8_lossy(&deleted.stderr);
            warn!(branch = %branch, stderr = %stderr.trim(), "Branch delete failed");
        }
        Ok(())
    }
}

/// Plain-directory backend for environments without a git checkout.
/// Provides the isolation contract without versioned lineage.
pub struct DirBackend;

#[async_trait]
impl WorkspaceBackend for DirBackend {
    async fn create(&self, path: &Path, _branch: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path, _branch: &str) -> Result<()> {
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }
}
