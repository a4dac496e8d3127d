// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree plumbing for a single canonical clone.
//!
//! # Directory Structure
//!
//! ```text
//! {workspace}/acme/app/           # Canonical clone
//! ├── .git/
//! ├── src/
//! └── worktrees/
//!     ├── issue-42/               # Worktree per workflow
//!     └── feat-auth/
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{GitError, IsolationError};
use crate::gitio;

/// Directory under the clone root that holds all worktrees. A path whose
/// segments include it is, by convention, a worktree path.
pub const WORKTREES_DIR: &str = "worktrees";

/// Whether a path points inside a worktree rather than a canonical clone.
pub fn is_worktree_path(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == WORKTREES_DIR)
}

/// Information about one entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
}

/// Git worktree operations rooted at one canonical clone.
pub struct WorktreeOps {
    repo_root: PathBuf,
}

impl WorktreeOps {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
        }
    }

    /// The clone's `worktrees/` directory.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.repo_root.join(WORKTREES_DIR)
    }

    /// Where the worktree for `branch` lives.
    pub fn path_for_branch(&self, branch: &str) -> PathBuf {
        self.worktrees_dir().join(branch)
    }

    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        gitio::run_git(&self.repo_root, args).await
    }

    /// All worktrees git knows about, including the canonical clone itself.
    pub async fn list(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        let mut worktrees = Vec::new();
        let mut current = WorktreeEntry::default();

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if !current.path.as_os_str().is_empty() {
                    worktrees.push(std::mem::take(&mut current));
                }
                current.path = PathBuf::from(path);
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                current.head = head.to_string();
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                current.branch = Some(branch.to_string());
            } else if line == "bare" {
                current.is_bare = true;
            } else if line == "detached" {
                current.is_detached = true;
            }
        }

        if !current.path.as_os_str().is_empty() {
            worktrees.push(current);
        }

        Ok(worktrees)
    }

    /// Whether `branch` is checked out in any worktree.
    pub async fn is_branch_checked_out(&self, branch: &str) -> bool {
        match self.list().await {
            Ok(entries) => entries.iter().any(|e| e.branch.as_deref() == Some(branch)),
            Err(_) => false,
        }
    }

    /// Create a worktree for a new branch off `base`.
    ///
    /// Fails when the branch already exists or its worktree path is taken.
    pub async fn add_new_branch(
        &self,
        branch: &str,
        base: &str,
    ) -> Result<PathBuf, IsolationError> {
        let path = self.path_for_branch(branch);

        if gitio::branch_exists(&self.repo_root, branch).await {
            return Err(IsolationError::BranchExists(branch.to_string()));
        }
        if path.exists() {
            return Err(IsolationError::WorktreeCreationFailed(format!(
                "directory already exists: {}",
                path.display()
            )));
        }

        info!("creating worktree for {} at {}", branch, path.display());
        std::fs::create_dir_all(self.worktrees_dir())?;
        let path_str = path.to_string_lossy().to_string();
        self.git(&["worktree", "add", "-b", branch, &path_str, base])
            .await
            .map_err(|e| IsolationError::WorktreeCreationFailed(e.to_string()))?;

        Ok(path)
    }

    /// Create a worktree for an existing branch, optionally pinned to a
    /// specific commit (same-repo PR heads carry a base sha).
    pub async fn add_existing_branch(
        &self,
        branch: &str,
        base_sha: Option<&str>,
    ) -> Result<PathBuf, IsolationError> {
        let path = self.path_for_branch(branch);
        if path.exists() {
            return Err(IsolationError::WorktreeCreationFailed(format!(
                "directory already exists: {}",
                path.display()
            )));
        }
        if self.is_branch_checked_out(branch).await {
            return Err(IsolationError::BranchInUse(branch.to_string()));
        }

        info!("creating worktree for existing branch {} at {}", branch, path.display());
        std::fs::create_dir_all(self.worktrees_dir())?;
        let path_str = path.to_string_lossy().to_string();

        if gitio::branch_exists(&self.repo_root, branch).await {
            self.git(&["worktree", "add", &path_str, branch])
                .await
                .map_err(|e| IsolationError::WorktreeCreationFailed(e.to_string()))?;
        } else {
            // Branch only exists on the remote (or is pinned by sha).
            let start = base_sha.unwrap_or(branch);
            self.git(&["worktree", "add", "-b", branch, &path_str, start])
                .await
                .map_err(|e| IsolationError::WorktreeCreationFailed(e.to_string()))?;
        }

        Ok(path)
    }

    /// Remove a worktree. Falls back to manual directory removal plus a
    /// prune when git refuses.
    pub async fn remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        if let Err(e) = self.git(&args).await {
            warn!("git worktree remove failed for {}: {}", path.display(), e);
            if !force {
                return Err(e);
            }
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }
        debug!("removed worktree at {}", path.display());
        Ok(())
    }

    /// Drop stale worktree bookkeeping.
    pub async fn prune(&self) -> Result<(), GitError> {
        self.git(&["worktree", "prune"]).await.map(|_| ())
    }

    /// Whether `path` is an existing, valid git worktree.
    pub async fn is_valid_worktree(&self, path: &Path) -> bool {
        path.is_dir() && gitio::is_git_repo(path).await
    }
}
