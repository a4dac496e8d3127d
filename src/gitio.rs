// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git subprocess helpers.
//!
//! Every git interaction in the control plane goes through this module:
//! mutations via [`run_git`], read-only queries via [`query_git`] which
//! bounds the subprocess with a 3-second timeout and degrades to the
//! `"unknown"` sentinel instead of failing the caller.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::GitError;

/// Sentinel returned by read-only queries that failed or timed out.
pub const UNKNOWN: &str = "unknown";

/// Timeout for read-only git queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Run a git command in `dir` and return trimmed stdout.
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    debug!("git {:?} in {:?}", args, dir);
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(GitError::Git(stderr))
    }
}

/// Run a read-only git query with a 3-second timeout.
///
/// Returns the sentinel [`UNKNOWN`] on any failure or timeout; state queries
/// must never stall or fail a user-facing operation.
pub async fn query_git(dir: &Path, args: &[&str]) -> String {
    match tokio::time::timeout(QUERY_TIMEOUT, run_git(dir, args)).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            debug!("git query {:?} failed: {}", args, e);
            UNKNOWN.to_string()
        }
        Err(_) => {
            warn!("git query {:?} timed out in {:?}", args, dir);
            UNKNOWN.to_string()
        }
    }
}

/// Current branch of the repository at `dir`, or `"unknown"`.
pub async fn current_branch(dir: &Path) -> String {
    let branch = query_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await;
    if branch.is_empty() {
        UNKNOWN.to_string()
    } else {
        branch
    }
}

/// Whether `dir` is inside a git working tree.
pub async fn is_git_repo(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    run_git(dir, &["rev-parse", "--git-dir"]).await.is_ok()
}

/// Whether the working tree at `dir` has uncommitted changes (staged,
/// unstaged, or untracked).
pub async fn has_uncommitted_changes(dir: &Path) -> Result<bool, GitError> {
    let status = run_git(dir, &["status", "--porcelain"]).await?;
    Ok(!status.is_empty())
}

/// Whether a local branch exists.
pub async fn branch_exists(dir: &Path, branch: &str) -> bool {
    run_git(dir, &["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
        .await
        .is_ok()
}

/// Delete a local branch, forcing when it is not merged.
pub async fn delete_branch(dir: &Path, branch: &str) -> Result<(), GitError> {
    run_git(dir, &["branch", "-D", branch]).await.map(|_| ())
}

/// The main branch of the repository: the symbolic-ref target of
/// `refs/remotes/origin/HEAD`, falling back to `main`.
pub async fn main_branch(dir: &Path) -> String {
    match run_git(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
        Ok(target) => target
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("main")
            .to_string(),
        Err(_) => "main".to_string(),
    }
}

/// Local branches fully merged into `into`. The current-branch marker and
/// worktree markers from `git branch` output are stripped.
pub async fn merged_branches(dir: &Path, into: &str) -> Result<Vec<String>, GitError> {
    let output = run_git(dir, &["branch", "--merged", into]).await?;
    Ok(output
        .lines()
        .map(|l| l.trim().trim_start_matches(['*', '+']).trim().to_string())
        .filter(|l| !l.is_empty() && l != into)
        .collect())
}

/// Fetch and fast-forward the current branch.
pub async fn pull(dir: &Path) -> Result<String, GitError> {
    run_git(dir, &["pull", "--ff-only"]).await
}

/// Clone `url` into `target`. The parent directory is created as needed.
pub async fn clone(url: &str, target: &Path) -> Result<(), GitError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let target_str = target.to_string_lossy().to_string();
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    run_git(parent, &["clone", url, &target_str]).await.map(|_| ())
}

/// Mark `path` as a trusted git directory for this process's user.
///
/// Worktrees created under a service account trip git's dubious-ownership
/// check otherwise.
pub async fn add_safe_directory(path: &Path) -> Result<(), GitError> {
    let path_str = path.to_string_lossy().to_string();
    run_git(
        Path::new("."),
        &["config", "--global", "--add", "safe.directory", &path_str],
    )
    .await
    .map(|_| ())
}

/// Normalize a repository URL: strip a trailing `.git` and convert the ssh
/// form `git@github.com:owner/repo` to `https://github.com/owner/repo`.
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_suffix(".git").unwrap_or(url);
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        format!("https://github.com/{}", rest)
    } else {
        url.to_string()
    }
}

/// Extract `(owner, repo)` from a normalized repository URL.
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let normalized = normalize_repo_url(url);
    let without_scheme = normalized
        .strip_prefix("https://")
        .or_else(|| normalized.strip_prefix("http://"))?;
    let mut segments = without_scheme.split('/');
    let _host = segments.next()?;
    let owner = segments.next()?;
    let repo = segments.next()?;
    if owner.is_empty() || repo.is_empty() || segments.next().is_some() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Inject an access token into an https clone URL:
/// `https://TOKEN@github.com/owner/repo.git`.
pub fn authenticated_clone_url(url: &str, token: Option<&str>) -> String {
    let normalized = normalize_repo_url(url);
    let with_token = match token {
        Some(token) if normalized.starts_with("https://") => {
            format!("https://{}@{}", token, &normalized["https://".len()..])
        }
        _ => normalized,
    };
    format!("{}.git", with_token)
}
