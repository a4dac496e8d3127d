// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime settings loaded from the environment.
//!
//! The control plane is configured entirely through environment variables;
//! per-repo configuration lives in each clone's `.archon/` directory.

use std::env;
use std::path::{Path, PathBuf};

use crate::types::AssistantType;

/// Default cap on concurrently processed conversations.
pub const DEFAULT_MAX_CONCURRENT_CONVERSATIONS: usize = 10;

/// Default cap on active worktrees per codebase.
pub const DEFAULT_MAX_WORKTREES_PER_CODEBASE: usize = 25;

/// Default age in days before a worktree is considered stale.
pub const DEFAULT_STALE_THRESHOLD_DAYS: i64 = 14;

/// Default period of the cleanup scheduler in hours.
pub const DEFAULT_CLEANUP_INTERVAL_HOURS: u64 = 6;

/// Runtime settings for the control plane.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of all archon state (`~/.archon` by default, `/.archon` in
    /// containers).
    pub home: PathBuf,
    /// Concurrency cap for the conversation lock manager.
    pub max_concurrent_conversations: usize,
    /// Active-environment cap per codebase.
    pub max_worktrees_per_codebase: usize,
    /// Age threshold for staleness-based cleanup.
    pub stale_threshold_days: i64,
    /// Period of the periodic cleanup cycle.
    pub cleanup_interval_hours: u64,
    /// Assistant used for conversations without a linked codebase.
    pub default_assistant: AssistantType,
    /// GitHub token injected into clone URLs when present.
    pub gh_token: Option<String>,
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            home: env::var("ARCHON_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_home()),
            max_concurrent_conversations: parse_env(
                "MAX_CONCURRENT_CONVERSATIONS",
                DEFAULT_MAX_CONCURRENT_CONVERSATIONS,
            ),
            max_worktrees_per_codebase: parse_env(
                "MAX_WORKTREES_PER_CODEBASE",
                DEFAULT_MAX_WORKTREES_PER_CODEBASE,
            ),
            stale_threshold_days: parse_env("STALE_THRESHOLD_DAYS", DEFAULT_STALE_THRESHOLD_DAYS),
            cleanup_interval_hours: parse_env(
                "CLEANUP_INTERVAL_HOURS",
                DEFAULT_CLEANUP_INTERVAL_HOURS,
            ),
            default_assistant: env::var("DEFAULT_AI_ASSISTANT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            gh_token: env::var("GH_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    /// Root directory for clones: `{home}/workspaces`.
    pub fn workspace_root(&self) -> PathBuf {
        self.home.join("workspaces")
    }

    /// Path of a clone for `owner/repo`.
    pub fn clone_path(&self, owner: &str, repo: &str) -> PathBuf {
        self.workspace_root().join(owner).join(repo)
    }

    /// Path of the control-plane database.
    pub fn database_path(&self) -> PathBuf {
        self.home.join("archon.db")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home: default_home(),
            max_concurrent_conversations: DEFAULT_MAX_CONCURRENT_CONVERSATIONS,
            max_worktrees_per_codebase: DEFAULT_MAX_WORKTREES_PER_CODEBASE,
            stale_threshold_days: DEFAULT_STALE_THRESHOLD_DAYS,
            cleanup_interval_hours: DEFAULT_CLEANUP_INTERVAL_HOURS,
            default_assistant: AssistantType::Claude,
            gh_token: None,
        }
    }
}

/// Resolve the default archon home directory.
///
/// Containerized deployments mount `/.archon`; everything else uses
/// `~/.archon`.
fn default_home() -> PathBuf {
    let container_home = Path::new("/.archon");
    if container_home.is_dir() {
        return container_home.to_path_buf();
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".archon")
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent_conversations, 10);
        assert_eq!(settings.max_worktrees_per_codebase, 25);
        assert_eq!(settings.stale_threshold_days, 14);
        assert_eq!(settings.cleanup_interval_hours, 6);
        assert_eq!(settings.default_assistant, AssistantType::Claude);
    }

    #[test]
    fn test_layout() {
        let settings = Settings {
            home: PathBuf::from("/data/.archon"),
            ..Settings::default()
        };
        assert_eq!(
            settings.clone_path("alice", "utils"),
            PathBuf::from("/data/.archon/workspaces/alice/utils")
        );
        assert_eq!(
            settings.workspace_root(),
            PathBuf::from("/data/.archon/workspaces")
        );
    }
}
