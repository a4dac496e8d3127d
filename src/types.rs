// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions shared across the control plane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which external assistant CLI drives a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssistantType {
    #[default]
    Claude,
    Codex,
}

impl AssistantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for AssistantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssistantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            other => Err(format!("unknown assistant type: {}", other)),
        }
    }
}

/// The kind of logical workflow an isolation environment is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Issue,
    Pr,
    Task,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
            Self::Task => "task",
        }
    }

    /// Branch name for a workflow identity: `issue-N`, `pr-N`, or the task
    /// slug itself (`task-<slug>` workflow ids carry the branch after the
    /// prefix).
    pub fn branch_name(&self, workflow_id: &str) -> String {
        match self {
            Self::Issue => format!("issue-{}", workflow_id),
            Self::Pr => format!("pr-{}", workflow_id),
            Self::Task => workflow_id
                .strip_prefix("task-")
                .unwrap_or(workflow_id)
                .to_string(),
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(Self::Issue),
            "pr" => Ok(Self::Pr),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown workflow type: {}", other)),
        }
    }
}

/// Lifecycle state of an isolation environment. Rows are never hard-deleted;
/// removal marks them destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Active,
    Destroyed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Destroyed => "destroyed",
        }
    }
}

impl FromStr for EnvironmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(format!("unknown environment status: {}", other)),
        }
    }
}

/// Terminal and non-terminal states of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// How an adapter wants assistant output delivered. Delivery only; the
/// semantics of a response do not change between modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Incremental chunks as the assistant produces them.
    Stream,
    /// One consolidated message at end of response.
    Batch,
}
