// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Entity types persisted by the state store.
//!
//! Six entities: Codebase, Conversation, Session, CommandTemplate,
//! IsolationEnvironment, WorkflowRun. Timestamps are unix seconds.
//! Metadata bags are JSON maps with merge-patch update semantics at the
//! SQL layer; the `commands` map on Codebase is replaced whole (callers
//! merge in memory first).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AssistantType, EnvironmentStatus, RunStatus, WorkflowType};

/// A cloned repository known to the system, identified by `owner/repo`.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebase {
    pub id: String,
    /// `owner/repo`.
    pub name: String,
    pub repository_url: Option<String>,
    /// Absolute path of the canonical clone.
    pub default_cwd: String,
    pub ai_assistant_type: AssistantType,
    /// Registered command files, keyed by command name.
    pub commands: BTreeMap<String, CodebaseCommand>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One registered command file of a codebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodebaseCommand {
    /// Path of the command file, relative to the clone root.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Fields for creating a codebase row.
#[derive(Debug, Clone)]
pub struct NewCodebase {
    pub name: String,
    pub repository_url: Option<String>,
    pub default_cwd: String,
    pub ai_assistant_type: AssistantType,
}

/// The per-platform chat or thread in which the system holds state.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub platform_type: String,
    pub platform_conversation_id: String,
    pub ai_assistant_type: AssistantType,
    pub codebase_id: Option<String>,
    pub cwd: Option<String>,
    pub isolation_env_id: Option<String>,
    pub last_activity_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for creating a conversation row.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub platform_type: String,
    pub platform_conversation_id: String,
    pub ai_assistant_type: AssistantType,
    pub codebase_id: Option<String>,
    pub cwd: Option<String>,
}

/// Partial update of a conversation. `None` leaves the column untouched;
/// the nested options carry explicit NULL writes.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub ai_assistant_type: Option<AssistantType>,
    pub codebase_id: Option<Option<String>>,
    pub cwd: Option<Option<String>>,
    pub isolation_env_id: Option<Option<String>>,
    pub last_activity_at: Option<i64>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        self.ai_assistant_type.is_none()
            && self.codebase_id.is_none()
            && self.cwd.is_none()
            && self.isolation_env_id.is_none()
            && self.last_activity_at.is_none()
    }
}

/// An assistant-side context resumable via `assistant_session_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub conversation_id: String,
    pub codebase_id: Option<String>,
    pub ai_assistant_type: AssistantType,
    /// Opaque resume token returned by the assistant CLI.
    pub assistant_session_id: Option<String>,
    pub active: bool,
    pub metadata: serde_json::Value,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

/// A global named prompt invoked as `/<name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A git worktree bound to a logical workflow (issue, PR, or named task).
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationEnvironment {
    pub id: String,
    pub codebase_id: String,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    pub provider: String,
    pub working_path: String,
    pub branch_name: String,
    pub status: EnvironmentStatus,
    pub created_by_platform: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl IsolationEnvironment {
    /// Issue numbers this environment serves, from `metadata.related_issues`.
    pub fn related_issues(&self) -> Vec<u64> {
        self.metadata
            .get("related_issues")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|n| n.as_u64()).collect())
            .unwrap_or_default()
    }
}

/// Fields for creating an isolation environment row.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub codebase_id: String,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    pub working_path: String,
    pub branch_name: String,
    pub created_by_platform: String,
    pub metadata: serde_json::Value,
}

/// One execution of a declarative workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_name: String,
    pub conversation_id: String,
    pub codebase_id: Option<String>,
    pub current_step_index: i64,
    pub status: RunStatus,
    pub user_message: String,
    pub metadata: serde_json::Value,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub last_activity_at: i64,
}

/// Fields for creating a workflow run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_name: String,
    pub conversation_id: String,
    pub codebase_id: Option<String>,
    pub user_message: String,
    pub metadata: serde_json::Value,
}
