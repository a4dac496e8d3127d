// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the Archon control plane.
//!
//! This module provides strongly-typed errors for different parts of the application,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation.

use thiserror::Error;

/// Errors that can occur while talking to the state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A mutating update affected zero rows. The canonical "conversation
    /// disappeared" signal: callers surface it as a retryable condition.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors from git subprocess invocations.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a git repository: {0}")]
    NotARepo(String),
}

/// Errors that can occur during isolation environment operations.
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Branch already in use: {0}")]
    BranchInUse(String),

    #[error("Invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("Worktree has uncommitted changes: {0}")]
    UncommittedChanges(String),

    #[error("Worktree limit reached for codebase:\n{breakdown}")]
    LimitReached { breakdown: String },

    #[error("Worktree creation failed: {0}")]
    WorktreeCreationFailed(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),
}

impl IsolationError {
    /// Whether the caller should suggest `--force` to the user.
    pub fn is_uncommitted(&self) -> bool {
        matches!(self, Self::UncommittedChanges(_))
    }
}

/// Errors that can occur while handling slash commands.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Path must be within {root}: {path}")]
    PathViolation { root: String, path: String },

    #[error("No codebase linked; use /clone or /repo first")]
    NoCodebase,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// The "conversation disappeared" case never retries automatically; the
    /// user is asked to resend instead.
    pub fn is_conversation_gone(&self) -> bool {
        matches!(self, Self::Store(StoreError::ConversationNotFound(_)))
    }
}

/// Errors that can occur during assistant invocations.
#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Failed to spawn assistant process: {0}")]
    SpawnFailed(String),

    #[error("Assistant exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Response parsing error: {0}")]
    ParseError(String),
}

/// Errors that can occur during workflow loading and execution.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// All validation problems for one file, aggregated.
    #[error("Invalid workflow {file}: {}", .reasons.join("; "))]
    Validation { file: String, reasons: Vec<String> },

    #[error("YAML parsing error in {file}: {message}")]
    Yaml { file: String, message: String },

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("A workflow is already running for this conversation")]
    RunActive,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("max_iterations reached")]
    MaxIterationsReached,

    #[error("Assistant error: {0}")]
    Assistant(#[from] AssistantError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors delivering messages through a platform adapter.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Adapter not running: {0}")]
    NotRunning(String),
}

/// Errors from the conversation lock manager.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock manager is shutting down")]
    ShuttingDown,

    #[error("Handler dropped without completing")]
    HandlerDropped,
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
