// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Assistant client interface.
//!
//! The external assistant CLIs (claude, codex) are collaborators; the core
//! consumes this trait. An invocation runs one prompt in one working
//! directory and returns a consolidated text output plus an opaque session
//! id that can be resumed later. Streaming delivery is optional: when a
//! chunk channel is supplied, output lines are forwarded as they arrive.

mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AssistantError;
use crate::types::AssistantType;

pub use process::ProcessAssistantClient;

/// One assistant invocation.
#[derive(Debug)]
pub struct AssistantRequest {
    pub prompt: String,
    pub working_directory: PathBuf,
    /// Opaque resume token from a prior response. Never parsed.
    pub session_to_resume: Option<String>,
    pub assistant_type: AssistantType,
    pub model: Option<String>,
    /// Optional live-output channel for streaming adapters.
    pub chunks: Option<mpsc::Sender<String>>,
}

impl AssistantRequest {
    pub fn new(prompt: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            session_to_resume: None,
            assistant_type: AssistantType::Claude,
            model: None,
            chunks: None,
        }
    }

    pub fn with_resume(mut self, session_id: Option<String>) -> Self {
        self.session_to_resume = session_id;
        self
    }

    pub fn with_assistant(mut self, assistant: AssistantType) -> Self {
        self.assistant_type = assistant;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_chunks(mut self, chunks: mpsc::Sender<String>) -> Self {
        self.chunks = Some(chunks);
        self
    }
}

/// Result of an assistant invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantResponse {
    /// Resume token for the next invocation, when the CLI reported one.
    pub session_id: Option<String>,
    /// Consolidated text output.
    pub text_output: String,
}

/// Uniform interface over assistant CLIs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn invoke(&self, request: AssistantRequest) -> Result<AssistantResponse, AssistantError>;
}
