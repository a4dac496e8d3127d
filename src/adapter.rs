// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Platform adapter interface.
//!
//! Adapters own all chat/webhook I/O: message chunking to platform limits,
//! formatting translation, signature verification, user whitelists. The core
//! consumes this trait and nothing else about a platform.

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::types::StreamingMode;

/// Contextual hints delivered alongside an inbound message.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    /// Subject line of the originating artifact (issue title, PR title).
    pub subject: Option<String>,
    /// Display name of the author, when the platform exposes one.
    pub author: Option<String>,
}

/// An inbound message, normalized by an adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub platform_type: String,
    /// Platform-native conversation id; maps 1:1 to a Conversation row.
    pub platform_conversation_id: String,
    pub text: String,
    pub context: Option<MessageContext>,
    /// Platform-native id of the parent conversation; a matching existing
    /// conversation donates `codebase_id`, `cwd`, and assistant type at
    /// creation time only.
    pub parent_conversation_id: Option<String>,
}

impl InboundMessage {
    pub fn new(
        platform_type: impl Into<String>,
        platform_conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            platform_type: platform_type.into(),
            platform_conversation_id: platform_conversation_id.into(),
            text: text.into(),
            context: None,
            parent_conversation_id: None,
        }
    }
}

/// A chat platform adapter, consumed by the orchestrator.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Stable platform identifier ("telegram", "github", ...).
    fn platform_type(&self) -> &str;

    /// How this adapter wants assistant output delivered.
    fn streaming_mode(&self) -> StreamingMode;

    /// Deliver text to a conversation. The adapter chunks to platform
    /// limits and translates formatting.
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), AdapterError>;

    async fn start(&self) -> Result<(), AdapterError>;

    async fn stop(&self) -> Result<(), AdapterError>;

    /// For threading platforms: the id future replies should target,
    /// creating a thread when needed. Defaults to the original id.
    async fn ensure_thread(
        &self,
        original_id: &str,
        _context: Option<&MessageContext>,
    ) -> Result<String, AdapterError> {
        Ok(original_id.to_string())
    }
}
