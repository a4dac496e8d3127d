// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The per-message pipeline.
//!
//! Every inbound message is serialized under its conversation's lock, then
//! dispatched: slash commands mutate state deterministically, workflow-named
//! messages start a run, everything else is a single assistant invocation in
//! the conversation's working directory. Replies and errors go back through
//! the originating adapter.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::adapter::{InboundMessage, PlatformAdapter};
use crate::assistant::AssistantClient;
use crate::cleanup::CleanupScheduler;
use crate::commands::{CommandHandler, CommandOutcome};
use crate::config::Settings;
use crate::error::Result;
use crate::isolation::IsolationManager;
use crate::lock::{CancelToken, ConversationLockManager, LockStats};
use crate::store::{Conversation, NewConversation, Store};
use crate::types::EnvironmentStatus;
use crate::workflow::{
    resolve_command_content, route_message, substitute_arguments, Route, RunContext,
    WorkflowEngine, WorkflowRegistry,
};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Central coordinator owning the control-plane components.
pub struct Orchestrator {
    store: Arc<Store>,
    settings: Settings,
    locks: ConversationLockManager,
    commands: Arc<CommandHandler>,
    engine: Arc<WorkflowEngine>,
    registry: Arc<WorkflowRegistry>,
    cleanup: Arc<CleanupScheduler>,
}

impl Orchestrator {
    pub fn new(settings: Settings, store: Arc<Store>, assistant: Arc<dyn AssistantClient>) -> Self {
        let isolation = Arc::new(IsolationManager::new(Arc::clone(&store), settings.clone()));
        let cleanup = Arc::new(CleanupScheduler::new(
            Arc::clone(&store),
            Arc::clone(&isolation),
            settings.clone(),
        ));
        let registry = Arc::new(WorkflowRegistry::new());
        let commands = Arc::new(CommandHandler::new(
            Arc::clone(&store),
            settings.clone(),
            Arc::clone(&isolation),
            Arc::clone(&registry),
            Arc::clone(&cleanup),
        ));
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&store), assistant));
        let locks = ConversationLockManager::new(settings.max_concurrent_conversations);

        Self {
            store,
            settings,
            locks,
            commands,
            engine,
            registry,
            cleanup,
        }
    }

    pub fn cleanup_scheduler(&self) -> &Arc<CleanupScheduler> {
        &self.cleanup
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    /// Handle one inbound message end to end. Returns after the message was
    /// fully processed; errors are reported to the adapter, not returned.
    pub async fn handle_message(
        self: Arc<Self>,
        adapter: Arc<dyn PlatformAdapter>,
        message: InboundMessage,
    ) {
        let lock_key = format!(
            "{}:{}",
            message.platform_type, message.platform_conversation_id
        );
        let this = Arc::clone(&self);
        let reply_adapter = Arc::clone(&adapter);
        let reply_target = message.platform_conversation_id.clone();

        let outcome = self
            .locks
            .acquire(&lock_key, move |cancel| async move {
                this.process(adapter, message, cancel).await
            })
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("message processing failed: {:#}", e);
                let _ = reply_adapter
                    .send_message(&reply_target, &format!("Error: {}", e))
                    .await;
            }
            Err(e) => {
                warn!("lock manager rejected message: {}", e);
                let _ = reply_adapter
                    .send_message(&reply_target, "The control plane is shutting down.")
                    .await;
            }
        }
    }

    /// Adapter notification that a platform conversation closed.
    pub async fn conversation_closed(&self, platform_type: &str, platform_conversation_id: &str) {
        let found = self
            .store
            .find_conversation_by_platform(platform_type, platform_conversation_id)
            .await;
        match found {
            Ok(Some(conversation)) => {
                if let Err(e) = self.cleanup.on_conversation_closed(&conversation).await {
                    warn!("close handling failed for {}: {}", conversation.id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("close lookup failed: {}", e),
        }
    }

    /// Drain in-flight handlers. The cleanup timer and store are owned by
    /// the caller and stopped afterwards.
    pub async fn shutdown(&self) {
        self.locks.shutdown().await;
    }

    async fn process(
        self: Arc<Self>,
        adapter: Arc<dyn PlatformAdapter>,
        message: InboundMessage,
        cancel: CancelToken,
    ) -> Result<()> {
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_message();

        let conversation = self.load_or_create_conversation(&message).await?;
        let _ = self.store.touch_conversation_activity(&conversation.id).await;

        if message.text.trim_start().starts_with('/') {
            match self.commands.handle(&conversation, &message.text).await {
                CommandOutcome::Handled(result) => {
                    adapter
                        .send_message(&message.platform_conversation_id, &result.message)
                        .await?;
                    return Ok(());
                }
                CommandOutcome::Unrecognized { name, args } => {
                    return self
                        .invoke_template(adapter, &conversation, &message, &name, &args, cancel)
                        .await;
                }
            }
        }

        match route_message(&self.store, &self.registry, &conversation.id, &message.text).await? {
            Route::Busy => {
                adapter
                    .send_message(
                        &message.platform_conversation_id,
                        "A workflow is already running for this conversation. Use /workflow cancel to stop it.",
                    )
                    .await?;
                Ok(())
            }
            Route::Workflow(name) => {
                // A concurrent /workflow reload may have dropped the name
                // between routing and execution.
                let Some(workflow) = self.registry.get(&name) else {
                    let ctx = self.run_context(&conversation, adapter, cancel).await?;
                    self.engine
                        .invoke_prompt(
                            &ctx,
                            &message.text,
                            conversation.ai_assistant_type,
                            None,
                            false,
                        )
                        .await?;
                    return Ok(());
                };
                let ctx = self.run_context(&conversation, adapter, cancel).await?;
                info!(
                    "starting workflow {} for conversation {}",
                    name, conversation.id
                );
                let status = self.engine.execute(&workflow, &ctx, &message.text).await?;
                info!("workflow {} finished: {:?}", name, status);
                Ok(())
            }
            Route::Plain => {
                let ctx = self.run_context(&conversation, adapter, cancel).await?;
                self.engine
                    .invoke_prompt(
                        &ctx,
                        &message.text,
                        conversation.ai_assistant_type,
                        None,
                        false,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// `/<name>` that is not a built-in: try a command template; otherwise
    /// point at /help. `/command-invoke <name> [args]` names the template
    /// explicitly.
    async fn invoke_template(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        conversation: &Conversation,
        message: &InboundMessage,
        name: &str,
        args: &[String],
        cancel: CancelToken,
    ) -> Result<()> {
        let (name, args): (String, Vec<String>) = if name == "command-invoke" {
            match args.split_first() {
                Some((first, rest)) => (first.clone(), rest.to_vec()),
                None => {
                    adapter
                        .send_message(
                            &message.platform_conversation_id,
                            "Usage: /command-invoke <command> [args]",
                        )
                        .await?;
                    return Ok(());
                }
            }
        } else {
            (name.to_string(), args.to_vec())
        };
        let name = name.as_str();
        let args = args.as_slice();

        if self
            .store
            .find_running_run(&conversation.id)
            .await?
            .is_some()
        {
            adapter
                .send_message(
                    &message.platform_conversation_id,
                    "A workflow is already running for this conversation. Use /workflow cancel to stop it.",
                )
                .await?;
            return Ok(());
        }

        let codebase = match &conversation.codebase_id {
            Some(id) => self.store.get_codebase(id).await?,
            None => None,
        };
        let Some(content) =
            resolve_command_content(&self.store, codebase.as_ref(), name).await?
        else {
            adapter
                .send_message(
                    &message.platform_conversation_id,
                    &format!("Unknown command /{}. Try /help.", name),
                )
                .await?;
            return Ok(());
        };

        let session_metadata = self
            .store
            .find_active_session(&conversation.id)
            .await?
            .map(|s| s.metadata);
        let prompt = substitute_arguments(&content, args, session_metadata.as_ref());

        let ctx = self.run_context(conversation, adapter, cancel).await?;
        self.engine
            .invoke_prompt(&ctx, &prompt, conversation.ai_assistant_type, None, false)
            .await?;
        Ok(())
    }

    async fn load_or_create_conversation(
        &self,
        message: &InboundMessage,
    ) -> Result<Conversation> {
        if let Some(existing) = self
            .store
            .find_conversation_by_platform(
                &message.platform_type,
                &message.platform_conversation_id,
            )
            .await?
        {
            return Ok(existing);
        }

        // Context inheritance happens at creation time only.
        let (assistant, codebase_id, cwd) = match &message.parent_conversation_id {
            Some(parent_id) => {
                match self
                    .store
                    .find_conversation_by_platform(&message.platform_type, parent_id)
                    .await?
                {
                    Some(parent) => (parent.ai_assistant_type, parent.codebase_id, parent.cwd),
                    None => (self.settings.default_assistant, None, None),
                }
            }
            None => (self.settings.default_assistant, None, None),
        };

        info!(
            "new conversation {}:{}",
            message.platform_type, message.platform_conversation_id
        );
        Ok(self
            .store
            .create_conversation(NewConversation {
                platform_type: message.platform_type.clone(),
                platform_conversation_id: message.platform_conversation_id.clone(),
                ai_assistant_type: assistant,
                codebase_id,
                cwd,
            })
            .await?)
    }

    /// Assemble the execution surroundings for assistant invocations,
    /// preferring the isolation environment's worktree over the plain cwd.
    async fn run_context(
        &self,
        conversation: &Conversation,
        adapter: Arc<dyn PlatformAdapter>,
        cancel: CancelToken,
    ) -> Result<RunContext> {
        let codebase = match &conversation.codebase_id {
            Some(id) => self.store.get_codebase(id).await?,
            None => None,
        };

        let mut working_dir: Option<PathBuf> = None;
        if let Some(env_id) = &conversation.isolation_env_id {
            match self.store.get_environment(env_id).await? {
                Some(env) if env.status == EnvironmentStatus::Active => {
                    working_dir = Some(PathBuf::from(env.working_path));
                }
                _ => {
                    // Orphaned reference: fall back to the plain cwd, do
                    // not auto-repair.
                    warn!(
                        "conversation {} references missing or destroyed environment {}",
                        conversation.id, env_id
                    );
                }
            }
        }

        let working_dir = working_dir
            .or_else(|| conversation.cwd.as_ref().map(PathBuf::from))
            .or_else(|| codebase.as_ref().map(|c| PathBuf::from(&c.default_cwd)))
            .unwrap_or_else(|| self.settings.workspace_root());

        Ok(RunContext {
            conversation: conversation.clone(),
            codebase,
            working_dir,
            adapter,
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::CaptureAdapter;
    use crate::assistant::{AssistantResponse, MockAssistantClient};
    use crate::store::{ConversationPatch, NewRun};
    use crate::types::{AssistantType, StreamingMode};
    use serde_json::json;

    fn orchestrator_with(assistant: MockAssistantClient) -> Arc<Orchestrator> {
        let settings = Settings {
            home: tempfile::tempdir().unwrap().into_path(),
            ..Settings::default()
        };
        let store = Arc::new(Store::in_memory().unwrap());
        Arc::new(Orchestrator::new(settings, store, Arc::new(assistant)))
    }

    fn echo_assistant() -> MockAssistantClient {
        let mut mock = MockAssistantClient::new();
        mock.expect_invoke().returning(|request| {
            Ok(AssistantResponse {
                session_id: Some("session-1".into()),
                text_output: format!("echo: {}", request.prompt),
            })
        });
        mock
    }

    #[tokio::test]
    async fn test_command_reply() {
        let orchestrator = orchestrator_with(MockAssistantClient::new());
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "/help"),
            )
            .await;

        let messages = adapter.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("/worktree create"));
    }

    #[tokio::test]
    async fn test_plain_message_invokes_assistant() {
        let orchestrator = orchestrator_with(echo_assistant());
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "hello there"),
            )
            .await;

        assert_eq!(adapter.messages(), vec!["echo: hello there"]);

        // Conversation row exists with an active, resumable session.
        let conversation = orchestrator
            .store
            .find_conversation_by_platform("telegram", "chat-1")
            .await
            .unwrap()
            .unwrap();
        let session = orchestrator
            .store
            .find_active_session(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.assistant_session_id.as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_template_invocation_substitutes_args() {
        let orchestrator = orchestrator_with(echo_assistant());
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        orchestrator
            .store
            .upsert_template("plan", None, "Plan for: $1")
            .await
            .unwrap();

        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "/plan \"Add dark mode\""),
            )
            .await;

        assert_eq!(adapter.messages(), vec!["echo: Plan for: Add dark mode"]);
    }

    #[tokio::test]
    async fn test_command_invoke_names_template_explicitly() {
        let orchestrator = orchestrator_with(echo_assistant());
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        orchestrator
            .store
            .upsert_template("plan", None, "Plan for: $1")
            .await
            .unwrap();

        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new(
                    "telegram",
                    "chat-1",
                    "/command-invoke plan \"Fix bug #123: edge case\"",
                ),
            )
            .await;

        assert_eq!(
            adapter.messages(),
            vec!["echo: Plan for: Fix bug #123: edge case"]
        );
    }

    #[tokio::test]
    async fn test_unknown_template_points_to_help() {
        let orchestrator = orchestrator_with(MockAssistantClient::new());
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "/frobnicate now"),
            )
            .await;

        let messages = adapter.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Unknown command /frobnicate"));
    }

    #[tokio::test]
    async fn test_busy_conversation_notifies() {
        let orchestrator = orchestrator_with(MockAssistantClient::new());
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        // Seed the conversation, then pin a running workflow on it.
        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "/help"),
            )
            .await;
        let conversation = orchestrator
            .store
            .find_conversation_by_platform("telegram", "chat-1")
            .await
            .unwrap()
            .unwrap();
        orchestrator
            .store
            .insert_run(NewRun {
                workflow_name: "implement".into(),
                conversation_id: conversation.id.clone(),
                codebase_id: None,
                user_message: "x".into(),
                metadata: json!({}),
            })
            .await
            .unwrap();

        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "do more things"),
            )
            .await;

        let messages = adapter.messages();
        assert!(messages.last().unwrap().contains("already running"));

        // /workflow cancel still works.
        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("telegram", "chat-1", "/workflow cancel"),
            )
            .await;
        assert!(adapter.messages().last().unwrap().contains("Cancelled"));
    }

    #[tokio::test]
    async fn test_child_inherits_parent_context_at_creation() {
        let orchestrator = orchestrator_with(echo_assistant());
        let adapter = Arc::new(CaptureAdapter::new("github", StreamingMode::Batch));

        // Parent conversation with explicit context.
        Arc::clone(&orchestrator)
            .handle_message(
                Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
                InboundMessage::new("github", "issue-42", "/help"),
            )
            .await;
        let parent = orchestrator
            .store
            .find_conversation_by_platform("github", "issue-42")
            .await
            .unwrap()
            .unwrap();
        orchestrator
            .store
            .update_conversation(
                &parent.id,
                ConversationPatch {
                    cwd: Some(Some("/workspaces/acme/app".into())),
                    ai_assistant_type: Some(AssistantType::Codex),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut child_message = InboundMessage::new("github", "issue-42-thread-1", "/help");
        child_message.parent_conversation_id = Some("issue-42".into());
        Arc::clone(&orchestrator)
            .handle_message(Arc::clone(&adapter) as Arc<dyn PlatformAdapter>, child_message)
            .await;

        let child = orchestrator
            .store
            .find_conversation_by_platform("github", "issue-42-thread-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.ai_assistant_type, AssistantType::Codex);
        assert_eq!(child.cwd.as_deref(), Some("/workspaces/acme/app"));

        // Later parent mutations do not propagate.
        orchestrator
            .store
            .update_conversation(
                &parent.id,
                ConversationPatch {
                    cwd: Some(Some("/workspaces/acme/other".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let child = orchestrator
            .store
            .get_conversation(&child.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.cwd.as_deref(), Some("/workspaces/acme/app"));
    }

    #[tokio::test]
    async fn test_per_conversation_serialization() {
        // Two messages to the same conversation must execute in order even
        // when submitted back to back.
        let mut mock = MockAssistantClient::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        mock.expect_invoke().returning(move |request| {
            order_clone.lock().unwrap().push(request.prompt.clone());
            Ok(AssistantResponse {
                session_id: None,
                text_output: "ok".into(),
            })
        });
        let orchestrator = orchestrator_with(mock);
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));

        let first = Arc::clone(&orchestrator).handle_message(
            Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
            InboundMessage::new("telegram", "chat-1", "first"),
        );
        let second = Arc::clone(&orchestrator).handle_message(
            Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
            InboundMessage::new("telegram", "chat-1", "second"),
        );
        tokio::join!(first, second);

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
