// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conversation state commands: /status, /getcwd, /setcwd, /reset,
//! /reset-context.

use crate::error::CommandError;
use crate::gitio;
use crate::store::{Conversation, ConversationPatch};

use super::{CommandHandler, CommandResult};

impl CommandHandler {
    pub(super) async fn status(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let conversation = self.auto_link(conversation).await;

        let mut lines = vec![
            format!("Platform: {}", conversation.platform_type),
            format!("Assistant: {}", conversation.ai_assistant_type),
            format!("Repository: {}", self.repo_context(&conversation).await),
        ];

        match self.store().find_active_session(&conversation.id).await? {
            Some(session) if session.assistant_session_id.is_some() => {
                lines.push("Session: active (resumable)".to_string());
            }
            Some(_) => lines.push("Session: active".to_string()),
            None => lines.push("Session: none".to_string()),
        }

        if let Some(codebase_id) = &conversation.codebase_id {
            let envs = self
                .store()
                .list_active_environments(Some(codebase_id))
                .await?;
            if !envs.is_empty() {
                lines.push(format!("Worktrees: {} active", envs.len()));
                for env in envs {
                    let marker = if conversation.isolation_env_id.as_deref() == Some(&env.id) {
                        " (current)"
                    } else {
                        ""
                    };
                    lines.push(format!(
                        "  {} [{} {}]{}",
                        env.branch_name, env.workflow_type, env.workflow_id, marker
                    ));
                }
            }
        }

        Ok(CommandResult::ok(lines.join("\n")))
    }

    pub(super) async fn getcwd(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let conversation = self.auto_link(conversation).await;
        match self.conversation_cwd(&conversation).await? {
            Some(cwd) => Ok(CommandResult::ok(format!(
                "{}\n{}",
                cwd.display(),
                self.repo_context(&conversation).await
            ))),
            None => Ok(CommandResult::ok("No working directory set.")),
        }
    }

    pub(super) async fn setcwd(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let Some(input) = args.first() else {
            return Ok(CommandResult::fail("Usage: /setcwd <path>"));
        };

        let root = self.settings().workspace_root();
        let path = self.resolve_in_workspace(&root, input)?;
        if !path.is_dir() {
            return Ok(CommandResult::fail(format!(
                "Directory does not exist: {}",
                path.display()
            )));
        }

        self.store()
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    cwd: Some(Some(path.to_string_lossy().to_string())),
                    ..Default::default()
                },
            )
            .await?;
        self.store().deactivate_sessions(&conversation.id).await?;

        if let Err(e) = gitio::add_safe_directory(&path).await {
            tracing::warn!("failed to trust {}: {}", path.display(), e);
        }

        Ok(CommandResult::changed(format!(
            "Working directory set to {}. Session reset.",
            path.display()
        )))
    }

    pub(super) async fn reset(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        self.store().deactivate_sessions(&conversation.id).await?;
        Ok(CommandResult::changed(
            "Session reset. The next message starts a fresh assistant context.",
        ))
    }

    pub(super) async fn reset_context(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        self.store().deactivate_sessions(&conversation.id).await?;
        Ok(CommandResult::changed(
            "Context cleared. Working directory and repository link preserved.",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::store::{ConversationPatch, NewCodebase};
    use crate::types::AssistantType;

    #[tokio::test]
    async fn test_setcwd_traversal_rejected() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let result =
            unwrap_handled(handler.handle(&conversation, "/setcwd ../outside").await);
        assert!(!result.success);
        assert!(result.message.contains("Path must be within"));
    }

    #[tokio::test]
    async fn test_setcwd_persists_and_resets_session() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let target = handler.settings().workspace_root().join("alice/utils");
        std::fs::create_dir_all(&target).unwrap();
        handler
            .store()
            .create_session(&conversation.id, None, AssistantType::Claude)
            .await
            .unwrap();

        let result =
            unwrap_handled(handler.handle(&conversation, "/setcwd alice/utils").await);
        assert!(result.success, "{}", result.message);

        let conversation = reload(&handler, &conversation).await;
        assert_eq!(
            conversation.cwd.as_deref(),
            Some(target.to_string_lossy().as_ref())
        );
        assert!(handler
            .store()
            .find_active_session(&conversation.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_status_auto_links_matching_cwd() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let clone = handler.settings().clone_path("alice", "utils");
        std::fs::create_dir_all(&clone).unwrap();
        let codebase = handler
            .store()
            .create_codebase(NewCodebase {
                name: "alice/utils".into(),
                repository_url: None,
                default_cwd: clone.to_string_lossy().to_string(),
                ai_assistant_type: AssistantType::Claude,
            })
            .await
            .unwrap();

        // cwd matches a codebase but the link is missing.
        handler
            .store()
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    cwd: Some(Some(clone.to_string_lossy().to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = unwrap_handled(handler.handle(&conversation, "/status").await);
        assert!(result.message.contains("alice/utils"));

        let conversation = reload(&handler, &conversation).await;
        assert_eq!(conversation.codebase_id.as_deref(), Some(codebase.id.as_str()));
    }

    #[tokio::test]
    async fn test_status_reports_unknown_branch_outside_git() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let plain = handler.settings().workspace_root().join("alice/plain");
        std::fs::create_dir_all(&plain).unwrap();
        unwrap_handled(handler.handle(&conversation, "/setcwd alice/plain").await);
        let conversation = reload(&handler, &conversation).await;

        let result = unwrap_handled(handler.handle(&conversation, "/status").await);
        assert!(result.message.contains("@ unknown"));
    }

    #[tokio::test]
    async fn test_reset_keeps_codebase_link() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        handler
            .store()
            .create_session(&conversation.id, None, AssistantType::Claude)
            .await
            .unwrap();
        let result = unwrap_handled(handler.handle(&conversation, "/reset").await);
        assert!(result.success);
        assert!(handler
            .store()
            .find_active_session(&conversation.id)
            .await
            .unwrap()
            .is_none());
    }
}
