// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worktree commands: /worktree create|list|remove|cleanup|orphans.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::CommandError;
use crate::isolation::{DestroyOptions, EnsureRequest, WorktreeOps};
use crate::store::{Conversation, ConversationPatch};

use super::{CommandHandler, CommandResult};

impl CommandHandler {
    pub(super) async fn worktree(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        match args.first().map(String::as_str) {
            Some("create") => self.worktree_create(conversation, args.get(1)).await,
            Some("list") => self.worktree_list(conversation).await,
            Some("remove") => {
                let force = args.iter().any(|a| a == "--force");
                self.worktree_remove(conversation, force).await
            }
            Some("cleanup") => self.worktree_cleanup(conversation, args.get(1)).await,
            Some("orphans") => self.worktree_orphans(conversation).await,
            _ => Ok(CommandResult::fail(
                "Usage: /worktree create <branch> | list | remove [--force] | cleanup merged|stale | orphans",
            )),
        }
    }

    async fn worktree_create(
        &self,
        conversation: &Conversation,
        branch: Option<&String>,
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let Some(branch) = branch else {
            return Ok(CommandResult::fail("Usage: /worktree create <branch>"));
        };

        if conversation.isolation_env_id.is_some() {
            return Ok(CommandResult::fail(
                "Already using a worktree. /worktree remove first.",
            ));
        }
        if !crate::isolation::valid_branch_name(branch) {
            return Ok(CommandResult::fail(format!(
                "Invalid branch name {:?} (allowed: letters, digits, _ -)",
                branch
            )));
        }

        let canonical = PathBuf::from(&codebase.default_cwd);
        let outcome = self
            .isolation()
            .ensure_for_workflow(
                &codebase,
                &canonical,
                EnsureRequest::task(branch, &conversation.platform_type),
            )
            .await?;

        // Keep the active session: the assistant's context carries over
        // into the isolated branch.
        self.store()
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    isolation_env_id: Some(Some(outcome.env.id.clone())),
                    cwd: Some(Some(outcome.env.working_path.clone())),
                    ..Default::default()
                },
            )
            .await?;

        Ok(CommandResult::changed(format!(
            "Worktree ready on branch {} at {}",
            outcome.env.branch_name, outcome.env.working_path
        )))
    }

    async fn worktree_list(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let ops = WorktreeOps::new(&codebase.default_cwd);
        let entries = ops.list().await?;

        let current = conversation.cwd.as_deref();
        let lines: Vec<String> = entries
            .iter()
            .map(|entry| {
                let marker = if current == Some(entry.path.to_string_lossy().as_ref()) {
                    "*"
                } else {
                    " "
                };
                let branch = entry.branch.as_deref().unwrap_or("(detached)");
                format!("{} {}  {}", marker, branch, entry.path.display())
            })
            .collect();
        Ok(CommandResult::ok(lines.join("\n")))
    }

    async fn worktree_remove(
        &self,
        conversation: &Conversation,
        force: bool,
    ) -> Result<CommandResult, CommandError> {
        let Some(env_id) = &conversation.isolation_env_id else {
            return Ok(CommandResult::fail("Not using a worktree."));
        };
        let codebase = self.require_codebase(conversation).await?;

        let Some(env) = self.store().get_environment(env_id).await? else {
            // Dangling reference: repair the conversation and move on.
            tracing::warn!("conversation {} points at missing env {}", conversation.id, env_id);
            self.detach_from_worktree(conversation, &codebase.default_cwd).await?;
            return Ok(CommandResult::changed(
                "Worktree record was missing; reverted to the canonical clone.",
            ));
        };

        let destroy = self
            .isolation()
            .destroy(
                &env,
                DestroyOptions {
                    force,
                    branch_name: Some(env.branch_name.clone()),
                    canonical_repo_path: Some(PathBuf::from(&codebase.default_cwd)),
                },
            )
            .await;

        if let Err(e) = destroy {
            if e.is_uncommitted() {
                return Ok(CommandResult::fail(
                    "Worktree has uncommitted changes. Commit them or use /worktree remove --force.",
                ));
            }
            return Err(e.into());
        }

        self.detach_from_worktree(conversation, &codebase.default_cwd).await?;
        self.store().deactivate_sessions(&conversation.id).await?;

        Ok(CommandResult::changed(format!(
            "Removed worktree {} and returned to {}",
            env.branch_name, codebase.default_cwd
        )))
    }

    async fn worktree_cleanup(
        &self,
        conversation: &Conversation,
        mode: Option<&String>,
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let report = match mode.map(String::as_str) {
            Some("merged") => self.cleanup().cleanup_merged(&codebase).await,
            Some("stale") => self.cleanup().cleanup_stale().await,
            _ => {
                return Ok(CommandResult::fail(
                    "Usage: /worktree cleanup merged|stale",
                ));
            }
        };
        Ok(CommandResult::changed(report.summary()))
    }

    async fn worktree_orphans(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let ops = WorktreeOps::new(&codebase.default_cwd);
        let entries = ops.list().await?;

        let known: HashSet<String> = self
            .store()
            .list_active_environments(Some(&codebase.id))
            .await?
            .into_iter()
            .map(|env| env.working_path)
            .collect();

        let canonical = Path::new(&codebase.default_cwd);
        let lines: Vec<String> = entries
            .iter()
            .filter(|entry| entry.path != canonical)
            .map(|entry| {
                let path = entry.path.to_string_lossy().to_string();
                let marker = if known.contains(&path) { "" } else { "  (untracked)" };
                let branch = entry.branch.as_deref().unwrap_or("(detached)");
                format!("{}  {}{}", branch, path, marker)
            })
            .collect();

        if lines.is_empty() {
            return Ok(CommandResult::ok("No worktrees."));
        }
        Ok(CommandResult::ok(lines.join("\n")))
    }

    async fn detach_from_worktree(
        &self,
        conversation: &Conversation,
        canonical_cwd: &str,
    ) -> Result<(), CommandError> {
        self.store()
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    isolation_env_id: Some(None),
                    cwd: Some(Some(canonical_cwd.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::gitio;
    use crate::store::NewCodebase;
    use crate::types::{AssistantType, EnvironmentStatus, WorkflowType};

    async fn setup_repo(handler: &CommandHandler) -> (Conversation, crate::store::Codebase) {
        let clone = handler.settings().clone_path("acme", "app");
        std::fs::create_dir_all(&clone).unwrap();
        gitio::run_git(&clone, &["init", "-b", "main"]).await.unwrap();
        gitio::run_git(&clone, &["config", "user.email", "t@t"]).await.unwrap();
        gitio::run_git(&clone, &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(clone.join("a.txt"), "a").unwrap();
        gitio::run_git(&clone, &["add", "."]).await.unwrap();
        gitio::run_git(&clone, &["commit", "-m", "init"]).await.unwrap();

        let codebase = handler
            .store()
            .create_codebase(NewCodebase {
                name: "acme/app".into(),
                repository_url: None,
                default_cwd: clone.to_string_lossy().to_string(),
                ai_assistant_type: AssistantType::Claude,
            })
            .await
            .unwrap();
        let conversation = conversation(handler).await;
        handler.link_codebase(&conversation, &codebase).await.unwrap();
        (reload(handler, &conversation).await, codebase)
    }

    #[tokio::test]
    async fn test_create_links_and_preserves_session() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, codebase) = setup_repo(&handler).await;

        // An active session that must survive worktree creation.
        let session = handler
            .store()
            .create_session(&conversation.id, Some(&codebase.id), AssistantType::Claude)
            .await
            .unwrap();

        let result =
            unwrap_handled(handler.handle(&conversation, "/worktree create feat-auth").await);
        assert!(result.success, "{}", result.message);

        let conversation = reload(&handler, &conversation).await;
        let env_id = conversation.isolation_env_id.clone().unwrap();
        let env = handler.store().get_environment(&env_id).await.unwrap().unwrap();
        assert_eq!(env.workflow_type, WorkflowType::Task);
        assert_eq!(env.workflow_id, "task-feat-auth");
        assert_eq!(env.branch_name, "feat-auth");
        assert_eq!(
            env.working_path,
            format!("{}/worktrees/feat-auth", codebase.default_cwd)
        );
        assert_eq!(conversation.cwd.as_deref(), Some(env.working_path.as_str()));

        let still_active = handler
            .store()
            .find_active_session(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_active.id, session.id);
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, _codebase) = setup_repo(&handler).await;

        unwrap_handled(handler.handle(&conversation, "/worktree create feat-a").await);
        let conversation = reload(&handler, &conversation).await;

        let result =
            unwrap_handled(handler.handle(&conversation, "/worktree create feat-b").await);
        assert!(!result.success);
        assert!(result.message.contains("Already using a worktree"));
    }

    #[tokio::test]
    async fn test_create_invalid_branch() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, _codebase) = setup_repo(&handler).await;

        let result =
            unwrap_handled(handler.handle(&conversation, "/worktree create \"feat auth\"").await);
        assert!(!result.success);
        assert!(result.message.contains("Invalid branch name"));
    }

    #[tokio::test]
    async fn test_remove_requires_worktree() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, _codebase) = setup_repo(&handler).await;

        let result = unwrap_handled(handler.handle(&conversation, "/worktree remove").await);
        assert!(!result.success);
        assert!(result.message.contains("Not using a worktree"));
    }

    #[tokio::test]
    async fn test_remove_dirty_suggests_force_then_forces() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, codebase) = setup_repo(&handler).await;

        unwrap_handled(handler.handle(&conversation, "/worktree create feat-x").await);
        let conversation = reload(&handler, &conversation).await;
        let env_id = conversation.isolation_env_id.clone().unwrap();
        let env = handler.store().get_environment(&env_id).await.unwrap().unwrap();
        std::fs::write(Path::new(&env.working_path).join("wip.txt"), "dirty").unwrap();

        let refused = unwrap_handled(handler.handle(&conversation, "/worktree remove").await);
        assert!(!refused.success);
        assert!(refused.message.contains("--force"));

        let removed =
            unwrap_handled(handler.handle(&conversation, "/worktree remove --force").await);
        assert!(removed.success, "{}", removed.message);

        let conversation = reload(&handler, &conversation).await;
        assert!(conversation.isolation_env_id.is_none());
        assert_eq!(conversation.cwd.as_deref(), Some(codebase.default_cwd.as_str()));
        assert!(handler
            .store()
            .find_active_session(&conversation.id)
            .await
            .unwrap()
            .is_none());

        let env = handler.store().get_environment(&env_id).await.unwrap().unwrap();
        assert_eq!(env.status, EnvironmentStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_list_marks_current() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, _codebase) = setup_repo(&handler).await;

        unwrap_handled(handler.handle(&conversation, "/worktree create feat-l").await);
        let conversation = reload(&handler, &conversation).await;

        let result = unwrap_handled(handler.handle(&conversation, "/worktree list").await);
        let current_line = result
            .message
            .lines()
            .find(|l| l.contains("feat-l"))
            .unwrap();
        assert!(current_line.starts_with('*'));
    }

    #[tokio::test]
    async fn test_orphans_shows_untracked() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let (conversation, codebase) = setup_repo(&handler).await;

        // A worktree created behind archon's back.
        let ops = WorktreeOps::new(&codebase.default_cwd);
        ops.add_new_branch("rogue", "main").await.unwrap();

        let result = unwrap_handled(handler.handle(&conversation, "/worktree orphans").await);
        assert!(result.message.contains("rogue"));
        assert!(result.message.contains("(untracked)"));
    }
}
