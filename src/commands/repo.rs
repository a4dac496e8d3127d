// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Repository commands: /clone, /repos, /repo, /repo-remove, /init.

use std::path::Path;

use tracing::info;

use crate::error::CommandError;
use crate::gitio;
use crate::store::{Codebase, Conversation, ConversationPatch, NewCodebase};
use crate::types::AssistantType;

use super::{CommandHandler, CommandResult};

/// Default command files copied into fresh clones (never overwriting).
const DEFAULT_COMMANDS: &[(&str, &str)] = &[
    ("plan.md", include_str!("../../assets/commands/plan.md")),
    ("implement.md", include_str!("../../assets/commands/implement.md")),
    ("example.md", include_str!("../../assets/commands/example.md")),
];

/// Default workflow files copied into fresh clones.
const DEFAULT_WORKFLOWS: &[(&str, &str)] =
    &[("implement.yaml", include_str!("../../assets/workflows/implement.yaml"))];

const DEFAULT_CONFIG: &str = include_str!("../../assets/config.yaml");

impl CommandHandler {
    pub(super) async fn clone_repo(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let Some(url) = args.first() else {
            return Ok(CommandResult::fail("Usage: /clone <repository-url>"));
        };

        let normalized = gitio::normalize_repo_url(url);
        let Some((owner, repo)) = gitio::parse_owner_repo(&normalized) else {
            return Ok(CommandResult::fail(format!(
                "Could not parse owner/repo from {:?}",
                url
            )));
        };
        let name = format!("{}/{}", owner, repo);
        let target = self.settings().clone_path(&owner, &repo);

        if target.exists() {
            // Re-link when we already know this repository.
            if let Some(codebase) = self.store().find_codebase_by_url(&normalized).await? {
                self.link_codebase(conversation, &codebase).await?;
                return Ok(CommandResult::changed(format!(
                    "Linked existing clone {} at {}",
                    codebase.name,
                    target.display()
                )));
            }
            return Ok(CommandResult::fail(format!(
                "Directory {} already exists but no codebase is registered for {}",
                target.display(),
                normalized
            )));
        }

        let clone_url = gitio::authenticated_clone_url(url, self.settings().gh_token.as_deref());
        gitio::clone(&clone_url, &target).await?;
        info!("cloned {} into {}", name, target.display());

        let assistant = detect_assistant(&target, self.settings().default_assistant);
        seed_archon_defaults(&target)?;

        let codebase = match self.store().find_codebase_by_url(&normalized).await? {
            Some(codebase) => codebase,
            None => {
                self.store()
                    .create_codebase(NewCodebase {
                        name: name.clone(),
                        repository_url: Some(normalized.clone()),
                        default_cwd: target.to_string_lossy().to_string(),
                        ai_assistant_type: assistant,
                    })
                    .await?
            }
        };

        let loaded = self
            .index_commands_dir(&codebase, &target.join(".archon/commands"))
            .await?;
        if let Err(e) = gitio::add_safe_directory(&target).await {
            tracing::warn!("failed to trust {}: {}", target.display(), e);
        }

        self.link_codebase(conversation, &codebase).await?;

        Ok(CommandResult::changed(format!(
            "Cloned {} ({} assistant, {} command(s) loaded)",
            name,
            assistant.as_str(),
            loaded
        )))
    }

    pub(super) async fn repos(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let repos = self.list_repo_dirs();
        if repos.is_empty() {
            return Ok(CommandResult::ok("No repositories cloned yet. Use /clone <url>."));
        }

        let active = match &conversation.codebase_id {
            Some(id) => self
                .store()
                .get_codebase(id)
                .await?
                .map(|codebase| codebase.name),
            None => None,
        };

        let lines: Vec<String> = repos
            .iter()
            .enumerate()
            .map(|(index, repo)| {
                let marker = if Some(repo) == active.as_ref() { "*" } else { " " };
                format!("{} #{} {}", marker, index + 1, repo)
            })
            .collect();
        Ok(CommandResult::ok(lines.join("\n")))
    }

    pub(super) async fn repo(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let Some(selector) = args.first() else {
            return Ok(CommandResult::fail("Usage: /repo <#|name|prefix> [pull]"));
        };
        let pull = args.get(1).map(String::as_str) == Some("pull");

        let name = self.resolve_repo_selector(selector)?;
        let Some((owner, repo)) = name.split_once('/') else {
            return Ok(CommandResult::fail(format!("Malformed repo name {:?}", name)));
        };
        let target = self.settings().clone_path(owner, repo);

        let mut pulled = String::new();
        if pull {
            match gitio::pull(&target).await {
                Ok(_) => pulled = " (pulled)".to_string(),
                Err(e) => pulled = format!(" (pull failed: {})", e),
            }
        }

        let target_str = target.to_string_lossy().to_string();
        let codebase = match self.store().find_codebase_by_cwd(&target_str).await? {
            Some(codebase) => codebase,
            None => {
                let assistant = detect_assistant(&target, self.settings().default_assistant);
                self.store()
                    .create_codebase(NewCodebase {
                        name: name.clone(),
                        repository_url: None,
                        default_cwd: target_str,
                        ai_assistant_type: assistant,
                    })
                    .await?
            }
        };

        let loaded = self
            .index_commands_dir(&codebase, &target.join(".archon/commands"))
            .await?;
        self.link_codebase(conversation, &codebase).await?;

        Ok(CommandResult::changed(format!(
            "Switched to {}{} ({} command(s) loaded)",
            name, pulled, loaded
        )))
    }

    pub(super) async fn repo_remove(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let Some(selector) = args.first() else {
            return Ok(CommandResult::fail("Usage: /repo-remove <#|name|prefix>"));
        };

        let name = self.resolve_repo_selector(selector)?;
        let Some((owner, repo)) = name.split_once('/') else {
            return Ok(CommandResult::fail(format!("Malformed repo name {:?}", name)));
        };
        let target = self.settings().clone_path(owner, repo);
        let target_str = target.to_string_lossy().to_string();

        if let Some(codebase) = self.store().find_codebase_by_cwd(&target_str).await? {
            if conversation.codebase_id.as_deref() == Some(codebase.id.as_str()) {
                self.store()
                    .update_conversation(
                        &conversation.id,
                        ConversationPatch {
                            codebase_id: Some(None),
                            cwd: Some(None),
                            isolation_env_id: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            self.store().delete_codebase(&codebase.id).await?;
        }

        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }

        Ok(CommandResult::changed(format!("Removed {}", name)))
    }

    pub(super) async fn init(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let Some(cwd) = self.conversation_cwd(conversation).await? else {
            return Ok(CommandResult::fail(
                "No working directory set. Use /clone or /repo first.",
            ));
        };

        let archon = cwd.join(".archon");
        if archon.exists() {
            return Ok(CommandResult::ok(format!(
                "{} already exists",
                archon.display()
            )));
        }

        std::fs::create_dir_all(archon.join("commands"))?;
        std::fs::write(archon.join("config.yaml"), DEFAULT_CONFIG)?;
        std::fs::write(
            archon.join("commands/example.md"),
            include_str!("../../assets/commands/example.md"),
        )?;

        Ok(CommandResult::changed(format!(
            "Scaffolded {}",
            archon.display()
        )))
    }

    /// Point the conversation at a codebase and start fresh: canonical cwd,
    /// the codebase's assistant, no active session.
    pub(super) async fn link_codebase(
        &self,
        conversation: &Conversation,
        codebase: &Codebase,
    ) -> Result<(), CommandError> {
        self.store()
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    codebase_id: Some(Some(codebase.id.clone())),
                    cwd: Some(Some(codebase.default_cwd.clone())),
                    ai_assistant_type: Some(codebase.ai_assistant_type),
                    ..Default::default()
                },
            )
            .await?;
        self.store().deactivate_sessions(&conversation.id).await?;
        Ok(())
    }
}

/// Pick the assistant for a clone: `.codex/` selects codex, `.claude/`
/// selects claude, otherwise the configured default.
fn detect_assistant(clone: &Path, default: AssistantType) -> AssistantType {
    if clone.join(".codex").is_dir() {
        AssistantType::Codex
    } else if clone.join(".claude").is_dir() {
        AssistantType::Claude
    } else {
        default
    }
}

/// Copy bundled default commands/workflows into a clone that lacks them.
/// Existing files are never overwritten.
fn seed_archon_defaults(clone: &Path) -> std::io::Result<()> {
    let commands = clone.join(".archon/commands");
    if !commands.exists() {
        std::fs::create_dir_all(&commands)?;
        for (file, contents) in DEFAULT_COMMANDS {
            let path = commands.join(file);
            if !path.exists() {
                std::fs::write(path, contents)?;
            }
        }
    }

    let workflows = clone.join(".archon/workflows");
    if !workflows.exists() {
        std::fs::create_dir_all(&workflows)?;
        for (file, contents) in DEFAULT_WORKFLOWS {
            let path = workflows.join(file);
            if !path.exists() {
                std::fs::write(path, contents)?;
            }
        }
    }

    let config = clone.join(".archon/config.yaml");
    if !config.exists() {
        std::fs::write(config, DEFAULT_CONFIG)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    async fn init_local_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        gitio::run_git(path, &["init", "-b", "main"]).await.unwrap();
        gitio::run_git(path, &["config", "user.email", "t@t"]).await.unwrap();
        gitio::run_git(path, &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(path.join("README.md"), "hello").unwrap();
        gitio::run_git(path, &["add", "."]).await.unwrap();
        gitio::run_git(path, &["commit", "-m", "init"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_repo_switch_creates_and_links_codebase() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let clone = handler.settings().clone_path("alice", "utils");
        init_local_repo(&clone).await;

        let result = unwrap_handled(handler.handle(&conversation, "/repo utils").await);
        assert!(result.success, "{}", result.message);
        assert!(result.modified);

        let conversation = reload(&handler, &conversation).await;
        assert!(conversation.codebase_id.is_some());
        assert_eq!(
            conversation.cwd.as_deref(),
            Some(clone.to_string_lossy().as_ref())
        );

        let codebase = handler
            .store()
            .find_codebase_by_name("alice/utils")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(codebase.default_cwd, clone.to_string_lossy());
    }

    #[tokio::test]
    async fn test_repos_marks_active_and_sorts() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        init_local_repo(&handler.settings().clone_path("bob", "utils")).await;
        init_local_repo(&handler.settings().clone_path("alice", "utils")).await;

        unwrap_handled(handler.handle(&conversation, "/repo utils").await);
        let conversation = reload(&handler, &conversation).await;

        let result = unwrap_handled(handler.handle(&conversation, "/repos").await);
        let lines: Vec<&str> = result.message.lines().collect();
        assert_eq!(lines.len(), 2);
        // Alphabetical ordering; /repo utils linked alice/utils by tie-break.
        assert!(lines[0].contains("alice/utils"));
        assert!(lines[0].starts_with('*'));
        assert!(lines[1].contains("bob/utils"));
        assert!(lines[1].starts_with(' '));
    }

    #[tokio::test]
    async fn test_repo_remove_deletes_everything() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let clone = handler.settings().clone_path("alice", "utils");
        init_local_repo(&clone).await;
        unwrap_handled(handler.handle(&conversation, "/repo utils").await);
        let conversation = reload(&handler, &conversation).await;
        assert!(conversation.codebase_id.is_some());

        let result = unwrap_handled(handler.handle(&conversation, "/repo-remove utils").await);
        assert!(result.success, "{}", result.message);

        assert!(!clone.exists());
        let conversation = reload(&handler, &conversation).await;
        assert!(conversation.codebase_id.is_none());
        assert!(conversation.cwd.is_none());
        assert!(handler
            .store()
            .find_codebase_by_name("alice/utils")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_clone_rejects_unparseable_url() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let origin = tempfile::tempdir().unwrap();
        let origin_path = origin.path().join("utils");
        init_local_repo(&origin_path).await;
        let url = format!("file://{}", origin_path.display());

        // file:// URLs do not parse to owner/repo; expect graceful failure.
        let result = unwrap_handled(handler.handle(&conversation, &format!("/clone {}", url)).await);
        assert!(!result.success);
        assert!(result.message.contains("owner/repo"));
    }

    #[tokio::test]
    async fn test_clone_links_existing_directory_with_known_url() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let clone = handler.settings().clone_path("alice", "utils");
        init_local_repo(&clone).await;
        handler
            .store()
            .create_codebase(NewCodebase {
                name: "alice/utils".into(),
                repository_url: Some("https://github.com/alice/utils".into()),
                default_cwd: clone.to_string_lossy().to_string(),
                ai_assistant_type: AssistantType::Claude,
            })
            .await
            .unwrap();

        let result = unwrap_handled(
            handler
                .handle(&conversation, "/clone https://github.com/alice/utils.git")
                .await,
        );
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("Linked existing clone"));

        let conversation = reload(&handler, &conversation).await;
        assert!(conversation.codebase_id.is_some());
    }

    #[tokio::test]
    async fn test_init_scaffold_once() {
        let home = tempfile::tempdir().unwrap();
        let handler = handler_with_home(home.path()).await;
        let conversation = conversation(&handler).await;

        let clone = handler.settings().clone_path("alice", "utils");
        init_local_repo(&clone).await;
        unwrap_handled(handler.handle(&conversation, "/repo utils").await);
        let conversation = reload(&handler, &conversation).await;

        let result = unwrap_handled(handler.handle(&conversation, "/init").await);
        assert!(result.success);
        assert!(clone.join(".archon/config.yaml").exists());
        assert!(clone.join(".archon/commands/example.md").exists());

        let again = unwrap_handled(handler.handle(&conversation, "/init").await);
        assert!(again.message.contains("already exists"));
    }

    #[test]
    fn test_detect_assistant() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            detect_assistant(dir.path(), AssistantType::Claude),
            AssistantType::Claude
        );
        std::fs::create_dir_all(dir.path().join(".codex")).unwrap();
        assert_eq!(
            detect_assistant(dir.path(), AssistantType::Claude),
            AssistantType::Codex
        );
    }

    #[test]
    fn test_seed_defaults_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let commands = dir.path().join(".archon/commands");
        std::fs::create_dir_all(&commands).unwrap();
        std::fs::write(commands.join("plan.md"), "user content").unwrap();

        seed_archon_defaults(dir.path()).unwrap();

        // Existing commands dir: left alone entirely.
        let contents = std::fs::read_to_string(commands.join("plan.md")).unwrap();
        assert_eq!(contents, "user content");
        // Workflows dir was absent and got seeded.
        assert!(dir.path().join(".archon/workflows/implement.yaml").exists());
    }
}
