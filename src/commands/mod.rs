// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Deterministic slash-command dispatch.
//!
//! `handle` is a synchronous transformer in spirit: it parses, mutates
//! state through the store and isolation manager, and returns a reply
//! string. No assistant invocation happens here; unrecognized names are
//! handed back to the orchestrator, which tries command templates next.

mod parser;
mod repo;
mod session;
mod templates;
mod worktree;
mod workflow;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::cleanup::CleanupScheduler;
use crate::config::Settings;
use crate::error::CommandError;
use crate::gitio;
use crate::isolation::{is_worktree_path, IsolationManager};
use crate::store::{Conversation, ConversationPatch, Store};
use crate::workflow::WorkflowRegistry;

pub use parser::{parse_command, ParsedCommand};

/// Allowed shape of registered command names.
static COMMAND_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_.-]+$").unwrap());

/// Result of a handled command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    /// Whether conversation or codebase state changed.
    pub modified: bool,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            modified: false,
        }
    }

    pub fn changed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            modified: true,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            modified: false,
        }
    }
}

/// What `handle` decided about a message.
#[derive(Debug)]
pub enum CommandOutcome {
    Handled(CommandResult),
    /// Not a built-in; the workflow router resolves `/<template>` next.
    Unrecognized { name: String, args: Vec<String> },
}

/// The slash-command handler.
pub struct CommandHandler {
    store: Arc<Store>,
    settings: Settings,
    isolation: Arc<IsolationManager>,
    registry: Arc<WorkflowRegistry>,
    cleanup: Arc<CleanupScheduler>,
}

impl CommandHandler {
    pub fn new(
        store: Arc<Store>,
        settings: Settings,
        isolation: Arc<IsolationManager>,
        registry: Arc<WorkflowRegistry>,
        cleanup: Arc<CleanupScheduler>,
    ) -> Self {
        Self {
            store,
            settings,
            isolation,
            registry,
            cleanup,
        }
    }

    /// Dispatch a slash command against a conversation.
    pub async fn handle(&self, conversation: &Conversation, text: &str) -> CommandOutcome {
        let Some(parsed) = parse_command(text) else {
            return CommandOutcome::Unrecognized {
                name: String::new(),
                args: Vec::new(),
            };
        };
        debug!("command /{} {:?}", parsed.name, parsed.args);

        let result = match parsed.name.as_str() {
            "help" => Ok(self.help()),
            "status" => self.status(conversation).await,
            "getcwd" => self.getcwd(conversation).await,
            "setcwd" => self.setcwd(conversation, &parsed.args).await,
            "clone" => self.clone_repo(conversation, &parsed.args).await,
            "repos" => self.repos(conversation).await,
            "repo" => self.repo(conversation, &parsed.args).await,
            "repo-remove" => self.repo_remove(conversation, &parsed.args).await,
            "command-set" => self.command_set(conversation, &parsed.args).await,
            "load-commands" => self.load_commands(conversation, &parsed.args).await,
            "commands" => self.list_commands(conversation).await,
            "template-add" => self.template_add(&parsed.args).await,
            "templates" => self.templates_list().await,
            "template-delete" => self.template_delete(&parsed.args).await,
            "reset" => self.reset(conversation).await,
            "reset-context" => self.reset_context(conversation).await,
            "worktree" => self.worktree(conversation, &parsed.args).await,
            "workflow" => self.workflow(conversation, &parsed.args).await,
            "init" => self.init(conversation).await,
            _ => {
                return CommandOutcome::Unrecognized {
                    name: parsed.name,
                    args: parsed.args,
                };
            }
        };

        CommandOutcome::Handled(match result {
            Ok(result) => result,
            Err(e) if e.is_conversation_gone() => {
                CommandResult::fail("Conversation state changed; please try again.")
            }
            Err(e) => CommandResult::fail(e.to_string()),
        })
    }

    // ---- shared plumbing -------------------------------------------------

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn isolation(&self) -> &Arc<IsolationManager> {
        &self.isolation
    }

    pub(crate) fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub(crate) fn cleanup(&self) -> &Arc<CleanupScheduler> {
        &self.cleanup
    }

    pub(crate) fn valid_command_name(name: &str) -> bool {
        COMMAND_NAME.is_match(name)
    }

    /// Resolve a user-supplied path lexically, requiring it to stay inside
    /// the workspace root. Relative input is joined to `base`.
    pub(crate) fn resolve_in_workspace(
        &self,
        base: &Path,
        input: &str,
    ) -> Result<PathBuf, CommandError> {
        let root = self.settings.workspace_root();
        let joined = {
            let candidate = Path::new(input);
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                base.join(candidate)
            }
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(CommandError::PathViolation {
                            root: root.display().to_string(),
                            path: input.to_string(),
                        });
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }

        if !normalized.starts_with(&root) {
            return Err(CommandError::PathViolation {
                root: root.display().to_string(),
                path: input.to_string(),
            });
        }
        Ok(normalized)
    }

    /// Current working directory of a conversation: explicit cwd, else the
    /// linked codebase's canonical clone.
    pub(crate) async fn conversation_cwd(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<PathBuf>, CommandError> {
        if let Some(cwd) = &conversation.cwd {
            return Ok(Some(PathBuf::from(cwd)));
        }
        if let Some(codebase_id) = &conversation.codebase_id {
            if let Some(codebase) = self.store.get_codebase(codebase_id).await? {
                return Ok(Some(PathBuf::from(codebase.default_cwd)));
            }
        }
        Ok(None)
    }

    /// Short repo context: `owner/repo @ branch (worktree)`.
    pub(crate) async fn repo_context(&self, conversation: &Conversation) -> String {
        let Ok(Some(cwd)) = self.conversation_cwd(conversation).await else {
            return "no repository selected".to_string();
        };

        let name = match &conversation.codebase_id {
            Some(id) => match self.store.get_codebase(id).await {
                Ok(Some(codebase)) => codebase.name,
                _ => owner_repo_from_path(&self.settings.workspace_root(), &cwd)
                    .unwrap_or_else(|| cwd.display().to_string()),
            },
            None => owner_repo_from_path(&self.settings.workspace_root(), &cwd)
                .unwrap_or_else(|| cwd.display().to_string()),
        };

        let branch = gitio::current_branch(&cwd).await;
        let marker = if is_worktree_path(&cwd) { " (worktree)" } else { "" };
        format!("{} @ {}{}", name, branch, marker)
    }

    /// Best-effort auto-link: a conversation with no codebase whose cwd is
    /// some codebase's canonical clone gets linked. Never overrides an
    /// explicit `/setcwd` cwd, and a vanished conversation is ignored.
    pub(crate) async fn auto_link(&self, conversation: &Conversation) -> Conversation {
        if conversation.codebase_id.is_some() {
            return conversation.clone();
        }
        let Some(cwd) = &conversation.cwd else {
            return conversation.clone();
        };
        let Ok(Some(codebase)) = self.store.find_codebase_by_cwd(cwd).await else {
            return conversation.clone();
        };

        let patch = ConversationPatch {
            codebase_id: Some(Some(codebase.id.clone())),
            ..Default::default()
        };
        match self.store.update_conversation(&conversation.id, patch).await {
            Ok(()) => {
                let mut updated = conversation.clone();
                updated.codebase_id = Some(codebase.id);
                updated
            }
            Err(e) => {
                debug!("auto-link skipped: {}", e);
                conversation.clone()
            }
        }
    }

    /// Two-level `owner/repo` directories under the workspace root, sorted.
    pub(crate) fn list_repo_dirs(&self) -> Vec<String> {
        let root = self.settings.workspace_root();
        let mut repos = Vec::new();
        let Ok(owners) = std::fs::read_dir(&root) else {
            return repos;
        };
        for owner in owners.flatten() {
            if !owner.path().is_dir() {
                continue;
            }
            let owner_name = owner.file_name().to_string_lossy().to_string();
            if owner_name.starts_with('.') {
                continue;
            }
            let Ok(children) = std::fs::read_dir(owner.path()) else {
                continue;
            };
            for child in children.flatten() {
                if child.path().is_dir() {
                    repos.push(format!(
                        "{}/{}",
                        owner_name,
                        child.file_name().to_string_lossy()
                    ));
                }
            }
        }
        repos.sort();
        repos
    }

    /// Resolve a repo selector: `#N` index, exact `owner/repo`, exact repo
    /// name, prefix of `owner/repo`, then prefix of repo name. Ambiguity is
    /// tie-broken alphabetically.
    pub(crate) fn resolve_repo_selector(&self, selector: &str) -> Result<String, CommandError> {
        let repos = self.list_repo_dirs();
        if repos.is_empty() {
            return Err(CommandError::NotFound("no repositories cloned yet".into()));
        }

        if let Some(index) = selector.strip_prefix('#') {
            let index: usize = index
                .parse()
                .map_err(|_| CommandError::InvalidArguments(format!("bad index {:?}", selector)))?;
            return repos
                .get(index.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| CommandError::NotFound(format!("repo #{}", index)));
        }

        let repo_name = |full: &str| full.split('/').nth(1).unwrap_or(full).to_string();

        if let Some(exact) = repos.iter().find(|r| r.as_str() == selector) {
            return Ok(exact.clone());
        }
        if let Some(by_name) = repos.iter().find(|r| repo_name(r) == selector) {
            return Ok(by_name.clone());
        }
        if let Some(prefix) = repos.iter().find(|r| r.starts_with(selector)) {
            return Ok(prefix.clone());
        }
        if let Some(name_prefix) = repos.iter().find(|r| repo_name(r).starts_with(selector)) {
            return Ok(name_prefix.clone());
        }

        Err(CommandError::NotFound(format!("repo {:?}", selector)))
    }

    fn help(&self) -> CommandResult {
        CommandResult::ok(HELP_TEXT.trim())
    }
}

/// Derive `owner/repo` from a path under the workspace root, tolerating
/// worktree paths.
pub(crate) fn owner_repo_from_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative.components();
    let owner = parts.next()?.as_os_str().to_string_lossy().to_string();
    let repo = parts.next()?.as_os_str().to_string_lossy().to_string();
    Some(format!("{}/{}", owner, repo))
}

const HELP_TEXT: &str = r#"
Available commands:
  /help                          This catalog
  /status                        Platform, assistant, repo and session state
  /getcwd                        Current repository context
  /setcwd <path>                 Change working directory (workspace-relative)
  /clone <url>                   Clone a repository and link it
  /repos                         List cloned repositories
  /repo <#|name|prefix> [pull]   Switch repository, optionally pulling
  /repo-remove <#|name|prefix>   Delete a repository and its records
  /command-set <name> <path> [text]   Register a command file
  /load-commands <folder>        Index every *.md as a command
  /commands                      List registered commands
  /template-add <name> <content> Add or update a global template
  /templates                     List global templates
  /template-delete <name>        Delete a global template
  /reset                         Start a fresh assistant session
  /reset-context                 Same, keeping the working directory
  /worktree create <branch>      Isolate this conversation in a worktree
  /worktree list                 List worktrees of the current repo
  /worktree remove [--force]     Leave and delete the current worktree
  /worktree cleanup merged|stale Reclaim merged or stale worktrees
  /worktree orphans              Show worktrees git knows but archon does not
  /workflow list|reload|cancel   Manage declarative workflows
  /init                          Scaffold .archon/ in the current repo
  /command-invoke <name> [args]  Run a named command or template
  /<template> [args]             Run a named command template
"#;
