// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command registration and global templates: /command-set, /load-commands,
//! /commands, /template-add, /templates, /template-delete.

use std::path::Path;

use walkdir::WalkDir;

use crate::error::CommandError;
use crate::store::{Codebase, CodebaseCommand, Conversation};
use crate::workflow;

use super::{CommandHandler, CommandResult};

impl CommandHandler {
    pub(super) async fn command_set(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let (Some(name), Some(relpath)) = (args.first(), args.get(1)) else {
            return Ok(CommandResult::fail(
                "Usage: /command-set <name> <relative-path> [content]",
            ));
        };
        if !Self::valid_command_name(name) {
            return Ok(CommandResult::fail(format!(
                "Invalid command name {:?} (allowed: letters, digits, . _ -)",
                name
            )));
        }

        let base = Path::new(&codebase.default_cwd);
        let path = self.resolve_in_workspace(base, relpath)?;

        let text = if args.len() > 2 {
            Some(args[2..].join(" "))
        } else {
            None
        };
        match text {
            Some(text) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, text)?;
            }
            None if !path.is_file() => {
                return Ok(CommandResult::fail(format!(
                    "File {} does not exist; pass content to create it",
                    path.display()
                )));
            }
            None => {}
        }

        let contents = std::fs::read_to_string(&path)?;
        let description = frontmatter_description(&contents);
        let rel = path
            .strip_prefix(base)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string());

        let mut commands = codebase.commands.clone();
        commands.insert(
            name.to_string(),
            CodebaseCommand {
                path: rel,
                description,
            },
        );
        self.store()
            .update_codebase_commands(&codebase.id, &commands)
            .await?;

        Ok(CommandResult::changed(format!(
            "Registered /{} -> {}",
            name,
            path.display()
        )))
    }

    pub(super) async fn load_commands(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let Some(folder) = args.first() else {
            return Ok(CommandResult::fail("Usage: /load-commands <folder>"));
        };

        let base = Path::new(&codebase.default_cwd);
        let dir = self.resolve_in_workspace(base, folder)?;
        let count = self.index_commands_dir(&codebase, &dir).await?;
        if count == 0 {
            return Ok(CommandResult::fail(format!(
                "No .md files found under {}",
                dir.display()
            )));
        }
        Ok(CommandResult::changed(format!(
            "Loaded {} command(s) from {}",
            count,
            dir.display()
        )))
    }

    pub(super) async fn list_commands(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        if codebase.commands.is_empty() {
            return Ok(CommandResult::ok(
                "No commands registered. Use /command-set or /load-commands.",
            ));
        }
        let lines: Vec<String> = codebase
            .commands
            .iter()
            .map(|(name, command)| match &command.description {
                Some(description) => format!("/{} - {}", name, description),
                None => format!("/{}", name),
            })
            .collect();
        Ok(CommandResult::ok(lines.join("\n")))
    }

    pub(super) async fn template_add(&self, args: &[String]) -> Result<CommandResult, CommandError> {
        let Some(name) = args.first() else {
            return Ok(CommandResult::fail("Usage: /template-add <name> <content>"));
        };
        if !Self::valid_command_name(name) {
            return Ok(CommandResult::fail(format!("Invalid template name {:?}", name)));
        }
        let content = args[1..].join(" ");
        if content.trim().is_empty() {
            return Ok(CommandResult::fail("Template content is empty"));
        }

        let description = frontmatter_description(&content);
        self.store()
            .upsert_template(name, description.as_deref(), &content)
            .await?;
        Ok(CommandResult::changed(format!("Template /{} saved", name)))
    }

    pub(super) async fn templates_list(&self) -> Result<CommandResult, CommandError> {
        let templates = self.store().list_templates().await?;
        if templates.is_empty() {
            return Ok(CommandResult::ok("No templates. Use /template-add."));
        }
        let lines: Vec<String> = templates
            .iter()
            .map(|template| match &template.description {
                Some(description) => format!("/{} - {}", template.name, description),
                None => format!("/{}", template.name),
            })
            .collect();
        Ok(CommandResult::ok(lines.join("\n")))
    }

    pub(super) async fn template_delete(
        &self,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        let Some(name) = args.first() else {
            return Ok(CommandResult::fail("Usage: /template-delete <name>"));
        };
        if self.store().delete_template(name).await? {
            Ok(CommandResult::changed(format!("Template /{} deleted", name)))
        } else {
            Ok(CommandResult::fail(format!("No template named /{}", name)))
        }
    }

    /// The conversation's linked codebase, or a user-facing error.
    pub(crate) async fn require_codebase(
        &self,
        conversation: &Conversation,
    ) -> Result<Codebase, CommandError> {
        let id = conversation
            .codebase_id
            .as_deref()
            .ok_or(CommandError::NoCodebase)?;
        self.store()
            .get_codebase(id)
            .await?
            .ok_or(CommandError::NoCodebase)
    }

    /// Recursively index `*.md` files under `dir` into the codebase's
    /// command map. Hidden directories and `node_modules` are skipped;
    /// later files override earlier same-named ones. Returns how many files
    /// were indexed.
    pub(crate) async fn index_commands_dir(
        &self,
        codebase: &Codebase,
        dir: &Path,
    ) -> Result<usize, CommandError> {
        if !dir.is_dir() {
            return Ok(0);
        }

        let base = Path::new(&codebase.default_cwd);
        let mut files: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                if entry.file_type().is_dir() {
                    // The walk root may itself be hidden (.archon/commands).
                    entry.depth() == 0 || (!name.starts_with('.') && name != "node_modules")
                } else {
                    true
                }
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("md"))
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        if files.is_empty() {
            return Ok(0);
        }

        let mut commands = codebase.commands.clone();
        let mut indexed = 0;
        for path in files {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !Self::valid_command_name(stem) {
                tracing::warn!("skipping command file with invalid name: {}", path.display());
                continue;
            }
            let description = std::fs::read_to_string(&path)
                .ok()
                .and_then(|contents| frontmatter_description(&contents));
            let rel = path
                .strip_prefix(base)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| path.to_string_lossy().to_string());
            commands.insert(
                stem.to_string(),
                CodebaseCommand {
                    path: rel,
                    description,
                },
            );
            indexed += 1;
        }

        if indexed > 0 {
            self.store()
                .update_codebase_commands(&codebase.id, &commands)
                .await?;
        }
        Ok(indexed)
    }
}

fn frontmatter_description(contents: &str) -> Option<String> {
    workflow::frontmatter_description(contents)
}
