// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow management commands: /workflow list|reload|cancel.

use std::path::Path;

use crate::error::CommandError;
use crate::store::Conversation;
use crate::types::RunStatus;

use super::{CommandHandler, CommandResult};

impl CommandHandler {
    pub(super) async fn workflow(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandResult, CommandError> {
        match args.first().map(String::as_str) {
            Some("list") => self.workflow_list(conversation).await,
            Some("reload") => self.workflow_reload(conversation).await,
            Some("cancel") => self.workflow_cancel(conversation).await,
            _ => Ok(CommandResult::fail("Usage: /workflow list|reload|cancel")),
        }
    }

    async fn workflow_list(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        self.require_codebase(conversation).await?;
        let names = self.registry().names();
        if names.is_empty() {
            return Ok(CommandResult::ok(
                "No workflows loaded. Add .archon/workflows/*.yaml and /workflow reload.",
            ));
        }

        let lines: Vec<String> = names
            .iter()
            .map(|name| match self.registry().get(name) {
                Some(workflow) if !workflow.description.is_empty() => {
                    format!("{} - {}", name, workflow.description)
                }
                _ => name.clone(),
            })
            .collect();
        Ok(CommandResult::ok(lines.join("\n")))
    }

    async fn workflow_reload(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        let codebase = self.require_codebase(conversation).await?;
        let report = self
            .registry()
            .reload_from_clone(Path::new(&codebase.default_cwd));

        let mut message = format!("Loaded {} workflow(s)", report.loaded.len());
        if !report.rejected.is_empty() {
            message.push_str(&format!(", rejected {}:", report.rejected.len()));
            for (file, reason) in &report.rejected {
                message.push_str(&format!("\n- {}: {}", file, reason));
            }
        }
        Ok(CommandResult::changed(message))
    }

    async fn workflow_cancel(
        &self,
        conversation: &Conversation,
    ) -> Result<CommandResult, CommandError> {
        match self.store().find_running_run(&conversation.id).await? {
            Some(run) => {
                self.store()
                    .finish_run(&run.id, RunStatus::Failed, Some("Cancelled by user"))
                    .await?;
                Ok(CommandResult::changed(format!(
                    "Cancelled workflow {} (step {}). In-flight step finishes on its own.",
                    run.workflow_name, run.current_step_index
                )))
            }
            None => Ok(CommandResult::fail("No workflow is running.")),
        }
    }
}
