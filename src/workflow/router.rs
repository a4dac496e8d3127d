// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message routing and prompt substitution.
//!
//! A non-command message either starts a workflow (first token exactly
//! matches a loaded workflow name), invokes a command template, or falls
//! through to a plain assistant invocation. A conversation with a running
//! workflow ignores everything except `/workflow cancel`.

use crate::error::WorkflowError;
use crate::store::{Codebase, Store};

use super::loader::WorkflowRegistry;

/// Routing decision for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A workflow is already running; the message is dropped.
    Busy,
    /// Start the named workflow.
    Workflow(String),
    /// Plain assistant invocation in the conversation's working directory.
    Plain,
}

/// Route a non-command message.
pub async fn route_message(
    store: &Store,
    registry: &WorkflowRegistry,
    conversation_id: &str,
    text: &str,
) -> Result<Route, WorkflowError> {
    if store.find_running_run(conversation_id).await?.is_some() {
        return Ok(Route::Busy);
    }

    if let Some(first_token) = text.split_whitespace().next() {
        if registry.get(first_token).is_some() {
            return Ok(Route::Workflow(first_token.to_string()));
        }
    }

    Ok(Route::Plain)
}

/// Substitute prompt placeholders.
///
/// `$1..$N` expand to positional arguments, `$ARGUMENTS` to all of them
/// joined by spaces. `$PLAN` and `$IMPLEMENTATION_SUMMARY` are drawn from
/// the active session's metadata; absent values expand to empty strings.
pub fn substitute_arguments(
    content: &str,
    args: &[String],
    session_metadata: Option<&serde_json::Value>,
) -> String {
    let mut result = content.to_string();

    let metadata_str = |key: &str| -> String {
        session_metadata
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    result = result.replace("$ARGUMENTS", &args.join(" "));
    result = result.replace("$PLAN", &metadata_str("plan"));
    result = result.replace("$IMPLEMENTATION_SUMMARY", &metadata_str("implementation_summary"));

    // Highest index first so $10 is not clobbered by $1.
    for (index, arg) in args.iter().enumerate().rev() {
        result = result.replace(&format!("${}", index + 1), arg);
    }

    result
}

/// Resolve a command's prompt content: per-codebase command files first,
/// then global templates.
pub async fn resolve_command_content(
    store: &Store,
    codebase: Option<&Codebase>,
    name: &str,
) -> Result<Option<String>, WorkflowError> {
    if let Some(codebase) = codebase {
        if let Some(command) = codebase.commands.get(name) {
            let path = std::path::Path::new(&codebase.default_cwd).join(&command.path);
            match std::fs::read_to_string(&path) {
                Ok(contents) => return Ok(Some(strip_frontmatter(&contents).to_string())),
                Err(e) => {
                    tracing::warn!(
                        "command {} file {} unreadable: {}",
                        name,
                        path.display(),
                        e
                    );
                }
            }
        }
    }

    if let Some(template) = store.get_template(name).await? {
        return Ok(Some(template.content));
    }

    Ok(None)
}

/// Drop a leading YAML frontmatter block from a command file.
pub(crate) fn strip_frontmatter(contents: &str) -> &str {
    let Some(rest) = contents.strip_prefix("---") else {
        return contents;
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            after.strip_prefix('\n').unwrap_or(after)
        }
        None => contents,
    }
}

/// Read `description:` from a YAML frontmatter block, if present.
pub(crate) fn frontmatter_description(contents: &str) -> Option<String> {
    let rest = contents.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let frontmatter: serde_yaml::Value = serde_yaml::from_str(&rest[..end]).ok()?;
    frontmatter
        .get("description")
        .and_then(|v| v.as_str())
        .map(String::from)
}
