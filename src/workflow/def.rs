// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow definition grammar and validation.
//!
//! Two mutually exclusive shapes:
//!
//! ```yaml
//! name: implement
//! description: Plan then implement
//! provider: claude
//! steps:
//!   - command: plan
//!   - command: implement
//!     clearContext: true
//!   - parallel:
//!       - command: test
//!       - command: lint
//! ```
//!
//! ```yaml
//! name: fix-until-green
//! description: Iterate until tests pass
//! loop:
//!   until: ALL TESTS PASS
//!   max_iterations: 5
//!   fresh_context: true
//! prompt: Run the tests and fix the first failure.
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::WorkflowError;
use crate::types::AssistantType;

/// Allowed shape of step command names.
static COMMAND_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_.-]+$").unwrap());

/// A validated workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: String,
    pub provider: AssistantType,
    pub model: Option<String>,
    pub body: WorkflowBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowBody {
    Steps(Vec<WorkflowStep>),
    Loop(LoopSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowStep {
    Single(StepCommand),
    Parallel(Vec<StepCommand>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepCommand {
    pub command: String,
    /// Start this step from a fresh assistant session instead of resuming.
    pub clear_context: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSpec {
    /// Completion signal, matched as a substring of the assistant output.
    pub until: String,
    pub max_iterations: u32,
    /// Start every iteration from a fresh session.
    pub fresh_context: bool,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    name: Option<String>,
    description: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    steps: Option<Vec<RawStep>>,
    #[serde(rename = "loop")]
    loop_spec: Option<RawLoop>,
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    command: Option<String>,
    #[serde(alias = "clearContext")]
    clear_context: Option<bool>,
    parallel: Option<Vec<RawParallelEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawParallelEntry {
    command: Option<String>,
    #[serde(alias = "clearContext")]
    clear_context: Option<bool>,
    /// Present only to reject nesting with a clear message.
    parallel: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawLoop {
    until: Option<String>,
    max_iterations: Option<u32>,
    #[serde(default)]
    fresh_context: bool,
}

/// Parse and validate one workflow file. All validation problems are
/// aggregated into a single error.
pub fn parse_workflow(file: &str, contents: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let raw: RawWorkflow = serde_yaml::from_str(contents).map_err(|e| WorkflowError::Yaml {
        file: file.to_string(),
        message: e.to_string(),
    })?;

    let mut errors = Vec::new();

    let name = match raw.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            errors.push("missing workflow name".to_string());
            String::new()
        }
    };

    let provider = match raw.provider.as_deref() {
        None => AssistantType::Claude,
        Some(raw_provider) => match raw_provider.parse() {
            Ok(provider) => provider,
            Err(e) => {
                errors.push(e);
                AssistantType::Claude
            }
        },
    };

    let body = match (&raw.steps, &raw.loop_spec) {
        (Some(_), Some(_)) => {
            errors.push("workflow has both steps and loop".to_string());
            None
        }
        (None, None) => {
            errors.push("workflow has neither steps nor loop".to_string());
            None
        }
        (Some(steps), None) => validate_steps(steps, &mut errors).map(WorkflowBody::Steps),
        (None, Some(loop_spec)) => {
            validate_loop(loop_spec, raw.prompt.as_deref(), &mut errors).map(WorkflowBody::Loop)
        }
    };

    match (body, errors.is_empty()) {
        (Some(body), true) => Ok(WorkflowDefinition {
            name,
            description: raw.description.unwrap_or_default(),
            provider,
            model: raw.model,
            body,
        }),
        _ => Err(WorkflowError::Validation {
            file: file.to_string(),
            reasons: errors,
        }),
    }
}

fn validate_command(raw: Option<&str>, position: &str, errors: &mut Vec<String>) -> Option<String> {
    match raw.map(str::trim) {
        Some(command) if COMMAND_NAME.is_match(command) => Some(command.to_string()),
        Some(command) => {
            errors.push(format!("{}: invalid command name {:?}", position, command));
            None
        }
        None => {
            errors.push(format!("{}: missing command", position));
            None
        }
    }
}

fn validate_steps(steps: &[RawStep], errors: &mut Vec<String>) -> Option<Vec<WorkflowStep>> {
    if steps.is_empty() {
        errors.push("steps list is empty".to_string());
        return None;
    }

    let mut validated = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let position = format!("step {}", index + 1);
        match (&step.command, &step.parallel) {
            (Some(_), Some(_)) => {
                errors.push(format!("{}: has both command and parallel", position));
            }
            (None, None) => {
                errors.push(format!("{}: has neither command nor parallel", position));
            }
            (Some(command), None) => {
                if let Some(command) = validate_command(Some(command), &position, errors) {
                    validated.push(WorkflowStep::Single(StepCommand {
                        command,
                        clear_context: step.clear_context.unwrap_or(false),
                    }));
                }
            }
            (None, Some(parallel)) => {
                if parallel.is_empty() {
                    errors.push(format!("{}: parallel block is empty", position));
                    continue;
                }
                let mut branch_commands = Vec::with_capacity(parallel.len());
                for (branch_index, entry) in parallel.iter().enumerate() {
                    let branch = format!("{} branch {}", position, branch_index + 1);
                    if entry.parallel.is_some() {
                        errors.push(format!("{}: parallel blocks may not nest", branch));
                        continue;
                    }
                    if let Some(command) =
                        validate_command(entry.command.as_deref(), &branch, errors)
                    {
                        branch_commands.push(StepCommand {
                            command,
                            clear_context: entry.clear_context.unwrap_or(false),
                        });
                    }
                }
                if branch_commands.len() == parallel.len() {
                    validated.push(WorkflowStep::Parallel(branch_commands));
                }
            }
        }
    }

    if errors.is_empty() {
        Some(validated)
    } else {
        None
    }
}

fn validate_loop(
    raw: &RawLoop,
    prompt: Option<&str>,
    errors: &mut Vec<String>,
) -> Option<LoopSpec> {
    let until = match raw.until.as_deref().map(str::trim) {
        Some(until) if !until.is_empty() => Some(until.to_string()),
        _ => {
            errors.push("loop is missing until signal".to_string());
            None
        }
    };

    let max_iterations = match raw.max_iterations {
        Some(n) if n >= 1 => Some(n),
        Some(n) => {
            errors.push(format!("loop max_iterations must be >= 1, got {}", n));
            None
        }
        None => {
            errors.push("loop is missing max_iterations".to_string());
            None
        }
    };

    let prompt = match prompt.map(str::trim) {
        Some(prompt) if !prompt.is_empty() => Some(prompt.to_string()),
        _ => {
            errors.push("loop workflow requires a non-empty prompt".to_string());
            None
        }
    };

    match (until, max_iterations, prompt) {
        (Some(until), Some(max_iterations), Some(prompt)) => Some(LoopSpec {
            until,
            max_iterations,
            fresh_context: raw.fresh_context,
            prompt,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_workflow() {
        let yaml = r#"
name: implement
description: Plan then implement
steps:
  - command: plan
  - command: implement
    clearContext: true
  - parallel:
      - command: test
      - command: lint
"#;
        let workflow = parse_workflow("implement.yaml", yaml).unwrap();
        assert_eq!(workflow.name, "implement");
        assert_eq!(workflow.provider, AssistantType::Claude);
        match &workflow.body {
            WorkflowBody::Steps(steps) => {
                assert_eq!(steps.len(), 3);
                assert_eq!(
                    steps[1],
                    WorkflowStep::Single(StepCommand {
                        command: "implement".into(),
                        clear_context: true,
                    })
                );
                assert!(matches!(&steps[2], WorkflowStep::Parallel(branches) if branches.len() == 2));
            }
            _ => panic!("expected steps"),
        }
    }

    #[test]
    fn test_loop_workflow() {
        let yaml = r#"
name: fix-until-green
description: Iterate until tests pass
provider: codex
loop:
  until: ALL TESTS PASS
  max_iterations: 5
  fresh_context: true
prompt: Run the tests and fix the first failure.
"#;
        let workflow = parse_workflow("fix.yaml", yaml).unwrap();
        assert_eq!(workflow.provider, AssistantType::Codex);
        match &workflow.body {
            WorkflowBody::Loop(spec) => {
                assert_eq!(spec.until, "ALL TESTS PASS");
                assert_eq!(spec.max_iterations, 5);
                assert!(spec.fresh_context);
            }
            _ => panic!("expected loop"),
        }
    }

    #[test]
    fn test_invalid_command_name_rejects_file() {
        let yaml = r#"
name: broken
steps:
  - command: "bad name"
"#;
        let err = parse_workflow("broken.yaml", yaml).unwrap_err();
        match err {
            WorkflowError::Validation { file, reasons } => {
                assert_eq!(file, "broken.yaml");
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("invalid command name"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_errors_aggregate() {
        let yaml = r#"
name: ""
steps:
  - command: "bad name"
  - parallel: []
  - parallel:
      - parallel:
          - command: inner
"#;
        let err = parse_workflow("multi.yaml", yaml).unwrap_err();
        match err {
            WorkflowError::Validation { reasons, .. } => {
                assert!(reasons.len() >= 4);
                assert!(reasons.iter().any(|r| r.contains("missing workflow name")));
                assert!(reasons.iter().any(|r| r.contains("parallel block is empty")));
                assert!(reasons.iter().any(|r| r.contains("may not nest")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_both_shapes_rejected() {
        let yaml = r#"
name: confused
steps:
  - command: plan
loop:
  until: DONE
  max_iterations: 2
prompt: go
"#;
        assert!(parse_workflow("confused.yaml", yaml).is_err());
    }

    #[test]
    fn test_loop_without_prompt_rejected() {
        let yaml = r#"
name: no-prompt
loop:
  until: DONE
  max_iterations: 2
"#;
        let err = parse_workflow("no-prompt.yaml", yaml).unwrap_err();
        match err {
            WorkflowError::Validation { reasons, .. } => {
                assert!(reasons.iter().any(|r| r.contains("non-empty prompt")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_not_yaml() {
        assert!(matches!(
            parse_workflow("junk.yaml", ":\n  - ["),
            Err(WorkflowError::Yaml { .. })
        ));
    }
}
