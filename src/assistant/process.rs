// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subprocess-backed assistant client.
//!
//! Drives the `claude` and `codex` CLIs. Claude runs in print mode with a
//! JSON envelope carrying the result text and the resume token; codex emits
//! plain text, which is forwarded line-by-line when a chunk channel is
//! attached.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AssistantError;
use crate::types::AssistantType;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::{AssistantClient, AssistantRequest, AssistantResponse};

/// Assistant client spawning the external CLI per invocation.
#[derive(Debug, Default)]
pub struct ProcessAssistantClient {
    /// Override for the claude binary (tests point this at a stub).
    pub claude_bin: Option<String>,
    /// Override for the codex binary.
    pub codex_bin: Option<String>,
}

impl ProcessAssistantClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn binary(&self, assistant: AssistantType) -> &str {
        match assistant {
            AssistantType::Claude => self.claude_bin.as_deref().unwrap_or("claude"),
            AssistantType::Codex => self.codex_bin.as_deref().unwrap_or("codex"),
        }
    }

    fn build_command(&self, request: &AssistantRequest) -> Command {
        let mut cmd = Command::new(self.binary(request.assistant_type));
        cmd.current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match request.assistant_type {
            AssistantType::Claude => {
                cmd.arg("-p").arg("--output-format").arg("json");
                if let Some(session) = &request.session_to_resume {
                    cmd.arg("--resume").arg(session);
                }
                if let Some(model) = &request.model {
                    cmd.arg("--model").arg(model);
                }
                cmd.arg(&request.prompt);
            }
            AssistantType::Codex => {
                cmd.arg("exec");
                if let Some(model) = &request.model {
                    cmd.arg("--model").arg(model);
                }
                if let Some(session) = &request.session_to_resume {
                    cmd.arg("resume").arg(session);
                }
                cmd.arg(&request.prompt);
            }
        }
        cmd
    }
}

#[async_trait]
impl AssistantClient for ProcessAssistantClient {
    async fn invoke(&self, request: AssistantRequest) -> Result<AssistantResponse, AssistantError> {
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_assistant_invocation();

        debug!(
            "invoking {} in {:?} (resume={})",
            request.assistant_type,
            request.working_directory,
            request.session_to_resume.is_some()
        );

        let mut child = self
            .build_command(&request)
            .spawn()
            .map_err(|e| AssistantError::SpawnFailed(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AssistantError::SpawnFailed("child stdout not captured".to_string())
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            AssistantError::SpawnFailed("child stderr not captured".to_string())
        })?;

        // Read stdout incrementally so codex output can stream.
        let mut reader = BufReader::new(stdout).lines();
        let mut collected = String::new();
        let stream_lines = request.assistant_type == AssistantType::Codex;
        while let Some(line) = reader.next_line().await? {
            if stream_lines {
                if let Some(chunks) = &request.chunks {
                    let _ = chunks.send(line.clone()).await;
                }
            }
            collected.push_str(&line);
            collected.push('\n');
        }

        let mut stderr_buf = String::new();
        let _ = stderr.read_to_string(&mut stderr_buf).await;

        let status = child.wait().await?;
        if !status.success() {
            return Err(AssistantError::Failed {
                status: status.code().unwrap_or(-1),
                stderr: stderr_buf.trim().to_string(),
            });
        }

        let response = match request.assistant_type {
            AssistantType::Claude => parse_claude_envelope(&collected)?,
            AssistantType::Codex => AssistantResponse {
                session_id: parse_codex_session(&collected),
                text_output: collected.trim().to_string(),
            },
        };

        // Batch CLIs get their single consolidated chunk at the end.
        if !stream_lines {
            if let Some(chunks) = &request.chunks {
                let _ = chunks.send(response.text_output.clone()).await;
            }
        }

        Ok(response)
    }
}

/// Claude print-mode JSON envelope: `{"session_id": ..., "result": ...}`.
fn parse_claude_envelope(raw: &str) -> Result<AssistantResponse, AssistantError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|e| AssistantError::ParseError(format!("claude envelope: {}", e)))?;
    let text_output = value
        .get("result")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let session_id = value
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(String::from);
    if session_id.is_none() {
        warn!("claude envelope carried no session_id");
    }
    Ok(AssistantResponse {
        session_id,
        text_output,
    })
}

/// Codex prints a `session id: <id>` metadata line before the response.
fn parse_codex_session(raw: &str) -> Option<String> {
    raw.lines().find_map(|line| {
        line.trim()
            .strip_prefix("session id:")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    })
}
