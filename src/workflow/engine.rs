// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow execution.
//!
//! Each step resolves its command (per-codebase files first, then global
//! templates), applies the session policy, invokes the assistant, and
//! delivers output through the adapter. Runs are cancelled cooperatively:
//! `/workflow cancel` marks the run failed, and the next step boundary is
//! the cancellation point.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapter::PlatformAdapter;
use crate::assistant::{AssistantClient, AssistantRequest};
use crate::error::{StoreError, WorkflowError};
use crate::lock::CancelToken;
use crate::store::{Codebase, Conversation, NewRun, Store};
use crate::types::{AssistantType, RunStatus, StreamingMode};

use super::def::{LoopSpec, StepCommand, WorkflowBody, WorkflowDefinition, WorkflowStep};
use super::router::{resolve_command_content, substitute_arguments};

/// Everything one run needs about its surroundings.
pub struct RunContext {
    pub conversation: Conversation,
    pub codebase: Option<Codebase>,
    /// Directory assistant invocations run in (worktree or canonical cwd).
    pub working_dir: PathBuf,
    pub adapter: Arc<dyn PlatformAdapter>,
    pub cancel: CancelToken,
}

/// Executes workflows against the assistant client.
pub struct WorkflowEngine {
    store: Arc<Store>,
    assistant: Arc<dyn AssistantClient>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<Store>, assistant: Arc<dyn AssistantClient>) -> Self {
        Self { store, assistant }
    }

    /// Run a workflow to a terminal state.
    ///
    /// Returns the final run status; `Err` carries the failure that was also
    /// recorded on the run's metadata.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        ctx: &RunContext,
        user_message: &str,
    ) -> Result<RunStatus, WorkflowError> {
        if self
            .store
            .find_running_run(&ctx.conversation.id)
            .await?
            .is_some()
        {
            return Err(WorkflowError::RunActive);
        }

        let run = self
            .store
            .insert_run(NewRun {
                workflow_name: workflow.name.clone(),
                conversation_id: ctx.conversation.id.clone(),
                codebase_id: ctx.conversation.codebase_id.clone(),
                user_message: user_message.to_string(),
                metadata: json!({}),
            })
            .await?;
        info!("workflow {} started as run {}", workflow.name, run.id);

        let outcome = match &workflow.body {
            WorkflowBody::Steps(steps) => {
                self.run_steps(&run.id, workflow, steps, ctx, user_message)
                    .await
            }
            WorkflowBody::Loop(spec) => {
                self.run_loop(&run.id, workflow, spec, ctx, user_message)
                    .await
            }
        };

        match outcome {
            Ok(true) => {
                self.finish(&run.id, RunStatus::Completed, None).await;
                Ok(RunStatus::Completed)
            }
            Ok(false) => {
                // Cancelled out from under us; the run is already terminal.
                info!("run {} stopped at a cancellation point", run.id);
                Ok(RunStatus::Failed)
            }
            Err(e) => {
                self.finish(&run.id, RunStatus::Failed, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// One-off assistant invocation outside a workflow (plain messages and
    /// template commands). Applies the same session policy and output
    /// delivery as a workflow step.
    pub async fn invoke_prompt(
        &self,
        ctx: &RunContext,
        prompt: &str,
        provider: AssistantType,
        model: Option<&str>,
        clear_context: bool,
    ) -> Result<String, WorkflowError> {
        if clear_context {
            self.store
                .deactivate_sessions(&ctx.conversation.id)
                .await?;
        }

        let session = match self
            .store
            .find_active_session(&ctx.conversation.id)
            .await?
        {
            Some(session) => session,
            None => {
                self.store
                    .create_session(
                        &ctx.conversation.id,
                        ctx.conversation.codebase_id.as_deref(),
                        provider,
                    )
                    .await?
            }
        };

        let mut request = AssistantRequest::new(prompt, &ctx.working_dir)
            .with_resume(session.assistant_session_id.clone())
            .with_assistant(provider)
            .with_model(model.map(String::from));

        let forwarder = match ctx.adapter.streaming_mode() {
            StreamingMode::Stream => {
                let (tx, mut rx) = mpsc::channel::<String>(64);
                request = request.with_chunks(tx);
                let adapter = Arc::clone(&ctx.adapter);
                let target = ctx.conversation.platform_conversation_id.clone();
                Some(tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        if let Err(e) = adapter.send_message(&target, &chunk).await {
                            warn!("chunk delivery failed: {}", e);
                        }
                    }
                }))
            }
            StreamingMode::Batch => None,
        };

        let response = self.assistant.invoke(request).await?;

        if let Some(task) = forwarder {
            let _ = task.await;
        } else if !response.text_output.is_empty() {
            if let Err(e) = ctx
                .adapter
                .send_message(
                    &ctx.conversation.platform_conversation_id,
                    &response.text_output,
                )
                .await
            {
                warn!("reply delivery failed: {}", e);
            }
        }

        if let Some(token) = &response.session_id {
            self.store
                .set_session_resume_token(&session.id, token)
                .await?;
        }

        Ok(response.text_output)
    }

    async fn run_steps(
        &self,
        run_id: &str,
        workflow: &WorkflowDefinition,
        steps: &[WorkflowStep],
        ctx: &RunContext,
        user_message: &str,
    ) -> Result<bool, WorkflowError> {
        for (index, step) in steps.iter().enumerate() {
            if !self.at_step_boundary(run_id, ctx).await {
                return Ok(false);
            }

            match step {
                WorkflowStep::Single(command) => {
                    let prompt = self.step_prompt(ctx, command, user_message).await?;
                    self.invoke_prompt(
                        ctx,
                        &prompt,
                        workflow.provider,
                        workflow.model.as_deref(),
                        command.clear_context,
                    )
                    .await?;
                }
                WorkflowStep::Parallel(branches) => {
                    self.run_parallel(workflow, branches, ctx, user_message)
                        .await?;
                }
            }

            self.store.advance_run_step(run_id, (index + 1) as i64).await?;
            self.store.touch_run_activity(run_id).await;
        }
        Ok(true)
    }

    /// Launch all branches concurrently; succeed iff every branch succeeds.
    /// Branch outputs are posted as each branch finishes, in no particular
    /// order, and branches never share or update the conversation session.
    async fn run_parallel(
        &self,
        workflow: &WorkflowDefinition,
        branches: &[StepCommand],
        ctx: &RunContext,
        user_message: &str,
    ) -> Result<(), WorkflowError> {
        let session_metadata = self
            .store
            .find_active_session(&ctx.conversation.id)
            .await?
            .map(|s| s.metadata);

        let mut set = JoinSet::new();
        for branch in branches {
            let content = resolve_command_content(&self.store, ctx.codebase.as_ref(), &branch.command)
                .await?
                .ok_or_else(|| WorkflowError::CommandNotFound(branch.command.clone()))?;
            let prompt = substitute_arguments(
                &content,
                &[user_message.to_string()],
                session_metadata.as_ref(),
            );

            let assistant = Arc::clone(&self.assistant);
            let adapter = Arc::clone(&ctx.adapter);
            let target = ctx.conversation.platform_conversation_id.clone();
            let working_dir = ctx.working_dir.clone();
            let provider = workflow.provider;
            let model = workflow.model.clone();

            set.spawn(async move {
                let request = AssistantRequest::new(prompt, working_dir)
                    .with_assistant(provider)
                    .with_model(model);
                let response = assistant.invoke(request).await?;
                if !response.text_output.is_empty() {
                    if let Err(e) = adapter.send_message(&target, &response.text_output).await {
                        warn!("parallel branch delivery failed: {}", e);
                    }
                }
                Ok::<_, WorkflowError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(WorkflowError::Assistant(
                        crate::error::AssistantError::SpawnFailed(e.to_string()),
                    ));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_loop(
        &self,
        run_id: &str,
        workflow: &WorkflowDefinition,
        spec: &LoopSpec,
        ctx: &RunContext,
        user_message: &str,
    ) -> Result<bool, WorkflowError> {
        for iteration in 0..spec.max_iterations {
            if !self.at_step_boundary(run_id, ctx).await {
                return Ok(false);
            }

            let session_metadata = self
                .store
                .find_active_session(&ctx.conversation.id)
                .await?
                .map(|s| s.metadata);
            let prompt = substitute_arguments(
                &spec.prompt,
                &[user_message.to_string()],
                session_metadata.as_ref(),
            );

            let output = self
                .invoke_prompt(
                    ctx,
                    &prompt,
                    workflow.provider,
                    workflow.model.as_deref(),
                    spec.fresh_context,
                )
                .await?;

            self.store
                .advance_run_step(run_id, (iteration + 1) as i64)
                .await?;
            self.store.touch_run_activity(run_id).await;

            if output.contains(&spec.until) {
                debug!(
                    "loop signal {:?} found on iteration {}",
                    spec.until,
                    iteration + 1
                );
                return Ok(true);
            }
        }

        Err(WorkflowError::MaxIterationsReached)
    }

    async fn step_prompt(
        &self,
        ctx: &RunContext,
        command: &StepCommand,
        user_message: &str,
    ) -> Result<String, WorkflowError> {
        let content = resolve_command_content(&self.store, ctx.codebase.as_ref(), &command.command)
            .await?
            .ok_or_else(|| WorkflowError::CommandNotFound(command.command.clone()))?;
        let session_metadata = self
            .store
            .find_active_session(&ctx.conversation.id)
            .await?
            .map(|s| s.metadata);
        Ok(substitute_arguments(
            &content,
            &[user_message.to_string()],
            session_metadata.as_ref(),
        ))
    }

    /// Cooperative cancellation check between steps. Returns false when the
    /// run was cancelled or the process is shutting down.
    async fn at_step_boundary(&self, run_id: &str, ctx: &RunContext) -> bool {
        if ctx.cancel.is_cancelled() {
            return false;
        }
        match self.store.get_run(run_id).await {
            Ok(Some(run)) => run.status == RunStatus::Running,
            Ok(None) => false,
            Err(e) => {
                warn!("run status check failed for {}: {}", run_id, e);
                true
            }
        }
    }

    /// Terminal transition, tolerant of races with `/workflow cancel`.
    async fn finish(&self, run_id: &str, status: RunStatus, error: Option<&str>) {
        match self.store.finish_run(run_id, status, error).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                debug!("run {} already terminal", run_id);
            }
            Err(e) => warn!("failed to finish run {}: {}", run_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::CaptureAdapter;
    use crate::assistant::{AssistantResponse, MockAssistantClient};
    use crate::store::NewConversation;
    use crate::workflow::parse_workflow;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn test_context(store: &Arc<Store>) -> (RunContext, Arc<CaptureAdapter>) {
        test_context_for(store, "chat-1").await
    }

    async fn test_context_for(
        store: &Arc<Store>,
        chat: &str,
    ) -> (RunContext, Arc<CaptureAdapter>) {
        let conversation = store
            .create_conversation(NewConversation {
                platform_type: "telegram".into(),
                platform_conversation_id: chat.into(),
                ai_assistant_type: AssistantType::Claude,
                codebase_id: None,
                cwd: None,
            })
            .await
            .unwrap();
        let adapter = Arc::new(CaptureAdapter::new("telegram", StreamingMode::Batch));
        let ctx = RunContext {
            conversation,
            codebase: None,
            working_dir: PathBuf::from("/tmp"),
            adapter: Arc::clone(&adapter) as Arc<dyn PlatformAdapter>,
            cancel: CancelToken::never(),
        };
        (ctx, adapter)
    }

    fn sequential_mock(outputs: Vec<&'static str>) -> MockAssistantClient {
        let mut mock = MockAssistantClient::new();
        let calls = AtomicU32::new(0);
        mock.expect_invoke().returning(move |_request| {
            let n = calls.fetch_add(1, Ordering::SeqCst) as usize;
            let text = outputs.get(n).copied().unwrap_or("done");
            Ok(AssistantResponse {
                session_id: Some(format!("session-{}", n)),
                text_output: text.to_string(),
            })
        });
        mock
    }

    #[tokio::test]
    async fn test_step_workflow_completes() {
        let store = Arc::new(Store::in_memory().unwrap());
        store.upsert_template("plan", None, "Plan: $ARGUMENTS").await.unwrap();
        store
            .upsert_template("implement", None, "Implement per plan")
            .await
            .unwrap();

        let workflow = parse_workflow(
            "w.yaml",
            "name: implement-flow\nsteps:\n  - command: plan\n  - command: implement\n",
        )
        .unwrap();

        let (ctx, adapter) = test_context(&store).await;
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(sequential_mock(vec!["planned", "implemented"])),
        );

        let status = engine
            .execute(&workflow, &ctx, "add dark mode")
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);

        // Run bookkeeping.
        assert!(store
            .find_running_run(&ctx.conversation.id)
            .await
            .unwrap()
            .is_none());

        // Output delivered per step.
        assert_eq!(adapter.messages(), vec!["planned", "implemented"]);

        // Session token persisted from the last invocation.
        let session = store
            .find_active_session(&ctx.conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.assistant_session_id.as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_step_failure_marks_run_failed() {
        let store = Arc::new(Store::in_memory().unwrap());
        store.upsert_template("plan", None, "Plan it").await.unwrap();

        let workflow =
            parse_workflow("w.yaml", "name: flow\nsteps:\n  - command: plan\n").unwrap();

        let mut mock = MockAssistantClient::new();
        mock.expect_invoke().returning(|_request| {
            Err(crate::error::AssistantError::Failed {
                status: 1,
                stderr: "exploded".into(),
            })
        });

        let (ctx, _adapter) = test_context(&store).await;
        let engine = WorkflowEngine::new(Arc::clone(&store), Arc::new(mock));
        let err = engine.execute(&workflow, &ctx, "go").await.unwrap_err();
        assert!(err.to_string().contains("exploded"));

        // No run left running; the failure landed in metadata.
        assert!(store
            .find_running_run(&ctx.conversation.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_command_fails_run() {
        let store = Arc::new(Store::in_memory().unwrap());
        let workflow =
            parse_workflow("w.yaml", "name: flow\nsteps:\n  - command: ghost\n").unwrap();

        let (ctx, _adapter) = test_context(&store).await;
        let engine = WorkflowEngine::new(Arc::clone(&store), Arc::new(sequential_mock(vec![])));
        let err = engine.execute(&workflow, &ctx, "go").await.unwrap_err();
        assert!(matches!(err, WorkflowError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn test_loop_stops_on_signal() {
        let store = Arc::new(Store::in_memory().unwrap());
        let workflow = parse_workflow(
            "w.yaml",
            "name: fix\nloop:\n  until: ALL GREEN\n  max_iterations: 5\nprompt: fix the tests\n",
        )
        .unwrap();

        let (ctx, _adapter) = test_context(&store).await;
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(sequential_mock(vec![
                "still failing",
                "progress... ALL GREEN now",
            ])),
        );

        let status = engine.execute(&workflow, &ctx, "go").await.unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_loop_exhaustion_fails() {
        let store = Arc::new(Store::in_memory().unwrap());
        let workflow = parse_workflow(
            "w.yaml",
            "name: fix\nloop:\n  until: ALL GREEN\n  max_iterations: 2\nprompt: fix\n",
        )
        .unwrap();

        let (ctx, _adapter) = test_context(&store).await;
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(sequential_mock(vec!["nope", "still nope"])),
        );

        let err = engine.execute(&workflow, &ctx, "go").await.unwrap_err();
        assert!(matches!(err, WorkflowError::MaxIterationsReached));
    }

    #[tokio::test]
    async fn test_parallel_step_requires_all_branches() {
        let store = Arc::new(Store::in_memory().unwrap());
        store.upsert_template("test", None, "Run tests").await.unwrap();
        store.upsert_template("lint", None, "Run lints").await.unwrap();

        let workflow = parse_workflow(
            "w.yaml",
            "name: checks\nsteps:\n  - parallel:\n      - command: test\n      - command: lint\n",
        )
        .unwrap();

        let (ctx, _adapter) = test_context(&store).await;
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(sequential_mock(vec!["tests ok", "lints ok"])),
        );
        let status = engine.execute(&workflow, &ctx, "go").await.unwrap();
        assert_eq!(status, RunStatus::Completed);

        // One failing branch fails the whole step.
        let mut mock = MockAssistantClient::new();
        let calls = AtomicU32::new(0);
        mock.expect_invoke().returning(move |_request| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(AssistantResponse {
                    session_id: None,
                    text_output: "ok".into(),
                })
            } else {
                Err(crate::error::AssistantError::Failed {
                    status: 1,
                    stderr: "branch died".into(),
                })
            }
        });
        let (ctx2, _adapter2) = test_context_for(&store, "chat-2").await;
        let engine = WorkflowEngine::new(Arc::clone(&store), Arc::new(mock));
        assert!(engine.execute(&workflow, &ctx2, "go").await.is_err());
    }

    #[tokio::test]
    async fn test_second_workflow_rejected_while_running() {
        let store = Arc::new(Store::in_memory().unwrap());
        let (ctx, _adapter) = test_context(&store).await;
        store
            .insert_run(NewRun {
                workflow_name: "other".into(),
                conversation_id: ctx.conversation.id.clone(),
                codebase_id: None,
                user_message: "x".into(),
                metadata: json!({}),
            })
            .await
            .unwrap();

        let workflow =
            parse_workflow("w.yaml", "name: flow\nsteps:\n  - command: plan\n").unwrap();
        let engine = WorkflowEngine::new(Arc::clone(&store), Arc::new(sequential_mock(vec![])));
        let err = engine.execute(&workflow, &ctx, "go").await.unwrap_err();
        assert!(matches!(err, WorkflowError::RunActive));
    }
}
