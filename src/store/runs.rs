// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow run accessors.

use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use crate::error::StoreError;
use crate::types::RunStatus;

use super::types::{NewRun, WorkflowRun};
use super::{new_id, now_ts, parse_column, parse_json, Store};

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get(0)?,
        workflow_name: row.get(1)?,
        conversation_id: row.get(2)?,
        codebase_id: row.get(3)?,
        current_step_index: row.get(4)?,
        status: parse_column(5, row.get::<_, String>(5)?)?,
        user_message: row.get(6)?,
        metadata: parse_json(7, row.get::<_, String>(7)?)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        last_activity_at: row.get(10)?,
    })
}

const COLUMNS: &str = "id, workflow_name, conversation_id, codebase_id, current_step_index, \
                       status, user_message, metadata, started_at, completed_at, last_activity_at";

impl Store {
    /// Insert a `running` run. Fails if the conversation already has one.
    pub async fn insert_run(&self, new: NewRun) -> Result<WorkflowRun, StoreError> {
        let now = now_ts();
        let run = WorkflowRun {
            id: new_id(),
            workflow_name: new.workflow_name,
            conversation_id: new.conversation_id,
            codebase_id: new.codebase_id,
            current_step_index: 0,
            status: RunStatus::Running,
            user_message: new.user_message,
            metadata: new.metadata,
            started_at: now,
            completed_at: None,
            last_activity_at: now,
        };

        let metadata = serde_json::to_string(&run.metadata)?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO workflow_runs
             (id, workflow_name, conversation_id, codebase_id, current_step_index,
              status, user_message, metadata, started_at, completed_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, 0, 'running', ?5, ?6, ?7, NULL, ?8)",
            params![
                run.id,
                run.workflow_name,
                run.conversation_id,
                run.codebase_id,
                run.user_message,
                metadata,
                run.started_at,
                run.last_activity_at,
            ],
        )?;
        Ok(run)
    }

    /// Get a run by id.
    pub async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM workflow_runs WHERE id = ?1", COLUMNS),
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(row)
    }

    /// The running run of a conversation, if any.
    pub async fn find_running_run(
        &self,
        conversation_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_runs
                     WHERE conversation_id = ?1 AND status = 'running'",
                    COLUMNS
                ),
                params![conversation_id],
                row_to_run,
            )
            .optional()?;
        Ok(row)
    }

    /// Advance the step index after a completed step.
    pub async fn advance_run_step(&self, run_id: &str, step_index: i64) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE workflow_runs SET current_step_index = ?1, last_activity_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![step_index, now_ts(), run_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("running run {}", run_id)));
        }
        Ok(())
    }

    /// Move a run to a terminal status, stamping `completed_at` and merging
    /// an optional error into metadata.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let patch = match error {
            Some(error) => serde_json::json!({ "error": error }),
            None => serde_json::json!({}),
        };
        let serialized = serde_json::to_string(&patch)?;
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE workflow_runs
             SET status = ?1, completed_at = ?2, last_activity_at = ?2,
                 metadata = json_patch(metadata, ?3)
             WHERE id = ?4 AND status = 'running'",
            params![status.as_str(), now_ts(), serialized, run_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("running run {}", run_id)));
        }
        Ok(())
    }

    /// Best-effort activity heartbeat. Database errors are logged, never
    /// returned.
    pub async fn touch_run_activity(&self, run_id: &str) {
        let result = {
            let conn = self.conn().await;
            conn.execute(
                "UPDATE workflow_runs SET last_activity_at = ?1 WHERE id = ?2",
                params![now_ts(), run_id],
            )
        };
        if let Err(e) = result {
            warn!("failed to update workflow activity for {}: {}", run_id, e);
        }
    }

    /// Merge a JSON patch into the run metadata bag.
    pub async fn merge_run_metadata(
        &self,
        run_id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(patch)?;
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE workflow_runs SET metadata = json_patch(metadata, ?1) WHERE id = ?2",
            params![serialized, run_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }
}
