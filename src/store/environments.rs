// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolation environment accessors.
//!
//! Rows are never hard-deleted; destruction flips `status` to `destroyed`
//! so history stays queryable and workflow identities free up.

#[cfg(feature = "telemetry")]
use std::time::Instant;

use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::types::{EnvironmentStatus, WorkflowType};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::types::{IsolationEnvironment, NewEnvironment};
use super::{new_id, now_ts, parse_column, parse_json, Store};

fn row_to_environment(row: &Row<'_>) -> rusqlite::Result<IsolationEnvironment> {
    Ok(IsolationEnvironment {
        id: row.get(0)?,
        codebase_id: row.get(1)?,
        workflow_type: parse_column(2, row.get::<_, String>(2)?)?,
        workflow_id: row.get(3)?,
        provider: row.get(4)?,
        working_path: row.get(5)?,
        branch_name: row.get(6)?,
        status: parse_column(7, row.get::<_, String>(7)?)?,
        created_by_platform: row.get(8)?,
        metadata: parse_json(9, row.get::<_, String>(9)?)?,
        created_at: row.get(10)?,
    })
}

const COLUMNS: &str = "id, codebase_id, workflow_type, workflow_id, provider, working_path, \
                       branch_name, status, created_by_platform, metadata, created_at";

impl Store {
    /// Insert an active environment row with `provider='worktree'`.
    pub async fn insert_environment(
        &self,
        new: NewEnvironment,
    ) -> Result<IsolationEnvironment, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let env = IsolationEnvironment {
            id: new_id(),
            codebase_id: new.codebase_id,
            workflow_type: new.workflow_type,
            workflow_id: new.workflow_id,
            provider: "worktree".to_string(),
            working_path: new.working_path,
            branch_name: new.branch_name,
            status: EnvironmentStatus::Active,
            created_by_platform: new.created_by_platform,
            metadata: new.metadata,
            created_at: now_ts(),
        };

        let metadata = serde_json::to_string(&env.metadata)?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO isolation_environments
             (id, codebase_id, workflow_type, workflow_id, provider, working_path,
              branch_name, status, created_by_platform, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, 'worktree', ?5, ?6, 'active', ?7, ?8, ?9)",
            params![
                env.id,
                env.codebase_id,
                env.workflow_type.as_str(),
                env.workflow_id,
                env.working_path,
                env.branch_name,
                env.created_by_platform,
                metadata,
                env.created_at,
            ],
        )?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.insert_environment", start.elapsed());

        Ok(env)
    }

    /// Get an environment by id.
    pub async fn get_environment(
        &self,
        id: &str,
    ) -> Result<Option<IsolationEnvironment>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM isolation_environments WHERE id = ?1", COLUMNS),
                params![id],
                row_to_environment,
            )
            .optional()?;
        Ok(row)
    }

    /// The single active environment for a workflow identity, if any.
    pub async fn find_environment_by_workflow(
        &self,
        codebase_id: &str,
        workflow_type: WorkflowType,
        workflow_id: &str,
    ) -> Result<Option<IsolationEnvironment>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM isolation_environments
                     WHERE codebase_id = ?1 AND workflow_type = ?2 AND workflow_id = ?3
                       AND status = 'active'",
                    COLUMNS
                ),
                params![codebase_id, workflow_type.as_str(), workflow_id],
                row_to_environment,
            )
            .optional()?;
        Ok(row)
    }

    /// Active environments, optionally scoped to one codebase.
    pub async fn list_active_environments(
        &self,
        codebase_id: Option<&str>,
    ) -> Result<Vec<IsolationEnvironment>, StoreError> {
        let conn = self.conn().await;
        let rows = match codebase_id {
            Some(codebase_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM isolation_environments
                     WHERE status = 'active' AND codebase_id = ?1
                     ORDER BY created_at",
                    COLUMNS
                ))?;
                let result = stmt
                    .query_map(params![codebase_id], row_to_environment)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM isolation_environments
                     WHERE status = 'active' ORDER BY created_at",
                    COLUMNS
                ))?;
                let result = stmt
                    .query_map([], row_to_environment)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
        };
        Ok(rows)
    }

    /// Count of active environments for a codebase.
    pub async fn count_active_environments(&self, codebase_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM isolation_environments
             WHERE status = 'active' AND codebase_id = ?1",
            params![codebase_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Set an environment's status. Idempotent.
    pub async fn set_environment_status(
        &self,
        id: &str,
        status: EnvironmentStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE isolation_environments SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Merge a JSON patch into the environment metadata bag.
    pub async fn merge_environment_metadata(
        &self,
        id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(patch)?;
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE isolation_environments SET metadata = json_patch(metadata, ?1) WHERE id = ?2",
            params![serialized, id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("environment {}", id)));
        }
        Ok(())
    }

    /// Active environments eligible for staleness cleanup: older than `days`,
    /// not created from telegram, and with no linked conversation active
    /// inside the window.
    pub async fn find_stale_environments(
        &self,
        days: i64,
    ) -> Result<Vec<IsolationEnvironment>, StoreError> {
        let cutoff = now_ts() - days * 24 * 60 * 60;
        let conn = self.conn().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM isolation_environments e
             WHERE e.status = 'active'
               AND e.created_by_platform != 'telegram'
               AND e.created_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM conversations c
                   WHERE c.isolation_env_id = e.id AND c.last_activity_at >= ?1
               )
             ORDER BY e.created_at",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![cutoff], row_to_environment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
