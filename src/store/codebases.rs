// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Codebase accessors.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;

use super::types::{Codebase, CodebaseCommand, NewCodebase};
use super::{new_id, now_ts, parse_column, Store};

fn row_to_codebase(row: &Row<'_>) -> rusqlite::Result<Codebase> {
    let commands_raw: String = row.get(5)?;
    let commands: BTreeMap<String, CodebaseCommand> = serde_json::from_str(&commands_raw)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?;
    Ok(Codebase {
        id: row.get(0)?,
        name: row.get(1)?,
        repository_url: row.get(2)?,
        default_cwd: row.get(3)?,
        ai_assistant_type: parse_column(4, row.get::<_, String>(4)?)?,
        commands,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const COLUMNS: &str =
    "id, name, repository_url, default_cwd, ai_assistant_type, commands, created_at, updated_at";

impl Store {
    /// Insert a codebase row.
    pub async fn create_codebase(&self, new: NewCodebase) -> Result<Codebase, StoreError> {
        let conn = self.conn().await;
        let now = now_ts();
        let codebase = Codebase {
            id: new_id(),
            name: new.name,
            repository_url: new.repository_url,
            default_cwd: new.default_cwd,
            ai_assistant_type: new.ai_assistant_type,
            commands: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO codebases (id, name, repository_url, default_cwd, ai_assistant_type, commands, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '{}', ?6, ?7)",
            params![
                codebase.id,
                codebase.name,
                codebase.repository_url,
                codebase.default_cwd,
                codebase.ai_assistant_type.as_str(),
                now,
                now,
            ],
        )?;
        Ok(codebase)
    }

    /// Get a codebase by id.
    pub async fn get_codebase(&self, id: &str) -> Result<Option<Codebase>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM codebases WHERE id = ?1", COLUMNS),
                params![id],
                row_to_codebase,
            )
            .optional()?;
        Ok(row)
    }

    /// Find a codebase by its `owner/repo` name (alphabetically first match).
    pub async fn find_codebase_by_name(&self, name: &str) -> Result<Option<Codebase>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM codebases WHERE name = ?1 ORDER BY name LIMIT 1",
                    COLUMNS
                ),
                params![name],
                row_to_codebase,
            )
            .optional()?;
        Ok(row)
    }

    /// Find a codebase by normalized repository URL.
    pub async fn find_codebase_by_url(&self, url: &str) -> Result<Option<Codebase>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM codebases WHERE repository_url = ?1 LIMIT 1",
                    COLUMNS
                ),
                params![url],
                row_to_codebase,
            )
            .optional()?;
        Ok(row)
    }

    /// Find a codebase whose canonical clone lives at `default_cwd`.
    pub async fn find_codebase_by_cwd(&self, cwd: &str) -> Result<Option<Codebase>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM codebases WHERE default_cwd = ?1 LIMIT 1",
                    COLUMNS
                ),
                params![cwd],
                row_to_codebase,
            )
            .optional()?;
        Ok(row)
    }

    /// All codebases, ordered by name.
    pub async fn list_codebases(&self) -> Result<Vec<Codebase>, StoreError> {
        let conn = self.conn().await;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM codebases ORDER BY name", COLUMNS))?;
        let rows = stmt
            .query_map([], row_to_codebase)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Replace the whole `commands` map. Callers merge in memory first.
    pub async fn update_codebase_commands(
        &self,
        id: &str,
        commands: &BTreeMap<String, CodebaseCommand>,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(commands)?;
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE codebases SET commands = ?1, updated_at = ?2 WHERE id = ?3",
            params![serialized, now_ts(), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("codebase {}", id)));
        }
        Ok(())
    }

    /// Delete a codebase. References on conversations and sessions are set
    /// to NULL before the row is removed.
    pub async fn delete_codebase(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE conversations SET codebase_id = NULL, updated_at = ?1 WHERE codebase_id = ?2",
            params![now_ts(), id],
        )?;
        conn.execute(
            "UPDATE sessions SET codebase_id = NULL WHERE codebase_id = ?1",
            params![id],
        )?;
        conn.execute("DELETE FROM codebases WHERE id = ?1", params![id])?;
        Ok(())
    }
}
