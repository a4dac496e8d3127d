// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command template accessors. Templates are global and upserted by name.

use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;

use super::types::CommandTemplate;
use super::{new_id, now_ts, Store};

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<CommandTemplate> {
    Ok(CommandTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const COLUMNS: &str = "id, name, description, content, created_at, updated_at";

impl Store {
    /// Insert or update a template by name.
    pub async fn upsert_template(
        &self,
        name: &str,
        description: Option<&str>,
        content: &str,
    ) -> Result<CommandTemplate, StoreError> {
        let now = now_ts();
        {
            let conn = self.conn().await;
            conn.execute(
                "INSERT INTO command_templates (id, name, description, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    description = excluded.description,
                    content = excluded.content,
                    updated_at = excluded.updated_at",
                params![new_id(), name, description, content, now],
            )?;
        }
        self.get_template(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("template {}", name)))
    }

    /// Get a template by name.
    pub async fn get_template(&self, name: &str) -> Result<Option<CommandTemplate>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM command_templates WHERE name = ?1", COLUMNS),
                params![name],
                row_to_template,
            )
            .optional()?;
        Ok(row)
    }

    /// All templates, ordered by name.
    pub async fn list_templates(&self) -> Result<Vec<CommandTemplate>, StoreError> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM command_templates ORDER BY name",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map([], row_to_template)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete a template by name. Returns whether a row was removed.
    pub async fn delete_template(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn().await;
        let affected = conn.execute(
            "DELETE FROM command_templates WHERE name = ?1",
            params![name],
        )?;
        Ok(affected > 0)
    }
}
