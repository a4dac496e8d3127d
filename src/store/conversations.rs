// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conversation accessors.

#[cfg(feature = "telemetry")]
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::error::StoreError;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::types::{Conversation, ConversationPatch, NewConversation};
use super::{new_id, now_ts, parse_column, Store};

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        platform_type: row.get(1)?,
        platform_conversation_id: row.get(2)?,
        ai_assistant_type: parse_column(3, row.get::<_, String>(3)?)?,
        codebase_id: row.get(4)?,
        cwd: row.get(5)?,
        isolation_env_id: row.get(6)?,
        last_activity_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const COLUMNS: &str = "id, platform_type, platform_conversation_id, ai_assistant_type, \
                       codebase_id, cwd, isolation_env_id, last_activity_at, created_at, updated_at";

impl Store {
    /// Insert a conversation row.
    pub async fn create_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Conversation, StoreError> {
        let conn = self.conn().await;
        let now = now_ts();
        let conversation = Conversation {
            id: new_id(),
            platform_type: new.platform_type,
            platform_conversation_id: new.platform_conversation_id,
            ai_assistant_type: new.ai_assistant_type,
            codebase_id: new.codebase_id,
            cwd: new.cwd,
            isolation_env_id: None,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO conversations (id, platform_type, platform_conversation_id, ai_assistant_type,
                                        codebase_id, cwd, isolation_env_id, last_activity_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9)",
            params![
                conversation.id,
                conversation.platform_type,
                conversation.platform_conversation_id,
                conversation.ai_assistant_type.as_str(),
                conversation.codebase_id,
                conversation.cwd,
                now,
                now,
                now,
            ],
        )?;
        Ok(conversation)
    }

    /// Get a conversation by id.
    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM conversations WHERE id = ?1", COLUMNS),
                params![id],
                row_to_conversation,
            )
            .optional()?;
        Ok(row)
    }

    /// Find a conversation by its platform identity.
    pub async fn find_conversation_by_platform(
        &self,
        platform_type: &str,
        platform_conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations
                     WHERE platform_type = ?1 AND platform_conversation_id = ?2",
                    COLUMNS
                ),
                params![platform_type, platform_conversation_id],
                row_to_conversation,
            )
            .optional()?;
        Ok(row)
    }

    /// Apply a partial update.
    ///
    /// SET clauses are built only for provided fields; `updated_at` is
    /// always refreshed. An update that affects zero rows fails with
    /// [`StoreError::ConversationNotFound`] - the canonical signal that the
    /// conversation disappeared under a concurrent mutation.
    pub async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<(), StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let mut sets = vec!["updated_at = ?".to_string()];
        let mut values: Vec<Value> = vec![Value::Integer(now_ts())];

        if let Some(assistant) = patch.ai_assistant_type {
            sets.push("ai_assistant_type = ?".to_string());
            values.push(Value::Text(assistant.as_str().to_string()));
        }
        if let Some(codebase_id) = patch.codebase_id {
            sets.push("codebase_id = ?".to_string());
            values.push(opt_text(codebase_id));
        }
        if let Some(cwd) = patch.cwd {
            sets.push("cwd = ?".to_string());
            values.push(opt_text(cwd));
        }
        if let Some(env_id) = patch.isolation_env_id {
            sets.push("isolation_env_id = ?".to_string());
            values.push(opt_text(env_id));
        }
        if let Some(last_activity_at) = patch.last_activity_at {
            sets.push("last_activity_at = ?".to_string());
            values.push(Value::Integer(last_activity_at));
        }

        values.push(Value::Text(id.to_string()));
        let sql = format!(
            "UPDATE conversations SET {} WHERE id = ?",
            sets.join(", ")
        );

        let affected = {
            let conn = self.conn().await;
            conn.execute(&sql, params_from_iter(values))?
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.update_conversation", start.elapsed());

        if affected == 0 {
            return Err(StoreError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Bump `last_activity_at` to now.
    pub async fn touch_conversation_activity(&self, id: &str) -> Result<(), StoreError> {
        self.update_conversation(
            id,
            ConversationPatch {
                last_activity_at: Some(now_ts()),
                ..Default::default()
            },
        )
        .await
    }

    /// Conversations pointing at an isolation environment.
    pub async fn conversations_referencing_env(
        &self,
        env_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations WHERE isolation_env_id = ?1",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![env_id], row_to_conversation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Clear every conversation reference to an environment.
    pub async fn clear_env_references(&self, env_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE conversations SET isolation_env_id = NULL, updated_at = ?1
             WHERE isolation_env_id = ?2",
            params![now_ts(), env_id],
        )?;
        Ok(affected)
    }

    /// Remove a conversation row. Only explicit platform requests do this.
    pub async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await;
        conn.execute("DELETE FROM sessions WHERE conversation_id = ?1", params![id])?;
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn opt_text(value: Option<String>) -> Value {
    match value {
        Some(text) => Value::Text(text),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssistantType;

    fn new_conversation(pcid: &str) -> NewConversation {
        NewConversation {
            platform_type: "telegram".into(),
            platform_conversation_id: pcid.into(),
            ai_assistant_type: AssistantType::Claude,
            codebase_id: None,
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_by_platform() {
        let store = Store::in_memory().unwrap();
        let created = store
            .create_conversation(new_conversation("chat-1"))
            .await
            .unwrap();

        let found = store
            .find_conversation_by_platform("telegram", "chat-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);

        assert!(store
            .find_conversation_by_platform("telegram", "chat-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_platform_identity_unique() {
        let store = Store::in_memory().unwrap();
        store
            .create_conversation(new_conversation("chat-1"))
            .await
            .unwrap();
        let dup = store.create_conversation(new_conversation("chat-1")).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_partial_update() {
        let store = Store::in_memory().unwrap();
        let conversation = store
            .create_conversation(new_conversation("chat-1"))
            .await
            .unwrap();

        store
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    cwd: Some(Some("/workspaces/alice/utils".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reloaded = store
            .get_conversation(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.cwd.as_deref(), Some("/workspaces/alice/utils"));
        // Untouched fields survive.
        assert_eq!(reloaded.ai_assistant_type, AssistantType::Claude);
        assert!(reloaded.codebase_id.is_none());

        // Explicit NULL write.
        store
            .update_conversation(
                &conversation.id,
                ConversationPatch {
                    cwd: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let reloaded = store
            .get_conversation(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert!(reloaded.cwd.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_conversation_not_found() {
        let store = Store::in_memory().unwrap();
        let err = store
            .update_conversation(
                "missing",
                ConversationPatch {
                    cwd: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_env_references() {
        let store = Store::in_memory().unwrap();
        let a = store.create_conversation(new_conversation("a")).await.unwrap();
        let b = store.create_conversation(new_conversation("b")).await.unwrap();

        for conversation in [&a, &b] {
            store
                .update_conversation(
                    &conversation.id,
                    ConversationPatch {
                        isolation_env_id: Some(Some("env-1".into())),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let refs = store.conversations_referencing_env("env-1").await.unwrap();
        assert_eq!(refs.len(), 2);

        let cleared = store.clear_env_references("env-1").await.unwrap();
        assert_eq!(cleared, 2);
        assert!(store
            .conversations_referencing_env("env-1")
            .await
            .unwrap()
            .is_empty());
    }
}
