// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session accessors.
//!
//! At most one session per conversation is active; creation deactivates any
//! predecessor first (also enforced by a partial unique index).

#[cfg(feature = "telemetry")]
use std::time::Instant;

use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::types::AssistantType;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::types::SessionRecord;
use super::{new_id, now_ts, parse_column, parse_json, Store};

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        codebase_id: row.get(2)?,
        ai_assistant_type: parse_column(3, row.get::<_, String>(3)?)?,
        assistant_session_id: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        metadata: parse_json(6, row.get::<_, String>(6)?)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

const COLUMNS: &str = "id, conversation_id, codebase_id, ai_assistant_type, \
                       assistant_session_id, active, metadata, started_at, ended_at";

impl Store {
    /// Start a fresh active session, deactivating any existing one.
    pub async fn create_session(
        &self,
        conversation_id: &str,
        codebase_id: Option<&str>,
        assistant: AssistantType,
    ) -> Result<SessionRecord, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        self.deactivate_sessions(conversation_id).await?;

        let session = SessionRecord {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            codebase_id: codebase_id.map(String::from),
            ai_assistant_type: assistant,
            assistant_session_id: None,
            active: true,
            metadata: serde_json::json!({}),
            started_at: now_ts(),
            ended_at: None,
        };

        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO sessions (id, conversation_id, codebase_id, ai_assistant_type,
                                   assistant_session_id, active, metadata, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 1, '{}', ?5, NULL)",
            params![
                session.id,
                session.conversation_id,
                session.codebase_id,
                session.ai_assistant_type.as_str(),
                session.started_at,
            ],
        )?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.create_session", start.elapsed());

        Ok(session)
    }

    /// The active session of a conversation, if any.
    pub async fn find_active_session(
        &self,
        conversation_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions WHERE conversation_id = ?1 AND active = 1",
                    COLUMNS
                ),
                params![conversation_id],
                row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    /// Deactivate every active session of a conversation. Idempotent.
    pub async fn deactivate_sessions(&self, conversation_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE sessions SET active = 0, ended_at = ?1
             WHERE conversation_id = ?2 AND active = 1",
            params![now_ts(), conversation_id],
        )?;
        Ok(affected)
    }

    /// Persist the assistant's resume token after an invocation.
    pub async fn set_session_resume_token(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE sessions SET assistant_session_id = ?1 WHERE id = ?2",
            params![token, session_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    /// Merge a JSON patch into the session metadata bag.
    pub async fn merge_session_metadata(
        &self,
        session_id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(patch)?;
        let conn = self.conn().await;
        let affected = conn.execute(
            "UPDATE sessions SET metadata = json_patch(metadata, ?1) WHERE id = ?2",
            params![serialized, session_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::NewConversation;
    use serde_json::json;

    async fn conversation(store: &Store) -> String {
        store
            .create_conversation(NewConversation {
                platform_type: "telegram".into(),
                platform_conversation_id: "chat-1".into(),
                ai_assistant_type: AssistantType::Claude,
                codebase_id: None,
                cwd: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_single_active_session() {
        let store = Store::in_memory().unwrap();
        let conv = conversation(&store).await;

        let first = store
            .create_session(&conv, None, AssistantType::Claude)
            .await
            .unwrap();
        let second = store
            .create_session(&conv, Some("cb-1"), AssistantType::Codex)
            .await
            .unwrap();

        let active = store.find_active_session(&conv).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(active.id, first.id);
        assert_eq!(active.ai_assistant_type, AssistantType::Codex);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let store = Store::in_memory().unwrap();
        let conv = conversation(&store).await;
        store
            .create_session(&conv, None, AssistantType::Claude)
            .await
            .unwrap();

        assert_eq!(store.deactivate_sessions(&conv).await.unwrap(), 1);
        assert_eq!(store.deactivate_sessions(&conv).await.unwrap(), 0);
        assert!(store.find_active_session(&conv).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_token() {
        let store = Store::in_memory().unwrap();
        let conv = conversation(&store).await;
        let session = store
            .create_session(&conv, None, AssistantType::Claude)
            .await
            .unwrap();

        store
            .set_session_resume_token(&session.id, "opaque-token-1")
            .await
            .unwrap();
        let active = store.find_active_session(&conv).await.unwrap().unwrap();
        assert_eq!(active.assistant_session_id.as_deref(), Some("opaque-token-1"));
    }

    #[tokio::test]
    async fn test_metadata_merges_not_replaces() {
        let store = Store::in_memory().unwrap();
        let conv = conversation(&store).await;
        let session = store
            .create_session(&conv, None, AssistantType::Claude)
            .await
            .unwrap();

        store
            .merge_session_metadata(&session.id, &json!({"plan": "step 1"}))
            .await
            .unwrap();
        store
            .merge_session_metadata(&session.id, &json!({"implementation_summary": "done"}))
            .await
            .unwrap();

        let active = store.find_active_session(&conv).await.unwrap().unwrap();
        assert_eq!(active.metadata["plan"], "step 1");
        assert_eq!(active.metadata["implementation_summary"], "done");
    }
}
