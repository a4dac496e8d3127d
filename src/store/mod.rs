// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed state store.
//!
//! Typed accessors over the six control-plane entities. All writes are
//! single statements; cross-row invariants are protected at the
//! application layer plus a precondition inside the SQL `WHERE` (the
//! affected-row count doubles as an optimistic concurrency check).
//! Metadata columns use merge semantics via SQLite's `json_patch`.

mod codebases;
mod conversations;
mod environments;
mod runs;
mod schema;
mod sessions;
mod templates;
pub mod types;

use std::path::Path;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::StoreError;

pub use schema::SCHEMA_VERSION;
pub use types::{
    Codebase, CodebaseCommand, CommandTemplate, Conversation, ConversationPatch,
    IsolationEnvironment, NewCodebase, NewConversation, NewEnvironment, NewRun, SessionRecord,
    WorkflowRun,
};

/// State store over a single SQLite connection.
///
/// The connection is guarded by an async mutex; every accessor takes the
/// lock for the duration of one statement, which keeps updates atomic
/// without explicit transactions.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("failed to create {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database. Used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn conn(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Current unix timestamp in seconds.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a fresh entity id.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parse a TEXT column into a typed enum, mapping failures to a column
/// conversion error instead of panicking.
pub(crate) fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

/// Parse a JSON TEXT column, mapping failures to a column conversion error.
pub(crate) fn parse_json(idx: usize, raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}
