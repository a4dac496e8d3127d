// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Schema creation for the control-plane database.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Apply pragmas and create the schema when missing.
pub fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS codebases (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            repository_url TEXT,
            default_cwd TEXT NOT NULL,
            ai_assistant_type TEXT NOT NULL,
            commands TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            platform_type TEXT NOT NULL,
            platform_conversation_id TEXT NOT NULL,
            ai_assistant_type TEXT NOT NULL,
            codebase_id TEXT REFERENCES codebases(id),
            cwd TEXT,
            isolation_env_id TEXT,
            last_activity_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (platform_type, platform_conversation_id)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            codebase_id TEXT,
            ai_assistant_type TEXT NOT NULL,
            assistant_session_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            metadata TEXT NOT NULL DEFAULT '{}',
            started_at INTEGER NOT NULL,
            ended_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS command_templates (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            description TEXT,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS isolation_environments (
            id TEXT PRIMARY KEY,
            codebase_id TEXT NOT NULL,
            workflow_type TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            provider TEXT NOT NULL DEFAULT 'worktree',
            working_path TEXT NOT NULL,
            branch_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_by_platform TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_runs (
            id TEXT PRIMARY KEY,
            workflow_name TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            codebase_id TEXT,
            current_step_index INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'running',
            user_message TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            last_activity_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_codebases_name ON codebases(name);
        CREATE INDEX IF NOT EXISTS idx_conversations_codebase ON conversations(codebase_id);
        CREATE INDEX IF NOT EXISTS idx_conversations_env ON conversations(isolation_env_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_conversation ON sessions(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_envs_codebase ON isolation_environments(codebase_id, status);
        CREATE INDEX IF NOT EXISTS idx_runs_conversation ON workflow_runs(conversation_id);

        -- One active session per conversation.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
            ON sessions(conversation_id) WHERE active = 1;

        -- One running workflow run per conversation.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_running
            ON workflow_runs(conversation_id) WHERE status = 'running';

        -- One active environment per workflow identity.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_envs_one_active_identity
            ON isolation_environments(codebase_id, workflow_type, workflow_id)
            WHERE status = 'active';
        "#,
    )?;

    let current_version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    if current_version.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_one_active_session_index() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        conn.execute(
            "INSERT INTO sessions (id, conversation_id, ai_assistant_type, started_at)
             VALUES ('s1', 'c1', 'claude', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO sessions (id, conversation_id, ai_assistant_type, started_at)
             VALUES ('s2', 'c1', 'claude', 0)",
            [],
        );
        assert!(dup.is_err());

        // Inactive rows do not conflict.
        conn.execute(
            "INSERT INTO sessions (id, conversation_id, ai_assistant_type, active, started_at)
             VALUES ('s3', 'c1', 'claude', 0, 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_one_active_environment_per_identity() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        conn.execute(
            "INSERT INTO isolation_environments
             (id, codebase_id, workflow_type, workflow_id, working_path, branch_name, created_by_platform, created_at)
             VALUES ('e1', 'cb', 'issue', '42', '/w', 'issue-42', 'github', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO isolation_environments
             (id, codebase_id, workflow_type, workflow_id, working_path, branch_name, created_by_platform, created_at)
             VALUES ('e2', 'cb', 'issue', '42', '/w2', 'issue-42', 'github', 0)",
            [],
        );
        assert!(dup.is_err());

        // Destroyed rows free the identity.
        conn.execute(
            "UPDATE isolation_environments SET status = 'destroyed' WHERE id = 'e1'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO isolation_environments
             (id, codebase_id, workflow_type, workflow_id, working_path, branch_name, created_by_platform, created_at)
             VALUES ('e3', 'cb', 'issue', '42', '/w3', 'issue-42', 'github', 0)",
            [],
        )
        .unwrap();
    }
}
