//! SQLite schema for the artifact store
//!
//! Every entity table carries `org_id` and every statement in this crate
//! filters on it; that is the embedded rendition of the row-level policy.
//! Text columns with semantic meaning get an FTS5 shadow table kept in sync
//! by triggers, and an `embedding` BLOB of 512 little-endian f32 values.

use engram_types::{EngramError, Result};
use sqlx::SqlitePool;

/// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let current_version: i32 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| EngramError::Storage(format!("Failed to read schema version: {e}")))?;

    if current_version != 0 && current_version != SCHEMA_VERSION {
        return Err(EngramError::Storage(format!(
            "Unsupported schema version {current_version}, expected {SCHEMA_VERSION}"
        )));
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orgs (
            org_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            api_key_hash TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create orgs table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS org_configs (
            org_id TEXT PRIMARY KEY,
            config TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create org_configs table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            org_id TEXT NOT NULL,
            request_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            source TEXT NOT NULL,
            agent_version TEXT NOT NULL DEFAULT '',
            request_group TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, request_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create requests table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interactions (
            org_id TEXT NOT NULL,
            interaction_id INTEGER NOT NULL,
            request_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            shadow_content TEXT,
            user_action TEXT NOT NULL DEFAULT 'NONE',
            user_action_description TEXT,
            interacted_image_url TEXT,
            image_encoding TEXT,
            tools_used TEXT NOT NULL DEFAULT '[]',
            embedding BLOB NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, interaction_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create interactions table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            org_id TEXT NOT NULL,
            profile_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            extractor_names TEXT NOT NULL DEFAULT '[]',
            custom_features TEXT NOT NULL DEFAULT 'null',
            generated_from_request_id TEXT NOT NULL DEFAULT '',
            last_modified_at INTEGER NOT NULL,
            expiration_at INTEGER,
            status TEXT NOT NULL,
            embedding BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, profile_id),
            UNIQUE (org_id, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create profiles table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_feedbacks (
            org_id TEXT NOT NULL,
            raw_feedback_id TEXT NOT NULL,
            user_id TEXT,
            agent_version TEXT NOT NULL DEFAULT '',
            request_id TEXT NOT NULL,
            source TEXT,
            feedback_name TEXT NOT NULL,
            feedback_content TEXT NOT NULL,
            do_action TEXT,
            do_not_action TEXT,
            when_condition TEXT,
            blocking_kind TEXT,
            blocking_details TEXT,
            indexed_content TEXT NOT NULL,
            status TEXT NOT NULL,
            embedding BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, raw_feedback_id),
            UNIQUE (org_id, content_hash)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create raw_feedbacks table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agg_feedbacks (
            org_id TEXT NOT NULL,
            feedback_id TEXT NOT NULL,
            agent_version TEXT NOT NULL DEFAULT '',
            feedback_name TEXT NOT NULL,
            feedback_content TEXT NOT NULL,
            do_action TEXT,
            do_not_action TEXT,
            when_condition TEXT,
            blocking_kind TEXT,
            blocking_details TEXT,
            indexed_content TEXT NOT NULL,
            feedback_status TEXT NOT NULL,
            feedback_metadata TEXT NOT NULL,
            status TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, feedback_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create agg_feedbacks table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS skills (
            org_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            agent_version TEXT NOT NULL DEFAULT '',
            feedback_name TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            description TEXT NOT NULL,
            instructions TEXT NOT NULL,
            allowed_tools TEXT NOT NULL DEFAULT '[]',
            blocking_issues TEXT NOT NULL DEFAULT '[]',
            raw_feedback_ids TEXT NOT NULL DEFAULT '[]',
            skill_status TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, skill_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create skills table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS success_results (
            org_id TEXT NOT NULL,
            result_id TEXT NOT NULL,
            evaluation_name TEXT NOT NULL,
            agent_version TEXT NOT NULL DEFAULT '',
            request_id TEXT NOT NULL,
            is_success INTEGER NOT NULL,
            failure_type TEXT,
            failure_reason TEXT,
            agent_prompt_update TEXT,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, result_id),
            UNIQUE (org_id, evaluation_name, request_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create success_results table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operation_states (
            org_id TEXT NOT NULL,
            service_name TEXT NOT NULL,
            in_progress INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            current_request_id TEXT,
            pending_request_id TEXT,
            PRIMARY KEY (org_id, service_name)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create operation_states table: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profile_change_log (
            org_id TEXT NOT NULL,
            request_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            extractor_name TEXT NOT NULL,
            added TEXT NOT NULL DEFAULT '[]',
            removed TEXT NOT NULL DEFAULT '[]',
            mentioned TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| EngramError::Storage(format!("Failed to create profile_change_log table: {e}")))?;

    // Secondary indexes for the hot read paths
    let index_batch = r#"
        CREATE INDEX IF NOT EXISTS idx_interactions_user
            ON interactions(org_id, user_id, interaction_id);
        CREATE INDEX IF NOT EXISTS idx_interactions_request
            ON interactions(org_id, request_id);
        CREATE INDEX IF NOT EXISTS idx_requests_group
            ON requests(org_id, request_group);
        CREATE INDEX IF NOT EXISTS idx_profiles_user
            ON profiles(org_id, user_id, status);
        CREATE INDEX IF NOT EXISTS idx_raw_feedbacks_pair
            ON raw_feedbacks(org_id, agent_version, feedback_name, status);
        CREATE INDEX IF NOT EXISTS idx_agg_feedbacks_pair
            ON agg_feedbacks(org_id, agent_version, feedback_name, status);
        CREATE INDEX IF NOT EXISTS idx_success_eval
            ON success_results(org_id, evaluation_name, created_at);
        CREATE INDEX IF NOT EXISTS idx_change_log_org
            ON profile_change_log(org_id, created_at);
    "#;
    sqlx::raw_sql(index_batch)
        .execute(pool)
        .await
        .map_err(|e| EngramError::Storage(format!("Failed to create indexes: {e}")))?;

    // FTS5 shadow tables, synced by triggers. Indexed text is immutable in
    // every collection (supersession writes a new row), so insert and
    // delete triggers are sufficient.
    let fts_batch = r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS interactions_fts USING fts5(content);
        CREATE TRIGGER IF NOT EXISTS interactions_fts_insert
            AFTER INSERT ON interactions BEGIN
                INSERT INTO interactions_fts(rowid, content) VALUES (new.rowid, new.content);
            END;
        CREATE TRIGGER IF NOT EXISTS interactions_fts_delete
            AFTER DELETE ON interactions BEGIN
                DELETE FROM interactions_fts WHERE rowid = old.rowid;
            END;
        CREATE TRIGGER IF NOT EXISTS interactions_fts_soft_delete
            AFTER UPDATE OF deleted ON interactions WHEN new.deleted = 1 BEGIN
                DELETE FROM interactions_fts WHERE rowid = old.rowid;
            END;

        CREATE VIRTUAL TABLE IF NOT EXISTS profiles_fts USING fts5(content);
        CREATE TRIGGER IF NOT EXISTS profiles_fts_insert
            AFTER INSERT ON profiles BEGIN
                INSERT INTO profiles_fts(rowid, content) VALUES (new.rowid, new.content);
            END;
        CREATE TRIGGER IF NOT EXISTS profiles_fts_delete
            AFTER DELETE ON profiles BEGIN
                DELETE FROM profiles_fts WHERE rowid = old.rowid;
            END;

        CREATE VIRTUAL TABLE IF NOT EXISTS raw_feedbacks_fts USING fts5(content);
        CREATE TRIGGER IF NOT EXISTS raw_feedbacks_fts_insert
            AFTER INSERT ON raw_feedbacks BEGIN
                INSERT INTO raw_feedbacks_fts(rowid, content) VALUES (new.rowid, new.indexed_content);
            END;
        CREATE TRIGGER IF NOT EXISTS raw_feedbacks_fts_delete
            AFTER DELETE ON raw_feedbacks BEGIN
                DELETE FROM raw_feedbacks_fts WHERE rowid = old.rowid;
            END;

        CREATE VIRTUAL TABLE IF NOT EXISTS agg_feedbacks_fts USING fts5(content);
        CREATE TRIGGER IF NOT EXISTS agg_feedbacks_fts_insert
            AFTER INSERT ON agg_feedbacks BEGIN
                INSERT INTO agg_feedbacks_fts(rowid, content) VALUES (new.rowid, new.indexed_content);
            END;
        CREATE TRIGGER IF NOT EXISTS agg_feedbacks_fts_delete
            AFTER DELETE ON agg_feedbacks BEGIN
                DELETE FROM agg_feedbacks_fts WHERE rowid = old.rowid;
            END;
    "#;
    sqlx::raw_sql(fts_batch)
        .execute(pool)
        .await
        .map_err(|e| EngramError::Storage(format!("Failed to create FTS tables: {e}")))?;

    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(pool)
        .await
        .map_err(|e| EngramError::Storage(format!("Failed to set schema version: {e}")))?;

    Ok(())
}
