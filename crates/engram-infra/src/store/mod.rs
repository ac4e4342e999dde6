//! SQLite artifact store
//!
//! One `SqliteStore` implements every repository trait in `engram-core`.
//! All writes are transactional; bulk inserts abort wholesale on any
//! failure. Reads within a tenant observe completed writes immediately
//! (single database, write-ahead journal).

use chrono::{DateTime, Utc};
use engram_types::{EngramError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub mod schema;

mod config;
mod feedbacks;
mod hybrid;
mod interactions;
mod operation_state;
mod profiles;
mod skills;
mod success;

pub use hybrid::CandidateRow;

/// Artifact store backed by an embedded SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a file-backed store
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))
        .map_err(|e| EngramError::Storage(format!("Invalid database path: {e}")))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to open database: {e}")))?;

        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests and ephemeral runs
    ///
    /// Pinned to a single connection: each `sqlite::memory:` connection is
    /// its own database, so a larger pool would shear the schema apart.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to open in-memory database: {e}")))?;

        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe used by the health endpoint
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngramError::Storage(format!("Health check failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column codecs shared by the repository impls
// ---------------------------------------------------------------------------

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub(crate) fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

pub(crate) fn storage_err(context: &str, err: sqlx::Error) -> EngramError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            EngramError::Conflict(format!("{context}: {db}"))
        }
        sqlx::Error::PoolTimedOut => EngramError::Timeout(format!("{context}: pool timed out")),
        other => EngramError::Storage(format!("{context}: {other}")),
    }
}
