//! Per-scope operation-state lock over SQLite
//!
//! The lock protocol is a single upsert whose conflict predicate admits the
//! caller when the row is idle or stale; a losing caller records itself as
//! the scope's one pending follow-up. `finish` atomically releases the
//! scope or hands it to that follow-up.

use async_trait::async_trait;
use chrono::Utc;
use engram_core::{AcquireOutcome, OperationState, OperationStateRepository};
use engram_types::{RequestId, Result};
use sqlx::{Row, Sqlite, Transaction};

use super::{from_epoch, storage_err, to_epoch, SqliteStore};

async fn fetch_state(
    tx: &mut Transaction<'_, Sqlite>,
    org_id: &str,
    service_name: &str,
) -> Result<Option<OperationState>> {
    let row = sqlx::query(
        "SELECT org_id, service_name, in_progress, started_at, current_request_id, \
         pending_request_id FROM operation_states WHERE org_id = ?1 AND service_name = ?2",
    )
    .bind(org_id)
    .bind(service_name)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| storage_err("fetch operation state", e))?;

    row.map(|row| {
        Ok(OperationState {
            org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
            service_name: row
                .try_get("service_name")
                .map_err(|e| storage_err("service_name", e))?,
            in_progress: row
                .try_get::<i64, _>("in_progress")
                .map_err(|e| storage_err("in_progress", e))?
                != 0,
            started_at: from_epoch(
                row.try_get("started_at")
                    .map_err(|e| storage_err("started_at", e))?,
            ),
            current_request_id: row
                .try_get("current_request_id")
                .map_err(|e| storage_err("current_request_id", e))?,
            pending_request_id: row
                .try_get("pending_request_id")
                .map_err(|e| storage_err("pending_request_id", e))?,
        })
    })
    .transpose()
}

#[async_trait]
impl OperationStateRepository for SqliteStore {
    async fn try_acquire(
        &self,
        org_id: &str,
        service_name: &str,
        request_id: &str,
        stale_lock_seconds: i64,
    ) -> Result<AcquireOutcome> {
        let now = to_epoch(Utc::now());
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin try_acquire", e))?;

        let result = sqlx::query(
            "INSERT INTO operation_states \
             (org_id, service_name, in_progress, started_at, current_request_id, pending_request_id) \
             VALUES (?1, ?2, 1, ?3, ?4, NULL) \
             ON CONFLICT (org_id, service_name) DO UPDATE SET \
                 in_progress = 1, started_at = ?3, current_request_id = ?4, \
                 pending_request_id = NULL \
             WHERE operation_states.in_progress = 0 \
                OR ?3 - operation_states.started_at >= ?5",
        )
        .bind(org_id)
        .bind(service_name)
        .bind(now)
        .bind(request_id)
        .bind(stale_lock_seconds)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("try_acquire upsert", e))?;

        let outcome = if result.rows_affected() > 0 {
            AcquireOutcome::Acquired
        } else {
            sqlx::query(
                "UPDATE operation_states SET pending_request_id = ?3 \
                 WHERE org_id = ?1 AND service_name = ?2",
            )
            .bind(org_id)
            .bind(service_name)
            .bind(request_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("record pending trigger", e))?;
            AcquireOutcome::Coalesced
        };

        tx.commit()
            .await
            .map_err(|e| storage_err("commit try_acquire", e))?;
        Ok(outcome)
    }

    async fn finish(&self, org_id: &str, service_name: &str) -> Result<Option<RequestId>> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin finish", e))?;

        let state = fetch_state(&mut tx, org_id, service_name).await?;
        let pending = state.and_then(|s| s.pending_request_id);

        match &pending {
            Some(pending_id) => {
                // Hand the scope straight to the coalesced trigger
                sqlx::query(
                    "UPDATE operation_states SET in_progress = 1, started_at = ?3, \
                     current_request_id = ?4, pending_request_id = NULL \
                     WHERE org_id = ?1 AND service_name = ?2",
                )
                .bind(org_id)
                .bind(service_name)
                .bind(to_epoch(Utc::now()))
                .bind(pending_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_err("finish handoff", e))?;
            }
            None => {
                sqlx::query(
                    "UPDATE operation_states SET in_progress = 0, current_request_id = NULL \
                     WHERE org_id = ?1 AND service_name = ?2",
                )
                .bind(org_id)
                .bind(service_name)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_err("finish release", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit finish", e))?;
        Ok(pending)
    }

    async fn clear(&self, org_id: &str, service_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM operation_states WHERE org_id = ?1 AND service_name = ?2")
            .bind(org_id)
            .bind(service_name)
            .execute(self.pool())
            .await
            .map_err(|e| storage_err("clear operation state", e))?;
        Ok(())
    }

    async fn get(&self, org_id: &str, service_name: &str) -> Result<Option<OperationState>> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin get state", e))?;
        let state = fetch_state(&mut tx, org_id, service_name).await?;
        tx.commit()
            .await
            .map_err(|e| storage_err("commit get state", e))?;
        Ok(state)
    }
}
