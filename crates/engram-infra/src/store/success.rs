//! Success evaluation repository over SQLite

use async_trait::async_trait;
use engram_core::*;
use engram_types::{EngramError, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{decode_embedding, encode_embedding, from_epoch, storage_err, to_epoch, SqliteStore};

const SUCCESS_COLUMNS: &str = "s.org_id, s.result_id, s.evaluation_name, s.agent_version, \
     s.request_id, s.is_success, s.failure_type, s.failure_reason, s.agent_prompt_update, \
     s.embedding, s.created_at";

fn row_to_result(row: &SqliteRow) -> Result<SuccessEvaluation> {
    let id_text: String = row
        .try_get("result_id")
        .map_err(|e| storage_err("result_id", e))?;
    let embedding_bytes: Vec<u8> = row
        .try_get("embedding")
        .map_err(|e| storage_err("embedding", e))?;

    Ok(SuccessEvaluation {
        result_id: id_text
            .parse()
            .map_err(|_| EngramError::Storage(format!("Corrupted result id: {id_text}")))?,
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        evaluation_name: row
            .try_get("evaluation_name")
            .map_err(|e| storage_err("evaluation_name", e))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| storage_err("agent_version", e))?,
        request_id: row
            .try_get("request_id")
            .map_err(|e| storage_err("request_id", e))?,
        is_success: row
            .try_get::<i64, _>("is_success")
            .map_err(|e| storage_err("is_success", e))?
            != 0,
        failure_type: row
            .try_get("failure_type")
            .map_err(|e| storage_err("failure_type", e))?,
        failure_reason: row
            .try_get("failure_reason")
            .map_err(|e| storage_err("failure_reason", e))?,
        agent_prompt_update: row
            .try_get("agent_prompt_update")
            .map_err(|e| storage_err("agent_prompt_update", e))?,
        embedding: decode_embedding(&embedding_bytes),
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

#[async_trait]
impl SuccessRepository for SqliteStore {
    async fn insert(&self, results: &[SuccessEvaluation]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin insert results", e))?;

        for result in results {
            // One evaluation per (evaluation_name, request_id); a retried
            // run after a timeout lands on the existing row
            sqlx::query(
                "INSERT INTO success_results (org_id, result_id, evaluation_name, agent_version, \
                 request_id, is_success, failure_type, failure_reason, agent_prompt_update, \
                 embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT (org_id, evaluation_name, request_id) DO NOTHING",
            )
            .bind(&result.org_id)
            .bind(result.result_id.to_string())
            .bind(&result.evaluation_name)
            .bind(&result.agent_version)
            .bind(&result.request_id)
            .bind(result.is_success as i64)
            .bind(&result.failure_type)
            .bind(&result.failure_reason)
            .bind(&result.agent_prompt_update)
            .bind(encode_embedding(&result.embedding))
            .bind(to_epoch(result.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("insert result", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit insert results", e))
    }

    async fn list(
        &self,
        org_id: &str,
        filter: &SuccessFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SuccessEvaluation>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SUCCESS_COLUMNS} FROM success_results s WHERE s.org_id = "
        ));
        qb.push_bind(org_id);
        if let Some(evaluation_name) = &filter.evaluation_name {
            qb.push(" AND s.evaluation_name = ").push_bind(evaluation_name);
        }
        if let Some(agent_version) = &filter.agent_version {
            qb.push(" AND s.agent_version = ").push_bind(agent_version);
        }
        if let Some(request_id) = &filter.request_id {
            qb.push(" AND s.request_id = ").push_bind(request_id);
        }
        qb.push(" ORDER BY s.created_at DESC, s.rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list results", e))?;
        rows.iter().map(row_to_result).collect()
    }
}
