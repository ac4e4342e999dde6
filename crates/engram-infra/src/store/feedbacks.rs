//! Raw and aggregated feedback repositories over SQLite

use async_trait::async_trait;
use engram_core::*;
use engram_types::{ArtifactStatus, EngramError, Id, Result, ReviewStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::hybrid::{fts_arm, fuse_candidates, CandidateRow};
use super::{
    decode_embedding, encode_embedding, from_epoch, from_json, storage_err, to_epoch, to_json,
    SqliteStore,
};

const RAW_COLUMNS: &str = "f.rowid AS row_key, f.org_id, f.raw_feedback_id, f.user_id, \
     f.agent_version, f.request_id, f.source, f.feedback_name, f.feedback_content, f.do_action, \
     f.do_not_action, f.when_condition, f.blocking_kind, f.blocking_details, f.status, \
     f.embedding, f.created_at";

const AGG_COLUMNS: &str = "f.rowid AS row_key, f.org_id, f.feedback_id, f.agent_version, \
     f.feedback_name, f.feedback_content, f.do_action, f.do_not_action, f.when_condition, \
     f.blocking_kind, f.blocking_details, f.feedback_status, f.feedback_metadata, f.status, \
     f.embedding, f.created_at";

fn blocking_issue_from_row(row: &SqliteRow) -> Result<Option<BlockingIssue>> {
    let kind: Option<String> = row
        .try_get("blocking_kind")
        .map_err(|e| storage_err("blocking_kind", e))?;
    let details: Option<String> = row
        .try_get("blocking_details")
        .map_err(|e| storage_err("blocking_details", e))?;
    Ok(kind.map(|kind| BlockingIssue {
        kind,
        details: details.unwrap_or_default(),
    }))
}

fn row_to_raw_feedback(row: &SqliteRow) -> Result<RawFeedback> {
    let status_text: String = row.try_get("status").map_err(|e| storage_err("status", e))?;
    let status = ArtifactStatus::parse(&status_text)
        .ok_or_else(|| EngramError::Storage(format!("Corrupted status column: {status_text}")))?;
    let id_text: String = row
        .try_get("raw_feedback_id")
        .map_err(|e| storage_err("raw_feedback_id", e))?;
    let embedding_bytes: Vec<u8> = row
        .try_get("embedding")
        .map_err(|e| storage_err("embedding", e))?;

    Ok(RawFeedback {
        raw_feedback_id: id_text
            .parse()
            .map_err(|_| EngramError::Storage(format!("Corrupted raw feedback id: {id_text}")))?,
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| storage_err("user_id", e))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| storage_err("agent_version", e))?,
        request_id: row
            .try_get("request_id")
            .map_err(|e| storage_err("request_id", e))?,
        source: row.try_get("source").map_err(|e| storage_err("source", e))?,
        feedback_name: row
            .try_get("feedback_name")
            .map_err(|e| storage_err("feedback_name", e))?,
        feedback_content: row
            .try_get("feedback_content")
            .map_err(|e| storage_err("feedback_content", e))?,
        do_action: row
            .try_get("do_action")
            .map_err(|e| storage_err("do_action", e))?,
        do_not_action: row
            .try_get("do_not_action")
            .map_err(|e| storage_err("do_not_action", e))?,
        when_condition: row
            .try_get("when_condition")
            .map_err(|e| storage_err("when_condition", e))?,
        blocking_issue: blocking_issue_from_row(row)?,
        status,
        embedding: decode_embedding(&embedding_bytes),
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

fn row_to_agg_feedback(row: &SqliteRow) -> Result<AggregatedFeedback> {
    let status_text: String = row.try_get("status").map_err(|e| storage_err("status", e))?;
    let status = ArtifactStatus::parse(&status_text)
        .ok_or_else(|| EngramError::Storage(format!("Corrupted status column: {status_text}")))?;
    let review_text: String = row
        .try_get("feedback_status")
        .map_err(|e| storage_err("feedback_status", e))?;
    let feedback_status = ReviewStatus::parse(&review_text).ok_or_else(|| {
        EngramError::Storage(format!("Corrupted feedback_status column: {review_text}"))
    })?;
    let id_text: String = row
        .try_get("feedback_id")
        .map_err(|e| storage_err("feedback_id", e))?;
    let metadata_text: String = row
        .try_get("feedback_metadata")
        .map_err(|e| storage_err("feedback_metadata", e))?;
    let embedding_bytes: Vec<u8> = row
        .try_get("embedding")
        .map_err(|e| storage_err("embedding", e))?;

    Ok(AggregatedFeedback {
        feedback_id: id_text
            .parse()
            .map_err(|_| EngramError::Storage(format!("Corrupted feedback id: {id_text}")))?,
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| storage_err("agent_version", e))?,
        feedback_name: row
            .try_get("feedback_name")
            .map_err(|e| storage_err("feedback_name", e))?,
        feedback_content: row
            .try_get("feedback_content")
            .map_err(|e| storage_err("feedback_content", e))?,
        do_action: row
            .try_get("do_action")
            .map_err(|e| storage_err("do_action", e))?,
        do_not_action: row
            .try_get("do_not_action")
            .map_err(|e| storage_err("do_not_action", e))?,
        when_condition: row
            .try_get("when_condition")
            .map_err(|e| storage_err("when_condition", e))?,
        blocking_issue: blocking_issue_from_row(row)?,
        feedback_status,
        feedback_metadata: from_json(&metadata_text)?,
        status,
        embedding: decode_embedding(&embedding_bytes),
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

fn push_raw_filter<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a RawFeedbackFilter) {
    if filter.statuses.is_empty() {
        qb.push(" AND f.status = 'current'");
    } else {
        qb.push(" AND f.status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND f.user_id = ").push_bind(user_id);
    }
    if let Some(agent_version) = &filter.agent_version {
        qb.push(" AND f.agent_version = ").push_bind(agent_version);
    }
    if let Some(feedback_name) = &filter.feedback_name {
        qb.push(" AND f.feedback_name = ").push_bind(feedback_name);
    }
    if let Some(source) = &filter.source {
        qb.push(" AND f.source = ").push_bind(source);
    }
}

fn push_agg_filter<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a AggregatedFeedbackFilter) {
    if filter.statuses.is_empty() {
        qb.push(" AND f.status = 'current'");
    } else {
        qb.push(" AND f.status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if filter.review_statuses.is_empty() {
        qb.push(" AND f.feedback_status = 'approved'");
    } else {
        qb.push(" AND f.feedback_status IN (");
        let mut separated = qb.separated(", ");
        for review in &filter.review_statuses {
            separated.push_bind(review.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(agent_version) = &filter.agent_version {
        qb.push(" AND f.agent_version = ").push_bind(agent_version);
    }
    if let Some(feedback_name) = &filter.feedback_name {
        qb.push(" AND f.feedback_name = ").push_bind(feedback_name);
    }
}

#[async_trait]
impl RawFeedbackRepository for SqliteStore {
    async fn insert(&self, feedbacks: &[RawFeedback]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin insert raw feedbacks", e))?;

        for feedback in feedbacks {
            let hash = content_hash(&[
                &feedback.agent_version,
                &feedback.feedback_name,
                &feedback.request_id,
                &feedback.feedback_content,
                feedback.when_condition.as_deref().unwrap_or(""),
                feedback.do_action.as_deref().unwrap_or(""),
                feedback.do_not_action.as_deref().unwrap_or(""),
            ]);
            sqlx::query(
                "INSERT INTO raw_feedbacks (org_id, raw_feedback_id, user_id, agent_version, \
                 request_id, source, feedback_name, feedback_content, do_action, do_not_action, \
                 when_condition, blocking_kind, blocking_details, indexed_content, status, \
                 embedding, content_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
                 ON CONFLICT (org_id, content_hash) DO NOTHING",
            )
            .bind(&feedback.org_id)
            .bind(feedback.raw_feedback_id.to_string())
            .bind(&feedback.user_id)
            .bind(&feedback.agent_version)
            .bind(&feedback.request_id)
            .bind(&feedback.source)
            .bind(&feedback.feedback_name)
            .bind(&feedback.feedback_content)
            .bind(&feedback.do_action)
            .bind(&feedback.do_not_action)
            .bind(&feedback.when_condition)
            .bind(feedback.blocking_issue.as_ref().map(|b| b.kind.clone()))
            .bind(feedback.blocking_issue.as_ref().map(|b| b.details.clone()))
            .bind(feedback.indexed_content())
            .bind(feedback.status.as_str())
            .bind(encode_embedding(&feedback.embedding))
            .bind(hash)
            .bind(to_epoch(feedback.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("insert raw feedback", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit insert raw feedbacks", e))
    }

    async fn get(&self, org_id: &str, raw_feedback_id: Id) -> Result<Option<RawFeedback>> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_feedbacks f \
             WHERE f.org_id = ?1 AND f.raw_feedback_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(org_id)
            .bind(raw_feedback_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| storage_err("get raw feedback", e))?;
        row.as_ref().map(row_to_raw_feedback).transpose()
    }

    async fn list(
        &self,
        org_id: &str,
        filter: &RawFeedbackFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RawFeedback>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RAW_COLUMNS} FROM raw_feedbacks f WHERE f.org_id = "
        ));
        qb.push_bind(org_id);
        push_raw_filter(&mut qb, filter);
        qb.push(" ORDER BY f.created_at DESC, f.rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list raw feedbacks", e))?;
        rows.iter().map(row_to_raw_feedback).collect()
    }

    async fn count(&self, org_id: &str, filter: &RawFeedbackFilter) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM raw_feedbacks f WHERE f.org_id = ");
        qb.push_bind(org_id);
        push_raw_filter(&mut qb, filter);

        let row = qb
            .build()
            .fetch_one(self.pool())
            .await
            .map_err(|e| storage_err("count raw feedbacks", e))?;
        let count: i64 = row.try_get("n").map_err(|e| storage_err("count", e))?;
        Ok(count as u64)
    }

    async fn update_status(
        &self,
        org_id: &str,
        raw_feedback_id: Id,
        status: ArtifactStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE raw_feedbacks SET status = ?3 WHERE org_id = ?1 AND raw_feedback_id = ?2",
        )
        .bind(org_id)
        .bind(raw_feedback_id.to_string())
        .bind(status.as_str())
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("update raw feedback status", e))?;

        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound(format!(
                "raw feedback {raw_feedback_id}"
            )));
        }
        Ok(())
    }

    async fn delete(&self, org_id: &str, raw_feedback_id: Id) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM raw_feedbacks WHERE org_id = ?1 AND raw_feedback_id = ?2")
                .bind(org_id)
                .bind(raw_feedback_id.to_string())
                .execute(self.pool())
                .await
                .map_err(|e| storage_err("delete raw feedback", e))?;
        Ok(result.rows_affected())
    }

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &RawFeedbackFilter,
    ) -> Result<Vec<Scored<RawFeedback>>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RAW_COLUMNS} FROM raw_feedbacks f WHERE f.org_id = "
        ));
        qb.push_bind(org_id);
        push_raw_filter(&mut qb, filter);

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("search raw feedback candidates", e))?;

        let mut by_key = std::collections::HashMap::new();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: i64 = row
                .try_get("row_key")
                .map_err(|e| storage_err("row_key", e))?;
            let feedback = row_to_raw_feedback(row)?;
            candidates.push(CandidateRow {
                key,
                embedding: feedback.embedding.clone(),
                created_at: to_epoch(feedback.created_at),
            });
            by_key.insert(key, feedback);
        }

        let fts = fts_arm(
            self.pool(),
            "raw_feedbacks_fts",
            &request.query_text,
            request.k.saturating_mul(3).max(1),
        )
        .await?;

        Ok(fuse_candidates(&candidates, fts, request)
            .into_iter()
            .filter_map(|(key, score)| by_key.remove(&key).map(|item| Scored { item, score }))
            .collect())
    }
}

#[async_trait]
impl AggregatedFeedbackRepository for SqliteStore {
    async fn insert(&self, feedbacks: &[AggregatedFeedback]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin insert aggregates", e))?;

        for feedback in feedbacks {
            sqlx::query(
                "INSERT INTO agg_feedbacks (org_id, feedback_id, agent_version, feedback_name, \
                 feedback_content, do_action, do_not_action, when_condition, blocking_kind, \
                 blocking_details, indexed_content, feedback_status, feedback_metadata, status, \
                 embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )
            .bind(&feedback.org_id)
            .bind(feedback.feedback_id.to_string())
            .bind(&feedback.agent_version)
            .bind(&feedback.feedback_name)
            .bind(&feedback.feedback_content)
            .bind(&feedback.do_action)
            .bind(&feedback.do_not_action)
            .bind(&feedback.when_condition)
            .bind(feedback.blocking_issue.as_ref().map(|b| b.kind.clone()))
            .bind(feedback.blocking_issue.as_ref().map(|b| b.details.clone()))
            .bind(feedback.indexed_content())
            .bind(feedback.feedback_status.as_str())
            .bind(to_json(&feedback.feedback_metadata)?)
            .bind(feedback.status.as_str())
            .bind(encode_embedding(&feedback.embedding))
            .bind(to_epoch(feedback.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("insert aggregate", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit insert aggregates", e))
    }

    async fn get(&self, org_id: &str, feedback_id: Id) -> Result<Option<AggregatedFeedback>> {
        let sql = format!(
            "SELECT {AGG_COLUMNS} FROM agg_feedbacks f \
             WHERE f.org_id = ?1 AND f.feedback_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(org_id)
            .bind(feedback_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| storage_err("get aggregate", e))?;
        row.as_ref().map(row_to_agg_feedback).transpose()
    }

    async fn list(
        &self,
        org_id: &str,
        filter: &AggregatedFeedbackFilter,
        limit: Option<usize>,
    ) -> Result<Vec<AggregatedFeedback>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {AGG_COLUMNS} FROM agg_feedbacks f WHERE f.org_id = "
        ));
        qb.push_bind(org_id);
        push_agg_filter(&mut qb, filter);
        qb.push(" ORDER BY f.created_at DESC, f.rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list aggregates", e))?;
        rows.iter().map(row_to_agg_feedback).collect()
    }

    async fn update_status(
        &self,
        org_id: &str,
        feedback_id: Id,
        status: ArtifactStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE agg_feedbacks SET status = ?3 WHERE org_id = ?1 AND feedback_id = ?2")
                .bind(org_id)
                .bind(feedback_id.to_string())
                .bind(status.as_str())
                .execute(self.pool())
                .await
                .map_err(|e| storage_err("update aggregate status", e))?;

        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound(format!("aggregate {feedback_id}")));
        }
        Ok(())
    }

    async fn update_review_status(
        &self,
        org_id: &str,
        feedback_id: Id,
        review: ReviewStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agg_feedbacks SET feedback_status = ?3 \
             WHERE org_id = ?1 AND feedback_id = ?2",
        )
        .bind(org_id)
        .bind(feedback_id.to_string())
        .bind(review.as_str())
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("update review status", e))?;

        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound(format!("aggregate {feedback_id}")));
        }
        Ok(())
    }

    async fn update_metadata(
        &self,
        org_id: &str,
        feedback_id: Id,
        metadata: &FeedbackMetadata,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agg_feedbacks SET feedback_metadata = ?3 \
             WHERE org_id = ?1 AND feedback_id = ?2",
        )
        .bind(org_id)
        .bind(feedback_id.to_string())
        .bind(to_json(metadata)?)
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("update aggregate metadata", e))?;

        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound(format!("aggregate {feedback_id}")));
        }
        Ok(())
    }

    async fn delete(&self, org_id: &str, feedback_id: Id) -> Result<u64> {
        let result = sqlx::query("DELETE FROM agg_feedbacks WHERE org_id = ?1 AND feedback_id = ?2")
            .bind(org_id)
            .bind(feedback_id.to_string())
            .execute(self.pool())
            .await
            .map_err(|e| storage_err("delete aggregate", e))?;
        Ok(result.rows_affected())
    }

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &AggregatedFeedbackFilter,
    ) -> Result<Vec<Scored<AggregatedFeedback>>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {AGG_COLUMNS} FROM agg_feedbacks f WHERE f.org_id = "
        ));
        qb.push_bind(org_id);
        push_agg_filter(&mut qb, filter);

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("search aggregate candidates", e))?;

        let mut by_key = std::collections::HashMap::new();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: i64 = row
                .try_get("row_key")
                .map_err(|e| storage_err("row_key", e))?;
            let feedback = row_to_agg_feedback(row)?;
            candidates.push(CandidateRow {
                key,
                embedding: feedback.embedding.clone(),
                created_at: to_epoch(feedback.created_at),
            });
            by_key.insert(key, feedback);
        }

        let fts = fts_arm(
            self.pool(),
            "agg_feedbacks_fts",
            &request.query_text,
            request.k.saturating_mul(3).max(1),
        )
        .await?;

        Ok(fuse_candidates(&candidates, fts, request)
            .into_iter()
            .filter_map(|(key, score)| by_key.remove(&key).map(|item| Scored { item, score }))
            .collect())
    }
}
