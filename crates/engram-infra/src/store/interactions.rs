//! Interaction and request repository over SQLite

use async_trait::async_trait;
use engram_core::*;
use engram_types::{EngramError, InteractionId, Result, Role, UserAction};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::hybrid::{fts_arm, fuse_candidates, CandidateRow};
use super::{
    decode_embedding, encode_embedding, from_epoch, from_json, storage_err, to_epoch, to_json,
    SqliteStore,
};

const INTERACTION_COLUMNS: &str = "i.rowid AS row_key, i.org_id, i.interaction_id, i.request_id, \
     i.user_id, i.role, i.content, i.shadow_content, i.user_action, i.user_action_description, \
     i.interacted_image_url, i.image_encoding, i.tools_used, i.embedding, i.deleted, i.created_at";

fn row_to_interaction(row: &SqliteRow) -> Result<Interaction> {
    let role_text: String = row.try_get("role").map_err(|e| storage_err("role", e))?;
    let role = Role::parse(&role_text)
        .ok_or_else(|| EngramError::Storage(format!("Corrupted role column: {role_text}")))?;
    let action_text: String = row
        .try_get("user_action")
        .map_err(|e| storage_err("user_action", e))?;
    let user_action = UserAction::parse(&action_text).unwrap_or_default();
    let tools_text: String = row
        .try_get("tools_used")
        .map_err(|e| storage_err("tools_used", e))?;
    let embedding_bytes: Vec<u8> = row
        .try_get("embedding")
        .map_err(|e| storage_err("embedding", e))?;

    Ok(Interaction {
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        interaction_id: row
            .try_get("interaction_id")
            .map_err(|e| storage_err("interaction_id", e))?,
        request_id: row
            .try_get("request_id")
            .map_err(|e| storage_err("request_id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| storage_err("user_id", e))?,
        role,
        content: row
            .try_get("content")
            .map_err(|e| storage_err("content", e))?,
        shadow_content: row
            .try_get("shadow_content")
            .map_err(|e| storage_err("shadow_content", e))?,
        user_action,
        user_action_description: row
            .try_get("user_action_description")
            .map_err(|e| storage_err("user_action_description", e))?,
        interacted_image_url: row
            .try_get("interacted_image_url")
            .map_err(|e| storage_err("interacted_image_url", e))?,
        image_encoding: row
            .try_get("image_encoding")
            .map_err(|e| storage_err("image_encoding", e))?,
        tools_used: from_json(&tools_text)?,
        embedding: decode_embedding(&embedding_bytes),
        deleted: row
            .try_get::<i64, _>("deleted")
            .map_err(|e| storage_err("deleted", e))?
            != 0,
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

fn row_to_request(row: &SqliteRow) -> Result<Request> {
    Ok(Request {
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        request_id: row
            .try_get("request_id")
            .map_err(|e| storage_err("request_id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| storage_err("user_id", e))?,
        source: row.try_get("source").map_err(|e| storage_err("source", e))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| storage_err("agent_version", e))?,
        request_group: row
            .try_get("request_group")
            .map_err(|e| storage_err("request_group", e))?,
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

/// Append the caller's interaction filter; `i` is the interactions alias
/// and `r` the joined requests alias
fn push_filter<'a>(
    qb: &mut QueryBuilder<'a, Sqlite>,
    filter: &'a InteractionFilter,
    include_deleted: bool,
) {
    if !include_deleted {
        qb.push(" AND i.deleted = 0");
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND i.user_id = ").push_bind(user_id);
    }
    if let Some(request_id) = &filter.request_id {
        qb.push(" AND i.request_id = ").push_bind(request_id);
    }
    if let Some(group) = &filter.request_group {
        qb.push(" AND r.request_group = ").push_bind(group);
    }
    if let Some(agent_version) = &filter.agent_version {
        qb.push(" AND r.agent_version = ").push_bind(agent_version);
    }
    if !filter.sources.is_empty() {
        qb.push(" AND r.source IN (");
        let mut separated = qb.separated(", ");
        for source in &filter.sources {
            separated.push_bind(source);
        }
        separated.push_unseparated(")");
    }
    if let Some(since) = filter.since {
        qb.push(" AND i.created_at >= ").push_bind(to_epoch(since));
    }
    if let Some(until) = filter.until {
        qb.push(" AND i.created_at <= ").push_bind(to_epoch(until));
    }
}

#[async_trait]
impl InteractionRepository for SqliteStore {
    async fn publish(
        &self,
        request: &Request,
        interactions: Vec<Interaction>,
    ) -> Result<Vec<Interaction>> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin publish", e))?;

        sqlx::query(
            "INSERT INTO requests (org_id, request_id, user_id, source, agent_version, \
             request_group, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&request.org_id)
        .bind(&request.request_id)
        .bind(&request.user_id)
        .bind(&request.source)
        .bind(&request.agent_version)
        .bind(&request.request_group)
        .bind(to_epoch(request.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("insert request", e))?;

        // Tenant-monotone id allocation inside the write transaction
        let base: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(interaction_id), 0) FROM interactions WHERE org_id = ?1",
        )
        .bind(&request.org_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| storage_err("allocate interaction ids", e))?;

        let mut stored = Vec::with_capacity(interactions.len());
        for (offset, mut interaction) in interactions.into_iter().enumerate() {
            interaction.interaction_id = base + offset as i64 + 1;
            sqlx::query(
                "INSERT INTO interactions (org_id, interaction_id, request_id, user_id, role, \
                 content, shadow_content, user_action, user_action_description, \
                 interacted_image_url, image_encoding, tools_used, embedding, deleted, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14)",
            )
            .bind(&interaction.org_id)
            .bind(interaction.interaction_id)
            .bind(&interaction.request_id)
            .bind(&interaction.user_id)
            .bind(interaction.role.as_str())
            .bind(&interaction.content)
            .bind(&interaction.shadow_content)
            .bind(interaction.user_action.as_str())
            .bind(&interaction.user_action_description)
            .bind(&interaction.interacted_image_url)
            .bind(&interaction.image_encoding)
            .bind(to_json(&interaction.tools_used)?)
            .bind(encode_embedding(&interaction.embedding))
            .bind(to_epoch(interaction.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("insert interaction", e))?;
            stored.push(interaction);
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit publish", e))?;
        Ok(stored)
    }

    async fn get_request(&self, org_id: &str, request_id: &str) -> Result<Option<Request>> {
        let row = sqlx::query(
            "SELECT org_id, request_id, user_id, source, agent_version, request_group, \
             created_at FROM requests WHERE org_id = ?1 AND request_id = ?2",
        )
        .bind(org_id)
        .bind(request_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| storage_err("get request", e))?;

        row.as_ref().map(row_to_request).transpose()
    }

    async fn list_requests(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Request>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT r.org_id, r.request_id, r.user_id, r.source, r.agent_version, \
             r.request_group, r.created_at FROM requests r WHERE r.org_id = ",
        );
        qb.push_bind(org_id);
        if let Some(user_id) = &filter.user_id {
            qb.push(" AND r.user_id = ").push_bind(user_id);
        }
        if let Some(request_id) = &filter.request_id {
            qb.push(" AND r.request_id = ").push_bind(request_id);
        }
        if let Some(group) = &filter.request_group {
            qb.push(" AND r.request_group = ").push_bind(group);
        }
        if let Some(agent_version) = &filter.agent_version {
            qb.push(" AND r.agent_version = ").push_bind(agent_version);
        }
        if !filter.sources.is_empty() {
            qb.push(" AND r.source IN (");
            let mut separated = qb.separated(", ");
            for source in &filter.sources {
                separated.push_bind(source);
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY r.created_at DESC, r.request_id DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list requests", e))?;
        rows.iter().map(row_to_request).collect()
    }

    async fn list_interactions(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<Vec<Interaction>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions i \
             JOIN requests r ON r.org_id = i.org_id AND r.request_id = i.request_id \
             WHERE i.org_id = "
        ));
        qb.push_bind(org_id);
        push_filter(&mut qb, filter, false);
        qb.push(if ascending {
            " ORDER BY i.interaction_id ASC"
        } else {
            " ORDER BY i.interaction_id DESC"
        });
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list interactions", e))?;
        rows.iter().map(row_to_interaction).collect()
    }

    async fn windowed_history(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
    ) -> Result<Vec<(Interaction, Request)>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {INTERACTION_COLUMNS}, r.org_id AS r_org_id, r.request_id AS r_request_id, \
             r.user_id AS r_user_id, r.source AS r_source, r.agent_version AS r_agent_version, \
             r.request_group AS r_request_group, r.created_at AS r_created_at \
             FROM interactions i \
             JOIN requests r ON r.org_id = i.org_id AND r.request_id = i.request_id \
             WHERE i.org_id = "
        ));
        qb.push_bind(org_id);
        push_filter(&mut qb, filter, false);
        qb.push(" ORDER BY i.interaction_id ASC");

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("windowed history", e))?;

        rows.iter()
            .map(|row| {
                let interaction = row_to_interaction(row)?;
                let request = Request {
                    org_id: row
                        .try_get("r_org_id")
                        .map_err(|e| storage_err("r_org_id", e))?,
                    request_id: row
                        .try_get("r_request_id")
                        .map_err(|e| storage_err("r_request_id", e))?,
                    user_id: row
                        .try_get("r_user_id")
                        .map_err(|e| storage_err("r_user_id", e))?,
                    source: row
                        .try_get("r_source")
                        .map_err(|e| storage_err("r_source", e))?,
                    agent_version: row
                        .try_get("r_agent_version")
                        .map_err(|e| storage_err("r_agent_version", e))?,
                    request_group: row
                        .try_get("r_request_group")
                        .map_err(|e| storage_err("r_request_group", e))?,
                    created_at: from_epoch(
                        row.try_get("r_created_at")
                            .map_err(|e| storage_err("r_created_at", e))?,
                    ),
                };
                Ok((interaction, request))
            })
            .collect()
    }

    async fn delete_interaction(
        &self,
        org_id: &str,
        interaction_id: InteractionId,
    ) -> Result<u64> {
        // Soft delete: the row stays for id monotonicity, windows skip it
        let result = sqlx::query(
            "UPDATE interactions SET deleted = 1 \
             WHERE org_id = ?1 AND interaction_id = ?2 AND deleted = 0",
        )
        .bind(org_id)
        .bind(interaction_id)
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("delete interaction", e))?;
        Ok(result.rows_affected())
    }

    async fn delete_request(&self, org_id: &str, request_id: &str) -> Result<u64> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin delete request", e))?;

        let removed = sqlx::query("DELETE FROM interactions WHERE org_id = ?1 AND request_id = ?2")
            .bind(org_id)
            .bind(request_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("cascade interactions", e))?
            .rows_affected();

        sqlx::query("DELETE FROM requests WHERE org_id = ?1 AND request_id = ?2")
            .bind(org_id)
            .bind(request_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("delete request", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("commit delete request", e))?;
        Ok(removed)
    }

    async fn delete_request_group(&self, org_id: &str, request_group: &str) -> Result<u64> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin delete group", e))?;

        let removed = sqlx::query(
            "DELETE FROM interactions WHERE org_id = ?1 AND request_id IN \
             (SELECT request_id FROM requests WHERE org_id = ?1 AND request_group = ?2)",
        )
        .bind(org_id)
        .bind(request_group)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_err("cascade group interactions", e))?
        .rows_affected();

        sqlx::query("DELETE FROM requests WHERE org_id = ?1 AND request_group = ?2")
            .bind(org_id)
            .bind(request_group)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("delete group requests", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_err("commit delete group", e))?;
        Ok(removed)
    }

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &InteractionFilter,
    ) -> Result<Vec<Scored<Interaction>>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions i \
             JOIN requests r ON r.org_id = i.org_id AND r.request_id = i.request_id \
             WHERE i.org_id = "
        ));
        qb.push_bind(org_id);
        push_filter(&mut qb, filter, false);

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("search candidates", e))?;

        let mut by_key = std::collections::HashMap::new();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: i64 = row
                .try_get("row_key")
                .map_err(|e| storage_err("row_key", e))?;
            let interaction = row_to_interaction(row)?;
            candidates.push(CandidateRow {
                key,
                embedding: interaction.embedding.clone(),
                created_at: to_epoch(interaction.created_at),
            });
            by_key.insert(key, interaction);
        }

        let fts = fts_arm(
            self.pool(),
            "interactions_fts",
            &request.query_text,
            request.k.saturating_mul(3).max(1),
        )
        .await?;

        Ok(fuse_candidates(&candidates, fts, request)
            .into_iter()
            .filter_map(|(key, score)| {
                by_key.remove(&key).map(|item| Scored { item, score })
            })
            .collect())
    }
}
