//! Skill repository over SQLite

use async_trait::async_trait;
use engram_core::*;
use engram_types::{EngramError, Id, Result, SkillStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{
    decode_embedding, encode_embedding, from_epoch, from_json, storage_err, to_epoch, to_json,
    SqliteStore,
};

const SKILL_COLUMNS: &str = "s.org_id, s.skill_id, s.agent_version, s.feedback_name, \
     s.skill_name, s.description, s.instructions, s.allowed_tools, s.blocking_issues, \
     s.raw_feedback_ids, s.skill_status, s.embedding, s.created_at";

fn row_to_skill(row: &SqliteRow) -> Result<Skill> {
    let status_text: String = row
        .try_get("skill_status")
        .map_err(|e| storage_err("skill_status", e))?;
    let skill_status = SkillStatus::parse(&status_text).ok_or_else(|| {
        EngramError::Storage(format!("Corrupted skill_status column: {status_text}"))
    })?;
    let id_text: String = row
        .try_get("skill_id")
        .map_err(|e| storage_err("skill_id", e))?;
    let tools_text: String = row
        .try_get("allowed_tools")
        .map_err(|e| storage_err("allowed_tools", e))?;
    let issues_text: String = row
        .try_get("blocking_issues")
        .map_err(|e| storage_err("blocking_issues", e))?;
    let raw_ids_text: String = row
        .try_get("raw_feedback_ids")
        .map_err(|e| storage_err("raw_feedback_ids", e))?;
    let embedding_bytes: Vec<u8> = row
        .try_get("embedding")
        .map_err(|e| storage_err("embedding", e))?;

    Ok(Skill {
        skill_id: id_text
            .parse()
            .map_err(|_| EngramError::Storage(format!("Corrupted skill id: {id_text}")))?,
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        agent_version: row
            .try_get("agent_version")
            .map_err(|e| storage_err("agent_version", e))?,
        feedback_name: row
            .try_get("feedback_name")
            .map_err(|e| storage_err("feedback_name", e))?,
        skill_name: row
            .try_get("skill_name")
            .map_err(|e| storage_err("skill_name", e))?,
        description: row
            .try_get("description")
            .map_err(|e| storage_err("description", e))?,
        instructions: row
            .try_get("instructions")
            .map_err(|e| storage_err("instructions", e))?,
        allowed_tools: from_json(&tools_text)?,
        blocking_issues: from_json(&issues_text)?,
        raw_feedback_ids: from_json(&raw_ids_text)?,
        skill_status,
        embedding: decode_embedding(&embedding_bytes),
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

#[async_trait]
impl SkillRepository for SqliteStore {
    async fn insert(&self, skills: &[Skill]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin insert skills", e))?;

        for skill in skills {
            sqlx::query(
                "INSERT INTO skills (org_id, skill_id, agent_version, feedback_name, skill_name, \
                 description, instructions, allowed_tools, blocking_issues, raw_feedback_ids, \
                 skill_status, embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(&skill.org_id)
            .bind(skill.skill_id.to_string())
            .bind(&skill.agent_version)
            .bind(&skill.feedback_name)
            .bind(&skill.skill_name)
            .bind(&skill.description)
            .bind(&skill.instructions)
            .bind(to_json(&skill.allowed_tools)?)
            .bind(to_json(&skill.blocking_issues)?)
            .bind(to_json(&skill.raw_feedback_ids)?)
            .bind(skill.skill_status.as_str())
            .bind(encode_embedding(&skill.embedding))
            .bind(to_epoch(skill.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("insert skill", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_err("commit insert skills", e))
    }

    async fn get(&self, org_id: &str, skill_id: Id) -> Result<Option<Skill>> {
        let sql =
            format!("SELECT {SKILL_COLUMNS} FROM skills s WHERE s.org_id = ?1 AND s.skill_id = ?2");
        let row = sqlx::query(&sql)
            .bind(org_id)
            .bind(skill_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| storage_err("get skill", e))?;
        row.as_ref().map(row_to_skill).transpose()
    }

    async fn list(
        &self,
        org_id: &str,
        filter: &SkillFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Skill>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {SKILL_COLUMNS} FROM skills s WHERE s.org_id = "));
        qb.push_bind(org_id);
        if let Some(agent_version) = &filter.agent_version {
            qb.push(" AND s.agent_version = ").push_bind(agent_version);
        }
        if let Some(feedback_name) = &filter.feedback_name {
            qb.push(" AND s.feedback_name = ").push_bind(feedback_name);
        }
        if let Some(status) = filter.skill_status {
            qb.push(" AND s.skill_status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY s.created_at DESC, s.rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list skills", e))?;
        rows.iter().map(row_to_skill).collect()
    }

    async fn update_skill_status(
        &self,
        org_id: &str,
        skill_id: Id,
        status: SkillStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE skills SET skill_status = ?3 WHERE org_id = ?1 AND skill_id = ?2")
                .bind(org_id)
                .bind(skill_id.to_string())
                .bind(status.as_str())
                .execute(self.pool())
                .await
                .map_err(|e| storage_err("update skill status", e))?;

        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound(format!("skill {skill_id}")));
        }
        Ok(())
    }
}
