//! Profile repository over SQLite

use async_trait::async_trait;
use chrono::Utc;
use engram_core::*;
use engram_types::{ArtifactStatus, EngramError, Id, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;

use super::hybrid::{fts_arm, fuse_candidates, CandidateRow};
use super::{
    decode_embedding, encode_embedding, from_epoch, from_json, storage_err, to_epoch, to_json,
    SqliteStore,
};

const PROFILE_COLUMNS: &str = "p.rowid AS row_key, p.org_id, p.profile_id, p.user_id, p.content, \
     p.source, p.extractor_names, p.custom_features, p.generated_from_request_id, \
     p.last_modified_at, p.expiration_at, p.status, p.embedding, p.created_at";

fn row_to_profile(row: &SqliteRow) -> Result<Profile> {
    let status_text: String = row.try_get("status").map_err(|e| storage_err("status", e))?;
    let status = ArtifactStatus::parse(&status_text)
        .ok_or_else(|| EngramError::Storage(format!("Corrupted status column: {status_text}")))?;
    let names_text: String = row
        .try_get("extractor_names")
        .map_err(|e| storage_err("extractor_names", e))?;
    let names: Vec<String> = from_json(&names_text)?;
    let features_text: String = row
        .try_get("custom_features")
        .map_err(|e| storage_err("custom_features", e))?;
    let profile_id_text: String = row
        .try_get("profile_id")
        .map_err(|e| storage_err("profile_id", e))?;
    let embedding_bytes: Vec<u8> = row
        .try_get("embedding")
        .map_err(|e| storage_err("embedding", e))?;

    Ok(Profile {
        profile_id: profile_id_text
            .parse()
            .map_err(|_| EngramError::Storage(format!("Corrupted profile id: {profile_id_text}")))?,
        org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| storage_err("user_id", e))?,
        content: row
            .try_get("content")
            .map_err(|e| storage_err("content", e))?,
        source: row.try_get("source").map_err(|e| storage_err("source", e))?,
        extractor_names: names.into_iter().collect::<BTreeSet<_>>(),
        custom_features: from_json(&features_text)?,
        generated_from_request_id: row
            .try_get("generated_from_request_id")
            .map_err(|e| storage_err("generated_from_request_id", e))?,
        last_modified_at: from_epoch(
            row.try_get("last_modified_at")
                .map_err(|e| storage_err("last_modified_at", e))?,
        ),
        expiration_at: row
            .try_get::<Option<i64>, _>("expiration_at")
            .map_err(|e| storage_err("expiration_at", e))?
            .map(from_epoch),
        status,
        embedding: decode_embedding(&embedding_bytes),
        created_at: from_epoch(
            row.try_get("created_at")
                .map_err(|e| storage_err("created_at", e))?,
        ),
    })
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a ProfileFilter) {
    if filter.statuses.is_empty() {
        qb.push(" AND p.status = 'current'");
    } else {
        qb.push(" AND p.status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND p.user_id = ").push_bind(user_id);
    }
    if let Some(source) = &filter.source {
        qb.push(" AND p.source = ").push_bind(source);
    }
    if let Some(extractor) = &filter.extractor_name {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(p.extractor_names) WHERE value = ")
            .push_bind(extractor)
            .push(")");
    }
    if !filter.include_expired {
        qb.push(" AND (p.expiration_at IS NULL OR p.expiration_at >= ")
            .push_bind(to_epoch(Utc::now()))
            .push(")");
    }
}

async fn insert_profiles_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    profiles: &[Profile],
) -> Result<()> {
    for profile in profiles {
        let names: Vec<&str> = profile.extractor_names.iter().map(String::as_str).collect();
        let hash = content_hash(&[
            &profile.user_id,
            &profile.content,
            &profile.source,
            &profile.generated_from_request_id,
            &names.join(","),
        ]);
        sqlx::query(
            "INSERT INTO profiles (org_id, profile_id, user_id, content, source, \
             extractor_names, custom_features, generated_from_request_id, last_modified_at, \
             expiration_at, status, embedding, content_hash, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             ON CONFLICT (org_id, content_hash) DO NOTHING",
        )
        .bind(&profile.org_id)
        .bind(profile.profile_id.to_string())
        .bind(&profile.user_id)
        .bind(&profile.content)
        .bind(&profile.source)
        .bind(to_json(&names)?)
        .bind(to_json(&profile.custom_features)?)
        .bind(&profile.generated_from_request_id)
        .bind(to_epoch(profile.last_modified_at))
        .bind(profile.expiration_at.map(to_epoch))
        .bind(profile.status.as_str())
        .bind(encode_embedding(&profile.embedding))
        .bind(hash)
        .bind(to_epoch(profile.created_at))
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_err("insert profile", e))?;
    }
    Ok(())
}

#[async_trait]
impl ProfileRepository for SqliteStore {
    async fn insert(&self, profiles: &[Profile]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin insert profiles", e))?;
        insert_profiles_tx(&mut tx, profiles).await?;
        tx.commit()
            .await
            .map_err(|e| storage_err("commit insert profiles", e))
    }

    async fn get(&self, org_id: &str, profile_id: Id) -> Result<Option<Profile>> {
        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles p WHERE p.org_id = ?1 AND p.profile_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(org_id)
            .bind(profile_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| storage_err("get profile", e))?;
        row.as_ref().map(row_to_profile).transpose()
    }

    async fn list(
        &self,
        org_id: &str,
        filter: &ProfileFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Profile>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles p WHERE p.org_id = "
        ));
        qb.push_bind(org_id);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY p.last_modified_at DESC, p.rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("list profiles", e))?;
        rows.iter().map(row_to_profile).collect()
    }

    async fn update_status(
        &self,
        org_id: &str,
        profile_id: Id,
        status: ArtifactStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE profiles SET status = ?3, last_modified_at = ?4 \
             WHERE org_id = ?1 AND profile_id = ?2",
        )
        .bind(org_id)
        .bind(profile_id.to_string())
        .bind(status.as_str())
        .bind(to_epoch(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("update profile status", e))?;

        if result.rows_affected() == 0 {
            return Err(EngramError::NotFound(format!("profile {profile_id}")));
        }
        Ok(())
    }

    async fn transition(&self, org_id: &str, archive: &[Id], insert: &[Profile]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| storage_err("begin transition", e))?;

        for profile_id in archive {
            sqlx::query(
                "UPDATE profiles SET status = 'archived', last_modified_at = ?3 \
                 WHERE org_id = ?1 AND profile_id = ?2 AND status = 'current'",
            )
            .bind(org_id)
            .bind(profile_id.to_string())
            .bind(to_epoch(Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_err("archive profile", e))?;
        }

        insert_profiles_tx(&mut tx, insert).await?;

        tx.commit()
            .await
            .map_err(|e| storage_err("commit transition", e))
    }

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &ProfileFilter,
    ) -> Result<Vec<Scored<Profile>>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles p WHERE p.org_id = "
        ));
        qb.push_bind(org_id);
        push_filter(&mut qb, filter);

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("search profile candidates", e))?;

        let mut by_key = std::collections::HashMap::new();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: i64 = row
                .try_get("row_key")
                .map_err(|e| storage_err("row_key", e))?;
            let profile = row_to_profile(row)?;
            candidates.push(CandidateRow {
                key,
                embedding: profile.embedding.clone(),
                created_at: to_epoch(profile.created_at),
            });
            by_key.insert(key, profile);
        }

        let fts = fts_arm(
            self.pool(),
            "profiles_fts",
            &request.query_text,
            request.k.saturating_mul(3).max(1),
        )
        .await?;

        Ok(fuse_candidates(&candidates, fts, request)
            .into_iter()
            .filter_map(|(key, score)| by_key.remove(&key).map(|item| Scored { item, score }))
            .collect())
    }

    async fn append_change_entry(&self, entry: &ProfileChangeEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO profile_change_log (org_id, request_id, user_id, extractor_name, \
             added, removed, mentioned, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&entry.org_id)
        .bind(&entry.request_id)
        .bind(&entry.user_id)
        .bind(&entry.extractor_name)
        .bind(to_json(&entry.added)?)
        .bind(to_json(&entry.removed)?)
        .bind(to_json(&entry.mentioned)?)
        .bind(to_epoch(entry.created_at))
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("append change entry", e))?;
        Ok(())
    }

    async fn change_log(
        &self,
        org_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ProfileChangeEntry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT org_id, request_id, user_id, extractor_name, added, removed, mentioned, \
             created_at FROM profile_change_log WHERE org_id = ",
        );
        qb.push_bind(org_id);
        qb.push(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(|e| storage_err("change log", e))?;

        rows.iter()
            .map(|row| {
                let added: String = row.try_get("added").map_err(|e| storage_err("added", e))?;
                let removed: String = row
                    .try_get("removed")
                    .map_err(|e| storage_err("removed", e))?;
                let mentioned: String = row
                    .try_get("mentioned")
                    .map_err(|e| storage_err("mentioned", e))?;
                Ok(ProfileChangeEntry {
                    org_id: row.try_get("org_id").map_err(|e| storage_err("org_id", e))?,
                    request_id: row
                        .try_get("request_id")
                        .map_err(|e| storage_err("request_id", e))?,
                    user_id: row
                        .try_get("user_id")
                        .map_err(|e| storage_err("user_id", e))?,
                    extractor_name: row
                        .try_get("extractor_name")
                        .map_err(|e| storage_err("extractor_name", e))?,
                    added: from_json(&added)?,
                    removed: from_json(&removed)?,
                    mentioned: from_json(&mentioned)?,
                    created_at: from_epoch(
                        row.try_get("created_at")
                            .map_err(|e| storage_err("created_at", e))?,
                    ),
                })
            })
            .collect()
    }
}
