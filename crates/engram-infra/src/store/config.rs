//! Tenant config and organization registry over SQLite

use async_trait::async_trait;
use chrono::Utc;
use engram_core::{ConfigRepository, OrgRepository};
use engram_types::{EngramError, OrgId, Result, TenantConfig};
use sqlx::Row;

use super::{from_json, storage_err, to_epoch, to_json, SqliteStore};

#[async_trait]
impl ConfigRepository for SqliteStore {
    async fn get_config(&self, org_id: &str) -> Result<Option<TenantConfig>> {
        let row = sqlx::query("SELECT config FROM org_configs WHERE org_id = ?1")
            .bind(org_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| storage_err("get config", e))?;

        row.map(|row| {
            let text: String = row.try_get("config").map_err(|e| storage_err("config", e))?;
            from_json(&text)
        })
        .transpose()
    }

    async fn set_config(&self, org_id: &str, config: &TenantConfig) -> Result<()> {
        config.validate()?;
        sqlx::query(
            "INSERT INTO org_configs (org_id, config, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT (org_id) DO UPDATE SET config = ?2, updated_at = ?3",
        )
        .bind(org_id)
        .bind(to_json(config)?)
        .bind(to_epoch(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(|e| storage_err("set config", e))?;
        Ok(())
    }
}

#[async_trait]
impl OrgRepository for SqliteStore {
    async fn create_org(&self, org_id: &str, name: &str, api_key_hash: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO orgs (org_id, name, api_key_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(org_id)
        .bind(name)
        .bind(api_key_hash)
        .bind(to_epoch(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EngramError::Conflict(format!("organization {org_id} already exists"))
            }
            other => storage_err("create org", other),
        })?;
        Ok(())
    }

    async fn org_for_key_hash(&self, api_key_hash: &str) -> Result<Option<OrgId>> {
        let row = sqlx::query("SELECT org_id FROM orgs WHERE api_key_hash = ?1")
            .bind(api_key_hash)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| storage_err("resolve api key", e))?;

        row.map(|row| {
            row.try_get::<String, _>("org_id")
                .map_err(|e| storage_err("org_id", e))
        })
        .transpose()
    }
}
