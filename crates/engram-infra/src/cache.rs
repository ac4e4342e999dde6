//! Per-tenant configuration cache
//!
//! Tenant configs are read on every trigger evaluation; this cache keeps
//! them in memory and is invalidated on any config write for that tenant.
//! Callers may bypass it with `force_refresh`.

use engram_core::ConfigRepository;
use engram_types::{OrgId, Result, TenantConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct TenantConfigCache {
    inner: RwLock<HashMap<OrgId, Arc<TenantConfig>>>,
}

impl TenantConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the tenant's config, reading through to the store on a miss or
    /// when `force_refresh` is set
    pub async fn get(
        &self,
        org_id: &str,
        repo: &dyn ConfigRepository,
        force_refresh: bool,
    ) -> Result<Option<Arc<TenantConfig>>> {
        if !force_refresh {
            if let Some(cached) = self.inner.read().await.get(org_id) {
                return Ok(Some(Arc::clone(cached)));
            }
        }

        let Some(config) = repo.get_config(org_id).await? else {
            return Ok(None);
        };
        let config = Arc::new(config);
        self.inner
            .write()
            .await
            .insert(org_id.to_string(), Arc::clone(&config));
        Ok(Some(config))
    }

    /// Drop the tenant's cached config after any write to its rows
    pub async fn invalidate(&self, org_id: &str) {
        self.inner.write().await.remove(org_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::EngramError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRepo {
        loads: AtomicUsize,
        config: Option<TenantConfig>,
    }

    #[async_trait::async_trait]
    impl ConfigRepository for CountingRepo {
        async fn get_config(&self, _org_id: &str) -> Result<Option<TenantConfig>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.config.clone())
        }

        async fn set_config(&self, _org_id: &str, _config: &TenantConfig) -> Result<()> {
            Err(EngramError::Other("read-only test repo".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_reads_through_once() {
        let repo = CountingRepo {
            loads: AtomicUsize::new(0),
            config: Some(TenantConfig::default()),
        };
        let cache = TenantConfigCache::new();

        assert!(cache.get("org", &repo, false).await.unwrap().is_some());
        assert!(cache.get("org", &repo, false).await.unwrap().is_some());
        assert_eq!(repo.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let repo = CountingRepo {
            loads: AtomicUsize::new(0),
            config: Some(TenantConfig::default()),
        };
        let cache = TenantConfigCache::new();

        cache.get("org", &repo, false).await.unwrap();
        cache.get("org", &repo, true).await.unwrap();
        assert_eq!(repo.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_drops_entry() {
        let repo = CountingRepo {
            loads: AtomicUsize::new(0),
            config: Some(TenantConfig::default()),
        };
        let cache = TenantConfigCache::new();

        cache.get("org", &repo, false).await.unwrap();
        cache.invalidate("org").await;
        cache.get("org", &repo, false).await.unwrap();
        assert_eq!(repo.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_config_is_not_cached() {
        let repo = CountingRepo {
            loads: AtomicUsize::new(0),
            config: None,
        };
        let cache = TenantConfigCache::new();

        assert!(cache.get("org", &repo, false).await.unwrap().is_none());
        assert!(cache.get("org", &repo, false).await.unwrap().is_none());
        assert_eq!(repo.loads.load(Ordering::SeqCst), 2);
    }
}
