//! API-key authentication
//!
//! Keys are stored as SHA-256 hashes and resolve to an `org_id`; a key can
//! never reach another tenant's rows because every repository call takes
//! the resolved org. Organization creation is gated by an invitation code
//! from the service settings.

use engram_core::OrgRepository;
use engram_types::{new_id, EngramError, OrgId, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Hex SHA-256 of an API key, the only form that touches storage
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub struct ApiKeyAuthenticator {
    orgs: Arc<dyn OrgRepository>,
    invitation_codes: Vec<String>,
}

impl ApiKeyAuthenticator {
    pub fn new(orgs: Arc<dyn OrgRepository>, invitation_codes: Vec<String>) -> Self {
        Self {
            orgs,
            invitation_codes,
        }
    }

    /// Resolve an API key to its organization
    pub async fn authenticate(&self, api_key: &str) -> Result<OrgId> {
        if api_key.is_empty() {
            return Err(EngramError::Auth("missing API key".to_string()));
        }
        self.orgs
            .org_for_key_hash(&hash_api_key(api_key))
            .await?
            .ok_or_else(|| EngramError::Auth("unknown API key".to_string()))
    }

    /// Create a new organization behind the invitation gate; the plaintext
    /// key is returned exactly once
    pub async fn create_org(&self, invitation_code: &str, name: &str) -> Result<(OrgId, String)> {
        if !self.invitation_codes.iter().any(|c| c == invitation_code) {
            return Err(EngramError::Auth("invalid invitation code".to_string()));
        }
        if name.is_empty() {
            return Err(EngramError::InvalidInput(
                "organization name cannot be empty".to_string(),
            ));
        }

        let org_id = new_id().to_string();
        let api_key = format!("egk_{}", new_id().simple());
        self.orgs
            .create_org(&org_id, name, &hash_api_key(&api_key))
            .await?;
        Ok((org_id, api_key))
    }
}
