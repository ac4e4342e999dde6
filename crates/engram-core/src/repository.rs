//! Repository traits (ports) for the artifact store
//!
//! These abstractions define the storage contract without any I/O
//! dependencies; `engram-infra` provides the SQLite implementations. Every
//! method takes the tenant's `org_id` explicitly and must never expose
//! another tenant's rows, whatever identifiers the caller crafts.

use crate::models::*;
use crate::search::SearchMode;
use chrono::{DateTime, Utc};
use engram_types::*;

/// A hybrid-search request against one collection
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: String,
    pub query_embedding: Vec<f32>,
    pub k: usize,
    /// Minimum cosine similarity for the vector arm (ignored in `fts` mode)
    pub threshold: f64,
    pub mode: SearchMode,
    pub rrf_k: f64,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query_text: String::new(),
            query_embedding: Vec::new(),
            k: 10,
            threshold: 0.0,
            mode: SearchMode::Hybrid,
            rrf_k: crate::search::RRF_K,
        }
    }
}

/// A record with its combined search score
#[derive(Debug, Clone, serde::Serialize)]
pub struct Scored<T> {
    pub item: T,
    pub score: f64,
}

/// Row predicate for interaction and request reads
#[derive(Debug, Clone, Default)]
pub struct InteractionFilter {
    pub user_id: Option<UserId>,
    pub request_id: Option<RequestId>,
    pub request_group: Option<String>,
    /// Empty means all sources
    pub sources: Vec<String>,
    pub agent_version: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Row predicate for profile reads
#[derive(Debug, Clone, Default)]
pub struct ProfileFilter {
    pub user_id: Option<UserId>,
    pub extractor_name: Option<String>,
    pub source: Option<String>,
    /// Empty means the default visibility: `current` only
    pub statuses: Vec<ArtifactStatus>,
    pub include_expired: bool,
}

/// Row predicate for raw feedback reads
#[derive(Debug, Clone, Default)]
pub struct RawFeedbackFilter {
    pub user_id: Option<UserId>,
    pub agent_version: Option<String>,
    pub feedback_name: Option<String>,
    pub source: Option<String>,
    /// Empty means `current` only
    pub statuses: Vec<ArtifactStatus>,
}

/// Row predicate for aggregated feedback reads
#[derive(Debug, Clone, Default)]
pub struct AggregatedFeedbackFilter {
    pub agent_version: Option<String>,
    pub feedback_name: Option<String>,
    /// Empty means the default visibility: `approved` only
    pub review_statuses: Vec<ReviewStatus>,
    /// Empty means `current` only
    pub statuses: Vec<ArtifactStatus>,
}

/// Row predicate for skill reads
#[derive(Debug, Clone, Default)]
pub struct SkillFilter {
    pub agent_version: Option<String>,
    pub feedback_name: Option<String>,
    pub skill_status: Option<SkillStatus>,
}

/// Row predicate for success evaluation reads
#[derive(Debug, Clone, Default)]
pub struct SuccessFilter {
    pub evaluation_name: Option<String>,
    pub agent_version: Option<String>,
    pub request_id: Option<RequestId>,
}

/// Requests and their interactions
#[async_trait::async_trait]
pub trait InteractionRepository: Send + Sync {
    /// Write one request plus its interactions atomically, assigning the
    /// tenant-monotone interaction ids; returns the stored interactions
    async fn publish(
        &self,
        request: &Request,
        interactions: Vec<Interaction>,
    ) -> Result<Vec<Interaction>>;

    async fn get_request(&self, org_id: &str, request_id: &str) -> Result<Option<Request>>;

    async fn list_requests(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Request>>;

    /// Ordered by `interaction_id` descending unless `ascending`
    async fn list_interactions(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<Vec<Interaction>>;

    /// The live (non-deleted) history matching `filter`, ascending, each
    /// interaction paired with its parent request
    async fn windowed_history(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
    ) -> Result<Vec<(Interaction, Request)>>;

    /// Returns the number of rows removed
    async fn delete_interaction(&self, org_id: &str, interaction_id: InteractionId)
        -> Result<u64>;

    /// Cascades to the request's interactions; returns interactions removed
    async fn delete_request(&self, org_id: &str, request_id: &str) -> Result<u64>;

    async fn delete_request_group(&self, org_id: &str, request_group: &str) -> Result<u64>;

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &InteractionFilter,
    ) -> Result<Vec<Scored<Interaction>>>;
}

/// Derived user profiles
#[async_trait::async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn insert(&self, profiles: &[Profile]) -> Result<()>;

    async fn get(&self, org_id: &str, profile_id: Id) -> Result<Option<Profile>>;

    async fn list(
        &self,
        org_id: &str,
        filter: &ProfileFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Profile>>;

    async fn update_status(
        &self,
        org_id: &str,
        profile_id: Id,
        status: ArtifactStatus,
    ) -> Result<()>;

    /// Apply one extraction outcome atomically: archive the superseded rows
    /// and insert the replacements in a single transaction
    async fn transition(&self, org_id: &str, archive: &[Id], insert: &[Profile]) -> Result<()>;

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &ProfileFilter,
    ) -> Result<Vec<Scored<Profile>>>;

    async fn append_change_entry(&self, entry: &ProfileChangeEntry) -> Result<()>;

    async fn change_log(
        &self,
        org_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ProfileChangeEntry>>;
}

/// Raw feedback observations
#[async_trait::async_trait]
pub trait RawFeedbackRepository: Send + Sync {
    async fn insert(&self, feedbacks: &[RawFeedback]) -> Result<()>;

    async fn get(&self, org_id: &str, raw_feedback_id: Id) -> Result<Option<RawFeedback>>;

    async fn list(
        &self,
        org_id: &str,
        filter: &RawFeedbackFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RawFeedback>>;

    async fn count(&self, org_id: &str, filter: &RawFeedbackFilter) -> Result<u64>;

    async fn update_status(
        &self,
        org_id: &str,
        raw_feedback_id: Id,
        status: ArtifactStatus,
    ) -> Result<()>;

    async fn delete(&self, org_id: &str, raw_feedback_id: Id) -> Result<u64>;

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &RawFeedbackFilter,
    ) -> Result<Vec<Scored<RawFeedback>>>;
}

/// Consolidated feedback rules
#[async_trait::async_trait]
pub trait AggregatedFeedbackRepository: Send + Sync {
    async fn insert(&self, feedbacks: &[AggregatedFeedback]) -> Result<()>;

    async fn get(&self, org_id: &str, feedback_id: Id) -> Result<Option<AggregatedFeedback>>;

    async fn list(
        &self,
        org_id: &str,
        filter: &AggregatedFeedbackFilter,
        limit: Option<usize>,
    ) -> Result<Vec<AggregatedFeedback>>;

    async fn update_status(
        &self,
        org_id: &str,
        feedback_id: Id,
        status: ArtifactStatus,
    ) -> Result<()>;

    async fn update_review_status(
        &self,
        org_id: &str,
        feedback_id: Id,
        review: ReviewStatus,
    ) -> Result<()>;

    /// Refresh provenance without touching the rule text (idempotent
    /// re-cluster path)
    async fn update_metadata(
        &self,
        org_id: &str,
        feedback_id: Id,
        metadata: &FeedbackMetadata,
    ) -> Result<()>;

    async fn delete(&self, org_id: &str, feedback_id: Id) -> Result<u64>;

    async fn search(
        &self,
        org_id: &str,
        request: &SearchRequest,
        filter: &AggregatedFeedbackFilter,
    ) -> Result<Vec<Scored<AggregatedFeedback>>>;
}

/// Synthesized skills
#[async_trait::async_trait]
pub trait SkillRepository: Send + Sync {
    async fn insert(&self, skills: &[Skill]) -> Result<()>;

    async fn get(&self, org_id: &str, skill_id: Id) -> Result<Option<Skill>>;

    async fn list(
        &self,
        org_id: &str,
        filter: &SkillFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Skill>>;

    async fn update_skill_status(
        &self,
        org_id: &str,
        skill_id: Id,
        status: SkillStatus,
    ) -> Result<()>;
}

/// Success evaluation results
#[async_trait::async_trait]
pub trait SuccessRepository: Send + Sync {
    async fn insert(&self, results: &[SuccessEvaluation]) -> Result<()>;

    async fn list(
        &self,
        org_id: &str,
        filter: &SuccessFilter,
        limit: Option<usize>,
    ) -> Result<Vec<SuccessEvaluation>>;
}

/// Outcome of a lock acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller owns the scope and must run now
    Acquired,
    /// Another run is in flight; the trigger was recorded as the scope's
    /// single pending follow-up
    Coalesced,
}

/// The per-scope concurrency lock
///
/// `try_acquire` succeeds when no row exists, the row is idle, or the
/// holder is stale (`started_at` older than `stale_lock_seconds`);
/// otherwise it records `request_id` as the pending follow-up. `finish`
/// atomically either releases the scope or hands it to the pending request.
#[async_trait::async_trait]
pub trait OperationStateRepository: Send + Sync {
    async fn try_acquire(
        &self,
        org_id: &str,
        service_name: &str,
        request_id: &str,
        stale_lock_seconds: i64,
    ) -> Result<AcquireOutcome>;

    /// Complete the current run; returns the coalesced pending request id
    /// if one arrived, in which case the scope stays held by the caller
    async fn finish(&self, org_id: &str, service_name: &str) -> Result<Option<RequestId>>;

    /// Drop the lock row outright (fatal-error path)
    async fn clear(&self, org_id: &str, service_name: &str) -> Result<()>;

    async fn get(&self, org_id: &str, service_name: &str) -> Result<Option<OperationState>>;
}

/// Per-tenant behavioral configuration storage
#[async_trait::async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get_config(&self, org_id: &str) -> Result<Option<TenantConfig>>;

    /// Replaces the tenant's config atomically
    async fn set_config(&self, org_id: &str, config: &TenantConfig) -> Result<()>;
}

/// Organization registry keyed by hashed API keys
#[async_trait::async_trait]
pub trait OrgRepository: Send + Sync {
    async fn create_org(&self, org_id: &str, name: &str, api_key_hash: &str) -> Result<()>;

    async fn org_for_key_hash(&self, api_key_hash: &str) -> Result<Option<OrgId>>;
}
