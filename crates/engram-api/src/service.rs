//! Operation-level service facade
//!
//! Implements the public operations table over the repositories and the
//! pipeline coordinator. Handlers stay thin: they authenticate, decode a
//! params struct, call one method here, and wrap the result in the
//! response envelope.

use chrono::{DateTime, Utc};
use engram_core::llm::LlmAdapter;
use engram_core::search::SearchMode;
use engram_core::*;
use engram_infra::{SqliteStore, TenantConfigCache};
use engram_learning::{ExtractionJob, PipelineCoordinator};
use engram_types::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

fn from_epoch_opt(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

#[derive(Debug, Deserialize)]
pub struct PublishInteractionParams {
    pub user_id: UserId,
    pub interactions: Vec<InteractionDraft>,
    pub source: String,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub request_group: Option<String>,
    #[serde(default)]
    pub wait_for_response: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub request_id: RequestId,
    /// False when wait-for-response timed out: tasks are scheduled but not
    /// yet complete
    pub completed: bool,
    pub scheduled_tasks: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchInteractionsParams {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub until: Option<i64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub most_recent_k: Option<usize>,
    #[serde(default)]
    pub mode: Option<SearchMode>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetInteractionsParams {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub request_group: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RequestGroupView {
    pub request_group: Option<String>,
    pub requests: Vec<Request>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchProfilesParams {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub extractor_name: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub status_filter: Vec<ArtifactStatus>,
    #[serde(default)]
    pub force_refresh: Option<bool>,
    #[serde(default)]
    pub mode: Option<SearchMode>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteProfileParams {
    pub user_id: UserId,
    #[serde(default)]
    pub profile_id: Option<Id>,
    #[serde(default)]
    pub search_query: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedbackQueryParams {
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub feedback_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub status_filter: Vec<ArtifactStatus>,
    #[serde(default)]
    pub review_status_filter: Vec<ReviewStatus>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub mode: Option<SearchMode>,
}

#[derive(Debug, Deserialize)]
pub struct AddFeedbackParams {
    pub agent_version: String,
    pub feedback_name: String,
    pub feedback_content: String,
    #[serde(default)]
    pub do_action: Option<String>,
    #[serde(default)]
    pub do_not_action: Option<String>,
    #[serde(default)]
    pub when_condition: Option<String>,
    #[serde(default)]
    pub blocking_issue: Option<BlockingIssue>,
}

#[derive(Debug, Deserialize)]
pub struct AddRawFeedbackParams {
    pub agent_version: String,
    pub feedback_name: String,
    pub request_id: RequestId,
    pub feedback_content: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub do_action: Option<String>,
    #[serde(default)]
    pub do_not_action: Option<String>,
    #[serde(default)]
    pub when_condition: Option<String>,
    #[serde(default)]
    pub blocking_issue: Option<BlockingIssue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RerunParams {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub extractor_name: Option<String>,
    #[serde(default)]
    pub feedback_name: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ScheduledResult {
    pub scheduled_tasks: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct SuccessResultsParams {
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub evaluation_name: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SkillQueryParams {
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub feedback_name: Option<String>,
    #[serde(default)]
    pub skill_status: Option<SkillStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub struct EngramService {
    interactions: Arc<dyn InteractionRepository>,
    profiles: Arc<dyn ProfileRepository>,
    raw_feedbacks: Arc<dyn RawFeedbackRepository>,
    agg_feedbacks: Arc<dyn AggregatedFeedbackRepository>,
    skills: Arc<dyn SkillRepository>,
    success: Arc<dyn SuccessRepository>,
    configs: Arc<dyn ConfigRepository>,
    store: Arc<SqliteStore>,
    cache: TenantConfigCache,
    coordinator: PipelineCoordinator,
    llm: Arc<dyn LlmAdapter>,
    settings: ServiceSettings,
}

impl EngramService {
    pub fn new(
        store: Arc<SqliteStore>,
        llm: Arc<dyn LlmAdapter>,
        settings: ServiceSettings,
    ) -> Self {
        let interactions: Arc<dyn InteractionRepository> = store.clone();
        let profiles: Arc<dyn ProfileRepository> = store.clone();
        let raw_feedbacks: Arc<dyn RawFeedbackRepository> = store.clone();
        let agg_feedbacks: Arc<dyn AggregatedFeedbackRepository> = store.clone();
        let skills: Arc<dyn SkillRepository> = store.clone();
        let success: Arc<dyn SuccessRepository> = store.clone();
        let operation_states: Arc<dyn OperationStateRepository> = store.clone();
        let configs: Arc<dyn ConfigRepository> = store.clone();

        let coordinator = PipelineCoordinator::new(
            Arc::clone(&interactions),
            Arc::clone(&profiles),
            Arc::clone(&raw_feedbacks),
            Arc::clone(&agg_feedbacks),
            Arc::clone(&skills),
            Arc::clone(&success),
            operation_states,
            Arc::clone(&llm),
            engram_learning::CoordinatorSettings {
                tenant_worker_pool_size: settings.tenant_worker_pool_size,
                llm_concurrency_limit: settings.llm_concurrency_limit,
                ..engram_learning::CoordinatorSettings::default()
            },
        );

        Self {
            interactions,
            profiles,
            raw_feedbacks,
            agg_feedbacks,
            skills,
            success,
            configs,
            store,
            cache: TenantConfigCache::new(),
            coordinator,
            llm,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    async fn tenant_config(&self, org_id: &str, force_refresh: bool) -> Result<Arc<TenantConfig>> {
        Ok(self
            .cache
            .get(org_id, self.configs.as_ref(), force_refresh)
            .await?
            .unwrap_or_default())
    }

    async fn query_embedding(&self, tenant: &TenantConfig, query: &str) -> Result<Vec<f32>> {
        self.llm
            .embed(&tenant.llm_config.embedding_model_name, query)
            .await
    }

    fn search_request(
        &self,
        query: &str,
        embedding: Vec<f32>,
        top_k: Option<usize>,
        threshold: Option<f64>,
        mode: Option<SearchMode>,
    ) -> SearchRequest {
        SearchRequest {
            query_text: query.to_string(),
            query_embedding: embedding,
            k: top_k.unwrap_or(10),
            threshold: threshold.unwrap_or(0.0),
            mode: mode.unwrap_or_default(),
            ..SearchRequest::default()
        }
    }

    // -----------------------------------------------------------------
    // Interactions
    // -----------------------------------------------------------------

    pub async fn publish_interaction(
        &self,
        org_id: &str,
        params: PublishInteractionParams,
    ) -> Result<PublishResult> {
        if params.user_id.is_empty() {
            return Err(EngramError::InvalidInput("user_id cannot be empty".to_string()));
        }
        if params.interactions.is_empty() {
            return Err(EngramError::InvalidInput(
                "interactions cannot be empty".to_string(),
            ));
        }
        if params.source.is_empty() {
            return Err(EngramError::InvalidInput("source cannot be empty".to_string()));
        }

        let tenant = self.tenant_config(org_id, false).await?;
        let now = current_timestamp();
        let request = Request {
            org_id: org_id.to_string(),
            request_id: new_id().to_string(),
            user_id: params.user_id.clone(),
            source: params.source.clone(),
            agent_version: params.agent_version.unwrap_or_default(),
            request_group: normalize_request_group(params.request_group),
            created_at: now,
        };

        let mut rows = Vec::with_capacity(params.interactions.len());
        for draft in params.interactions {
            let embedding = self.query_embedding(&tenant, &draft.content).await?;
            rows.push(Interaction {
                org_id: org_id.to_string(),
                interaction_id: 0,
                request_id: request.request_id.clone(),
                user_id: params.user_id.clone(),
                role: draft.role,
                content: draft.content,
                shadow_content: draft.shadow_content,
                user_action: draft.user_action,
                user_action_description: draft.user_action_description,
                interacted_image_url: draft.interacted_image_url,
                image_encoding: draft.image_encoding,
                tools_used: draft.tools_used,
                embedding,
                deleted: false,
                created_at: now,
            });
        }

        self.interactions.publish(&request, rows).await?;
        info!(request_id = %request.request_id, "request published");

        let handles = self
            .coordinator
            .on_interaction_write(org_id, Arc::clone(&tenant), &request)
            .await;
        let scheduled_tasks = handles.len();

        let completed = if params.wait_for_response.unwrap_or(false) {
            let deadline = std::time::Duration::from_secs(self.settings.wait_for_response_seconds);
            tokio::time::timeout(deadline, futures::future::join_all(handles))
                .await
                .is_ok()
        } else {
            false
        };

        Ok(PublishResult {
            request_id: request.request_id,
            completed,
            scheduled_tasks,
        })
    }

    pub async fn search_interactions(
        &self,
        org_id: &str,
        params: SearchInteractionsParams,
    ) -> Result<Vec<Scored<Interaction>>> {
        let filter = InteractionFilter {
            user_id: params.user_id,
            since: from_epoch_opt(params.since),
            until: from_epoch_opt(params.until),
            ..InteractionFilter::default()
        };

        match params.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => {
                let tenant = self.tenant_config(org_id, false).await?;
                let embedding = self.query_embedding(&tenant, query).await?;
                let request =
                    self.search_request(query, embedding, params.top_k, None, params.mode);
                self.interactions.search(org_id, &request, &filter).await
            }
            None => {
                let limit = params.most_recent_k.or(params.top_k).unwrap_or(10);
                let interactions = self
                    .interactions
                    .list_interactions(org_id, &filter, Some(limit), false)
                    .await?;
                Ok(interactions
                    .into_iter()
                    .map(|item| Scored { item, score: 0.0 })
                    .collect())
            }
        }
    }

    pub async fn get_interactions(
        &self,
        org_id: &str,
        params: GetInteractionsParams,
    ) -> Result<Vec<Interaction>> {
        let filter = InteractionFilter {
            user_id: params.user_id,
            request_id: params.request_id,
            request_group: normalize_request_group(params.request_group),
            sources: params.sources,
            ..InteractionFilter::default()
        };
        self.interactions
            .list_interactions(org_id, &filter, params.top_k, false)
            .await
    }

    pub async fn get_requests(
        &self,
        org_id: &str,
        params: GetInteractionsParams,
    ) -> Result<Vec<RequestGroupView>> {
        let filter = InteractionFilter {
            user_id: params.user_id,
            request_id: params.request_id,
            request_group: normalize_request_group(params.request_group),
            sources: params.sources,
            ..InteractionFilter::default()
        };
        let requests = self
            .interactions
            .list_requests(org_id, &filter, params.top_k)
            .await?;

        let mut groups: Vec<RequestGroupView> = Vec::new();
        for request in requests {
            let group = normalize_request_group(request.request_group.clone());
            match groups.iter_mut().find(|g| g.request_group == group) {
                Some(view) => view.requests.push(request),
                None => groups.push(RequestGroupView {
                    request_group: group,
                    requests: vec![request],
                }),
            }
        }
        Ok(groups)
    }

    pub async fn delete_interaction(&self, org_id: &str, interaction_id: InteractionId) -> Result<u64> {
        self.interactions.delete_interaction(org_id, interaction_id).await
    }

    pub async fn delete_request(&self, org_id: &str, request_id: &str) -> Result<u64> {
        self.interactions.delete_request(org_id, request_id).await
    }

    pub async fn delete_request_group(&self, org_id: &str, request_group: &str) -> Result<u64> {
        self.interactions
            .delete_request_group(org_id, request_group)
            .await
    }

    // -----------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------

    pub async fn search_profiles(
        &self,
        org_id: &str,
        params: SearchProfilesParams,
    ) -> Result<Vec<Scored<Profile>>> {
        let filter = ProfileFilter {
            user_id: params.user_id.clone(),
            extractor_name: params.extractor_name.clone(),
            statuses: params.status_filter.clone(),
            ..ProfileFilter::default()
        };

        match params.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => {
                let tenant = self
                    .tenant_config(org_id, params.force_refresh.unwrap_or(false))
                    .await?;
                let embedding = self.query_embedding(&tenant, query).await?;
                let request = self.search_request(
                    query,
                    embedding,
                    params.top_k,
                    params.threshold,
                    params.mode,
                );
                self.profiles.search(org_id, &request, &filter).await
            }
            None => Ok(self
                .profiles
                .list(org_id, &filter, params.top_k)
                .await?
                .into_iter()
                .map(|item| Scored { item, score: 0.0 })
                .collect()),
        }
    }

    pub async fn get_profiles(
        &self,
        org_id: &str,
        user_id: &str,
        status_filter: Vec<ArtifactStatus>,
        top_k: Option<usize>,
    ) -> Result<Vec<Profile>> {
        let filter = ProfileFilter {
            user_id: Some(user_id.to_string()),
            statuses: status_filter,
            ..ProfileFilter::default()
        };
        self.profiles.list(org_id, &filter, top_k).await
    }

    pub async fn get_all_profiles(&self, org_id: &str) -> Result<Vec<Profile>> {
        self.profiles
            .list(org_id, &ProfileFilter::default(), None)
            .await
    }

    pub async fn delete_profile(&self, org_id: &str, params: DeleteProfileParams) -> Result<Vec<Id>> {
        let target = match (params.profile_id, params.search_query) {
            (Some(id), _) => Some(id),
            (None, Some(query)) if !query.is_empty() => {
                let tenant = self.tenant_config(org_id, false).await?;
                let embedding = self.query_embedding(&tenant, &query).await?;
                let request = self.search_request(&query, embedding, Some(1), None, None);
                let filter = ProfileFilter {
                    user_id: Some(params.user_id.clone()),
                    ..ProfileFilter::default()
                };
                self.profiles
                    .search(org_id, &request, &filter)
                    .await?
                    .first()
                    .map(|hit| hit.item.profile_id)
            }
            _ => {
                return Err(EngramError::InvalidInput(
                    "either profile_id or search_query is required".to_string(),
                ))
            }
        };

        match target {
            Some(profile_id) => {
                self.profiles
                    .update_status(org_id, profile_id, ArtifactStatus::Archived)
                    .await?;
                Ok(vec![profile_id])
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_profile_change_log(
        &self,
        org_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ProfileChangeEntry>> {
        self.profiles.change_log(org_id, limit).await
    }

    // -----------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------

    fn raw_feedback_filter(params: &FeedbackQueryParams) -> RawFeedbackFilter {
        RawFeedbackFilter {
            user_id: params.user_id.clone(),
            agent_version: params.agent_version.clone(),
            feedback_name: params.feedback_name.clone(),
            statuses: params.status_filter.clone(),
            ..RawFeedbackFilter::default()
        }
    }

    fn agg_feedback_filter(params: &FeedbackQueryParams) -> AggregatedFeedbackFilter {
        AggregatedFeedbackFilter {
            agent_version: params.agent_version.clone(),
            feedback_name: params.feedback_name.clone(),
            review_statuses: params.review_status_filter.clone(),
            statuses: params.status_filter.clone(),
        }
    }

    pub async fn search_feedbacks(
        &self,
        org_id: &str,
        params: FeedbackQueryParams,
    ) -> Result<Vec<Scored<AggregatedFeedback>>> {
        let filter = Self::agg_feedback_filter(&params);
        match params.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => {
                let tenant = self.tenant_config(org_id, false).await?;
                let embedding = self.query_embedding(&tenant, query).await?;
                let request =
                    self.search_request(query, embedding, params.top_k, None, params.mode);
                self.agg_feedbacks.search(org_id, &request, &filter).await
            }
            None => Ok(self
                .agg_feedbacks
                .list(org_id, &filter, params.top_k)
                .await?
                .into_iter()
                .map(|item| Scored { item, score: 0.0 })
                .collect()),
        }
    }

    pub async fn search_raw_feedbacks(
        &self,
        org_id: &str,
        params: FeedbackQueryParams,
    ) -> Result<Vec<Scored<RawFeedback>>> {
        let filter = Self::raw_feedback_filter(&params);
        match params.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => {
                let tenant = self.tenant_config(org_id, false).await?;
                let embedding = self.query_embedding(&tenant, query).await?;
                let request =
                    self.search_request(query, embedding, params.top_k, None, params.mode);
                self.raw_feedbacks.search(org_id, &request, &filter).await
            }
            None => Ok(self
                .raw_feedbacks
                .list(org_id, &filter, params.top_k)
                .await?
                .into_iter()
                .map(|item| Scored { item, score: 0.0 })
                .collect()),
        }
    }

    pub async fn get_feedbacks(
        &self,
        org_id: &str,
        params: FeedbackQueryParams,
    ) -> Result<Vec<AggregatedFeedback>> {
        let filter = Self::agg_feedback_filter(&params);
        self.agg_feedbacks.list(org_id, &filter, params.top_k).await
    }

    pub async fn get_raw_feedbacks(
        &self,
        org_id: &str,
        params: FeedbackQueryParams,
    ) -> Result<Vec<RawFeedback>> {
        let filter = Self::raw_feedback_filter(&params);
        self.raw_feedbacks.list(org_id, &filter, params.top_k).await
    }

    /// Hand-added consolidated rules enter the store already approved
    pub async fn add_feedbacks(
        &self,
        org_id: &str,
        items: Vec<AddFeedbackParams>,
    ) -> Result<Vec<Id>> {
        if items.is_empty() {
            return Err(EngramError::InvalidInput("no feedbacks given".to_string()));
        }
        let tenant = self.tenant_config(org_id, false).await?;

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let indexed = item
                .when_condition
                .clone()
                .unwrap_or_else(|| item.feedback_content.clone());
            let embedding = self.query_embedding(&tenant, &indexed).await?;
            rows.push(AggregatedFeedback {
                feedback_id: new_id(),
                org_id: org_id.to_string(),
                agent_version: item.agent_version,
                feedback_name: item.feedback_name,
                feedback_content: item.feedback_content,
                do_action: item.do_action,
                do_not_action: item.do_not_action,
                when_condition: item.when_condition,
                blocking_issue: item.blocking_issue,
                feedback_status: ReviewStatus::Approved,
                feedback_metadata: FeedbackMetadata {
                    raw_feedback_ids: Vec::new(),
                    cluster_size: 0,
                    centroid: Vec::new(),
                },
                status: ArtifactStatus::Current,
                embedding,
                created_at: current_timestamp(),
            });
        }

        let ids = rows.iter().map(|r| r.feedback_id).collect();
        self.agg_feedbacks.insert(&rows).await?;
        Ok(ids)
    }

    pub async fn add_raw_feedback(&self, org_id: &str, params: AddRawFeedbackParams) -> Result<Id> {
        let tenant = self.tenant_config(org_id, false).await?;
        let indexed = params
            .when_condition
            .clone()
            .unwrap_or_else(|| params.feedback_content.clone());
        let embedding = self.query_embedding(&tenant, &indexed).await?;

        let row = RawFeedback {
            raw_feedback_id: new_id(),
            org_id: org_id.to_string(),
            user_id: params.user_id,
            agent_version: params.agent_version,
            request_id: params.request_id,
            source: params.source,
            feedback_name: params.feedback_name,
            feedback_content: params.feedback_content,
            do_action: params.do_action,
            do_not_action: params.do_not_action,
            when_condition: params.when_condition,
            blocking_issue: params.blocking_issue,
            status: ArtifactStatus::Current,
            embedding,
            created_at: current_timestamp(),
        };
        let id = row.raw_feedback_id;
        self.raw_feedbacks.insert(&[row]).await?;
        Ok(id)
    }

    pub async fn delete_feedback(&self, org_id: &str, feedback_id: Id) -> Result<u64> {
        self.agg_feedbacks.delete(org_id, feedback_id).await
    }

    pub async fn delete_raw_feedback(&self, org_id: &str, raw_feedback_id: Id) -> Result<u64> {
        self.raw_feedbacks.delete(org_id, raw_feedback_id).await
    }

    pub async fn approve_feedback(&self, org_id: &str, feedback_id: Id) -> Result<()> {
        self.agg_feedbacks
            .update_review_status(org_id, feedback_id, ReviewStatus::Approved)
            .await
    }

    pub async fn reject_feedback(&self, org_id: &str, feedback_id: Id) -> Result<()> {
        self.agg_feedbacks
            .update_review_status(org_id, feedback_id, ReviewStatus::Rejected)
            .await
    }

    // -----------------------------------------------------------------
    // Rerun / manual / aggregation triggers
    // -----------------------------------------------------------------

    /// Re-extract all matching history; outputs land with `pending` status
    pub async fn rerun_profile_generation(
        &self,
        org_id: &str,
        params: RerunParams,
    ) -> Result<ScheduledResult> {
        let tenant = self.tenant_config(org_id, false).await?;
        let windows = self.coordinator.window_service();

        let users = match &params.user_id {
            Some(user) => vec![user.clone()],
            None => {
                let filter = InteractionFilter {
                    sources: params.sources.clone(),
                    ..InteractionFilter::default()
                };
                windows.distinct_users(org_id, &filter).await?
            }
        };

        let mut scheduled = 0;
        for config in &tenant.profile_extractor_configs {
            if let Some(only) = &params.extractor_name {
                if only != &config.extractor_name {
                    continue;
                }
            }
            for user in &users {
                let job = ExtractionJob::Profile {
                    extractor_name: config.extractor_name.clone(),
                    user_id: user.clone(),
                    mode: WindowMode::Rerun,
                };
                if self
                    .coordinator
                    .schedule(org_id, Arc::clone(&tenant), "rerun", job)
                    .await
                    .is_some()
                {
                    scheduled += 1;
                }
            }
        }
        Ok(ScheduledResult {
            scheduled_tasks: scheduled,
        })
    }

    pub async fn rerun_feedback_generation(
        &self,
        org_id: &str,
        params: RerunParams,
    ) -> Result<ScheduledResult> {
        let tenant = self.tenant_config(org_id, false).await?;
        let windows = self.coordinator.window_service();

        let versions = match &params.agent_version {
            Some(version) => vec![version.clone()],
            None => {
                let filter = InteractionFilter {
                    sources: params.sources.clone(),
                    ..InteractionFilter::default()
                };
                windows.distinct_agent_versions(org_id, &filter).await?
            }
        };

        let mut scheduled = 0;
        for config in &tenant.agent_feedback_configs {
            if let Some(only) = &params.feedback_name {
                if only != &config.feedback_name {
                    continue;
                }
            }
            for version in &versions {
                let job = ExtractionJob::Feedback {
                    feedback_name: config.feedback_name.clone(),
                    agent_version: version.clone(),
                    mode: WindowMode::Rerun,
                };
                if self
                    .coordinator
                    .schedule(org_id, Arc::clone(&tenant), "rerun", job)
                    .await
                    .is_some()
                {
                    scheduled += 1;
                }
            }
        }
        Ok(ScheduledResult {
            scheduled_tasks: scheduled,
        })
    }

    /// Single-window regeneration; always fire-and-forget, outputs `current`
    pub async fn manual_profile_generation(
        &self,
        org_id: &str,
        params: RerunParams,
    ) -> Result<ScheduledResult> {
        let user_id = params.user_id.clone().ok_or_else(|| {
            EngramError::InvalidInput("user_id is required for manual generation".to_string())
        })?;
        let tenant = self.tenant_config(org_id, false).await?;

        let mut scheduled = 0;
        for config in &tenant.profile_extractor_configs {
            if let Some(only) = &params.extractor_name {
                if only != &config.extractor_name {
                    continue;
                }
            }
            let job = ExtractionJob::Profile {
                extractor_name: config.extractor_name.clone(),
                user_id: user_id.clone(),
                mode: WindowMode::Manual,
            };
            if self
                .coordinator
                .schedule(org_id, Arc::clone(&tenant), "manual", job)
                .await
                .is_some()
            {
                scheduled += 1;
            }
        }
        Ok(ScheduledResult {
            scheduled_tasks: scheduled,
        })
    }

    pub async fn manual_feedback_generation(
        &self,
        org_id: &str,
        params: RerunParams,
    ) -> Result<ScheduledResult> {
        let agent_version = params.agent_version.clone().unwrap_or_default();
        let tenant = self.tenant_config(org_id, false).await?;

        let mut scheduled = 0;
        for config in &tenant.agent_feedback_configs {
            if let Some(only) = &params.feedback_name {
                if only != &config.feedback_name {
                    continue;
                }
            }
            let job = ExtractionJob::Feedback {
                feedback_name: config.feedback_name.clone(),
                agent_version: agent_version.clone(),
                mode: WindowMode::Manual,
            };
            if self
                .coordinator
                .schedule(org_id, Arc::clone(&tenant), "manual", job)
                .await
                .is_some()
            {
                scheduled += 1;
            }
        }
        Ok(ScheduledResult {
            scheduled_tasks: scheduled,
        })
    }

    /// Force an aggregation pass for one pair, bypassing the counter
    pub async fn run_feedback_aggregation(
        &self,
        org_id: &str,
        agent_version: &str,
        feedback_name: &str,
    ) -> Result<ScheduledResult> {
        let tenant = self.tenant_config(org_id, false).await?;
        let job = ExtractionJob::Aggregation {
            feedback_name: feedback_name.to_string(),
            agent_version: agent_version.to_string(),
        };
        let scheduled = self
            .coordinator
            .schedule(org_id, tenant, "aggregation", job)
            .await
            .is_some();
        Ok(ScheduledResult {
            scheduled_tasks: scheduled as usize,
        })
    }

    // -----------------------------------------------------------------
    // Skills
    // -----------------------------------------------------------------

    pub async fn synthesize_skills(
        &self,
        org_id: &str,
        agent_version: &str,
        feedback_name: &str,
    ) -> Result<ScheduledResult> {
        let tenant = self.tenant_config(org_id, false).await?;
        let job = ExtractionJob::Skills {
            feedback_name: feedback_name.to_string(),
            agent_version: agent_version.to_string(),
        };
        let scheduled = self
            .coordinator
            .schedule(org_id, tenant, "skills", job)
            .await
            .is_some();
        Ok(ScheduledResult {
            scheduled_tasks: scheduled as usize,
        })
    }

    pub async fn get_skills(&self, org_id: &str, params: SkillQueryParams) -> Result<Vec<Skill>> {
        let filter = SkillFilter {
            agent_version: params.agent_version,
            feedback_name: params.feedback_name,
            skill_status: params.skill_status,
        };
        self.skills.list(org_id, &filter, params.limit).await
    }

    pub async fn update_skill_status(
        &self,
        org_id: &str,
        skill_id: Id,
        status: SkillStatus,
    ) -> Result<()> {
        self.skills.update_skill_status(org_id, skill_id, status).await
    }

    // -----------------------------------------------------------------
    // Config & results
    // -----------------------------------------------------------------

    pub async fn get_config(&self, org_id: &str) -> Result<TenantConfig> {
        Ok(self.tenant_config(org_id, true).await?.as_ref().clone())
    }

    pub async fn set_config(&self, org_id: &str, config: TenantConfig) -> Result<()> {
        self.configs.set_config(org_id, &config).await?;
        self.cache.invalidate(org_id).await;
        Ok(())
    }

    pub async fn get_agent_success_evaluation_results(
        &self,
        org_id: &str,
        params: SuccessResultsParams,
    ) -> Result<Vec<SuccessEvaluation>> {
        let filter = SuccessFilter {
            evaluation_name: params.evaluation_name,
            agent_version: params.agent_version,
            ..SuccessFilter::default()
        };
        self.success.list(org_id, &filter, params.limit).await
    }

    pub async fn health(&self) -> Result<()> {
        self.store.health_check().await
    }
}
