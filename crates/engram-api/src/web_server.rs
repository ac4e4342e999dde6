//! HTTP surface
//!
//! A thin axum layer over the service facade. Every tenant operation reads
//! the `x-api-key` header, resolves it to an org, and calls one service
//! method; results and failures share the `{success, ...}` envelope with
//! the public error codes.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use engram_types::{EngramError, ErrorCode, Id, Result, SkillStatus, TenantConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::auth::ApiKeyAuthenticator;
use crate::service::*;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EngramService>,
    pub auth: Arc<ApiKeyAuthenticator>,
}

#[derive(Serialize)]
struct ApiEnvelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Auth => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => Json(ApiEnvelope {
            success: true,
            data: Some(data),
            message: None,
            code: None,
        })
        .into_response(),
        Err(err) => failure(err),
    }
}

fn failure(err: EngramError) -> Response {
    let code = err.code();
    let envelope: ApiEnvelope<()> = ApiEnvelope {
        success: false,
        data: None,
        message: Some(err.to_string()),
        code: Some(code),
    };
    (status_for(code), Json(envelope)).into_response()
}

async fn org_from_headers(state: &AppState, headers: &HeaderMap) -> Result<String> {
    let key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    state.auth.authenticate(key).await
}

macro_rules! tenant_handler {
    ($name:ident, $params:ty, $method:ident) => {
        async fn $name(
            State(state): State<AppState>,
            headers: HeaderMap,
            Json(params): Json<$params>,
        ) -> Response {
            match org_from_headers(&state, &headers).await {
                Ok(org_id) => respond(state.service.$method(&org_id, params).await),
                Err(err) => failure(err),
            }
        }
    };
}

tenant_handler!(publish_interaction, PublishInteractionParams, publish_interaction);
tenant_handler!(search_interactions, SearchInteractionsParams, search_interactions);
tenant_handler!(get_interactions, GetInteractionsParams, get_interactions);
tenant_handler!(get_requests, GetInteractionsParams, get_requests);
tenant_handler!(search_profiles, SearchProfilesParams, search_profiles);
tenant_handler!(delete_profile, DeleteProfileParams, delete_profile);
tenant_handler!(search_feedbacks, FeedbackQueryParams, search_feedbacks);
tenant_handler!(search_raw_feedbacks, FeedbackQueryParams, search_raw_feedbacks);
tenant_handler!(get_feedbacks, FeedbackQueryParams, get_feedbacks);
tenant_handler!(get_raw_feedbacks, FeedbackQueryParams, get_raw_feedbacks);
tenant_handler!(add_raw_feedback, AddRawFeedbackParams, add_raw_feedback);
tenant_handler!(rerun_profile_generation, RerunParams, rerun_profile_generation);
tenant_handler!(rerun_feedback_generation, RerunParams, rerun_feedback_generation);
tenant_handler!(manual_profile_generation, RerunParams, manual_profile_generation);
tenant_handler!(manual_feedback_generation, RerunParams, manual_feedback_generation);
tenant_handler!(get_skills, SkillQueryParams, get_skills);
tenant_handler!(
    get_success_results,
    SuccessResultsParams,
    get_agent_success_evaluation_results
);

#[derive(Deserialize)]
struct DeleteInteractionParams {
    interaction_id: i64,
}

async fn delete_interaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<DeleteInteractionParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .delete_interaction(&org_id, params.interaction_id)
                .await,
        ),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct DeleteRequestParams {
    request_id: String,
}

async fn delete_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<DeleteRequestParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.delete_request(&org_id, &params.request_id).await),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct DeleteRequestGroupParams {
    request_group: String,
}

async fn delete_request_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<DeleteRequestGroupParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .delete_request_group(&org_id, &params.request_group)
                .await,
        ),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct GetProfilesParams {
    user_id: String,
    #[serde(default)]
    status_filter: Vec<engram_types::ArtifactStatus>,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn get_profiles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<GetProfilesParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .get_profiles(&org_id, &params.user_id, params.status_filter, params.top_k)
                .await,
        ),
        Err(err) => failure(err),
    }
}

async fn get_all_profiles(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.get_all_profiles(&org_id).await),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct ChangeLogParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn get_profile_change_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<ChangeLogParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.get_profile_change_log(&org_id, params.limit).await),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct AddFeedbacksParams {
    feedbacks: Vec<AddFeedbackParams>,
}

async fn add_feedbacks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<AddFeedbacksParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.add_feedbacks(&org_id, params.feedbacks).await),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct FeedbackIdParams {
    feedback_id: Id,
}

async fn delete_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<FeedbackIdParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.delete_feedback(&org_id, params.feedback_id).await),
        Err(err) => failure(err),
    }
}

async fn delete_raw_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<FeedbackIdParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .delete_raw_feedback(&org_id, params.feedback_id)
                .await,
        ),
        Err(err) => failure(err),
    }
}

async fn approve_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<FeedbackIdParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.approve_feedback(&org_id, params.feedback_id).await),
        Err(err) => failure(err),
    }
}

async fn reject_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<FeedbackIdParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.reject_feedback(&org_id, params.feedback_id).await),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct AggregationParams {
    agent_version: String,
    feedback_name: String,
}

async fn run_feedback_aggregation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<AggregationParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .run_feedback_aggregation(&org_id, &params.agent_version, &params.feedback_name)
                .await,
        ),
        Err(err) => failure(err),
    }
}

async fn synthesize_skills(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<AggregationParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .synthesize_skills(&org_id, &params.agent_version, &params.feedback_name)
                .await,
        ),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct SkillStatusParams {
    skill_id: Id,
    skill_status: SkillStatus,
}

async fn update_skill_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<SkillStatusParams>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(
            state
                .service
                .update_skill_status(&org_id, params.skill_id, params.skill_status)
                .await,
        ),
        Err(err) => failure(err),
    }
}

async fn get_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.get_config(&org_id).await),
        Err(err) => failure(err),
    }
}

async fn set_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<TenantConfig>,
) -> Response {
    match org_from_headers(&state, &headers).await {
        Ok(org_id) => respond(state.service.set_config(&org_id, config).await),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
struct CreateOrgParams {
    invitation_code: String,
    name: String,
}

#[derive(Serialize)]
struct CreateOrgResult {
    org_id: String,
    api_key: String,
}

async fn create_org(
    State(state): State<AppState>,
    Json(params): Json<CreateOrgParams>,
) -> Response {
    let result = state
        .auth
        .create_org(&params.invitation_code, &params.name)
        .await
        .map(|(org_id, api_key)| CreateOrgResult { org_id, api_key });
    respond(result)
}

async fn health(State(state): State<AppState>) -> Response {
    respond(state.service.health().await.map(|()| "ok"))
}

/// Assemble the full operation router
pub fn build_router(service: Arc<EngramService>, auth: Arc<ApiKeyAuthenticator>) -> Router {
    let state = AppState { service, auth };
    Router::new()
        .route("/v1/orgs", post(create_org))
        .route("/v1/health", post(health))
        .route("/v1/interactions/publish", post(publish_interaction))
        .route("/v1/interactions/search", post(search_interactions))
        .route("/v1/interactions/get", post(get_interactions))
        .route("/v1/interactions/delete", post(delete_interaction))
        .route("/v1/requests/get", post(get_requests))
        .route("/v1/requests/delete", post(delete_request))
        .route("/v1/request-groups/delete", post(delete_request_group))
        .route("/v1/profiles/search", post(search_profiles))
        .route("/v1/profiles/get", post(get_profiles))
        .route("/v1/profiles/get-all", post(get_all_profiles))
        .route("/v1/profiles/delete", post(delete_profile))
        .route("/v1/profiles/change-log", post(get_profile_change_log))
        .route("/v1/profiles/rerun", post(rerun_profile_generation))
        .route("/v1/profiles/manual", post(manual_profile_generation))
        .route("/v1/feedbacks/search", post(search_feedbacks))
        .route("/v1/feedbacks/get", post(get_feedbacks))
        .route("/v1/feedbacks/add", post(add_feedbacks))
        .route("/v1/feedbacks/delete", post(delete_feedback))
        .route("/v1/feedbacks/approve", post(approve_feedback))
        .route("/v1/feedbacks/reject", post(reject_feedback))
        .route("/v1/feedbacks/rerun", post(rerun_feedback_generation))
        .route("/v1/feedbacks/manual", post(manual_feedback_generation))
        .route("/v1/feedbacks/aggregate", post(run_feedback_aggregation))
        .route("/v1/raw-feedbacks/search", post(search_raw_feedbacks))
        .route("/v1/raw-feedbacks/get", post(get_raw_feedbacks))
        .route("/v1/raw-feedbacks/add", post(add_raw_feedback))
        .route("/v1/raw-feedbacks/delete", post(delete_raw_feedback))
        .route("/v1/skills/synthesize", post(synthesize_skills))
        .route("/v1/skills/get", post(get_skills))
        .route("/v1/skills/status", post(update_skill_status))
        .route("/v1/config/get", post(get_config))
        .route("/v1/config/set", post(set_config))
        .route("/v1/success-results/get", post(get_success_results))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
