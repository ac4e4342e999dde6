//! End-to-end service tests: publish → extract → read back

mod support;

use engram_api::auth::hash_api_key;
use engram_api::{ApiKeyAuthenticator, EngramService};
use engram_core::*;
use engram_infra::SqliteStore;
use engram_types::*;
use serde_json::json;
use std::sync::Arc;
use support::StaticLlm;

struct Fixture {
    store: Arc<SqliteStore>,
    llm: Arc<StaticLlm>,
    service: EngramService,
}

async fn fixture() -> Fixture {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let llm = Arc::new(StaticLlm::new());
    let service = EngramService::new(
        store.clone(),
        llm.clone(),
        ServiceSettings::default(),
    );
    Fixture {
        store,
        llm,
        service,
    }
}

fn profile_config() -> TenantConfig {
    TenantConfig {
        profile_extractor_configs: vec![ProfileExtractorConfig {
            extractor_name: "preferences".to_string(),
            profile_content_definition_prompt: "extract user preferences".to_string(),
            context_prompt: None,
            metadata_definition_prompt: None,
            should_extract_profile_prompt_override: None,
            manual_trigger: false,
            request_sources_enabled: Some(vec!["chat".to_string()]),
            window: WindowOverrides {
                extraction_window_size_override: Some(1),
                extraction_window_stride_override: Some(1),
            },
            profile_ttl: ProfileTtl::Infinity,
        }],
        ..TenantConfig::default()
    }
}

fn publish_params(user: &str, contents: &[&str]) -> engram_api::service::PublishInteractionParams {
    serde_json::from_value(json!({
        "user_id": user,
        "source": "chat",
        "agent_version": "",
        "wait_for_response": true,
        "interactions": contents
            .iter()
            .map(|c| json!({"role": "User", "content": c}))
            .collect::<Vec<_>>(),
    }))
    .unwrap()
}

#[tokio::test]
async fn test_publish_then_profile_becomes_readable() {
    let fixture = fixture().await;
    fixture
        .service
        .set_config("org", profile_config())
        .await
        .unwrap();
    fixture.llm.push_response(json!({
        "items": [{"action": "add", "content": "likes blue shirts"}]
    }));

    let result = fixture
        .service
        .publish_interaction("org", publish_params("u1", &["I like blue shirts"]))
        .await
        .unwrap();
    assert!(result.completed);
    assert_eq!(result.scheduled_tasks, 1);

    let profiles = fixture
        .service
        .get_profiles("org", "u1", Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(profiles.len(), 1);
    assert!(profiles[0].content.contains("blue"));
    assert_eq!(profiles[0].status, ArtifactStatus::Current);
}

#[tokio::test]
async fn test_publish_validation_errors() {
    let fixture = fixture().await;

    let err = fixture
        .service
        .publish_interaction("org", publish_params("", &["hello"]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Validation);

    let err = fixture
        .service
        .publish_interaction("org", publish_params("u1", &[]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn test_delete_request_preserves_derived_profiles() {
    let fixture = fixture().await;
    fixture
        .service
        .set_config("org", profile_config())
        .await
        .unwrap();
    fixture.llm.push_response(json!({
        "items": [{"action": "add", "content": "writes terse bug reports"}]
    }));

    let contents = ["one", "two", "three", "four", "five terse reports"];
    let result = fixture
        .service
        .publish_interaction("org", publish_params("u1", &contents))
        .await
        .unwrap();

    let interactions = fixture
        .service
        .get_interactions(
            "org",
            engram_api::service::GetInteractionsParams {
                user_id: Some("u1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(interactions.len(), 5);

    let removed = fixture
        .service
        .delete_request("org", &result.request_id)
        .await
        .unwrap();
    assert_eq!(removed, 5);

    let interactions = fixture
        .service
        .get_interactions(
            "org",
            engram_api::service::GetInteractionsParams {
                user_id: Some("u1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(interactions.is_empty());

    // Derived artifacts are not retracted; the audit link remains
    let profiles = fixture
        .service
        .get_profiles("org", "u1", Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].generated_from_request_id, result.request_id);
}

#[tokio::test]
async fn test_config_round_trips_through_service() {
    let fixture = fixture().await;
    let config = profile_config();
    fixture.service.set_config("org", config.clone()).await.unwrap();
    assert_eq!(fixture.service.get_config("org").await.unwrap(), config);

    // An unset tenant reads server defaults
    assert_eq!(
        fixture.service.get_config("other-org").await.unwrap(),
        TenantConfig::default()
    );
}

#[tokio::test]
async fn test_tenant_isolation_through_service() {
    let fixture = fixture().await;
    fixture
        .service
        .publish_interaction("org-a", publish_params("u1", &["org a data"]))
        .await
        .unwrap();

    let other = fixture
        .service
        .get_interactions(
            "org-b",
            engram_api::service::GetInteractionsParams::default(),
        )
        .await
        .unwrap();
    assert!(other.is_empty());

    let results = fixture
        .service
        .search_interactions(
            "org-b",
            engram_api::service::SearchInteractionsParams {
                query: Some("org a data".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_search_interactions_round_trip() {
    let fixture = fixture().await;
    fixture
        .service
        .publish_interaction("org", publish_params("u1", &["I like blue shirts"]))
        .await
        .unwrap();
    fixture
        .service
        .publish_interaction("org", publish_params("u1", &["completely unrelated topic"]))
        .await
        .unwrap();

    let results = fixture
        .service
        .search_interactions(
            "org",
            engram_api::service::SearchInteractionsParams {
                user_id: Some("u1".to_string()),
                query: Some("I like blue shirts".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].item.content, "I like blue shirts");
}

#[tokio::test]
async fn test_manual_feedback_is_searchable_after_approval_default() {
    let fixture = fixture().await;
    let ids = fixture
        .service
        .add_feedbacks(
            "org",
            vec![serde_json::from_value(json!({
                "agent_version": "v1",
                "feedback_name": "formatting",
                "feedback_content": "keep summaries short",
                "when_condition": "user asks for a summary"
            }))
            .unwrap()],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    // Hand-added rules are approved, so the default read surfaces them
    let feedbacks = fixture
        .service
        .get_feedbacks("org", engram_api::service::FeedbackQueryParams::default())
        .await
        .unwrap();
    assert_eq!(feedbacks.len(), 1);
    assert_eq!(feedbacks[0].feedback_status, ReviewStatus::Approved);

    // Rejecting hides it from the default read again
    fixture
        .service
        .reject_feedback("org", feedbacks[0].feedback_id)
        .await
        .unwrap();
    let feedbacks = fixture
        .service
        .get_feedbacks("org", engram_api::service::FeedbackQueryParams::default())
        .await
        .unwrap();
    assert!(feedbacks.is_empty());
}

#[tokio::test]
async fn test_api_key_auth_and_org_creation() {
    let fixture = fixture().await;
    let orgs: Arc<dyn OrgRepository> = fixture.store.clone();
    let auth = ApiKeyAuthenticator::new(orgs, vec!["beta-code".to_string()]);

    let err = auth.create_org("wrong-code", "Acme").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Auth);

    let (org_id, api_key) = auth.create_org("beta-code", "Acme").await.unwrap();
    assert!(api_key.starts_with("egk_"));
    assert_eq!(auth.authenticate(&api_key).await.unwrap(), org_id);

    let err = auth.authenticate("egk_bogus").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Auth);

    // Only the hash is stored
    let registry: &dyn OrgRepository = fixture.store.as_ref();
    assert_eq!(
        registry
            .org_for_key_hash(&hash_api_key(&api_key))
            .await
            .unwrap()
            .as_deref(),
        Some(org_id.as_str())
    );
}

#[tokio::test]
async fn test_success_results_listing() {
    let fixture = fixture().await;
    fixture
        .service
        .set_config(
            "org",
            TenantConfig {
                agent_success_configs: vec![AgentSuccessConfig {
                    evaluation_name: "task-done".to_string(),
                    success_definition_prompt: "did the agent finish".to_string(),
                    sampling_rate: 1.0,
                    metadata_definition_prompt: None,
                    tool_can_use: None,
                    window: WindowOverrides::default(),
                }],
                ..TenantConfig::default()
            },
        )
        .await
        .unwrap();
    fixture.llm.push_response(json!({"is_success": true}));

    fixture
        .service
        .publish_interaction("org", publish_params("u1", &["do the thing"]))
        .await
        .unwrap();

    let results = fixture
        .service
        .get_agent_success_evaluation_results(
            "org",
            engram_api::service::SuccessResultsParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success);
    assert_eq!(results[0].evaluation_name, "task-done");
}
