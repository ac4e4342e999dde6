//! Extraction-pipeline integration tests over in-memory SQLite and a
//! scripted LLM

mod support;

use engram_core::*;
use engram_infra::SqliteStore;
use engram_learning::{CoordinatorSettings, ExtractionJob, PipelineCoordinator, SuccessEvaluator};
use engram_types::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{request, user_interaction, StaticLlm};

struct Fixture {
    store: Arc<SqliteStore>,
    llm: Arc<StaticLlm>,
    coordinator: PipelineCoordinator,
}

async fn fixture(llm: StaticLlm) -> Fixture {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let llm = Arc::new(llm);
    let coordinator = PipelineCoordinator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        llm.clone(),
        CoordinatorSettings::default(),
    );
    Fixture {
        store,
        llm,
        coordinator,
    }
}

fn profile_tenant() -> Arc<TenantConfig> {
    Arc::new(TenantConfig {
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
    })
}

fn feedback_tenant() -> Arc<TenantConfig> {
    Arc::new(TenantConfig {
        agent_feedback_configs: vec![AgentFeedbackConfig {
            feedback_name: "formatting".to_string(),
            feedback_definition_prompt: "note formatting complaints".to_string(),
            metadata_definition_prompt: None,
            feedback_aggregator_config: FeedbackAggregatorConfig {
                min_feedback_threshold: 3,
                refresh_count: 3,
            },
            request_sources_enabled: None,
            window: WindowOverrides {
                extraction_window_size_override: Some(1),
                extraction_window_stride_override: Some(1),
            },
        }],
        ..TenantConfig::default()
    })
}

async fn publish_and_extract(
    fixture: &Fixture,
    tenant: &Arc<TenantConfig>,
    request_id: &str,
    content: &str,
) {
    let interactions: &dyn InteractionRepository = fixture.store.as_ref();
    let req = request("org", request_id, "u1", "chat");
    interactions
        .publish(&req, vec![user_interaction("org", request_id, "u1", content)])
        .await
        .unwrap();

    let handles = fixture
        .coordinator
        .on_interaction_write("org", Arc::clone(tenant), &req)
        .await;
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_basic_profile_extraction() {
    let llm = StaticLlm::new();
    llm.push_response(json!({
        "items": [{"action": "add", "content": "likes blue shirts"}]
    }));
    let fixture = fixture(llm).await;
    let tenant = profile_tenant();

    publish_and_extract(&fixture, &tenant, "r1", "I like blue shirts").await;

    let profiles: &dyn ProfileRepository = fixture.store.as_ref();
    let current = profiles
        .list(
            "org",
            &ProfileFilter {
                user_id: Some("u1".to_string()),
                ..ProfileFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert!(current[0].content.contains("blue"));
    assert_eq!(current[0].status, ArtifactStatus::Current);
    assert!(current[0].extractor_names.contains("preferences"));

    let log = profiles.change_log("org", None).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].added.len(), 1);
    assert_eq!(log[0].request_id, "r1");
}

#[tokio::test]
async fn test_source_filter_gates_profile_extraction() {
    let llm = StaticLlm::new();
    let fixture = fixture(llm).await;
    let tenant = profile_tenant();

    // The extractor listens to "chat" only; an email interaction does not
    // schedule it
    let interactions: &dyn InteractionRepository = fixture.store.as_ref();
    let req = request("org", "r1", "u1", "email");
    interactions
        .publish(&req, vec![user_interaction("org", "r1", "u1", "hello")])
        .await
        .unwrap();
    let handles = fixture
        .coordinator
        .on_interaction_write("org", Arc::clone(&tenant), &req)
        .await;
    assert!(handles.is_empty());
    assert_eq!(fixture.llm.generate_call_count(), 0);
}

#[tokio::test]
async fn test_rerun_keeps_current_and_writes_pending() {
    let llm = StaticLlm::new();
    llm.push_response(json!({
        "items": [{"action": "add", "content": "likes blue shirts"}]
    }));
    let fixture = fixture(llm).await;
    let tenant = profile_tenant();

    publish_and_extract(&fixture, &tenant, "r1", "I like blue shirts").await;

    fixture.llm.push_response(json!({
        "items": [{"action": "add", "content": "prefers navy outfits"}]
    }));
    let job = ExtractionJob::Profile {
        extractor_name: "preferences".to_string(),
        user_id: "u1".to_string(),
        mode: WindowMode::Rerun,
    };
    let handle = fixture
        .coordinator
        .schedule("org", Arc::clone(&tenant), "rerun", job)
        .await
        .expect("rerun should acquire its scope");
    handle.await.unwrap();

    let profiles: &dyn ProfileRepository = fixture.store.as_ref();
    let current = profiles
        .list("org", &ProfileFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert!(current[0].content.contains("blue"));

    let pending = profiles
        .list(
            "org",
            &ProfileFilter {
                statuses: vec![ArtifactStatus::Pending],
                ..ProfileFilter::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].content.contains("navy"));
}

#[tokio::test]
async fn test_semantic_duplicate_supersedes_current_profile() {
    let llm = StaticLlm::new();
    llm.push_response(json!({
        "items": [{"action": "add", "content": "likes blue shirts"}]
    }));
    let fixture = fixture(llm).await;
    let tenant = profile_tenant();

    publish_and_extract(&fixture, &tenant, "r1", "I like blue shirts").await;
    let profiles: &dyn ProfileRepository = fixture.store.as_ref();
    let first = profiles
        .list("org", &ProfileFilter::default(), None)
        .await
        .unwrap();
    let old_id = first[0].profile_id;

    // The same fact extracted again embeds identically and supersedes the
    // old row instead of duplicating it
    fixture.llm.push_response(json!({
        "items": [{"action": "add", "content": "likes blue shirts"}]
    }));
    publish_and_extract(&fixture, &tenant, "r2", "blue shirts again").await;

    let current = profiles
        .list("org", &ProfileFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_ne!(current[0].profile_id, old_id);

    let archived = profiles.get("org", old_id).await.unwrap().unwrap();
    assert_eq!(archived.status, ArtifactStatus::Archived);
}

#[tokio::test]
async fn test_feedback_threshold_triggers_single_aggregate() {
    let llm = StaticLlm::new();
    let fixture = fixture(llm).await;
    let tenant = feedback_tenant();

    for (idx, complaint) in [
        "answer was too verbose",
        "reply rambled on",
        "response buried the summary",
    ]
    .iter()
    .enumerate()
    {
        fixture.llm.push_response(json!({
            "items": [{
                "feedback_content": complaint,
                "when_condition": "user asks for a summary"
            }]
        }));
        if idx == 2 {
            // The third write crosses the threshold; the aggregation pass
            // will consume this consolidation answer
            fixture.llm.push_response(json!({
                "feedback_content": "keep summaries short",
                "do_action": "answer in three sentences",
                "when_condition": "user asks for a summary"
            }));
        }
        publish_and_extract(&fixture, &tenant, &format!("r{idx}"), "please summarize").await;
    }

    // Aggregation runs as a detached task; poll for its outcome
    let agg_feedbacks: &dyn AggregatedFeedbackRepository = fixture.store.as_ref();
    let filter = AggregatedFeedbackFilter {
        review_statuses: vec![ReviewStatus::Pending],
        ..AggregatedFeedbackFilter::default()
    };
    let mut aggregates = Vec::new();
    for _ in 0..200 {
        aggregates = agg_feedbacks.list("org", &filter, None).await.unwrap();
        if !aggregates.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(aggregates.len(), 1);
    let aggregate = &aggregates[0];
    assert_eq!(aggregate.feedback_status, ReviewStatus::Pending);
    assert_eq!(aggregate.feedback_metadata.cluster_size, 3);
    assert_eq!(aggregate.feedback_metadata.raw_feedback_ids.len(), 3);
    assert_eq!(
        aggregate.when_condition.as_deref(),
        Some("user asks for a summary")
    );
}

#[tokio::test]
async fn test_parallel_triggers_coalesce_to_at_most_two_runs() {
    let llm = StaticLlm::with_delay(Duration::from_millis(200));
    llm.push_response(json!({
        "items": [{"action": "add", "content": "likes blue shirts"}]
    }));
    let fixture = fixture(llm).await;
    let tenant = profile_tenant();

    let interactions: &dyn InteractionRepository = fixture.store.as_ref();
    interactions
        .publish(
            &request("org", "r1", "u1", "chat"),
            vec![user_interaction("org", "r1", "u1", "I like blue shirts")],
        )
        .await
        .unwrap();

    let job = || ExtractionJob::Profile {
        extractor_name: "preferences".to_string(),
        user_id: "u1".to_string(),
        mode: WindowMode::Incremental,
    };

    let mut handles = Vec::new();
    for idx in 0..10 {
        handles.extend(
            fixture
                .coordinator
                .schedule("org", Arc::clone(&tenant), &format!("r{idx}"), job())
                .await,
        );
    }
    // Exactly one trigger wins the scope; the rest coalesce
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await.unwrap();
    }

    // One in-flight run plus at most one coalesced follow-up
    let runs = fixture.llm.generate_call_count();
    assert!(runs >= 1 && runs <= 2, "got {runs} extraction runs");

    let states: &dyn OperationStateRepository = fixture.store.as_ref();
    let state = states
        .get("org", "profile:preferences:u1")
        .await
        .unwrap()
        .unwrap();
    assert!(!state.in_progress);
}

#[tokio::test]
async fn test_success_sampling_is_deterministic() {
    let always = AgentSuccessConfig {
        evaluation_name: "task-done".to_string(),
        success_definition_prompt: "did the agent finish".to_string(),
        sampling_rate: 1.0,
        metadata_definition_prompt: None,
        tool_can_use: None,
        window: WindowOverrides::default(),
    };
    assert!(SuccessEvaluator::sampled(&always, "r1"));

    let never = AgentSuccessConfig {
        sampling_rate: 0.0,
        ..always.clone()
    };
    assert!(!SuccessEvaluator::sampled(&never, "r1"));

    let half = AgentSuccessConfig {
        sampling_rate: 0.5,
        ..always
    };
    for idx in 0..20 {
        let request_id = format!("r{idx}");
        assert_eq!(
            SuccessEvaluator::sampled(&half, &request_id),
            SuccessEvaluator::sampled(&half, &request_id)
        );
    }
}

#[tokio::test]
async fn test_success_evaluation_persists_once_per_request() {
    let llm = StaticLlm::new();
    llm.push_response(json!({
        "is_success": false,
        "failure_type": "incomplete",
        "failure_reason": "agent never answered the question"
    }));
    let fixture = fixture(llm).await;
    let tenant = Arc::new(TenantConfig {
        agent_success_configs: vec![AgentSuccessConfig {
            evaluation_name: "task-done".to_string(),
            success_definition_prompt: "did the agent finish".to_string(),
            sampling_rate: 1.0,
            metadata_definition_prompt: None,
            tool_can_use: None,
            window: WindowOverrides::default(),
        }],
        ..TenantConfig::default()
    });

    publish_and_extract(&fixture, &tenant, "r1", "please do the thing").await;

    let success: &dyn SuccessRepository = fixture.store.as_ref();
    let results = success
        .list("org", &SuccessFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_success);
    assert_eq!(results[0].failure_type.as_deref(), Some("incomplete"));

    // A rerun of the same evaluation lands on the existing row
    fixture.llm.push_response(json!({"is_success": true}));
    let job = ExtractionJob::Success {
        evaluation_name: "task-done".to_string(),
        request_id: "r1".to_string(),
    };
    if let Some(handle) = fixture
        .coordinator
        .schedule("org", Arc::clone(&tenant), "r1-rerun", job)
        .await
    {
        handle.await.unwrap();
    }

    let results = success
        .list("org", &SuccessFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_success);
}
