//! Artifact-store integration tests against in-memory SQLite
//!
//! `SqliteStore` implements every repository trait, so each test takes the
//! trait views it exercises.

use chrono::Utc;
use engram_core::search::SearchMode;
use engram_core::*;
use engram_infra::SqliteStore;
use engram_types::*;
use std::collections::BTreeSet;

fn request(org: &str, request_id: &str, user: &str, source: &str) -> Request {
    Request {
        org_id: org.to_string(),
        request_id: request_id.to_string(),
        user_id: user.to_string(),
        source: source.to_string(),
        agent_version: String::new(),
        request_group: None,
        created_at: Utc::now(),
    }
}

fn interaction(
    org: &str,
    request_id: &str,
    user: &str,
    content: &str,
    embedding: Vec<f32>,
) -> Interaction {
    Interaction {
        org_id: org.to_string(),
        interaction_id: 0,
        request_id: request_id.to_string(),
        user_id: user.to_string(),
        role: Role::User,
        content: content.to_string(),
        shadow_content: None,
        user_action: UserAction::None,
        user_action_description: None,
        interacted_image_url: None,
        image_encoding: None,
        tools_used: Vec::new(),
        embedding,
        deleted: false,
        created_at: Utc::now(),
    }
}

fn profile(org: &str, user: &str, content: &str, embedding: Vec<f32>) -> Profile {
    Profile {
        profile_id: new_id(),
        org_id: org.to_string(),
        user_id: user.to_string(),
        content: content.to_string(),
        source: "chat".to_string(),
        extractor_names: BTreeSet::from(["preferences".to_string()]),
        custom_features: serde_json::Value::Null,
        generated_from_request_id: "r1".to_string(),
        last_modified_at: Utc::now(),
        expiration_at: None,
        status: ArtifactStatus::Current,
        embedding,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_interaction_ids_are_tenant_monotone() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    let first = interactions
        .publish(
            &request("org-a", "r1", "u1", "chat"),
            vec![
                interaction("org-a", "r1", "u1", "one", vec![1.0, 0.0]),
                interaction("org-a", "r1", "u1", "two", vec![1.0, 0.0]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(
        first.iter().map(|i| i.interaction_id).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let second = interactions
        .publish(
            &request("org-a", "r2", "u1", "chat"),
            vec![interaction("org-a", "r2", "u1", "three", vec![1.0, 0.0])],
        )
        .await
        .unwrap();
    assert_eq!(second[0].interaction_id, 3);

    // A different tenant starts its own sequence
    let other = interactions
        .publish(
            &request("org-b", "r1", "u9", "chat"),
            vec![interaction("org-b", "r1", "u9", "hello", vec![1.0, 0.0])],
        )
        .await
        .unwrap();
    assert_eq!(other[0].interaction_id, 1);
}

#[tokio::test]
async fn test_duplicate_request_id_conflicts() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    interactions
        .publish(
            &request("org", "r1", "u1", "chat"),
            vec![interaction("org", "r1", "u1", "hello", vec![1.0])],
        )
        .await
        .unwrap();

    let err = interactions
        .publish(
            &request("org", "r1", "u1", "chat"),
            vec![interaction("org", "r1", "u1", "again", vec![1.0])],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
}

#[tokio::test]
async fn test_cross_tenant_reads_are_impossible() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    interactions
        .publish(
            &request("org-a", "r1", "u1", "chat"),
            vec![interaction(
                "org-a",
                "r1",
                "u1",
                "org a secret",
                vec![1.0, 0.0],
            )],
        )
        .await
        .unwrap();

    // Even a crafted request id resolves nothing for another tenant
    assert!(interactions.get_request("org-b", "r1").await.unwrap().is_none());
    let listed = interactions
        .list_interactions("org-b", &InteractionFilter::default(), None, false)
        .await
        .unwrap();
    assert!(listed.is_empty());

    let results = interactions
        .search(
            "org-b",
            &SearchRequest {
                query_text: "secret".to_string(),
                query_embedding: vec![1.0, 0.0],
                mode: SearchMode::Hybrid,
                ..SearchRequest::default()
            },
            &InteractionFilter::default(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_exact_text_ranks_first_in_fts_and_top3_in_hybrid() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    let contents = [
        "I like blue shirts",
        "the weather is sunny",
        "let's talk about sqlite indexes",
    ];
    for (idx, content) in contents.iter().enumerate() {
        interactions
            .publish(
                &request("org", &format!("r{idx}"), "u1", "chat"),
                vec![interaction(
                    "org",
                    &format!("r{idx}"),
                    "u1",
                    content,
                    vec![0.1, 0.2],
                )],
            )
            .await
            .unwrap();
    }

    let fts = interactions
        .search(
            "org",
            &SearchRequest {
                query_text: "I like blue shirts".to_string(),
                query_embedding: vec![0.1, 0.2],
                mode: SearchMode::Fts,
                ..SearchRequest::default()
            },
            &InteractionFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(fts[0].item.content, "I like blue shirts");

    let hybrid = interactions
        .search(
            "org",
            &SearchRequest {
                query_text: "I like blue shirts".to_string(),
                query_embedding: vec![0.1, 0.2],
                mode: SearchMode::Hybrid,
                ..SearchRequest::default()
            },
            &InteractionFilter::default(),
        )
        .await
        .unwrap();
    let rank = hybrid
        .iter()
        .position(|s| s.item.content == "I like blue shirts")
        .unwrap();
    assert!(rank < 3);
}

#[tokio::test]
async fn test_hybrid_profile_ranking_follows_query() {
    let store = SqliteStore::in_memory().await.unwrap();
    let profiles: &dyn ProfileRepository = &store;

    let p1 = profile("org", "u1", "user prefers concise answers", vec![1.0, 0.0]);
    let p2 = profile("org", "u1", "user likes long detailed responses", vec![0.0, 1.0]);
    profiles.insert(&[p1.clone(), p2.clone()]).await.unwrap();

    // Neutral embedding: the text arm decides
    let concise = profiles
        .search(
            "org",
            &SearchRequest {
                query_text: "concise".to_string(),
                query_embedding: vec![0.5, 0.5],
                mode: SearchMode::Hybrid,
                ..SearchRequest::default()
            },
            &ProfileFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(concise[0].item.profile_id, p1.profile_id);

    let long = profiles
        .search(
            "org",
            &SearchRequest {
                query_text: "long".to_string(),
                query_embedding: vec![0.5, 0.5],
                mode: SearchMode::Hybrid,
                ..SearchRequest::default()
            },
            &ProfileFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(long[0].item.profile_id, p2.profile_id);

    // Embedding close to P1 but text matching P2: both surface, P1 within
    // the top 2
    let mixed = profiles
        .search(
            "org",
            &SearchRequest {
                query_text: "long".to_string(),
                query_embedding: vec![1.0, 0.0],
                mode: SearchMode::Hybrid,
                ..SearchRequest::default()
            },
            &ProfileFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(mixed.len(), 2);
    let p1_rank = mixed
        .iter()
        .position(|s| s.item.profile_id == p1.profile_id)
        .unwrap();
    assert!(p1_rank <= 1);
}

#[tokio::test]
async fn test_search_is_idempotent_without_writes() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    for idx in 0..5 {
        interactions
            .publish(
                &request("org", &format!("r{idx}"), "u1", "chat"),
                vec![interaction(
                    "org",
                    &format!("r{idx}"),
                    "u1",
                    &format!("blue message {idx}"),
                    vec![idx as f32 * 0.1, 1.0],
                )],
            )
            .await
            .unwrap();
    }

    let query = SearchRequest {
        query_text: "blue".to_string(),
        query_embedding: vec![0.2, 1.0],
        mode: SearchMode::Hybrid,
        ..SearchRequest::default()
    };
    let first = interactions
        .search("org", &query, &InteractionFilter::default())
        .await
        .unwrap();
    let second = interactions
        .search("org", &query, &InteractionFilter::default())
        .await
        .unwrap();
    let ids = |results: &[Scored<Interaction>]| {
        results
            .iter()
            .map(|s| s.item.interaction_id)
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_delete_request_cascades_exactly() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    let rows: Vec<Interaction> = (0..5)
        .map(|i| interaction("org", "r1", "u1", &format!("message {i}"), vec![1.0]))
        .collect();
    interactions
        .publish(&request("org", "r1", "u1", "chat"), rows)
        .await
        .unwrap();
    interactions
        .publish(
            &request("org", "r2", "u1", "chat"),
            vec![interaction("org", "r2", "u1", "survivor", vec![1.0])],
        )
        .await
        .unwrap();

    let removed = interactions.delete_request("org", "r1").await.unwrap();
    assert_eq!(removed, 5);

    let remaining = interactions
        .list_interactions("org", &InteractionFilter::default(), None, false)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].content, "survivor");
    assert!(interactions.get_request("org", "r1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_soft_deleted_interactions_vanish_from_reads() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    let stored = interactions
        .publish(
            &request("org", "r1", "u1", "chat"),
            vec![
                interaction("org", "r1", "u1", "keep me", vec![1.0]),
                interaction("org", "r1", "u1", "delete me", vec![1.0]),
            ],
        )
        .await
        .unwrap();

    let removed = interactions
        .delete_interaction("org", stored[1].interaction_id)
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let listed = interactions
        .list_interactions("org", &InteractionFilter::default(), None, false)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let history = interactions
        .windowed_history("org", &InteractionFilter::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].0.content, "keep me");

    // The FTS shadow row is gone too
    let fts = interactions
        .search(
            "org",
            &SearchRequest {
                query_text: "delete".to_string(),
                query_embedding: vec![1.0],
                mode: SearchMode::Fts,
                ..SearchRequest::default()
            },
            &InteractionFilter::default(),
        )
        .await
        .unwrap();
    assert!(fts.is_empty());
}

#[tokio::test]
async fn test_profile_transition_is_atomic_and_single_current() {
    let store = SqliteStore::in_memory().await.unwrap();
    let profiles: &dyn ProfileRepository = &store;

    let old = profile("org", "u1", "likes blue", vec![1.0, 0.0]);
    profiles.insert(std::slice::from_ref(&old)).await.unwrap();

    let new = profile("org", "u1", "likes navy blue", vec![0.9, 0.1]);
    profiles
        .transition("org", &[old.profile_id], std::slice::from_ref(&new))
        .await
        .unwrap();

    let current = profiles
        .list("org", &ProfileFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].profile_id, new.profile_id);

    let archived = profiles.get("org", old.profile_id).await.unwrap().unwrap();
    assert_eq!(archived.status, ArtifactStatus::Archived);
}

#[tokio::test]
async fn test_pending_profiles_hidden_from_default_reads() {
    let store = SqliteStore::in_memory().await.unwrap();
    let profiles: &dyn ProfileRepository = &store;

    let mut pending = profile("org", "u1", "tentative fact", vec![1.0]);
    pending.status = ArtifactStatus::Pending;
    profiles.insert(&[pending]).await.unwrap();

    let visible = profiles
        .list("org", &ProfileFilter::default(), None)
        .await
        .unwrap();
    assert!(visible.is_empty());

    let all = profiles
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
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_operation_state_acquire_coalesce_finish() {
    let store = SqliteStore::in_memory().await.unwrap();
    let states: &dyn OperationStateRepository = &store;

    assert_eq!(
        states
            .try_acquire("org", "profile:p:u1", "r1", 300)
            .await
            .unwrap(),
        AcquireOutcome::Acquired
    );
    // Overlapping triggers coalesce; the newest wins the pending slot
    assert_eq!(
        states
            .try_acquire("org", "profile:p:u1", "r2", 300)
            .await
            .unwrap(),
        AcquireOutcome::Coalesced
    );
    assert_eq!(
        states
            .try_acquire("org", "profile:p:u1", "r3", 300)
            .await
            .unwrap(),
        AcquireOutcome::Coalesced
    );

    let state = states.get("org", "profile:p:u1").await.unwrap().unwrap();
    assert!(state.in_progress);
    assert_eq!(state.current_request_id.as_deref(), Some("r1"));
    assert_eq!(state.pending_request_id.as_deref(), Some("r3"));

    // Finish hands the scope to the coalesced trigger
    let pending = states.finish("org", "profile:p:u1").await.unwrap();
    assert_eq!(pending.as_deref(), Some("r3"));
    let state = states.get("org", "profile:p:u1").await.unwrap().unwrap();
    assert!(state.in_progress);
    assert_eq!(state.current_request_id.as_deref(), Some("r3"));
    assert!(state.pending_request_id.is_none());

    // Second finish releases it
    assert!(states.finish("org", "profile:p:u1").await.unwrap().is_none());
    let state = states.get("org", "profile:p:u1").await.unwrap().unwrap();
    assert!(!state.in_progress);

    // And it is acquirable again
    assert_eq!(
        states
            .try_acquire("org", "profile:p:u1", "r4", 300)
            .await
            .unwrap(),
        AcquireOutcome::Acquired
    );
}

#[tokio::test]
async fn test_stale_lock_is_preemptable() {
    let store = SqliteStore::in_memory().await.unwrap();
    let states: &dyn OperationStateRepository = &store;

    assert_eq!(
        states.try_acquire("org", "scope", "r1", 300).await.unwrap(),
        AcquireOutcome::Acquired
    );
    // With a zero stale threshold the holder is immediately preemptable
    assert_eq!(
        states.try_acquire("org", "scope", "r2", 0).await.unwrap(),
        AcquireOutcome::Acquired
    );
    let state = states.get("org", "scope").await.unwrap().unwrap();
    assert_eq!(state.current_request_id.as_deref(), Some("r2"));
    assert!(state.pending_request_id.is_none());
}

#[tokio::test]
async fn test_config_round_trips() {
    let store = SqliteStore::in_memory().await.unwrap();
    let configs: &dyn ConfigRepository = &store;

    assert!(configs.get_config("org").await.unwrap().is_none());

    let config = TenantConfig {
        agent_context_prompt: "a shopping assistant".to_string(),
        extraction_window_size: 4,
        extraction_window_stride: 2,
        profile_extractor_configs: vec![ProfileExtractorConfig {
            extractor_name: "preferences".to_string(),
            profile_content_definition_prompt: "extract user preferences".to_string(),
            context_prompt: None,
            metadata_definition_prompt: None,
            should_extract_profile_prompt_override: None,
            manual_trigger: false,
            request_sources_enabled: Some(vec!["chat".to_string()]),
            window: WindowOverrides::default(),
            profile_ttl: ProfileTtl::OneMonth,
        }],
        ..TenantConfig::default()
    };
    configs.set_config("org", &config).await.unwrap();
    assert_eq!(configs.get_config("org").await.unwrap().unwrap(), config);

    // Replacement overwrites wholesale
    let mut replacement = config.clone();
    replacement.extraction_window_size = 8;
    configs.set_config("org", &replacement).await.unwrap();
    assert_eq!(
        configs
            .get_config("org")
            .await
            .unwrap()
            .unwrap()
            .extraction_window_size,
        8
    );
}

#[tokio::test]
async fn test_invalid_config_rejected_on_set() {
    let store = SqliteStore::in_memory().await.unwrap();
    let configs: &dyn ConfigRepository = &store;

    let config = TenantConfig {
        extraction_window_stride: 0,
        ..TenantConfig::default()
    };
    let err = configs.set_config("org", &config).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn test_org_registry_resolves_hashed_keys() {
    let store = SqliteStore::in_memory().await.unwrap();
    let orgs: &dyn OrgRepository = &store;

    orgs.create_org("org-1", "Acme", "hash-1").await.unwrap();

    assert_eq!(
        orgs.org_for_key_hash("hash-1").await.unwrap().as_deref(),
        Some("org-1")
    );
    assert!(orgs.org_for_key_hash("hash-2").await.unwrap().is_none());

    let err = orgs.create_org("org-1", "Acme", "hash-3").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
}

#[tokio::test]
async fn test_raw_feedback_insert_is_idempotent_by_content() {
    let store = SqliteStore::in_memory().await.unwrap();
    let raw_feedbacks: &dyn RawFeedbackRepository = &store;

    let feedback = RawFeedback {
        raw_feedback_id: new_id(),
        org_id: "org".to_string(),
        user_id: Some("u1".to_string()),
        agent_version: "v1".to_string(),
        request_id: "r1".to_string(),
        source: Some("chat".to_string()),
        feedback_name: "formatting".to_string(),
        feedback_content: "answer was too verbose".to_string(),
        do_action: None,
        do_not_action: None,
        when_condition: Some("user asks for a summary".to_string()),
        blocking_issue: None,
        status: ArtifactStatus::Current,
        embedding: vec![1.0, 0.0],
        created_at: Utc::now(),
    };
    raw_feedbacks.insert(&[feedback.clone()]).await.unwrap();

    // A retried run after a timeout re-inserts the same content under a
    // fresh id; the store must keep a single row
    let retried = RawFeedback {
        raw_feedback_id: new_id(),
        ..feedback.clone()
    };
    raw_feedbacks.insert(&[retried]).await.unwrap();

    let count = raw_feedbacks
        .count(
            "org",
            &RawFeedbackFilter {
                agent_version: Some("v1".to_string()),
                feedback_name: Some("formatting".to_string()),
                ..RawFeedbackFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_aggregated_feedback_defaults_to_approved_reads() {
    let store = SqliteStore::in_memory().await.unwrap();
    let agg_feedbacks: &dyn AggregatedFeedbackRepository = &store;

    let pending = AggregatedFeedback {
        feedback_id: new_id(),
        org_id: "org".to_string(),
        agent_version: "v1".to_string(),
        feedback_name: "formatting".to_string(),
        feedback_content: "keep summaries short".to_string(),
        do_action: Some("answer in three sentences".to_string()),
        do_not_action: None,
        when_condition: Some("user asks for a summary".to_string()),
        blocking_issue: None,
        feedback_status: ReviewStatus::Pending,
        feedback_metadata: FeedbackMetadata {
            raw_feedback_ids: vec![new_id()],
            cluster_size: 3,
            centroid: vec![1.0, 0.0],
        },
        status: ArtifactStatus::Current,
        embedding: vec![1.0, 0.0],
        created_at: Utc::now(),
    };
    let id = pending.feedback_id;
    agg_feedbacks.insert(&[pending]).await.unwrap();

    // Default visibility is approved-only
    let visible = agg_feedbacks
        .list("org", &AggregatedFeedbackFilter::default(), None)
        .await
        .unwrap();
    assert!(visible.is_empty());

    agg_feedbacks
        .update_review_status("org", id, ReviewStatus::Approved)
        .await
        .unwrap();
    let visible = agg_feedbacks
        .list("org", &AggregatedFeedbackFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].feedback_metadata.cluster_size, 3);
}

#[tokio::test]
async fn test_file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engram.db");

    {
        let store = SqliteStore::open(&path).await.unwrap();
        let interactions: &dyn InteractionRepository = &store;
        interactions
            .publish(
                &request("org", "r1", "u1", "chat"),
                vec![interaction("org", "r1", "u1", "durable message", vec![1.0])],
            )
            .await
            .unwrap();
    }

    let store = SqliteStore::open(&path).await.unwrap();
    let interactions: &dyn InteractionRepository = &store;
    let listed = interactions
        .list_interactions("org", &InteractionFilter::default(), None, false)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].content, "durable message");
}

#[tokio::test]
async fn test_empty_store_searches_return_empty() {
    let store = SqliteStore::in_memory().await.unwrap();
    let interactions: &dyn InteractionRepository = &store;

    let results = interactions
        .search(
            "org",
            &SearchRequest {
                query_text: "anything".to_string(),
                query_embedding: vec![1.0, 0.0],
                mode: SearchMode::Hybrid,
                ..SearchRequest::default()
            },
            &InteractionFilter::default(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}
