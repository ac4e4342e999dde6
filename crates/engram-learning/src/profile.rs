//! Profile extractor
//!
//! Turns a window of interactions into a delta over the user's profile set:
//! gate, structured extraction, embedding, semantic dedup against the
//! current profiles, and one atomic batch of status transitions.

use chrono::Utc;
use engram_core::llm::LlmAdapter;
use engram_core::search::SearchMode;
use engram_core::*;
use engram_types::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::prompts;
use crate::schemas::{
    gate_schema, profile_delta_schema, GateDecision, ProfileActionKind, ProfileDeltaOutput,
};
use crate::structured::generate_decoded;

/// Similarity above which a new draft supersedes an existing profile of the
/// same extractor
pub const PROFILE_DEDUPE_THRESHOLD: f64 = 0.85;

/// Similarity above which a profile is shared across extractors instead of
/// duplicated
pub const PROFILE_SHARE_THRESHOLD: f64 = 0.9;

/// What one extraction run did to the profile set
#[derive(Debug, Default)]
pub struct ProfileOutcome {
    pub added: Vec<Id>,
    pub archived: Vec<Id>,
    pub kept: Vec<Id>,
}

impl ProfileOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.archived.is_empty() && self.kept.is_empty()
    }
}

pub struct ProfileExtractor {
    profiles: Arc<dyn ProfileRepository>,
    llm: Arc<dyn LlmAdapter>,
}

impl ProfileExtractor {
    pub fn new(profiles: Arc<dyn ProfileRepository>, llm: Arc<dyn LlmAdapter>) -> Self {
        Self { profiles, llm }
    }

    /// Run one extraction over a window and apply its delta
    pub async fn run(
        &self,
        org_id: &str,
        window: &Window,
        config: &ProfileExtractorConfig,
        tenant: &TenantConfig,
    ) -> Result<ProfileOutcome> {
        let Some(request) = window.latest_request() else {
            return Ok(ProfileOutcome::default());
        };
        let user_id = request.user_id.clone();

        // Gate: a cheap model decides whether the window is worth the
        // extraction call at all
        if let Some(gate_prompt) = &config.should_extract_profile_prompt_override {
            let decision: GateDecision = generate_decoded(
                self.llm.as_ref(),
                &tenant.llm_config.should_run_model_name,
                &gate_schema(),
                &prompts::profile_gate_prompt(gate_prompt, tenant, window),
            )
            .await?;
            if !decision.should_extract {
                debug!(extractor = %config.extractor_name, %user_id, "gate declined window");
                return Ok(ProfileOutcome::default());
            }
        }

        let existing = self
            .profiles
            .list(
                org_id,
                &ProfileFilter {
                    user_id: Some(user_id.clone()),
                    extractor_name: Some(config.extractor_name.clone()),
                    ..ProfileFilter::default()
                },
                None,
            )
            .await?;

        let output: ProfileDeltaOutput = generate_decoded(
            self.llm.as_ref(),
            &tenant.llm_config.generation_model_name,
            &profile_delta_schema(),
            &prompts::profile_extraction_prompt(config, tenant, window, &existing),
        )
        .await?;

        let delta = self.resolve_delta(output, &existing);
        if delta.is_empty() && delta.keep.is_empty() {
            return Ok(ProfileOutcome::default());
        }

        self.apply_delta(org_id, window, config, tenant, request, &user_id, delta)
            .await
    }

    /// Map the model's action list onto known profile ids
    fn resolve_delta(&self, output: ProfileDeltaOutput, existing: &[Profile]) -> ProfileDelta {
        let known: BTreeSet<Id> = existing.iter().map(|p| p.profile_id).collect();
        let mut delta = ProfileDelta::default();

        for item in output.items {
            let referenced = item
                .profile_id
                .as_deref()
                .and_then(|id| id.parse::<Id>().ok())
                .filter(|id| known.contains(id));

            match item.action {
                ProfileActionKind::Add => {
                    if let Some(content) = item.content.filter(|c| !c.is_empty()) {
                        delta.add.push(ProfileDraft {
                            content,
                            custom_features: item
                                .custom_features
                                .unwrap_or(serde_json::Value::Null),
                        });
                    }
                }
                ProfileActionKind::Replace => match (referenced, item.content) {
                    (Some(old_id), Some(content)) if !content.is_empty() => {
                        delta.replace.push((
                            old_id,
                            ProfileDraft {
                                content,
                                custom_features: item
                                    .custom_features
                                    .unwrap_or(serde_json::Value::Null),
                            },
                        ));
                    }
                    _ => warn!("replace action with unknown profile id or empty content, ignored"),
                },
                ProfileActionKind::Drop => match referenced {
                    Some(old_id) => delta.remove.push(old_id),
                    None => warn!("drop action with unknown profile id, ignored"),
                },
                ProfileActionKind::Keep => {
                    if let Some(id) = referenced {
                        delta.keep.push(id);
                    }
                }
            }
        }
        delta
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_delta(
        &self,
        org_id: &str,
        window: &Window,
        config: &ProfileExtractorConfig,
        tenant: &TenantConfig,
        request: &Request,
        user_id: &str,
        delta: ProfileDelta,
    ) -> Result<ProfileOutcome> {
        let rerun = window.mode == WindowMode::Rerun;
        let status = if rerun {
            ArtifactStatus::Pending
        } else {
            ArtifactStatus::Current
        };
        let now = Utc::now();
        let expiration = config.profile_ttl.as_duration().map(|ttl| now + ttl);

        let mut archive: Vec<Id> = Vec::new();
        let mut inserts: Vec<Profile> = Vec::new();
        let mut outcome = ProfileOutcome {
            kept: delta.keep.clone(),
            ..ProfileOutcome::default()
        };

        let make_profile = |content: String,
                                custom_features: serde_json::Value,
                                embedding: Vec<f32>,
                                extractor_names: BTreeSet<String>| {
            Profile {
                profile_id: new_id(),
                org_id: org_id.to_string(),
                user_id: user_id.to_string(),
                content,
                source: request.source.clone(),
                extractor_names,
                custom_features,
                generated_from_request_id: request.request_id.clone(),
                last_modified_at: now,
                expiration_at: expiration,
                status,
                embedding,
                created_at: now,
            }
        };

        let own_names: BTreeSet<String> = BTreeSet::from([config.extractor_name.clone()]);

        for (old_id, draft) in delta.replace {
            let embedding = self
                .llm
                .embed(&tenant.llm_config.embedding_model_name, &draft.content)
                .await?;
            if !rerun {
                archive.push(old_id);
            }
            inserts.push(make_profile(
                draft.content,
                draft.custom_features,
                embedding,
                own_names.clone(),
            ));
        }

        for draft in delta.add {
            let embedding = self
                .llm
                .embed(&tenant.llm_config.embedding_model_name, &draft.content)
                .await?;

            // Semantic supersession inside this extractor's profile set
            let duplicates = self
                .profiles
                .search(
                    org_id,
                    &SearchRequest {
                        query_text: draft.content.clone(),
                        query_embedding: embedding.clone(),
                        k: 3,
                        threshold: PROFILE_DEDUPE_THRESHOLD,
                        mode: SearchMode::Vector,
                        ..SearchRequest::default()
                    },
                    &ProfileFilter {
                        user_id: Some(user_id.to_string()),
                        extractor_name: Some(config.extractor_name.clone()),
                        ..ProfileFilter::default()
                    },
                )
                .await?;

            if let Some(hit) = duplicates.first() {
                if !rerun {
                    archive.push(hit.item.profile_id);
                }
                inserts.push(make_profile(
                    draft.content,
                    draft.custom_features,
                    embedding,
                    own_names.clone(),
                ));
                continue;
            }

            // Multi-extractor sharing: an equivalent fact owned by another
            // extractor is reused rather than duplicated
            let shared = self
                .profiles
                .search(
                    org_id,
                    &SearchRequest {
                        query_text: draft.content.clone(),
                        query_embedding: embedding.clone(),
                        k: 1,
                        threshold: PROFILE_SHARE_THRESHOLD,
                        mode: SearchMode::Vector,
                        ..SearchRequest::default()
                    },
                    &ProfileFilter {
                        user_id: Some(user_id.to_string()),
                        ..ProfileFilter::default()
                    },
                )
                .await?;

            match shared.first() {
                Some(hit) if hit.item.extractor_names.contains(&config.extractor_name) => {
                    outcome.kept.push(hit.item.profile_id);
                }
                Some(hit) => {
                    let mut names = hit.item.extractor_names.clone();
                    names.insert(config.extractor_name.clone());
                    if !rerun {
                        archive.push(hit.item.profile_id);
                    }
                    inserts.push(make_profile(
                        draft.content,
                        draft.custom_features,
                        embedding,
                        names,
                    ));
                }
                None => {
                    inserts.push(make_profile(
                        draft.content,
                        draft.custom_features,
                        embedding,
                        own_names.clone(),
                    ));
                }
            }
        }

        if !rerun {
            archive.extend(delta.remove.iter().copied());
        }

        outcome.added = inserts.iter().map(|p| p.profile_id).collect();
        outcome.archived = archive.clone();

        self.profiles.transition(org_id, &archive, &inserts).await?;

        if !rerun && !outcome.is_empty() {
            self.profiles
                .append_change_entry(&ProfileChangeEntry {
                    org_id: org_id.to_string(),
                    request_id: request.request_id.clone(),
                    user_id: user_id.to_string(),
                    extractor_name: config.extractor_name.clone(),
                    added: outcome.added.clone(),
                    removed: outcome.archived.clone(),
                    mentioned: outcome.kept.clone(),
                    created_at: now,
                })
                .await?;
        }

        Ok(outcome)
    }
}
