//! Feedback aggregator
//!
//! Clusters the `current` raw feedbacks of one `(agent_version,
//! feedback_name)` pair and consolidates each cluster into a single rule
//! awaiting approval. Re-clustering archives aggregates the new clusters no
//! longer support and leaves near-identical ones in place.

use chrono::Utc;
use engram_core::llm::LlmAdapter;
use engram_core::*;
use engram_types::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::prompts;
use crate::schemas::{aggregate_schema, AggregateOutput};
use crate::structured::generate_decoded;

/// A cluster keeps an existing aggregate alive when it shares at least this
/// fraction of members
pub const RECLUSTER_OVERLAP_FRACTION: f64 = 0.5;

/// Jaccard similarity above which a new cluster is the same rule and only
/// refreshes provenance
pub const IDENTICAL_CLUSTER_JACCARD: f64 = 0.8;

#[derive(Debug, Default)]
pub struct AggregateOutcome {
    pub created: Vec<Id>,
    pub refreshed: Vec<Id>,
    pub archived: Vec<Id>,
}

pub struct FeedbackAggregator {
    raw_feedbacks: Arc<dyn RawFeedbackRepository>,
    agg_feedbacks: Arc<dyn AggregatedFeedbackRepository>,
    llm: Arc<dyn LlmAdapter>,
    /// Cosine-distance epsilon for cluster membership
    epsilon: f64,
}

impl FeedbackAggregator {
    pub fn new(
        raw_feedbacks: Arc<dyn RawFeedbackRepository>,
        agg_feedbacks: Arc<dyn AggregatedFeedbackRepository>,
        llm: Arc<dyn LlmAdapter>,
    ) -> Self {
        Self {
            raw_feedbacks,
            agg_feedbacks,
            llm,
            epsilon: DEFAULT_CLUSTER_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub async fn run(
        &self,
        org_id: &str,
        agent_version: &str,
        feedback_name: &str,
        aggregator_config: &FeedbackAggregatorConfig,
        tenant: &TenantConfig,
    ) -> Result<AggregateOutcome> {
        let raws = self
            .raw_feedbacks
            .list(
                org_id,
                &RawFeedbackFilter {
                    agent_version: Some(agent_version.to_string()),
                    feedback_name: Some(feedback_name.to_string()),
                    ..RawFeedbackFilter::default()
                },
                None,
            )
            .await?;

        if raws.len() < aggregator_config.min_feedback_threshold {
            return Ok(AggregateOutcome::default());
        }

        let embeddings: Vec<Vec<f32>> = raws.iter().map(|r| r.embedding.clone()).collect();
        let clusters = cluster_embeddings(
            &embeddings,
            self.epsilon,
            aggregator_config.min_feedback_threshold,
        );
        if clusters.is_empty() {
            return Ok(AggregateOutcome::default());
        }

        let existing = self
            .agg_feedbacks
            .list(
                org_id,
                &AggregatedFeedbackFilter {
                    agent_version: Some(agent_version.to_string()),
                    feedback_name: Some(feedback_name.to_string()),
                    review_statuses: vec![
                        ReviewStatus::Pending,
                        ReviewStatus::Approved,
                        ReviewStatus::Rejected,
                    ],
                    ..AggregatedFeedbackFilter::default()
                },
                None,
            )
            .await?;

        let mut outcome = AggregateOutcome::default();
        let mut retained: HashSet<Id> = HashSet::new();
        let mut cluster_id_sets: Vec<HashSet<Id>> = Vec::new();

        for members in &clusters {
            let ids: HashSet<Id> = members.iter().map(|&i| raws[i].raw_feedback_id).collect();
            let centroid_embedding = centroid(&embeddings, members);
            let metadata = FeedbackMetadata {
                raw_feedback_ids: ids.iter().copied().collect(),
                cluster_size: members.len(),
                centroid: centroid_embedding,
            };

            // A near-identical existing rule only gets its provenance
            // refreshed
            if let Some(same) = existing.iter().find(|agg| {
                let prev: HashSet<Id> =
                    agg.feedback_metadata.raw_feedback_ids.iter().copied().collect();
                jaccard_index(&prev, &ids) >= IDENTICAL_CLUSTER_JACCARD
            }) {
                self.agg_feedbacks
                    .update_metadata(org_id, same.feedback_id, &metadata)
                    .await?;
                retained.insert(same.feedback_id);
                outcome.refreshed.push(same.feedback_id);
                cluster_id_sets.push(ids);
                continue;
            }

            let cluster_items: Vec<RawFeedback> =
                members.iter().map(|&i| raws[i].clone()).collect();
            let output: AggregateOutput = generate_decoded(
                self.llm.as_ref(),
                &tenant.llm_config.generation_model_name,
                &aggregate_schema(),
                &prompts::aggregation_prompt(feedback_name, &cluster_items),
            )
            .await?;

            let indexed = output
                .when_condition
                .clone()
                .unwrap_or_else(|| output.feedback_content.clone());
            let embedding = self
                .llm
                .embed(&tenant.llm_config.embedding_model_name, &indexed)
                .await?;

            let aggregate = AggregatedFeedback {
                feedback_id: new_id(),
                org_id: org_id.to_string(),
                agent_version: agent_version.to_string(),
                feedback_name: feedback_name.to_string(),
                feedback_content: output.feedback_content,
                do_action: output.do_action,
                do_not_action: output.do_not_action,
                when_condition: output.when_condition,
                blocking_issue: output.blocking_issue.map(|b| b.into_issue()),
                feedback_status: ReviewStatus::Pending,
                feedback_metadata: metadata,
                status: ArtifactStatus::Current,
                embedding,
                created_at: Utc::now(),
            };
            let id = aggregate.feedback_id;
            self.agg_feedbacks.insert(&[aggregate]).await?;
            outcome.created.push(id);
            cluster_id_sets.push(ids);
        }

        // Archive aggregates no new cluster meaningfully supports
        for agg in &existing {
            if retained.contains(&agg.feedback_id) {
                continue;
            }
            let prev: HashSet<Id> =
                agg.feedback_metadata.raw_feedback_ids.iter().copied().collect();
            let best_overlap = cluster_id_sets
                .iter()
                .map(|ids| overlap_fraction(&prev, ids))
                .fold(0.0f64, f64::max);
            if best_overlap < RECLUSTER_OVERLAP_FRACTION {
                self.agg_feedbacks
                    .update_status(org_id, agg.feedback_id, ArtifactStatus::Archived)
                    .await?;
                outcome.archived.push(agg.feedback_id);
            }
        }

        info!(
            agent_version,
            feedback_name,
            created = outcome.created.len(),
            refreshed = outcome.refreshed.len(),
            archived = outcome.archived.len(),
            "aggregation pass complete"
        );
        Ok(outcome)
    }
}
