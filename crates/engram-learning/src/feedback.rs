//! Feedback extractor
//!
//! Extracts structured `{do, do_not, when, blocking_issue}` observations
//! about an agent version from a window, embeds the triggering condition,
//! and signals the aggregator when the pair's counter crosses its refresh
//! threshold.

use chrono::Utc;
use engram_core::llm::LlmAdapter;
use engram_core::*;
use engram_types::*;
use std::sync::Arc;
use tracing::debug;

use crate::prompts;
use crate::schemas::{feedback_list_schema, gate_schema, FeedbackListOutput, GateDecision};
use crate::structured::generate_decoded;

/// Result of one feedback extraction run
#[derive(Debug, Default)]
pub struct FeedbackOutcome {
    pub inserted: Vec<Id>,
    /// The pair's counter crossed the refresh threshold; an aggregation
    /// pass is due
    pub aggregation_due: bool,
}

pub struct FeedbackExtractor {
    raw_feedbacks: Arc<dyn RawFeedbackRepository>,
    llm: Arc<dyn LlmAdapter>,
}

impl FeedbackExtractor {
    pub fn new(raw_feedbacks: Arc<dyn RawFeedbackRepository>, llm: Arc<dyn LlmAdapter>) -> Self {
        Self { raw_feedbacks, llm }
    }

    pub async fn run(
        &self,
        org_id: &str,
        window: &Window,
        config: &AgentFeedbackConfig,
        tenant: &TenantConfig,
        agent_version: &str,
    ) -> Result<FeedbackOutcome> {
        let Some(request) = window.latest_request() else {
            return Ok(FeedbackOutcome::default());
        };

        let gate: GateDecision = generate_decoded(
            self.llm.as_ref(),
            &tenant.llm_config.should_run_model_name,
            &gate_schema(),
            &prompts::feedback_gate_prompt(config, tenant, window),
        )
        .await?;
        if !gate.should_extract {
            debug!(feedback = %config.feedback_name, "gate declined window");
            return Ok(FeedbackOutcome::default());
        }

        let output: FeedbackListOutput = generate_decoded(
            self.llm.as_ref(),
            &tenant.llm_config.generation_model_name,
            &feedback_list_schema(),
            &prompts::feedback_extraction_prompt(config, tenant, window),
        )
        .await?;

        if output.items.is_empty() {
            return Ok(FeedbackOutcome::default());
        }

        let status = if window.mode == WindowMode::Rerun {
            ArtifactStatus::Pending
        } else {
            ArtifactStatus::Current
        };
        let now = Utc::now();

        let mut feedbacks = Vec::with_capacity(output.items.len());
        for item in output.items {
            let draft = RawFeedbackDraft {
                feedback_content: item.feedback_content,
                do_action: item.do_action,
                do_not_action: item.do_not_action,
                when_condition: item.when_condition,
                blocking_issue: item.blocking_issue.map(|b| b.into_issue()),
            };
            let embedding = self
                .llm
                .embed(&tenant.llm_config.embedding_model_name, draft.indexed_content())
                .await?;

            feedbacks.push(RawFeedback {
                raw_feedback_id: new_id(),
                org_id: org_id.to_string(),
                user_id: Some(request.user_id.clone()),
                agent_version: agent_version.to_string(),
                request_id: request.request_id.clone(),
                source: Some(request.source.clone()),
                feedback_name: config.feedback_name.clone(),
                feedback_content: draft.feedback_content,
                do_action: draft.do_action,
                do_not_action: draft.do_not_action,
                when_condition: draft.when_condition,
                blocking_issue: draft.blocking_issue,
                status,
                embedding,
                created_at: now,
            });
        }

        let inserted: Vec<Id> = feedbacks.iter().map(|f| f.raw_feedback_id).collect();
        self.raw_feedbacks.insert(&feedbacks).await?;

        // The aggregation counter is derived from the stored rows, not kept
        // in memory, so coalesced and retried runs cannot double-count
        let aggregation_due = if status == ArtifactStatus::Current {
            let total = self
                .raw_feedbacks
                .count(
                    org_id,
                    &RawFeedbackFilter {
                        agent_version: Some(agent_version.to_string()),
                        feedback_name: Some(config.feedback_name.clone()),
                        ..RawFeedbackFilter::default()
                    },
                )
                .await? as usize;
            let aggregator = &config.feedback_aggregator_config;
            total >= aggregator.min_feedback_threshold
                && total % aggregator.refresh_count == 0
        } else {
            false
        };

        Ok(FeedbackOutcome {
            inserted,
            aggregation_due,
        })
    }
}
