//! Skill synthesis
//!
//! Turns approved aggregated feedbacks into reusable instruction blocks for
//! downstream agent prompts. References flow one way: a skill records the
//! raw feedback ids of the aggregate it came from.

use chrono::Utc;
use engram_core::llm::LlmAdapter;
use engram_core::*;
use engram_types::*;
use std::collections::HashSet;
use std::sync::Arc;

use crate::prompts;
use crate::schemas::{skill_schema, SkillOutput};
use crate::structured::generate_decoded;

pub struct SkillSynthesizer {
    agg_feedbacks: Arc<dyn AggregatedFeedbackRepository>,
    skills: Arc<dyn SkillRepository>,
    llm: Arc<dyn LlmAdapter>,
}

impl SkillSynthesizer {
    pub fn new(
        agg_feedbacks: Arc<dyn AggregatedFeedbackRepository>,
        skills: Arc<dyn SkillRepository>,
        llm: Arc<dyn LlmAdapter>,
    ) -> Self {
        Self {
            agg_feedbacks,
            skills,
            llm,
        }
    }

    /// Build one draft skill per approved aggregate that has none yet
    pub async fn run(
        &self,
        org_id: &str,
        agent_version: &str,
        feedback_name: &str,
        tenant: &TenantConfig,
    ) -> Result<Vec<Id>> {
        let approved = self
            .agg_feedbacks
            .list(
                org_id,
                &AggregatedFeedbackFilter {
                    agent_version: Some(agent_version.to_string()),
                    feedback_name: Some(feedback_name.to_string()),
                    review_statuses: vec![ReviewStatus::Approved],
                    ..AggregatedFeedbackFilter::default()
                },
                None,
            )
            .await?;

        let existing = self
            .skills
            .list(
                org_id,
                &SkillFilter {
                    agent_version: Some(agent_version.to_string()),
                    feedback_name: Some(feedback_name.to_string()),
                    ..SkillFilter::default()
                },
                None,
            )
            .await?;
        let covered: Vec<HashSet<Id>> = existing
            .iter()
            .map(|skill| skill.raw_feedback_ids.iter().copied().collect())
            .collect();

        let mut created = Vec::new();
        for aggregate in approved {
            let raw_ids: HashSet<Id> = aggregate
                .feedback_metadata
                .raw_feedback_ids
                .iter()
                .copied()
                .collect();
            if covered.iter().any(|ids| *ids == raw_ids) {
                continue;
            }

            let output: SkillOutput = generate_decoded(
                self.llm.as_ref(),
                &tenant.llm_config.generation_model_name,
                &skill_schema(),
                &prompts::skill_prompt(
                    feedback_name,
                    &aggregate.feedback_content,
                    aggregate.do_action.as_deref(),
                    aggregate.do_not_action.as_deref(),
                    aggregate.when_condition.as_deref(),
                ),
            )
            .await?;

            let embedding = self
                .llm
                .embed(&tenant.llm_config.embedding_model_name, &output.description)
                .await?;

            let allowed_tools = if output.allowed_tools.is_empty() {
                tenant
                    .tool_can_use
                    .iter()
                    .map(|t| t.tool_name.clone())
                    .collect()
            } else {
                output.allowed_tools
            };

            let skill = Skill {
                skill_id: new_id(),
                org_id: org_id.to_string(),
                agent_version: agent_version.to_string(),
                feedback_name: feedback_name.to_string(),
                skill_name: output.skill_name,
                description: output.description,
                instructions: output.instructions,
                allowed_tools,
                blocking_issues: aggregate.blocking_issue.clone().into_iter().collect(),
                raw_feedback_ids: aggregate.feedback_metadata.raw_feedback_ids.clone(),
                skill_status: SkillStatus::Draft,
                embedding,
                created_at: Utc::now(),
            };
            let id = skill.skill_id;
            self.skills.insert(&[skill]).await?;
            created.push(id);
        }

        Ok(created)
    }
}
