//! Success evaluator
//!
//! Judges a sampled request against its evaluator's success definition.
//! The sampling decision is deterministic in `(request_id,
//! evaluation_name)` so reruns reproduce the same sample set.

use chrono::Utc;
use engram_core::llm::LlmAdapter;
use engram_core::*;
use engram_types::*;
use std::sync::Arc;

use crate::prompts;
use crate::schemas::{success_schema, SuccessOutput};
use crate::structured::generate_decoded;
use crate::windows::WindowService;

pub struct SuccessEvaluator {
    windows: Arc<WindowService>,
    success: Arc<dyn SuccessRepository>,
    llm: Arc<dyn LlmAdapter>,
}

impl SuccessEvaluator {
    pub fn new(
        windows: Arc<WindowService>,
        success: Arc<dyn SuccessRepository>,
        llm: Arc<dyn LlmAdapter>,
    ) -> Self {
        Self {
            windows,
            success,
            llm,
        }
    }

    /// The deterministic sampling gate for one request
    pub fn sampled(config: &AgentSuccessConfig, request_id: &str) -> bool {
        passes_sampling(request_id, &config.evaluation_name, config.sampling_rate)
    }

    pub async fn run(
        &self,
        org_id: &str,
        request: &Request,
        config: &AgentSuccessConfig,
        tenant: &TenantConfig,
    ) -> Result<Option<SuccessEvaluation>> {
        let Some(window) = self
            .windows
            .request_window(org_id, &request.request_id)
            .await?
        else {
            return Ok(None);
        };

        let output: SuccessOutput = generate_decoded(
            self.llm.as_ref(),
            &tenant.llm_config.generation_model_name,
            &success_schema(),
            &prompts::success_prompt(config, tenant, &window),
        )
        .await?;

        let indexed = output
            .failure_reason
            .clone()
            .unwrap_or_else(|| "success".to_string());
        let embedding = self
            .llm
            .embed(&tenant.llm_config.embedding_model_name, &indexed)
            .await?;

        let result = SuccessEvaluation {
            result_id: new_id(),
            org_id: org_id.to_string(),
            evaluation_name: config.evaluation_name.clone(),
            agent_version: request.agent_version.clone(),
            request_id: request.request_id.clone(),
            is_success: output.is_success,
            failure_type: output.failure_type,
            failure_reason: output.failure_reason,
            agent_prompt_update: output.agent_prompt_update,
            embedding,
            created_at: Utc::now(),
        };

        self.success.insert(std::slice::from_ref(&result)).await?;
        Ok(Some(result))
    }
}
