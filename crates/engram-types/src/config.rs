//! Configuration schema
//!
//! Two layers of configuration exist: the per-tenant behavioral config that
//! drives extraction (stored in the artifact store, editable through
//! `set_config`), and the service settings that boot the process (TOML file
//! plus environment variables).

use crate::error::{EngramError, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Storage backend selection for a tenant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Embedded SQLite database
    Local {
        #[serde(default = "default_local_path")]
        path: String,
    },
    /// Hosted Postgres with vector RPCs; requires the external adapter
    Supabase { url: String, service_key: String },
}

fn default_local_path() -> String {
    "data/engram.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            path: default_local_path(),
        }
    }
}

/// A tool the agent may call, surfaced to extraction prompts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub tool_name: String,
    pub tool_description: String,
}

/// Time-to-live buckets for extracted profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileTtl {
    OneDay,
    OneWeek,
    OneMonth,
    OneQuarter,
    OneYear,
    Infinity,
}

impl Default for ProfileTtl {
    fn default() -> Self {
        ProfileTtl::Infinity
    }
}

impl ProfileTtl {
    /// Concrete duration for this bucket; `None` means the profile never
    /// expires
    pub fn as_duration(&self) -> Option<chrono::Duration> {
        match self {
            ProfileTtl::OneDay => Some(chrono::Duration::days(1)),
            ProfileTtl::OneWeek => Some(chrono::Duration::weeks(1)),
            ProfileTtl::OneMonth => Some(chrono::Duration::days(30)),
            ProfileTtl::OneQuarter => Some(chrono::Duration::days(91)),
            ProfileTtl::OneYear => Some(chrono::Duration::days(365)),
            ProfileTtl::Infinity => None,
        }
    }
}

/// Per-extractor window overrides; falls back to the tenant defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WindowOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_window_size_override: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_window_stride_override: Option<usize>,
}

/// One configured profile extractor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileExtractorConfig {
    pub extractor_name: String,
    pub profile_content_definition_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_definition_prompt: Option<String>,
    /// When present, a gate LLM call decides whether the window is worth
    /// extracting at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_extract_profile_prompt_override: Option<String>,
    /// Manual-trigger extractors never run on interaction writes
    #[serde(default)]
    pub manual_trigger: bool,
    /// Sources this extractor listens to; empty means all sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_sources_enabled: Option<Vec<String>>,
    #[serde(flatten)]
    pub window: WindowOverrides,
    #[serde(default)]
    pub profile_ttl: ProfileTtl,
}

/// Aggregation thresholds for one feedback family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackAggregatorConfig {
    /// Minimum cluster size before raw feedbacks consolidate into a rule
    pub min_feedback_threshold: usize,
    /// The aggregator re-runs every `refresh_count` raw feedbacks
    pub refresh_count: usize,
}

impl Default for FeedbackAggregatorConfig {
    fn default() -> Self {
        Self {
            min_feedback_threshold: 3,
            refresh_count: 3,
        }
    }
}

/// One configured feedback extractor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentFeedbackConfig {
    pub feedback_name: String,
    pub feedback_definition_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_definition_prompt: Option<String>,
    #[serde(default)]
    pub feedback_aggregator_config: FeedbackAggregatorConfig,
    /// Unlike profiles, feedback listens to all sources unless restricted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_sources_enabled: Option<Vec<String>>,
    #[serde(flatten)]
    pub window: WindowOverrides,
}

/// One configured success evaluator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSuccessConfig {
    pub evaluation_name: String,
    pub success_definition_prompt: String,
    /// Fraction of requests evaluated, decided deterministically per request
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_definition_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_can_use: Option<Vec<ToolDescriptor>>,
    #[serde(flatten)]
    pub window: WindowOverrides,
}

fn default_sampling_rate() -> f64 {
    1.0
}

/// Provider credentials for LLM and embedding calls
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_base_url: Option<String>,
}

/// Model selection for the three LLM roles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub should_run_model_name: String,
    pub generation_model_name: String,
    pub embedding_model_name: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            should_run_model_name: "gpt-4o-mini".to_string(),
            generation_model_name: "gpt-4o".to_string(),
            embedding_model_name: "text-embedding-3-small".to_string(),
        }
    }
}

/// Per-tenant behavioral configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantConfig {
    #[serde(default)]
    pub storage_config: StorageConfig,
    #[serde(default)]
    pub agent_context_prompt: String,
    #[serde(default)]
    pub tool_can_use: Vec<ToolDescriptor>,
    #[serde(default = "default_window_size")]
    pub extraction_window_size: usize,
    #[serde(default = "default_window_stride")]
    pub extraction_window_stride: usize,
    #[serde(default)]
    pub profile_extractor_configs: Vec<ProfileExtractorConfig>,
    #[serde(default)]
    pub agent_feedback_configs: Vec<AgentFeedbackConfig>,
    #[serde(default)]
    pub agent_success_configs: Vec<AgentSuccessConfig>,
    #[serde(default)]
    pub api_key_config: ApiKeyConfig,
    #[serde(default)]
    pub llm_config: LlmConfig,
}

fn default_window_size() -> usize {
    10
}

fn default_window_stride() -> usize {
    5
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            storage_config: StorageConfig::default(),
            agent_context_prompt: String::new(),
            tool_can_use: Vec::new(),
            extraction_window_size: default_window_size(),
            extraction_window_stride: default_window_stride(),
            profile_extractor_configs: Vec::new(),
            agent_feedback_configs: Vec::new(),
            agent_success_configs: Vec::new(),
            api_key_config: ApiKeyConfig::default(),
            llm_config: LlmConfig::default(),
        }
    }
}

impl TenantConfig {
    /// Effective window size for an extractor's overrides
    pub fn window_size(&self, overrides: &WindowOverrides) -> usize {
        overrides
            .extraction_window_size_override
            .unwrap_or(self.extraction_window_size)
    }

    /// Effective window stride for an extractor's overrides
    pub fn window_stride(&self, overrides: &WindowOverrides) -> usize {
        overrides
            .extraction_window_stride_override
            .unwrap_or(self.extraction_window_stride)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if matches!(self.storage_config, StorageConfig::Supabase { .. }) {
            // The hosted backend ships as a separate adapter; this build
            // only bundles the local store
            return Err(EngramError::Config(
                "supabase storage is not available in this build".to_string(),
            ));
        }
        if self.extraction_window_size == 0 {
            return Err(EngramError::Config(
                "extraction_window_size must be > 0".to_string(),
            ));
        }
        if self.extraction_window_stride == 0
            || self.extraction_window_stride > self.extraction_window_size
        {
            return Err(EngramError::Config(
                "extraction_window_stride must be in 1..=extraction_window_size".to_string(),
            ));
        }

        let mut extractor_names = std::collections::HashSet::new();
        for extractor in &self.profile_extractor_configs {
            if extractor.extractor_name.is_empty() {
                return Err(EngramError::Config(
                    "extractor_name cannot be empty".to_string(),
                ));
            }
            if !extractor_names.insert(&extractor.extractor_name) {
                return Err(EngramError::Config(format!(
                    "duplicate extractor_name: {}",
                    extractor.extractor_name
                )));
            }
            if let Some(size) = extractor.window.extraction_window_size_override {
                if size == 0 {
                    return Err(EngramError::Config(format!(
                        "extractor {}: window size override must be > 0",
                        extractor.extractor_name
                    )));
                }
            }
        }

        let mut feedback_names = std::collections::HashSet::new();
        for feedback in &self.agent_feedback_configs {
            if feedback.feedback_name.is_empty() {
                return Err(EngramError::Config(
                    "feedback_name cannot be empty".to_string(),
                ));
            }
            if !feedback_names.insert(&feedback.feedback_name) {
                return Err(EngramError::Config(format!(
                    "duplicate feedback_name: {}",
                    feedback.feedback_name
                )));
            }
            if feedback.feedback_aggregator_config.min_feedback_threshold < 2 {
                return Err(EngramError::Config(format!(
                    "feedback {}: min_feedback_threshold must be >= 2",
                    feedback.feedback_name
                )));
            }
            if feedback.feedback_aggregator_config.refresh_count == 0 {
                return Err(EngramError::Config(format!(
                    "feedback {}: refresh_count must be > 0",
                    feedback.feedback_name
                )));
            }
        }

        for success in &self.agent_success_configs {
            if success.evaluation_name.is_empty() {
                return Err(EngramError::Config(
                    "evaluation_name cannot be empty".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&success.sampling_rate) {
                return Err(EngramError::Config(format!(
                    "evaluation {}: sampling_rate must be between 0.0 and 1.0",
                    success.evaluation_name
                )));
            }
        }

        Ok(())
    }
}

/// Process-level settings that boot the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    /// Codes that gate new organization creation
    pub invitation_codes: Vec<String>,
    /// Background extraction parallelism per tenant
    pub tenant_worker_pool_size: usize,
    /// Global cap on concurrent LLM calls
    pub llm_concurrency_limit: usize,
    /// Seconds a wait-for-response publish blocks before acknowledging
    pub wait_for_response_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            database_path: "data/engram.db".to_string(),
            invitation_codes: Vec::new(),
            tenant_worker_pool_size: 8,
            llm_concurrency_limit: 32,
            wait_for_response_seconds: 60,
        }
    }
}

impl ServiceSettings {
    /// Load settings from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(host) = env::var("ENGRAM_HOST") {
            settings.host = host;
        }
        if let Ok(port) = env::var("ENGRAM_PORT") {
            settings.port = port
                .parse()
                .map_err(|_| EngramError::Config("Invalid ENGRAM_PORT".to_string()))?;
        }
        if let Ok(path) = env::var("ENGRAM_DATABASE_PATH") {
            settings.database_path = path;
        }
        if let Ok(codes) = env::var("ENGRAM_INVITATION_CODES") {
            settings.invitation_codes =
                codes.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(pool) = env::var("ENGRAM_TENANT_WORKERS") {
            settings.tenant_worker_pool_size = pool
                .parse()
                .map_err(|_| EngramError::Config("Invalid ENGRAM_TENANT_WORKERS".to_string()))?;
        }
        if let Ok(cap) = env::var("ENGRAM_LLM_CONCURRENCY") {
            settings.llm_concurrency_limit = cap
                .parse()
                .map_err(|_| EngramError::Config("Invalid ENGRAM_LLM_CONCURRENCY".to_string()))?;
        }

        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngramError::Config(format!("Failed to read settings file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| EngramError::Config(format!("Failed to parse settings file: {e}")))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(EngramError::Config("port must be > 0".to_string()));
        }
        if self.database_path.is_empty() {
            return Err(EngramError::Config(
                "database_path cannot be empty".to_string(),
            ));
        }
        if self.tenant_worker_pool_size == 0 {
            return Err(EngramError::Config(
                "tenant_worker_pool_size must be > 0".to_string(),
            ));
        }
        if self.llm_concurrency_limit == 0 {
            return Err(EngramError::Config(
                "llm_concurrency_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
