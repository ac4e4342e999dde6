//! HTTP LLM and embedding adapter
//!
//! Speaks the OpenAI-compatible wire format: chat completions with a JSON
//! schema response format for structured generation, and the embeddings
//! endpoint pinned to the service-wide 512 dimensions. Transient provider
//! failures (429, 5xx, timeouts) retry with exponential backoff.

use engram_core::llm::LlmAdapter;
use engram_types::{EngramError, Result, EMBEDDING_DIM};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

/// Endpoint and credentials for one provider
#[derive(Debug, Clone)]
pub struct LlmEndpointConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for LlmEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_timeout_seconds: 60,
        }
    }
}

/// Exponential backoff applied to transient provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based); `None` when out of retries
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Some(self.max_delay.min(Duration::from_secs_f64(scaled)))
    }
}

/// OpenAI-compatible adapter
pub struct HttpLlmAdapter {
    client: Client,
    config: LlmEndpointConfig,
    retry: RetryPolicy,
}

impl HttpLlmAdapter {
    pub fn new(config: LlmEndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| EngramError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(&url, body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match self.retry.delay_for(attempt) {
                    Some(delay) => {
                        warn!(attempt, ?delay, "transient provider failure, retrying: {err}");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngramError::Timeout(format!("provider request timed out: {e}"))
            } else {
                EngramError::LlmTransient(format!("provider request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(EngramError::LlmTransient(format!(
                "provider returned {status}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngramError::Llm(format!(
                "provider returned {status}: {detail}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngramError::Llm(format!("provider response was not JSON: {e}")))
    }
}

#[async_trait::async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn structured_generate(
        &self,
        model: &str,
        schema: &Value,
        prompt: &str,
    ) -> Result<Value> {
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "strict": true,
                    "schema": schema,
                }
            }
        });

        let response = self.post_json("/chat/completions", &body).await?;
        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngramError::Llm("provider response missing message content".to_string())
            })?;

        serde_json::from_str(content).map_err(|e| {
            EngramError::LlmSchemaViolation(format!("model output is not valid JSON: {e}"))
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": model,
            "input": text,
            "dimensions": EMBEDDING_DIM,
        });

        let response = self.post_json("/embeddings", &body).await?;
        let values = response
            .pointer("/data/0/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| EngramError::Llm("provider response missing embedding".to_string()))?;

        let embedding: Vec<f32> = values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| EngramError::Llm("embedding contained non-numeric values".to_string()))?;

        if embedding.len() != EMBEDDING_DIM {
            return Err(EngramError::Llm(format!(
                "expected {EMBEDDING_DIM}-dimensional embedding, got {}",
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}
