//! LLM adapter port
//!
//! Extractors treat the language model as an opaque pair of operations:
//! schema-guided generation and embedding. Concrete providers live in
//! `engram-infra`; schema-violation retries stay with the callers because
//! the reminder text is extractor-specific.

use engram_types::Result;

/// Opaque language-model operations used by the extraction pipeline
#[async_trait::async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Generate an object matching `schema`, or fail with
    /// `EngramError::LlmSchemaViolation` when the model cannot comply
    async fn structured_generate(
        &self,
        model: &str,
        schema: &serde_json::Value,
        prompt: &str,
    ) -> Result<serde_json::Value>;

    /// Embed `text` into the service-wide 512-dimensional space
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;
}

/// Prompt budget applied to window transcripts before dispatch
pub const DEFAULT_PROMPT_TOKEN_BUDGET: usize = 12_000;

/// Cheap token estimate; four characters per token is close enough for
/// budgeting window transcripts
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimate_scales_with_length() {
        assert_eq!(estimate_tokens(""), 1);
        let short = estimate_tokens("hello");
        let long = estimate_tokens(&"hello ".repeat(100));
        assert!(long > short * 50);
    }
}
