//! Structured-generation helpers
//!
//! A schema violation gets exactly one targeted retry carrying a schema
//! reminder; a second violation is fatal for the current window only.

use engram_core::llm::LlmAdapter;
use engram_types::{EngramError, Result};
use serde_json::Value;
use tracing::warn;

const SCHEMA_REMINDER: &str = "\n\nYour previous reply did not match the required JSON schema. \
Respond again with a single JSON object that exactly matches the schema: every required key \
present, no extra keys, no prose outside the JSON.";

/// Run a structured generation with the one-retry schema policy and decode
/// the result
pub async fn generate_decoded<T: serde::de::DeserializeOwned>(
    llm: &dyn LlmAdapter,
    model: &str,
    schema: &Value,
    prompt: &str,
) -> Result<T> {
    let value = match llm.structured_generate(model, schema, prompt).await {
        Ok(value) => value,
        Err(EngramError::LlmSchemaViolation(first)) => {
            warn!("schema violation, retrying with reminder: {first}");
            let reminder_prompt = format!("{prompt}{SCHEMA_REMINDER}");
            llm.structured_generate(model, schema, &reminder_prompt)
                .await?
        }
        Err(other) => return Err(other),
    };

    serde_json::from_value(value)
        .map_err(|e| EngramError::LlmSchemaViolation(format!("undecodable model output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyLlm {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait::async_trait]
    impl LlmAdapter for FlakyLlm {
        async fn structured_generate(
            &self,
            _model: &str,
            _schema: &Value,
            prompt: &str,
        ) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(EngramError::LlmSchemaViolation("bad shape".to_string()));
            }
            // The retry must carry the reminder text
            if call == 1 {
                assert!(prompt.contains("did not match"));
            }
            Ok(json!({"should_extract": true}))
        }

        async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 4])
        }
    }

    #[derive(serde::Deserialize)]
    struct Gate {
        should_extract: bool,
    }

    #[tokio::test]
    async fn test_retry_once_on_schema_violation() {
        let llm = FlakyLlm {
            calls: AtomicUsize::new(0),
            fail_first: true,
        };
        let gate: Gate = generate_decoded(&llm, "m", &json!({}), "prompt").await.unwrap();
        assert!(gate.should_extract);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_first_call_succeeds() {
        let llm = FlakyLlm {
            calls: AtomicUsize::new(0),
            fail_first: false,
        };
        let _: Gate = generate_decoded(&llm, "m", &json!({}), "prompt").await.unwrap();
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    struct AlwaysInvalid;

    #[async_trait::async_trait]
    impl LlmAdapter for AlwaysInvalid {
        async fn structured_generate(
            &self,
            _model: &str,
            _schema: &Value,
            _prompt: &str,
        ) -> Result<Value> {
            Err(EngramError::LlmSchemaViolation("still bad".to_string()))
        }

        async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 4])
        }
    }

    #[tokio::test]
    async fn test_second_violation_is_fatal() {
        let result: Result<Gate> =
            generate_decoded(&AlwaysInvalid, "m", &json!({}), "prompt").await;
        assert!(matches!(result, Err(EngramError::LlmSchemaViolation(_))));
    }
}
