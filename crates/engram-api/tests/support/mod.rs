//! Test support: a scripted LLM adapter

use engram_core::llm::LlmAdapter;
use engram_types::{EngramError, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scripted LLM: generation answers come from a queue, gates auto-approve,
/// embeddings are hash-derived so identical text embeds identically
pub struct StaticLlm {
    responses: Mutex<VecDeque<Value>>,
    pub generate_calls: AtomicUsize,
}

impl StaticLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            generate_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, value: Value) {
        self.responses.lock().unwrap().push_back(value);
    }
}

/// Deterministic pseudo-embedding: 16 dimensions seeded by SHA-256 of the
/// text
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = Vec::with_capacity(16);
    for pair in digest.chunks_exact(2).take(16) {
        let raw = i16::from_le_bytes([pair[0], pair[1]]);
        out.push(raw as f32 / i16::MAX as f32);
    }
    let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut out {
            *v /= norm;
        }
    }
    out
}

#[async_trait::async_trait]
impl LlmAdapter for StaticLlm {
    async fn structured_generate(
        &self,
        _model: &str,
        schema: &Value,
        _prompt: &str,
    ) -> Result<Value> {
        // Gate calls auto-approve and do not consume the script
        if schema.pointer("/properties/should_extract").is_some() {
            return Ok(json!({"should_extract": true}));
        }

        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().unwrap().pop_front() {
            Some(value) => Ok(value),
            None if schema.pointer("/properties/items").is_some() => Ok(json!({"items": []})),
            None => Err(EngramError::Llm("no scripted response left".to_string())),
        }
    }

    async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(text))
    }
}
