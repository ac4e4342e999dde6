//! Content hashing and deterministic sampling
//!
//! Derived-artifact writes are idempotent: each artifact carries a SHA-256
//! hash over its semantically identifying fields, and inserts upsert on
//! `(org_id, content_hash)`. The same hash primitive drives the success
//! evaluator's sampling decision so reruns are reproducible.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest over the given parts, length-prefixed so that
/// `["ab", "c"]` and `["a", "bc"]` never collide
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex_encode(&hasher.finalize())
}

/// Map `(request_id, evaluation_name)` to a uniform fraction in `[0, 1)`
pub fn sampling_fraction(request_id: &str, evaluation_name: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(evaluation_name.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) as f64) / (u64::MAX as f64 + 1.0)
}

/// The deterministic sampling decision for a success evaluation
pub fn passes_sampling(request_id: &str, evaluation_name: &str, sampling_rate: f64) -> bool {
    if sampling_rate >= 1.0 {
        return true;
    }
    if sampling_rate <= 0.0 {
        return false;
    }
    sampling_fraction(request_id, evaluation_name) < sampling_rate
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
