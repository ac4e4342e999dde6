//! Engram domain logic and abstractions
//!
//! This crate defines the domain entities, repository traits, and pure
//! algorithms of the behavioral learning pipeline without any I/O
//! dependencies. Infrastructure implementations are provided through trait
//! implementations in `engram-infra`.

pub mod cluster;
pub mod hashing;
pub mod llm;
pub mod models;
pub mod repository;
pub mod search;
pub mod window;

pub use cluster::{
    centroid, cluster_embeddings, jaccard_index, overlap_fraction, DEFAULT_CLUSTER_EPSILON,
};
pub use hashing::{content_hash, passes_sampling, sampling_fraction};
pub use llm::{estimate_tokens, LlmAdapter, DEFAULT_PROMPT_TOKEN_BUDGET};
pub use models::*;
pub use repository::*;
pub use search::{
    cosine_distance, cosine_similarity, parse_query, reciprocal_rank_fusion, ParsedQuery,
    SearchMode, RRF_K,
};
pub use window::{incremental_window, manual_window, rerun_chunks, Window, WindowItem, WindowMode};
