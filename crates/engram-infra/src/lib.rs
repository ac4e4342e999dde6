//! Engram infrastructure layer
//!
//! This crate provides concrete implementations of the `engram-core`
//! repository traits and handles all I/O: the SQLite artifact store with
//! hybrid search, the HTTP LLM/embedding adapter, and the per-tenant
//! configuration cache.

pub mod cache;
pub mod llm;
pub mod store;

pub use cache::TenantConfigCache;
pub use llm::{HttpLlmAdapter, LlmEndpointConfig, RetryPolicy};
pub use store::SqliteStore;
