//! Engram shared types and utilities
//!
//! This crate provides common identifiers, status enums, error definitions,
//! and the per-tenant configuration schema used across all engram crates.

pub mod common;
pub mod config;
pub mod error;

// Re-export everything for easy access
pub use common::*;
pub use config::*;
pub use error::*;
