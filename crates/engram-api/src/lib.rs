//! Engram API layer
//!
//! The operation-level service facade over the learning pipeline and the
//! artifact store, API-key authentication, and the axum HTTP surface.

pub mod auth;
pub mod logging;
pub mod service;
pub mod web_server;

pub use auth::ApiKeyAuthenticator;
pub use service::EngramService;
pub use web_server::build_router;
