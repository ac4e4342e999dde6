//! Error types for the engram service

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Public error codes surfaced to API callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Auth,
    NotFound,
    Validation,
    Conflict,
    BackendTimeout,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Auth => write!(f, "AUTH"),
            ErrorCode::NotFound => write!(f, "NOT_FOUND"),
            ErrorCode::Validation => write!(f, "VALIDATION"),
            ErrorCode::Conflict => write!(f, "CONFLICT"),
            ErrorCode::BackendTimeout => write!(f, "BACKEND_TIMEOUT"),
            ErrorCode::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Main error type for the engram crates
#[derive(Error, Debug)]
pub enum EngramError {
    /// IO related errors
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {source}")]
    Serialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Bad client payload, never retried
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or expired API key
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Entity lookup failures
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate primary key or concurrent config edit
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store access failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// A backend call exceeded its deadline
    #[error("Backend timeout: {0}")]
    Timeout(String),

    /// Transient LLM/provider failure, retried with backoff
    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    /// The model returned output that does not match the requested schema
    #[error("LLM schema violation: {0}")]
    LlmSchemaViolation(String),

    /// Unrecoverable LLM/provider failure
    #[error("LLM error: {0}")]
    Llm(String),

    /// Operation-state lock handling failures
    #[error("Lock error: {0}")]
    Lock(String),

    /// Generic error with custom message
    #[error("Error: {0}")]
    Other(String),
}

impl EngramError {
    /// Map this error to the public code carried in failure envelopes
    pub fn code(&self) -> ErrorCode {
        match self {
            EngramError::Auth(_) => ErrorCode::Auth,
            EngramError::NotFound(_) => ErrorCode::NotFound,
            EngramError::InvalidInput(_) | EngramError::Config(_) => ErrorCode::Validation,
            EngramError::Conflict(_) => ErrorCode::Conflict,
            EngramError::Timeout(_) => ErrorCode::BackendTimeout,
            _ => ErrorCode::Internal,
        }
    }

    /// Transient failures are retried with exponential backoff; everything
    /// else is surfaced or logged immediately
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngramError::LlmTransient(_) | EngramError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(error: serde_json::Error) -> Self {
        EngramError::Serialization {
            source: Box::new(error),
        }
    }
}

impl From<anyhow::Error> for EngramError {
    fn from(error: anyhow::Error) -> Self {
        EngramError::Other(format!("{error:#}"))
    }
}

/// Result type for the engram crates
pub type Result<T> = std::result::Result<T, EngramError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(EngramError::Auth("bad key".into()).code(), ErrorCode::Auth);
        assert_eq!(
            EngramError::NotFound("profile".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            EngramError::InvalidInput("empty user_id".into()).code(),
            ErrorCode::Validation
        );
        assert_eq!(
            EngramError::Conflict("duplicate".into()).code(),
            ErrorCode::Conflict
        );
        assert_eq!(
            EngramError::Timeout("store".into()).code(),
            ErrorCode::BackendTimeout
        );
        assert_eq!(
            EngramError::Storage("corrupt row".into()).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngramError::LlmTransient("429".into()).is_transient());
        assert!(EngramError::Timeout("deadline".into()).is_transient());
        assert!(!EngramError::Auth("expired".into()).is_transient());
        assert!(!EngramError::LlmSchemaViolation("bad shape".into()).is_transient());
    }

    #[test]
    fn test_code_display_matches_wire_format() {
        assert_eq!(ErrorCode::BackendTimeout.to_string(), "BACKEND_TIMEOUT");
        assert_eq!(ErrorCode::NotFound.to_string(), "NOT_FOUND");
    }
}
