//! Error taxonomy for the memory engine
//!
//! Typed errors at module boundaries, converted to the stable wire envelope
//! by the dispatcher. Internal categories are enumerated; surface strings
//! are kept short and human-readable, never leaking stack traces.

use serde::Serialize;
use thiserror::Error;

/// All errors the engine's internal layers can raise.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown scope: {0}")]
    UnknownScope(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("action {action} temporarily unavailable, retry after {retry_after_secs}s")]
    CircuitOpen { action: String, retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the dispatcher's retry wrapper should retry this error.
    ///
    /// Validation errors are non-retryable; backend/store failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable(_) | EngineError::StoreError(_) | EngineError::Internal(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::StoreIntegrity(e.to_string())
            }
            _ => EngineError::StoreError(e.to_string()),
        }
    }
}

/// The stable wire envelope for error responses: `{status: "ERROR", error: "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub status: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&EngineError> for ErrorEnvelope {
    fn from(e: &EngineError) -> Self {
        let retry_after = match e {
            EngineError::CircuitOpen { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        };
        ErrorEnvelope {
            status: "ERROR",
            error: e.to_string(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_retryable() {
        assert!(EngineError::StoreError("x".into()).is_retryable());
        assert!(EngineError::StoreUnavailable("x".into()).is_retryable());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!EngineError::InvalidRequest("missing field".into()).is_retryable());
        assert!(!EngineError::UnknownAction("foo".into()).is_retryable());
    }

    #[test]
    fn circuit_open_carries_retry_after() {
        let err = EngineError::CircuitOpen { action: "store_memory".into(), retry_after_secs: 60 };
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.retry_after, Some(60));
    }
}
