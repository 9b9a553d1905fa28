//! Discriminated error kinds shared by every layer.
//!
//! The lowest layers (embedding calls, store queries) convert raw backend
//! failures into one of these kinds; business logic above them matches on
//! the kind instead of inspecting strings. The tool surface maps each kind
//! to a stable response shape via [`Error::kind`].
//!
//! | Kind | Retried locally? | Surfaced as |
//! |------|------------------|-------------|
//! | `InvalidInput` | no | 400 with field paths |
//! | `NotFound` | no | 404 |
//! | `Conflict` | no | 409 |
//! | `Transient` | yes, with backoff | 503 once retries are exhausted |
//! | `RateLimited` | no | 429 with a retry-after hint |
//! | `FatalConfig` | no | 500, terminates the operation |
//! | `Internal` | no | 500, message redacted |

use serde::Serialize;
use thiserror::Error;

/// A single field-level validation failure, reported with its path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    /// Path of the offending field (e.g. `filters.tags[3]`).
    pub field: String,
    /// Human-readable description of what is wrong.
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Input failed schema or whitelist validation.
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        fields: Vec<FieldError>,
    },

    /// No matching entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ambiguous result where exactly one was required.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable provider or store failure (timeout, 5xx, throttling).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A per-tool request cap was exceeded.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Unrecoverable misconfiguration (bad credentials, dimension mismatch).
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Unexpected failure; the message is redacted at the tool surface.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for an [`Error::InvalidInput`] without field detail.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// An [`Error::InvalidInput`] carrying per-field errors.
    pub fn invalid_fields(message: impl Into<String>, fields: Vec<FieldError>) -> Self {
        Error::InvalidInput {
            message: message.into(),
            fields,
        }
    }

    /// Stable wire discriminator for the tool surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput { .. } => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Transient(_) => "transient",
            Error::RateLimited { .. } => "rate_limited",
            Error::FatalConfig(_) => "fatal_config",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Error::Transient(e.to_string())
            }
            sqlx::Error::Database(db) => {
                // 53xx = insufficient resources, 57xx = operator intervention,
                // 08xxx = connection exceptions. All are worth retrying.
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                if code.starts_with("53") || code.starts_with("57") || code.starts_with("08") {
                    Error::Transient(e.to_string())
                } else {
                    Error::Internal(e.to_string())
                }
            }
            _ => Error::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_discriminators_are_stable() {
        assert_eq!(Error::invalid("x").kind(), "invalid_input");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(Error::Transient("x".into()).kind(), "transient");
        assert_eq!(
            Error::RateLimited {
                retry_after_secs: 1
            }
            .kind(),
            "rate_limited"
        );
        assert_eq!(Error::FatalConfig("x".into()).kind(), "fatal_config");
        assert_eq!(Error::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(Error::Transient("t".into()).is_transient());
        assert!(!Error::invalid("v").is_transient());
        assert!(!Error::FatalConfig("f".into()).is_transient());
    }

    #[test]
    fn field_errors_carry_paths() {
        let err = Error::invalid_fields(
            "filter rejected",
            vec![FieldError::new("filters.tags[0]", "empty string")],
        );
        match err {
            Error::InvalidInput { fields, .. } => {
                assert_eq!(fields[0].field, "filters.tags[0]");
            }
            _ => panic!("expected InvalidInput"),
        }
    }
}
