//! Error taxonomy shared by every ragline component.
//!
//! | Variant | Meaning | Retried by ragline? |
//! |---------|---------|---------------------|
//! | `Validation` | malformed configuration or input | never |
//! | `NotFound` | referenced document, conversation or task is absent | never |
//! | `Conflict` | duplicate resource creation | never |
//! | `Transport` | one transient provider/backend failure | yes, inside the retry loop |
//! | `UpstreamUnavailable` | `Transport` failures exhausted the attempt ceiling | by the caller |
//! | `Processing` | a pipeline stage failed mid-run | by re-submitting |
//! | `Cancelled` | cooperative cancellation was observed | n/a |

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RagError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    /// A single transient failure. Retry loops consume these; once the
    /// attempt ceiling is hit they become [`RagError::UpstreamUnavailable`].
    #[error("{service} transport error: {message}")]
    Transport { service: String, message: String },

    #[error("{service} unavailable after {attempts} attempts: {message}")]
    UpstreamUnavailable {
        service: String,
        attempts: u32,
        message: String,
    },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("cancelled")]
    Cancelled,
}

impl RagError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RagError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RagError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        RagError::Processing(msg.into())
    }

    pub fn transport(service: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        RagError::Transport {
            service: service.into(),
            message: msg.to_string(),
        }
    }

    /// True only for failures worth another attempt inside a retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::Transport { .. })
    }

    /// Stable snake_case label for logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::NotFound { .. } => "not_found",
            RagError::Conflict(_) => "conflict",
            RagError::Transport { .. } => "transport",
            RagError::UpstreamUnavailable { .. } => "upstream_unavailable",
            RagError::Processing(_) => "processing",
            RagError::Cancelled => "cancelled",
        }
    }

    /// Convert an exhausted transient failure into `UpstreamUnavailable`.
    /// Other variants pass through untouched.
    pub fn exhausted(self, attempts: u32) -> Self {
        match self {
            RagError::Transport { service, message } => RagError::UpstreamUnavailable {
                service,
                attempts,
                message,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Processing(format!("json: {e}"))
    }
}
