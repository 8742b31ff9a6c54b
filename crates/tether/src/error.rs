//! Core error taxonomy.
//!
//! Every user-visible failure carries a stable `code` plus a human-readable
//! message. Repositories use `anyhow` internally; services surface this type.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("proposal base hash is stale; workflow is now at {current_hash}")]
    StaleBase { current_hash: String },

    #[error("Workflow hash mismatch; workflow is now at {current_hash}")]
    HashMismatch { current_hash: String },

    #[error("invalid resume token")]
    InvalidToken,

    #[error("deadline elapsed: {0}")]
    Timeout(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("runner disconnected: {0}")]
    RunnerDisconnected(String),

    #[error("sandbox unhealthy: {0}")]
    SandboxUnhealthy(String),

    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code, surfaced in API bodies and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::StaleBase { .. } => "STALE_BASE",
            CoreError::HashMismatch { .. } => "HASH_MISMATCH",
            CoreError::InvalidToken => "INVALID_TOKEN",
            CoreError::Timeout(_) => "TIMEOUT",
            CoreError::Busy(_) => "BUSY",
            CoreError::RunnerDisconnected(_) => "RUNNER_DISCONNECTED",
            CoreError::SandboxUnhealthy(_) => "SANDBOX_UNHEALTHY",
            CoreError::UnknownRecipient(_) => "UNKNOWN_RECIPIENT",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    /// Transient failures callers may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_) | CoreError::Busy(_) | CoreError::RunnerDisconnected(_)
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Internal(anyhow::Error::new(err).context("database error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::validation("x").code(), "VALIDATION");
        assert_eq!(
            CoreError::HashMismatch { current_hash: "sha256:ab".into() }.code(),
            "HASH_MISMATCH"
        );
        assert_eq!(
            CoreError::StaleBase { current_hash: "sha256:ab".into() }.code(),
            "STALE_BASE"
        );
        assert_eq!(CoreError::InvalidToken.code(), "INVALID_TOKEN");
    }

    #[test]
    fn transient_classes() {
        assert!(CoreError::Busy("queue full".into()).is_transient());
        assert!(CoreError::Timeout("actor call".into()).is_transient());
        assert!(!CoreError::validation("bad").is_transient());
    }

    #[test]
    fn hash_mismatch_message_names_the_mismatch() {
        let err = CoreError::HashMismatch { current_hash: "sha256:ff".into() };
        assert!(err.to_string().contains("Workflow hash mismatch"));
    }
}
