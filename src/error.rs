//! Engine error taxonomy.
//!
//! Query-style operations (`get`, `search`, `recommend*`) return empty results
//! or `None` when nothing matches; only mutations surface `NotFound`. The
//! `is_retryable` helper lets callers distinguish transient conditions
//! (version conflicts, database unavailability, exceeded budgets) from
//! terminal ones.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the knowledge engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The referenced record does not exist (or is tombstoned).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic-concurrency version mismatch. The caller should re-read and
    /// retry its delta rather than overwrite.
    #[error("version conflict on {kind} {id}")]
    Conflict { kind: &'static str, id: String },

    /// The input was rejected before any write happened.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The underlying store is unreachable or misbehaving.
    #[error("knowledge database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A traversal or delivery exceeded its budget.
    #[error("{operation} exceeded its time budget")]
    Timeout { operation: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the caller may retry the same operation and expect it to
    /// eventually succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Database(_) | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_timeout_are_retryable() {
        assert!(EngineError::conflict("entry", "e1").is_retryable());
        assert!(EngineError::Timeout { operation: "related_to" }.is_retryable());
    }

    #[test]
    fn not_found_and_validation_are_terminal() {
        assert!(!EngineError::not_found("entry", "e1").is_retryable());
        assert!(!EngineError::validation("empty content").is_retryable());
    }
}
