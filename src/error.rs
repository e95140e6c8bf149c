//! Error taxonomy for the research engine.
//!
//! Engine modules (queue, index, store, retrieval) return [`EngineError`] so
//! callers can distinguish retryable conditions from permanent ones. The CLI
//! and orchestration layers convert into `anyhow` at the boundary.

use thiserror::Error;

/// Result alias used throughout the engine modules.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Classified engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Backing-store hiccup (connection, lock contention, I/O). Retryable
    /// with backoff.
    #[error("transient store error: {0}")]
    Transient(#[from] sqlx::Error),

    /// The requested document or task does not exist. Not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller does not hold the current claim on the task. The caller
    /// must re-claim, not escalate.
    #[error("worker '{worker}' does not hold the claim on task {task_id}")]
    NotOwner { task_id: String, worker: String },

    /// Malformed input rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The vector index cannot be reached. Retrieval degrades to empty
    /// context; direct callers may retry.
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// The task reached its terminal failed state. Requires operator
    /// re-enqueue; never retried automatically.
    #[error("task {0} exceeded max attempts")]
    MaxAttemptsExceeded(String),
}

impl EngineError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::IndexUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::IndexUnavailable("down".into()).is_retryable());
        assert!(!EngineError::NotFound("T1055/windows".into()).is_retryable());
        assert!(!EngineError::Validation("bad score".into()).is_retryable());
        assert!(!EngineError::NotOwner {
            task_id: "t1".into(),
            worker: "w1".into()
        }
        .is_retryable());
    }
}
