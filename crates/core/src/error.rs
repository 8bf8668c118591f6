//! Coordination error model.

use thiserror::Error;

/// Result type used across the coordination layer.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Error returned by the saga coordinator and the dead letter queue.
///
/// Nothing in this taxonomy is fatal to the host process. `InvalidState` in
/// particular is advisory: it is how duplicate or late deliveries surface
/// under at-least-once semantics, and callers treat it as a no-op.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// Unknown saga or entry id.
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Operation attempted against a resource that is not in the required state.
    #[error("cannot {operation} {resource} {id} in state {state}")]
    InvalidState {
        resource: &'static str,
        id: String,
        state: String,
        operation: &'static str,
    },

    /// The retry handler rejected the entry or returned an error.
    #[error("retry handler failed: {0}")]
    HandlerFailure(String),

    /// The dead letter queue reached its configured size.
    #[error("dead letter queue at capacity ({max} entries)")]
    CapacityExceeded { max: usize },

    /// Caller input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoordinationError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        resource: &'static str,
        id: impl ToString,
        state: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            resource,
            id: id.to_string(),
            state: state.to_string(),
            operation,
        }
    }

    pub fn handler_failure(msg: impl Into<String>) -> Self {
        Self::HandlerFailure(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for errors that signal duplicate/out-of-order delivery and should be
    /// treated as a no-op rather than propagated.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
