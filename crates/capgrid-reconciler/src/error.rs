use std::time::Duration;

use thiserror::Error;

/// Failures reported by the capacity provisioning API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("capacity unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("state store: {0}")]
    State(String),
}

impl ProvisionError {
    /// Worth retrying within the same cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Throttled(_) | ProvisionError::Unavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProvisionError::TimedOut(_))
    }
}

impl From<capgrid_state::StateError> for ProvisionError {
    fn from(e: capgrid_state::StateError) -> Self {
        ProvisionError::State(e.to_string())
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
