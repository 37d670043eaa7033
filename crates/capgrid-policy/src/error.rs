use thiserror::Error;

use crate::model::Scope;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("system default mTLS mode must be strict")]
    PermissiveDefault,

    #[error("policy conflict at {scope}: {detail} (add a `loosen` statement to allow)")]
    PolicyConflict { scope: Scope, detail: String },

    #[error("duplicate traffic policy for {0}")]
    DuplicateScope(Scope),

    #[error("invalid circuit breaker at {scope}: {reason}")]
    InvalidCircuitBreaker { scope: Scope, reason: String },

    #[error("`loosen` at {0} requires a non-empty reason")]
    EmptyLoosenReason(Scope),

    #[error("invalid gateway rule for host {host:?}: {reason}")]
    InvalidGatewayRule { host: String, reason: String },

    #[error("duplicate gateway rule for host {0:?}")]
    DuplicateHost(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
