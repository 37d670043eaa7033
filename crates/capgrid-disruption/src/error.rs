use capgrid_reconciler::ProvisionError;
use capgrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DisruptionError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("draining {node} would take pool {pool} below min_size {min_size}")]
    BelowMinSize {
        node: String,
        pool: String,
        min_size: u32,
    },

    #[error("eviction failed: {0}")]
    Evict(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

pub type DisruptionResult<T> = Result<T, DisruptionError>;
