//! Error types for the capgrid state store.

use thiserror::Error;

use crate::types::NodeState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pool {pool} would exceed max size {max} ({active} active, {requested} requested)")]
    CapacityBound {
        pool: String,
        max: u32,
        active: u32,
        requested: u32,
    },

    #[error("shape {shape} is not eligible for pool {pool}")]
    IneligibleShape { pool: String, shape: String },

    #[error("node {node} is {state} and accepts no new workloads")]
    NodeNotSchedulable { node: String, state: NodeState },
}
