use capgrid_config::ConfigError;
use capgrid_disruption::DisruptionError;
use capgrid_state::{NodeState, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The document is valid on its own but conflicts with live nodes.
    #[error("policy rejected: {}", .0.join("; "))]
    Rejected(Vec<String>),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {node} is {state}, expected {expected}")]
    InvalidState {
        node: String,
        state: NodeState,
        expected: NodeState,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Disruption(#[from] DisruptionError),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    /// The caller asked for something invalid, as opposed to a dependency
    /// (store, provider, filesystem) failing.
    pub fn is_validation(&self) -> bool {
        match self {
            ControlError::Config(ConfigError::Io { .. }) => false,
            ControlError::Config(_)
            | ControlError::Rejected(_)
            | ControlError::NodeNotFound(_)
            | ControlError::InvalidState { .. } => true,
            ControlError::State(e) => state_is_validation(e),
            ControlError::Disruption(e) => match e {
                DisruptionError::NodeNotFound(_) | DisruptionError::BelowMinSize { .. } => true,
                DisruptionError::State(e) => state_is_validation(e),
                DisruptionError::Evict(_) | DisruptionError::Provision(_) => false,
            },
        }
    }

    /// Process exit code: 1 for validation errors, 2 for external failures.
    pub fn exit_code(&self) -> i32 {
        if self.is_validation() { 1 } else { 2 }
    }
}

fn state_is_validation(err: &StateError) -> bool {
    matches!(
        err,
        StateError::NotFound(_)
            | StateError::CapacityBound { .. }
            | StateError::IneligibleShape { .. }
            | StateError::NodeNotSchedulable { .. }
    )
}
