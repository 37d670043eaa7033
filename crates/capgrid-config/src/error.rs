use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy document: {0}")]
    Parse(String),

    #[error("policy validation failed with {} error(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),
}

impl ConfigError {
    /// Individual messages, for event payloads.
    pub fn messages(&self) -> Vec<String> {
        match self {
            ConfigError::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
