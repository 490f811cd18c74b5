//! CLI error types

use requestor_core::RequestorError;
use requestor_state::StateError;
use requestor_tasks::TaskError;
use thiserror::Error;

/// CLI error types
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Daemon or session error
    #[error(transparent)]
    Requestor(#[from] RequestorError),

    /// Run store error
    #[error("Run store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Task(#[from] TaskError),

    /// No run matches the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML encoding error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
