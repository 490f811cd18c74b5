//! Persistence errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// Referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),
}

/// Result type for persistence operations
pub type StateResult<T> = Result<T, StateError>;
