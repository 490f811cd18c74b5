//! Task distribution errors

use requestor_core::RequestorError;
use requestor_payment::PaymentError;
use requestor_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Requestor(#[from] RequestorError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("Run store error: {0}")]
    State(#[from] StateError),

    #[error("Failed to read work source: {0}")]
    Io(#[from] std::io::Error),

    /// The work source file is malformed
    #[error("Invalid work source: {0}")]
    InvalidSource(String),

    /// No further agreement can be obtained
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Run {0} not found")]
    RunNotFound(String),
}

/// Result type for task distribution
pub type TaskResult<T> = Result<T, TaskError>;
