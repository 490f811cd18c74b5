//! Payment errors

use requestor_core::RequestorError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors from payment processing
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Requestor(#[from] RequestorError),

    /// The rolling budget refused a payment
    #[error("Budget exceeded: {spent} spent of {budget} per hour")]
    BudgetExceeded { spent: Decimal, budget: Decimal },

    #[error("Unexpected payment resource: {0}")]
    UnexpectedResource(String),
}

/// Result type for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;
