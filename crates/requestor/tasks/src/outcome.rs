//! How a run ended

use requestor_types::RunId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the distributor stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum StopCause {
    /// Every task was processed
    Completed,
    /// Interrupted by the user
    UserRequested,
    BudgetExhausted { spent: Decimal, budget: Decimal },
    /// A collector the run depends on gave up
    CollectorFailed { collector: String, reason: String },
    /// No agreement could be obtained
    NegotiationFailed { reason: String },
    Fatal { reason: String },
}

impl StopCause {
    /// Process exit code for this cause
    pub fn exit_code(&self) -> i32 {
        match self {
            StopCause::Completed | StopCause::UserRequested => 0,
            StopCause::BudgetExhausted { .. } => 2,
            StopCause::CollectorFailed { .. } => 3,
            StopCause::NegotiationFailed { .. } => 4,
            StopCause::Fatal { .. } => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Completed => write!(f, "all tasks processed"),
            StopCause::UserRequested => write!(f, "stopped by user"),
            StopCause::BudgetExhausted { spent, budget } => {
                write!(f, "budget exhausted ({} of {} per hour)", spent, budget)
            }
            StopCause::CollectorFailed { collector, reason } => {
                write!(f, "collector {} failed: {}", collector, reason)
            }
            StopCause::NegotiationFailed { reason } => write!(f, "negotiation failed: {}", reason),
            StopCause::Fatal { reason } => write!(f, "{}", reason),
        }
    }
}

/// Result of one `Distributor::run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub cause: StopCause,
    pub tasks_completed: u64,
    /// Tasks dropped after exhausting their attempts
    pub tasks_failed: u64,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.cause.exit_code()
    }
}
