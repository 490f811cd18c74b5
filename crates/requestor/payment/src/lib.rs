//! Requestor - Payment
//!
//! Pays for the work: accepts debit notes and invoices against hourly
//! allocations, enforces a rolling one-hour spending cap and flags activities
//! whose cost per result exceeds the configured maximum.
//!
//! Budget exhaustion and expensive activities are reported on the event bus
//! (`BudgetExceeded`, `ActivityFlagged`); stopping work is left to the owner
//! of the activities.

pub mod budget;
pub mod cost;
pub mod error;
pub mod monitor;
pub mod rotation;

pub use budget::{BudgetDecision, RollingBudget};
pub use cost::{ActivityCost, CostTracker};
pub use error::{PaymentError, PaymentResult};
pub use monitor::{PaymentConfig, PaymentMonitor};
pub use rotation::AllocationRotator;
