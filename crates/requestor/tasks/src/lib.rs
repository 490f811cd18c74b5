//! Requestor - Task distribution
//!
//! Runs a list of tasks on rented activities. The distributor negotiates
//! and prepares activities, feeds them tasks, replaces the ones that fail
//! or cost too much, and records everything in a run store so an
//! interrupted run can be resumed on the same agreements.

pub mod distributor;
pub mod error;
pub mod outcome;
pub mod source;
pub mod worker;
pub mod writer;

pub use distributor::{Distributor, DistributorConfig};
pub use error::{TaskError, TaskResult};
pub use outcome::{RunOutcome, StopCause};
pub use source::{DemandSpec, QueueTaskSource, TaskSource, TaskSpec, WorkSource, DEFAULT_REPOSITORY_URL};
pub use worker::{FailureTracker, WorkerSlot, WorkerState};
pub use writer::{activity_status, EventWriter};
