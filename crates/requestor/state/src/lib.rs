//! Requestor - Run persistence
//!
//! Records each run as a chain of `demand -> proposal -> agreement ->
//! activity -> batch` rows plus debit notes and result counters. The
//! records are enough to reattach to live activities after the process
//! died, and to report on a run afterwards.

pub mod error;
pub mod memory;
pub mod records;
pub mod sqlite;
pub mod store;

pub use error::{StateError, StateResult};
pub use memory::InMemoryRunStore;
pub use records::{
    ActivityRecord, ActivityRollup, ActivityStatus, AgreementRecord, BatchRecord, DebitNoteRecord,
    DemandRecord, ProposalRecord, RunRecord, RunSummary,
};
pub use sqlite::SqliteRunStore;
pub use store::RunStore;
