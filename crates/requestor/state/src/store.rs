//! Run store contract

use crate::error::StateResult;
use crate::records::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requestor_types::{AgreementState, ResourceId, RunId, StopReason};

/// Persistence of runs and their resource chains.
///
/// Inserts are idempotent: writing a row whose id already exists leaves the
/// stored row untouched. A row whose parent is missing is refused with
/// `StateError::NotFound`.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create the schema if it does not exist yet
    async fn install(&self) -> StateResult<()>;

    /// Record a new run, or return the existing one with the same id
    async fn create_run(&self, id: RunId, started_at: DateTime<Utc>) -> StateResult<RunRecord>;

    async fn get_run(&self, id: &RunId) -> StateResult<Option<RunRecord>>;

    /// Most recently started run
    async fn latest_run(&self) -> StateResult<Option<RunRecord>>;

    /// Delete a run and everything recorded under it
    async fn delete_run(&self, id: &RunId) -> StateResult<bool>;

    async fn insert_demand(&self, record: DemandRecord) -> StateResult<()>;

    async fn insert_proposal(&self, record: ProposalRecord) -> StateResult<()>;

    async fn insert_agreement(&self, record: AgreementRecord) -> StateResult<()>;

    async fn insert_activity(&self, record: ActivityRecord) -> StateResult<()>;

    async fn insert_batch(&self, record: BatchRecord) -> StateResult<()>;

    async fn insert_debit_note(&self, record: DebitNoteRecord) -> StateResult<()>;

    async fn update_agreement_status(&self, id: &ResourceId, status: AgreementState) -> StateResult<()>;

    /// Set the status of an activity. A `None` reason keeps the stored one.
    async fn update_activity_status(
        &self,
        id: &ResourceId,
        status: ActivityStatus,
        stop_reason: Option<StopReason>,
    ) -> StateResult<()>;

    /// Add to the result counter of an activity
    async fn add_results(&self, run_id: &RunId, activity_id: &ResourceId, count: u64) -> StateResult<()>;

    async fn agreements(&self, run_id: &RunId) -> StateResult<Vec<AgreementRecord>>;

    async fn activities(&self, run_id: &RunId) -> StateResult<Vec<ActivityRecord>>;

    /// Debit notes of the run created at or after `since`
    async fn debit_notes(&self, run_id: &RunId, since: Option<DateTime<Utc>>) -> StateResult<Vec<DebitNoteRecord>>;

    /// Per-activity aggregates, oldest activity first
    async fn rollup(&self, run_id: &RunId) -> StateResult<Vec<ActivityRollup>>;

    async fn summary(&self, run_id: &RunId) -> StateResult<Option<RunSummary>>;
}
