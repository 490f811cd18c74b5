//! Persisted rows and the views built from them

use chrono::{DateTime, Utc};
use requestor_types::{AgreementState, ResourceId, RunId, StopReason};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Status of an activity as recorded for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    New,
    Ready,
    Busy,
    Stopping,
    Stopped,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::New => "NEW",
            ActivityStatus::Ready => "READY",
            ActivityStatus::Busy => "BUSY",
            ActivityStatus::Stopping => "STOPPING",
            ActivityStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(ActivityStatus::New),
            "READY" => Some(ActivityStatus::Ready),
            "BUSY" => Some(ActivityStatus::Busy),
            "STOPPING" => Some(ActivityStatus::Stopping),
            "STOPPED" => Some(ActivityStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandRecord {
    pub id: ResourceId,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: ResourceId,
    pub demand_id: ResourceId,
    /// Offered by a provider rather than countered by us
    pub initial: bool,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementRecord {
    pub id: ResourceId,
    pub proposal_id: ResourceId,
    pub status: AgreementState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: ResourceId,
    pub agreement_id: ResourceId,
    pub status: ActivityStatus,
    pub stop_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Whether a later process may pick this activity up again
    pub fn is_reusable(&self) -> bool {
        self.stop_reason.is_none()
            && !matches!(self.status, ActivityStatus::Stopping | ActivityStatus::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: ResourceId,
    pub activity_id: ResourceId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitNoteRecord {
    pub id: ResourceId,
    pub activity_id: ResourceId,
    /// Newly accepted on top of the activity's earlier notes
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One activity of a run with its aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRollup {
    pub activity_id: ResourceId,
    pub agreement_id: ResourceId,
    pub status: ActivityStatus,
    pub stop_reason: Option<StopReason>,
    pub batches: u64,
    pub cost: Decimal,
    pub results: u64,
    pub created_at: DateTime<Utc>,
    pub last_batch_at: Option<DateTime<Utc>>,
}

/// Aggregate of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub activities: u64,
    pub results: u64,
    pub total_cost: Decimal,
}

impl RunSummary {
    pub(crate) fn build(run: &RunRecord, rollup: &[ActivityRollup], results: u64) -> Self {
        let last_update = rollup
            .iter()
            .flat_map(|a| std::iter::once(a.created_at).chain(a.last_batch_at))
            .fold(run.started_at, |latest, at| latest.max(at));
        Self {
            run_id: run.id,
            started_at: run.started_at,
            last_update,
            activities: rollup.len() as u64,
            results,
            total_cost: rollup.iter().map(|a| a.cost).sum(),
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.last_update - self.started_at
    }

    pub fn cost_per_result(&self) -> Option<Decimal> {
        (self.results > 0).then(|| self.total_cost / Decimal::from(self.results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            ActivityStatus::New,
            ActivityStatus::Ready,
            ActivityStatus::Busy,
            ActivityStatus::Stopping,
            ActivityStatus::Stopped,
        ] {
            assert_eq!(ActivityStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ActivityStatus::parse("busy"), None);
    }

    #[test]
    fn test_reusable() {
        let mut record = ActivityRecord {
            id: ResourceId::new("a"),
            agreement_id: ResourceId::new("g"),
            status: ActivityStatus::Busy,
            stop_reason: None,
            created_at: Utc::now(),
        };
        assert!(record.is_reusable());
        record.stop_reason = Some(StopReason::TooExpensive);
        assert!(!record.is_reusable());
        record.stop_reason = None;
        record.status = ActivityStatus::Stopped;
        assert!(!record.is_reusable());
    }

    #[test]
    fn test_summary_of_empty_run() {
        let run = RunRecord {
            id: RunId::generate(),
            started_at: Utc::now(),
        };
        let summary = RunSummary::build(&run, &[], 0);
        assert_eq!(summary.elapsed(), chrono::Duration::zero());
        assert_eq!(summary.cost_per_result(), None);
    }
}
