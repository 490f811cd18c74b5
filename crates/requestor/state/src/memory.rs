//! In-memory run store

use crate::error::{StateError, StateResult};
use crate::records::*;
use crate::store::RunStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requestor_types::{AgreementState, ResourceId, RunId, StopReason};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, RunRecord>,
    demands: HashMap<ResourceId, DemandRecord>,
    proposals: HashMap<ResourceId, ProposalRecord>,
    agreements: HashMap<ResourceId, AgreementRecord>,
    activities: HashMap<ResourceId, ActivityRecord>,
    batches: HashMap<ResourceId, BatchRecord>,
    debit_notes: HashMap<ResourceId, DebitNoteRecord>,
    /// Result counters keyed by activity
    results: HashMap<ResourceId, (RunId, u64)>,
}

impl Tables {
    fn run_of_demand(&self, id: &ResourceId) -> Option<RunId> {
        self.demands.get(id).map(|d| d.run_id)
    }

    fn run_of_proposal(&self, id: &ResourceId) -> Option<RunId> {
        self.proposals
            .get(id)
            .and_then(|p| self.run_of_demand(&p.demand_id))
    }

    fn run_of_agreement(&self, id: &ResourceId) -> Option<RunId> {
        self.agreements
            .get(id)
            .and_then(|a| self.run_of_proposal(&a.proposal_id))
    }

    fn run_of_activity(&self, id: &ResourceId) -> Option<RunId> {
        self.activities
            .get(id)
            .and_then(|a| self.run_of_agreement(&a.agreement_id))
    }

    fn activities_of(&self, run_id: &RunId) -> Vec<&ActivityRecord> {
        let mut activities: Vec<_> = self
            .activities
            .values()
            .filter(|a| self.run_of_agreement(&a.agreement_id).as_ref() == Some(run_id))
            .collect();
        activities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        activities
    }

    fn rollup(&self, run_id: &RunId) -> Vec<ActivityRollup> {
        self.activities_of(run_id)
            .into_iter()
            .map(|activity| {
                let batches: Vec<_> = self
                    .batches
                    .values()
                    .filter(|b| b.activity_id == activity.id)
                    .collect();
                ActivityRollup {
                    activity_id: activity.id.clone(),
                    agreement_id: activity.agreement_id.clone(),
                    status: activity.status,
                    stop_reason: activity.stop_reason,
                    batches: batches.len() as u64,
                    cost: self
                        .debit_notes
                        .values()
                        .filter(|d| d.activity_id == activity.id)
                        .map(|d| d.amount)
                        .sum(),
                    results: self.results.get(&activity.id).map(|(_, n)| *n).unwrap_or(0),
                    created_at: activity.created_at,
                    last_batch_at: batches.iter().map(|b| b.created_at).max(),
                }
            })
            .collect()
    }
}

/// Run store kept in process memory, used by tests and `--store memory`
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    tables: RwLock<Tables>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(kind: &str, id: impl std::fmt::Display) -> StateError {
    StateError::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn install(&self) -> StateResult<()> {
        Ok(())
    }

    async fn create_run(&self, id: RunId, started_at: DateTime<Utc>) -> StateResult<RunRecord> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .runs
            .entry(id)
            .or_insert(RunRecord { id, started_at })
            .clone())
    }

    async fn get_run(&self, id: &RunId) -> StateResult<Option<RunRecord>> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn latest_run(&self) -> StateResult<Option<RunRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.runs.values().max_by_key(|r| r.started_at).cloned())
    }

    async fn delete_run(&self, id: &RunId) -> StateResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.runs.remove(id).is_none() {
            return Ok(false);
        }
        let activities: Vec<ResourceId> = tables
            .activities_of(id)
            .into_iter()
            .map(|a| a.id.clone())
            .collect();
        let agreements: Vec<ResourceId> = tables
            .agreements
            .values()
            .filter(|a| tables.run_of_proposal(&a.proposal_id).as_ref() == Some(id))
            .map(|a| a.id.clone())
            .collect();
        let proposals: Vec<ResourceId> = tables
            .proposals
            .values()
            .filter(|p| tables.run_of_demand(&p.demand_id).as_ref() == Some(id))
            .map(|p| p.id.clone())
            .collect();

        tables.batches.retain(|_, b| !activities.contains(&b.activity_id));
        tables.debit_notes.retain(|_, d| !activities.contains(&d.activity_id));
        tables.results.retain(|_, (run_id, _)| run_id != id);
        tables.activities.retain(|k, _| !activities.contains(k));
        tables.agreements.retain(|k, _| !agreements.contains(k));
        tables.proposals.retain(|k, _| !proposals.contains(k));
        tables.demands.retain(|_, d| d.run_id != *id);
        Ok(true)
    }

    async fn insert_demand(&self, record: DemandRecord) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.runs.contains_key(&record.run_id) {
            return Err(missing("run", record.run_id));
        }
        tables.demands.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn insert_proposal(&self, record: ProposalRecord) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.demands.contains_key(&record.demand_id) {
            return Err(missing("demand", &record.demand_id));
        }
        tables.proposals.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn insert_agreement(&self, record: AgreementRecord) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.proposals.contains_key(&record.proposal_id) {
            return Err(missing("proposal", &record.proposal_id));
        }
        tables.agreements.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn insert_activity(&self, record: ActivityRecord) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.agreements.contains_key(&record.agreement_id) {
            return Err(missing("agreement", &record.agreement_id));
        }
        tables.activities.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn insert_batch(&self, record: BatchRecord) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.activities.contains_key(&record.activity_id) {
            return Err(missing("activity", &record.activity_id));
        }
        tables.batches.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn insert_debit_note(&self, record: DebitNoteRecord) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.activities.contains_key(&record.activity_id) {
            return Err(missing("activity", &record.activity_id));
        }
        tables.debit_notes.entry(record.id.clone()).or_insert(record);
        Ok(())
    }

    async fn update_agreement_status(&self, id: &ResourceId, status: AgreementState) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        let agreement = tables
            .agreements
            .get_mut(id)
            .ok_or_else(|| missing("agreement", id))?;
        agreement.status = status;
        Ok(())
    }

    async fn update_activity_status(
        &self,
        id: &ResourceId,
        status: ActivityStatus,
        stop_reason: Option<StopReason>,
    ) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        let activity = tables
            .activities
            .get_mut(id)
            .ok_or_else(|| missing("activity", id))?;
        activity.status = status;
        if stop_reason.is_some() {
            activity.stop_reason = stop_reason;
        }
        Ok(())
    }

    async fn add_results(&self, run_id: &RunId, activity_id: &ResourceId, count: u64) -> StateResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.runs.contains_key(run_id) {
            return Err(missing("run", run_id));
        }
        if tables.run_of_activity(activity_id).as_ref() != Some(run_id) {
            return Err(missing("activity", activity_id));
        }
        tables
            .results
            .entry(activity_id.clone())
            .or_insert((*run_id, 0))
            .1 += count;
        Ok(())
    }

    async fn agreements(&self, run_id: &RunId) -> StateResult<Vec<AgreementRecord>> {
        let tables = self.tables.read().await;
        let mut agreements: Vec<_> = tables
            .agreements
            .values()
            .filter(|a| tables.run_of_proposal(&a.proposal_id).as_ref() == Some(run_id))
            .cloned()
            .collect();
        agreements.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(agreements)
    }

    async fn activities(&self, run_id: &RunId) -> StateResult<Vec<ActivityRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.activities_of(run_id).into_iter().cloned().collect())
    }

    async fn debit_notes(&self, run_id: &RunId, since: Option<DateTime<Utc>>) -> StateResult<Vec<DebitNoteRecord>> {
        let tables = self.tables.read().await;
        let mut notes: Vec<_> = tables
            .debit_notes
            .values()
            .filter(|d| tables.run_of_activity(&d.activity_id).as_ref() == Some(run_id))
            .filter(|d| since.map_or(true, |since| d.created_at >= since))
            .cloned()
            .collect();
        notes.sort_by_key(|d| d.created_at);
        Ok(notes)
    }

    async fn rollup(&self, run_id: &RunId) -> StateResult<Vec<ActivityRollup>> {
        Ok(self.tables.read().await.rollup(run_id))
    }

    async fn summary(&self, run_id: &RunId) -> StateResult<Option<RunSummary>> {
        let tables = self.tables.read().await;
        let Some(run) = tables.runs.get(run_id) else {
            return Ok(None);
        };
        let rollup = tables.rollup(run_id);
        let results = tables
            .results
            .values()
            .filter(|(r, _)| r == run_id)
            .map(|(_, n)| *n)
            .sum();
        Ok(Some(RunSummary::build(run, &rollup, results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (InMemoryRunStore, RunId) {
        let store = InMemoryRunStore::new();
        let run = RunId::generate();
        let now = Utc::now();
        store.create_run(run, now).await.unwrap();
        store
            .insert_demand(DemandRecord {
                id: ResourceId::new("d"),
                run_id: run,
                created_at: now,
            })
            .await
            .unwrap();
        store
            .insert_proposal(ProposalRecord {
                id: ResourceId::new("p"),
                demand_id: ResourceId::new("d"),
                initial: true,
                data: serde_json::json!({}),
                created_at: now,
            })
            .await
            .unwrap();
        store
            .insert_agreement(AgreementRecord {
                id: ResourceId::new("g"),
                proposal_id: ResourceId::new("p"),
                status: AgreementState::Approved,
                created_at: now,
            })
            .await
            .unwrap();
        store
            .insert_activity(ActivityRecord {
                id: ResourceId::new("a"),
                agreement_id: ResourceId::new("g"),
                status: ActivityStatus::New,
                stop_reason: None,
                created_at: now,
            })
            .await
            .unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn test_orphan_rows_are_refused() {
        let store = InMemoryRunStore::new();
        let err = store
            .insert_batch(BatchRecord {
                id: ResourceId::new("b"),
                activity_id: ResourceId::new("nope"),
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_reason_is_kept() {
        let (store, run) = seeded().await;
        let id = ResourceId::new("a");
        store
            .update_activity_status(&id, ActivityStatus::Stopping, Some(StopReason::TooExpensive))
            .await
            .unwrap();
        store
            .update_activity_status(&id, ActivityStatus::Stopped, None)
            .await
            .unwrap();
        let activities = store.activities(&run).await.unwrap();
        assert_eq!(activities[0].status, ActivityStatus::Stopped);
        assert_eq!(activities[0].stop_reason, Some(StopReason::TooExpensive));
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (store, run) = seeded().await;
        store
            .add_results(&run, &ResourceId::new("a"), 3)
            .await
            .unwrap();
        assert!(store.delete_run(&run).await.unwrap());
        assert!(store.activities(&run).await.unwrap().is_empty());
        assert!(store.summary(&run).await.unwrap().is_none());
        assert!(!store.delete_run(&run).await.unwrap());
    }
}
