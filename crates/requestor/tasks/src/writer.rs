//! Persistence writer
//!
//! Mirrors the resource tree of a run into the run store. A single bus
//! listener handles every event, so rows are written parent first in the
//! order the tree grew.

use crate::error::TaskResult;
use chrono::Utc;
use requestor_core::{ListenerId, ResourceNode, Session};
use requestor_state::{
    ActivityRecord, ActivityStatus, AgreementRecord, BatchRecord, DebitNoteRecord, DemandRecord,
    ProposalRecord, RunStore,
};
use requestor_types::{
    ActivityState, AgreementState, LifecycleState, RequestorEvent, ResourceData, ResourceKind,
    ResourceRef, RunId,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const RECORDED_KINDS: [ResourceKind; 5] = [
    ResourceKind::Demand,
    ResourceKind::Proposal,
    ResourceKind::Agreement,
    ResourceKind::Activity,
    ResourceKind::PoolingBatch,
];

fn is_recorded(event: &RequestorEvent) -> bool {
    match event {
        RequestorEvent::NewResource { resource, .. } => RECORDED_KINDS.contains(&resource.kind),
        RequestorEvent::StateChanged { resource, .. } => {
            matches!(resource.kind, ResourceKind::Agreement | ResourceKind::Activity)
        }
        RequestorEvent::DebitNoteAccepted { .. } => true,
        _ => false,
    }
}

/// Stored status of an activity in local state `state`
pub fn activity_status(state: ActivityState) -> Option<ActivityStatus> {
    match state {
        ActivityState::New => None,
        ActivityState::Idle => Some(ActivityStatus::Ready),
        ActivityState::Busy => Some(ActivityStatus::Busy),
        ActivityState::Destroyed => Some(ActivityStatus::Stopped),
    }
}

pub struct EventWriter {
    session: Session,
    store: Arc<dyn RunStore>,
    run_id: RunId,
}

impl EventWriter {
    pub fn new(session: Session, store: Arc<dyn RunStore>, run_id: RunId) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            run_id,
        })
    }

    /// Register the writer on the session bus.
    pub fn start(self: &Arc<Self>) -> ListenerId {
        let writer = Arc::clone(self);
        self.session.bus().listen(is_recorded, move |event| {
            let writer = writer.clone();
            async move { writer.handle(event).await.map_err(anyhow::Error::from) }
        })
    }

    async fn handle(&self, event: RequestorEvent) -> TaskResult<()> {
        match event {
            RequestorEvent::NewResource { resource, parent } => {
                self.on_new_resource(&resource, parent.as_ref()).await
            }
            RequestorEvent::StateChanged { resource, to, .. } => self.on_state_changed(&resource, to).await,
            RequestorEvent::DebitNoteAccepted {
                resource,
                activity_id,
                amount,
                ..
            } => {
                self.store
                    .insert_debit_note(DebitNoteRecord {
                        id: resource.id,
                        activity_id,
                        amount,
                        created_at: Utc::now(),
                    })
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_new_resource(&self, resource: &ResourceRef, parent: Option<&ResourceRef>) -> TaskResult<()> {
        let node = self.session.node(resource.kind, &resource.id);
        let created_at = node.as_ref().map(|n| n.created_at()).unwrap_or_else(Utc::now);
        let id = resource.id.clone();

        // Nodes without a parent other than demands were adopted from an
        // earlier process and are already stored.
        let Some(parent) = parent else {
            if resource.kind == ResourceKind::Demand {
                self.store
                    .insert_demand(DemandRecord {
                        id,
                        run_id: self.run_id,
                        created_at,
                    })
                    .await?;
            }
            return Ok(());
        };

        match resource.kind {
            ResourceKind::Proposal => {
                let Some(demand_id) = node.as_ref().and_then(owning_demand) else {
                    debug!(proposal_id = %id, "Proposal outside any demand, not stored");
                    return Ok(());
                };
                let data = node
                    .as_ref()
                    .and_then(|n| n.cached_data())
                    .and_then(|d| match d.as_ref() {
                        ResourceData::Proposal(p) => serde_json::to_value(p).ok(),
                        _ => None,
                    })
                    .unwrap_or(Value::Null);
                self.store
                    .insert_proposal(ProposalRecord {
                        id,
                        demand_id,
                        initial: parent.kind == ResourceKind::Demand,
                        data,
                        created_at,
                    })
                    .await?;
            }
            ResourceKind::Agreement => {
                self.store
                    .insert_agreement(AgreementRecord {
                        id,
                        proposal_id: parent.id.clone(),
                        status: AgreementState::Pending,
                        created_at,
                    })
                    .await?;
            }
            ResourceKind::Activity => {
                self.store
                    .insert_activity(ActivityRecord {
                        id,
                        agreement_id: parent.id.clone(),
                        status: ActivityStatus::New,
                        stop_reason: None,
                        created_at,
                    })
                    .await?;
            }
            ResourceKind::PoolingBatch => {
                self.store
                    .insert_batch(BatchRecord {
                        id,
                        activity_id: parent.id.clone(),
                        created_at,
                    })
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_state_changed(&self, resource: &ResourceRef, to: LifecycleState) -> TaskResult<()> {
        if let Some(state) = to.agreement() {
            self.store.update_agreement_status(&resource.id, state).await?;
        } else if let Some(status) = to.activity().and_then(activity_status) {
            self.store.update_activity_status(&resource.id, status, None).await?;
        }
        Ok(())
    }
}

fn owning_demand(node: &Arc<ResourceNode>) -> Option<requestor_types::ResourceId> {
    let mut current = node.parent();
    while let Some(n) = current {
        if n.resource().kind == ResourceKind::Demand {
            return Some(n.resource().id.clone());
        }
        current = n.parent();
    }
    None
}
