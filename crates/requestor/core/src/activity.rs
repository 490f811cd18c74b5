//! Activity handle

use crate::batch::{BatchSource, PoolingBatch};
use crate::error::{ApiError, RequestorError, RequestorResult};
use crate::market::Agreement;
use crate::session::collector_key;
use requestor_types::{
    prepare_script, ActivityData, ActivityState, BatchData, LifecycleState, ResourceData,
    ResourceId, ResourceKind, Script,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Longest a Deploy and Start preparation may take
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(300);

resource_handle!(
    /// Execution context on a provider, created under an approved agreement
    Activity,
    ResourceKind::Activity,
    Activity,
    ActivityData
);

impl Activity {
    /// Adopt an activity started by an earlier process under `agreement`.
    /// It comes back Idle unless the daemon reports it gone.
    pub async fn recover(agreement: &Agreement, id: &ResourceId) -> RequestorResult<Self> {
        let session = agreement.session();
        session.ensure_open()?;
        let node = session.get_or_create(
            ResourceKind::Activity,
            id.clone(),
            Some(agreement.node()),
            None,
        );
        let activity = Self::from_node(node, session.clone());
        let data = activity.data(true).await?;
        let next = if data.state == "Terminated" || data.state == "Unresponsive" {
            ActivityState::Destroyed
        } else {
            ActivityState::Idle
        };
        activity.transition(next);
        debug!(activity_id = %id, remote_state = %data.state, "Activity recovered");
        Ok(activity)
    }

    pub fn activity_state(&self) -> ActivityState {
        self.state().activity().unwrap_or(ActivityState::Destroyed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.activity_state() == ActivityState::Destroyed
    }

    pub fn agreement(&self) -> Option<Agreement> {
        self.node
            .parent()
            .filter(|p| p.resource().kind == ResourceKind::Agreement)
            .map(|p| Agreement::from_node(p, self.session.clone()))
    }

    /// Batches submitted on this activity, in submission order
    pub fn batches(&self) -> Vec<PoolingBatch> {
        self.node
            .children()
            .into_iter()
            .filter(|n| n.resource().kind == ResourceKind::PoolingBatch)
            .map(|n| PoolingBatch::from_node(n, self.session.clone()))
            .collect()
    }

    pub(crate) fn transition(&self, next: ActivityState) -> bool {
        self.session.update_state(&self.node, |s| match s.activity() {
            Some(current) if current.can_transition_to(next) => Some(LifecycleState::Activity(next)),
            _ => None,
        })
    }

    /// Submit `script` as one batch. The activity is Busy until every batch
    /// it runs has finished.
    #[instrument(skip(self, script), fields(activity_id = %self.id(), commands = script.len()))]
    pub async fn execute(&self, script: Script) -> RequestorResult<PoolingBatch> {
        self.session.ensure_open()?;
        script.validate()?;
        if self.is_destroyed() {
            return Err(RequestorError::precondition(self.resource(), "activity is destroyed"));
        }

        let batch_id = self.session.api().exec(self.id(), &script).await?;
        let data = BatchData::new(batch_id.clone(), self.id().clone(), script.len());
        let node = self.session.get_or_create(
            ResourceKind::PoolingBatch,
            batch_id,
            Some(&self.node),
            Some(ResourceData::PoolingBatch(data)),
        );

        self.node.begin_batch();
        self.transition(ActivityState::Busy);
        debug!(batch_id = %node.resource().id, "Batch submitted");

        self.session.spawn_collector(
            collector_key(node.resource()),
            Some(node.resource().clone()),
            BatchSource::new(self.session.clone(), node.clone(), self.node.clone()),
        );
        Ok(PoolingBatch::from_node(node, self.session.clone()))
    }

    /// Deploy and start the exe-unit.
    ///
    /// Any failure, a timeout included, closes the whole agreement (or
    /// destroys the activity when it has none) before the error is returned.
    #[instrument(skip(self, deploy_args), fields(activity_id = %self.id()))]
    pub async fn prepare(&self, deploy_args: Option<Value>, timeout: Duration) -> RequestorResult<()> {
        let outcome = async {
            let batch = self.execute(prepare_script(deploy_args)).await?;
            batch.wait(timeout).await.map(|_| ())
        }
        .await;

        match &outcome {
            Ok(()) => info!("Activity ready"),
            Err(e) => {
                warn!(error = %e, "Activity preparation failed");
                match self.agreement() {
                    Some(agreement) => agreement.close_all().await,
                    None => {
                        if let Err(destroy) = self.destroy().await {
                            warn!(error = %destroy, "Failed to destroy activity");
                        }
                    }
                }
            }
        }
        outcome
    }

    /// Destroy the remote activity. Destroyed is final.
    pub async fn destroy(&self) -> RequestorResult<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        match self.session.api().destroy_activity(self.id()).await {
            Ok(()) | Err(ApiError::Gone(_)) => {}
            Err(e) => return Err(e.into()),
        }
        for batch in self.batches() {
            if batch.is_running() {
                batch.cancel().await;
            }
        }
        self.transition(ActivityState::Destroyed);
        info!(activity_id = %self.id(), "Activity destroyed");
        Ok(())
    }
}
