//! Task distributor
//!
//! Keeps a fixed number of worker slots busy. Each slot binds one activity
//! (reattached from an earlier process, created on a spare agreement, or
//! negotiated from scratch), then pulls tasks from the source and runs each
//! as one batch. An activity that fails too often, or that the payment
//! monitor flags, is torn down and the slot starts over while work remains.

use crate::error::{TaskError, TaskResult};
use crate::outcome::{RunOutcome, StopCause};
use crate::source::{TaskSource, TaskSpec};
use crate::worker::{FailureTracker, WorkerSlot, WorkerState};
use crate::writer::EventWriter;
use chrono::Utc;
use dashmap::DashMap;
use requestor_core::activity::PREPARE_TIMEOUT;
use requestor_core::{
    Activity, Agreement, Demand, NegotiatedProposals, Negotiator, RequestorError, RequestorResult,
    Session,
};
use requestor_payment::PaymentMonitor;
use requestor_state::{ActivityStatus, RunRecord, RunStore};
use requestor_types::{
    AgreementState, RequestorEvent, ResourceId, ResourceKind, RunId, StopReason,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Concurrent worker slots, one activity each
    pub workers: usize,
    /// Activities negotiated and prepared at the same time
    pub max_concurrent_preparations: usize,
    pub prepare_timeout: Duration,
    pub task_timeout: Duration,
    /// Consecutive task failures after which an activity is replaced
    pub max_activity_failures: u32,
    /// Consecutive failed attempts to obtain an activity before the run gives up
    pub max_agreement_failures: u32,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_concurrent_preparations: 2,
            prepare_timeout: PREPARE_TIMEOUT,
            task_timeout: Duration::from_secs(600),
            max_activity_failures: 3,
            max_agreement_failures: 10,
        }
    }
}

/// How a slot's hold on an activity ended
enum Release {
    /// The task source has nothing left
    Drained,
    Stop(StopReason),
    /// The activity disappeared on its own
    Lost,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Distributor {
    run_id: RunId,
    session: Session,
    store: Arc<dyn RunStore>,
    payments: Arc<PaymentMonitor>,
    negotiator: Arc<Negotiator>,
    source: Arc<dyn TaskSource>,
    demand: requestor_types::DemandData,
    config: DistributorConfig,
    stop_tx: watch::Sender<Option<StopCause>>,
    preparing: Semaphore,
    proposals: tokio::sync::Mutex<Option<NegotiatedProposals>>,
    reattached: Mutex<VecDeque<Activity>>,
    spare_agreements: Mutex<VecDeque<Agreement>>,
    flagged: DashMap<ResourceId, StopReason>,
    agreement_failures: AtomicU32,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Distributor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        session: Session,
        store: Arc<dyn RunStore>,
        payments: Arc<PaymentMonitor>,
        negotiator: Arc<Negotiator>,
        source: Arc<dyn TaskSource>,
        demand: requestor_types::DemandData,
        config: DistributorConfig,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(None);
        Arc::new(Self {
            run_id,
            preparing: Semaphore::new(config.max_concurrent_preparations.max(1)),
            session,
            store,
            payments,
            negotiator,
            source,
            demand,
            config,
            stop_tx,
            proposals: tokio::sync::Mutex::new(None),
            reattached: Mutex::new(VecDeque::new()),
            spare_agreements: Mutex::new(VecDeque::new()),
            flagged: DashMap::new(),
            agreement_failures: AtomicU32::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Ask the run to stop. Only the first cause is kept.
    pub fn stop(&self, cause: StopCause) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            info!(run_id = %self.run_id, %cause, "Stopping run");
            *current = Some(cause);
            true
        });
    }

    fn stop_cause(&self) -> Option<StopCause> {
        self.stop_tx.borrow().clone()
    }

    fn is_stopping(&self) -> bool {
        self.stop_tx.borrow().is_some()
    }

    /// Run until every task is processed, a stop condition is met or
    /// `shutdown` resolves. Resumes the run when the store already knows it.
    ///
    /// Always closes the session on the way out, terminating every agreement.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run<F>(self: &Arc<Self>, shutdown: F) -> TaskResult<RunOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let outcome = self.run_inner(shutdown).await;
        self.close().await;
        outcome
    }

    async fn run_inner<F>(self: &Arc<Self>, shutdown: F) -> TaskResult<RunOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let run = self.open_run().await?;
        EventWriter::new(self.session.clone(), self.store.clone(), self.run_id).start();
        self.watch_bus();

        let recent = self
            .store
            .debit_notes(&self.run_id, Some(Utc::now() - chrono::Duration::hours(1)))
            .await?;
        self.payments.seed(recent.iter().map(|d| (d.created_at, d.amount)));
        let rollup = self.store.rollup(&self.run_id).await?;
        self.payments.seed_totals(
            rollup
                .into_iter()
                .map(|a| (a.activity_id, a.agreement_id, a.cost)),
        );
        self.payments.start(Some(run.started_at)).await?;

        self.recover().await?;

        let mut workers = JoinSet::new();
        for index in 0..self.config.workers.max(1) {
            let distributor = Arc::clone(self);
            workers.spawn(async move { distributor.work_slot(index).await });
        }

        let mut stop_rx = self.stop_tx.subscribe();
        tokio::pin!(shutdown);
        let cause = tokio::select! {
            biased;
            _ = &mut shutdown => StopCause::UserRequested,
            cause = async { stop_rx.wait_for(Option::is_some).await.ok().and_then(|c| (*c).clone()) } => {
                cause.unwrap_or(StopCause::Completed)
            }
            _ = async { while workers.join_next().await.is_some() {} } => {
                self.stop_cause().unwrap_or(StopCause::Completed)
            }
        };
        self.stop(cause.clone());
        workers.shutdown().await;

        self.mark_stopping(&cause).await;

        let outcome = RunOutcome {
            run_id: self.run_id,
            cause,
            tasks_completed: self.completed.load(Ordering::SeqCst),
            tasks_failed: self.failed.load(Ordering::SeqCst),
        };
        info!(
            cause = %outcome.cause,
            completed = outcome.tasks_completed,
            failed = outcome.tasks_failed,
            "Run finished"
        );
        Ok(outcome)
    }

    async fn open_run(&self) -> TaskResult<RunRecord> {
        match self.store.get_run(&self.run_id).await? {
            Some(run) => {
                info!(started_at = %run.started_at, "Resuming run");
                Ok(run)
            }
            None => {
                let run = self.store.create_run(self.run_id, Utc::now()).await?;
                info!("Starting new run");
                Ok(run)
            }
        }
    }

    async fn close(&self) {
        self.session.close(true).await;
        self.payments.stop();
        self.payments.allocations().release_all().await;
    }

    /// React to budget exhaustion, fatal collector failures and flagged
    /// activities.
    fn watch_bus(self: &Arc<Self>) {
        let distributor = Arc::downgrade(self);
        self.session.bus().listen(
            |event| {
                matches!(
                    event,
                    RequestorEvent::BudgetExceeded { .. }
                        | RequestorEvent::CollectorFailed { .. }
                        | RequestorEvent::ActivityFlagged { .. }
                )
            },
            move |event| {
                let distributor = distributor.upgrade();
                async move {
                    if let Some(distributor) = distributor {
                        distributor.on_event(event);
                    }
                    Ok(())
                }
            },
        );
    }

    fn on_event(&self, event: RequestorEvent) {
        match event {
            RequestorEvent::BudgetExceeded { spent, budget } => {
                self.stop(StopCause::BudgetExhausted { spent, budget });
            }
            // Batch collectors fail their own batch; only the session-wide
            // payment collector and offer collectors are fatal
            RequestorEvent::CollectorFailed {
                collector,
                resource,
                reason,
            } => {
                let fatal = resource
                    .as_ref()
                    .map_or(true, |r| r.kind == ResourceKind::Demand);
                if fatal {
                    error!(%collector, %reason, "Collector failed");
                    self.stop(StopCause::CollectorFailed { collector, reason });
                }
            }
            RequestorEvent::ActivityFlagged { resource, reason, .. } => {
                self.flagged.insert(resource.id, reason);
            }
            _ => {}
        }
    }

    /// Adopt what an earlier process of this run left behind: live
    /// activities are reattached, approved agreements without one are kept
    /// as spares.
    async fn recover(&self) -> TaskResult<()> {
        let agreements = self.store.agreements(&self.run_id).await?;
        if agreements.is_empty() {
            return Ok(());
        }
        let activities = self.store.activities(&self.run_id).await?;

        for record in agreements.iter().filter(|a| a.status == AgreementState::Approved) {
            let agreement = match Agreement::recover(&self.session, &record.id).await {
                Ok(agreement) if agreement.agreement_state() == AgreementState::Approved => agreement,
                Ok(_) => {
                    debug!(agreement_id = %record.id, "Agreement no longer live");
                    continue;
                }
                Err(e) => {
                    warn!(agreement_id = %record.id, error = %e, "Failed to recover agreement");
                    continue;
                }
            };

            let mut adopted = false;
            for activity in activities
                .iter()
                .filter(|a| a.agreement_id == record.id && a.is_reusable())
            {
                match Activity::recover(&agreement, &activity.id).await {
                    Ok(live) if !live.is_destroyed() => {
                        info!(activity_id = %activity.id, "Activity reattached");
                        lock(&self.reattached).push_back(live);
                        adopted = true;
                    }
                    Ok(_) => debug!(activity_id = %activity.id, "Activity no longer live"),
                    Err(e) => warn!(activity_id = %activity.id, error = %e, "Failed to recover activity"),
                }
            }
            if !adopted {
                info!(agreement_id = %record.id, "Agreement kept for a new activity");
                lock(&self.spare_agreements).push_back(agreement);
            }
        }

        info!(
            reattached = lock(&self.reattached).len(),
            spare_agreements = lock(&self.spare_agreements).len(),
            "Run recovered"
        );
        Ok(())
    }

    async fn work_slot(self: Arc<Self>, index: usize) {
        let mut slot = WorkerSlot::new(index);
        loop {
            if self.is_stopping() || self.source.remaining().await == 0 {
                break;
            }
            let activity = match self.acquire(&mut slot).await {
                Ok(Some(activity)) => activity,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = index, error = %e, "Cannot obtain an activity");
                    self.stop(StopCause::NegotiationFailed { reason: e.to_string() });
                    break;
                }
            };

            self.payments.register_activity(activity.id());
            match self.process(&mut slot, &activity).await {
                Release::Drained => {
                    // Releases slots still waiting for offers
                    if self.source.remaining().await == 0 {
                        self.stop(StopCause::Completed);
                    }
                    break;
                }
                Release::Stop(reason) => self.retire(&mut slot, &activity, reason).await,
                Release::Lost => {
                    warn!(worker = index, activity_id = %activity.id(), "Activity lost");
                    slot.transition(WorkerState::Stopping);
                    slot.transition(WorkerState::Unbound);
                }
            }
        }
        debug!(worker = index, state = %slot.state(), "Worker finished");
    }

    /// Bind an activity to `slot`. `Ok(None)` means this attempt failed and
    /// may be retried; an error means no activity can be obtained any more.
    async fn acquire(&self, slot: &mut WorkerSlot) -> TaskResult<Option<Activity>> {
        if let Some(activity) = lock(&self.reattached).pop_front() {
            slot.transition(WorkerState::Idle);
            return Ok(Some(activity));
        }

        let _permit = self
            .preparing
            .acquire()
            .await
            .map_err(|e| TaskError::Negotiation(e.to_string()))?;
        if self.is_stopping() {
            return Ok(None);
        }

        let spare = lock(&self.spare_agreements).pop_front();
        let agreement = match spare {
            Some(agreement) => agreement,
            None => {
                slot.transition(WorkerState::NegotiatingAgreement);
                match self.negotiate().await? {
                    Ok(agreement) => agreement,
                    Err(e) => return self.attempt_failed(slot, e),
                }
            }
        };

        slot.transition(WorkerState::PreparingActivity);
        let activity = match agreement.create_activity().await {
            Ok(activity) => activity,
            Err(e) => {
                agreement.close_all().await;
                return self.attempt_failed(slot, e);
            }
        };
        if let Err(e) = activity.prepare(None, self.config.prepare_timeout).await {
            agreement.close_all().await;
            return self.attempt_failed(slot, e);
        }

        self.agreement_failures.store(0, Ordering::SeqCst);
        slot.transition(WorkerState::Idle);
        Ok(Some(activity))
    }

    fn attempt_failed(&self, slot: &mut WorkerSlot, error: RequestorError) -> TaskResult<Option<Activity>> {
        slot.transition(WorkerState::Unbound);
        let failures = self.agreement_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(worker = slot.index(), failures, error = %error, "Failed to obtain an activity");
        if failures >= self.config.max_agreement_failures.max(1) {
            return Err(TaskError::Negotiation(format!(
                "{} consecutive failures, last: {}",
                failures, error
            )));
        }
        Ok(None)
    }

    /// Take the best negotiated proposal and turn it into an agreement.
    /// The outer error is fatal; the inner one is a failed attempt.
    async fn negotiate(&self) -> TaskResult<RequestorResult<Agreement>> {
        let proposal = {
            let mut proposals = self.proposals.lock().await;
            if proposals.is_none() {
                let demand = Demand::subscribe(&self.session, self.demand.clone())
                    .await
                    .map_err(|e| TaskError::Negotiation(format!("demand subscription failed: {}", e)))?;
                info!(demand_id = %demand.id(), "Demand subscribed");
                *proposals = Some(self.negotiator.start(&demand));
            }
            match proposals.as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            }
        };
        let Some(proposal) = proposal else {
            return Err(TaskError::Negotiation("no more offers".into()));
        };
        Ok(self.negotiator.agree(&proposal).await)
    }

    /// Run tasks on `activity` until the source is drained or the activity
    /// has to go.
    async fn process(&self, slot: &mut WorkerSlot, activity: &Activity) -> Release {
        let mut failures = FailureTracker::new(self.config.max_activity_failures);
        loop {
            if let Some((_, reason)) = self.flagged.remove(activity.id()) {
                return Release::Stop(reason);
            }
            if activity.is_destroyed() {
                return Release::Lost;
            }
            if self.is_stopping() {
                return Release::Drained;
            }
            let Some(task) = self.source.next().await else {
                return Release::Drained;
            };

            slot.transition(WorkerState::Running);
            match self.execute(activity, &task).await {
                Ok(()) => {
                    self.source.complete(&task.id).await;
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    failures.record_success();
                    self.payments.record_results(activity.id(), 1);
                    if let Err(e) = self.store.add_results(&self.run_id, activity.id(), 1).await {
                        warn!(activity_id = %activity.id(), error = %e, "Failed to record result");
                    }
                }
                Err(e) => {
                    warn!(activity_id = %activity.id(), task_id = %task.id, error = %e, "Task failed");
                    let task_id = task.id.clone();
                    if !self.source.requeue(task).await {
                        error!(%task_id, "Task abandoned");
                        self.failed.fetch_add(1, Ordering::SeqCst);
                    }
                    if failures.record_failure() {
                        slot.transition(WorkerState::Idle);
                        return Release::Stop(StopReason::TooManyFailures);
                    }
                }
            }
            slot.transition(WorkerState::Idle);
        }
    }

    async fn execute(&self, activity: &Activity, task: &TaskSpec) -> RequestorResult<()> {
        let batch = activity.execute(task.script()).await?;
        match batch.wait(self.config.task_timeout).await {
            Ok(results) => {
                let stdout = results.last().and_then(|r| r.stdout.as_deref()).unwrap_or("");
                debug!(task_id = %task.id, batch_id = %batch.id(), stdout, "Task done");
                Ok(())
            }
            Err(e) => {
                if e.is_timeout() {
                    batch.cancel().await;
                }
                Err(e)
            }
        }
    }

    /// Stop `activity` for `reason` and free the slot.
    async fn retire(&self, slot: &mut WorkerSlot, activity: &Activity, reason: StopReason) {
        slot.transition(WorkerState::Stopping);
        info!(activity_id = %activity.id(), %reason, "Stopping activity");
        self.set_status(activity.id(), ActivityStatus::Stopping, Some(reason)).await;
        match activity.agreement() {
            Some(agreement) => agreement.close_all().await,
            None => {
                if let Err(e) = activity.destroy().await {
                    warn!(activity_id = %activity.id(), error = %e, "Failed to destroy activity");
                }
            }
        }
        self.set_status(activity.id(), ActivityStatus::Stopped, None).await;
        slot.transition(WorkerState::Unbound);
    }

    /// Record why every activity of the run still up is about to stop.
    async fn mark_stopping(&self, cause: &StopCause) {
        let reason = match cause {
            StopCause::BudgetExhausted { .. } => StopReason::BudgetExhausted,
            _ => StopReason::AppClosing,
        };
        let activities = match self.store.activities(&self.run_id).await {
            Ok(activities) => activities,
            Err(e) => {
                warn!(error = %e, "Failed to load activities");
                return;
            }
        };
        for activity in activities
            .iter()
            .filter(|a| a.status != ActivityStatus::Stopped)
        {
            let reason = activity.stop_reason.is_none().then_some(reason);
            self.set_status(&activity.id, ActivityStatus::Stopping, reason).await;
        }
    }

    async fn set_status(&self, id: &ResourceId, status: ActivityStatus, reason: Option<StopReason>) {
        if let Err(e) = self.store.update_activity_status(id, status, reason).await {
            warn!(activity_id = %id, error = %e, "Failed to record activity status");
        }
    }
}
