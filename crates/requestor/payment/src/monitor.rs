//! Payment monitor
//!
//! Accepts the full amount of every incoming debit note and invoice as long
//! as the rolling budget allows it. Documents are handled one at a time, in
//! the order the bus delivers them.
//!
//! A debit note states the running total due for its activity. Only the
//! increase over the last accepted total is new spending.

use crate::budget::{BudgetDecision, RollingBudget};
use crate::cost::{ActivityCost, CostTracker};
use crate::error::{PaymentError, PaymentResult};
use crate::rotation::AllocationRotator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use requestor_core::{collect_payments, DebitNote, Invoice, ListenerId, Session};
use requestor_types::{
    DocumentStatus, RequestorEvent, ResourceId, ResourceKind, ResourceRef, StopReason,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Spending cap per trailing hour
    pub budget_per_hour: Decimal,
    /// Highest acceptable cost per result; unlimited when unset
    pub max_price: Option<Decimal>,
    /// Time an activity runs before its cost per result is judged
    pub warmup: Duration,
    pub payment_platform: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            budget_per_hour: Decimal::ONE,
            max_price: None,
            warmup: Duration::from_secs(10),
            payment_platform: "erc20-holesky-tglm".to_string(),
        }
    }
}

struct Ledger {
    budget: RollingBudget,
    costs: CostTracker,
}

pub struct PaymentMonitor {
    session: Session,
    config: PaymentConfig,
    ledger: Mutex<Ledger>,
    /// Last accepted running total per activity
    accepted_totals: DashMap<ResourceId, Decimal>,
    /// Accepted through debit notes, per agreement
    covered: DashMap<ResourceId, Decimal>,
    allocations: Arc<AllocationRotator>,
    listener: Mutex<Option<ListenerId>>,
    rotation: Mutex<Option<JoinHandle<()>>>,
}

impl PaymentMonitor {
    pub fn new(session: Session, config: PaymentConfig) -> Arc<Self> {
        let warmup = chrono::Duration::from_std(config.warmup).unwrap_or_else(|_| chrono::Duration::zero());
        let allocations = Arc::new(AllocationRotator::new(
            session.clone(),
            config.budget_per_hour,
            config.payment_platform.clone(),
        ));
        Arc::new(Self {
            ledger: Mutex::new(Ledger {
                budget: RollingBudget::per_hour(config.budget_per_hour),
                costs: CostTracker::new(warmup, config.max_price),
            }),
            session,
            config,
            accepted_totals: DashMap::new(),
            covered: DashMap::new(),
            allocations,
            listener: Mutex::new(None),
            rotation: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    pub fn allocations(&self) -> &Arc<AllocationRotator> {
        &self.allocations
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the first allocation, start hourly rotation, listen for payment
    /// documents and start collecting those issued after `since`.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, since: Option<DateTime<Utc>>) -> PaymentResult<()> {
        self.allocations.current().await?;
        *self.rotation.lock().unwrap_or_else(|p| p.into_inner()) = Some(self.allocations.spawn());

        let monitor = Arc::clone(self);
        let id = self.session.bus().listen(
            |event| {
                matches!(
                    event,
                    RequestorEvent::NewResource { resource, .. }
                        if matches!(resource.kind, ResourceKind::DebitNote | ResourceKind::Invoice)
                )
            },
            move |event| {
                let monitor = monitor.clone();
                async move { monitor.handle(event).await.map_err(anyhow::Error::from) }
            },
        );
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(id);

        collect_payments(&self.session, since);
        info!(budget_per_hour = %self.config.budget_per_hour, max_price = ?self.config.max_price, "Payment monitor started");
        Ok(())
    }

    /// Stop reacting to new documents. Allocations stay open.
    pub fn stop(&self) {
        if let Some(id) = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take() {
            self.session.bus().unlisten(id);
        }
        if let Some(task) = self.rotation.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }

    /// Count payments accepted by an earlier process of the same run
    /// against the rolling budget.
    pub fn seed<I>(&self, accepted: I)
    where
        I: IntoIterator<Item = (DateTime<Utc>, Decimal)>,
    {
        let mut ledger = self.ledger();
        for (at, amount) in accepted {
            ledger.budget.record(amount, at);
        }
    }

    /// Restore the totals an earlier process of the same run accepted for
    /// each activity, given as `(activity, agreement, total)`.
    pub fn seed_totals<I>(&self, totals: I)
    where
        I: IntoIterator<Item = (ResourceId, ResourceId, Decimal)>,
    {
        for (activity_id, agreement_id, total) in totals {
            let mut accepted = self.accepted_totals.entry(activity_id).or_insert(Decimal::ZERO);
            if total > *accepted {
                *self.covered.entry(agreement_id).or_insert(Decimal::ZERO) += total - *accepted;
                *accepted = total;
            }
        }
    }

    /// Last running total accepted for `activity`
    pub fn accepted_total(&self, activity: &ResourceId) -> Decimal {
        self.accepted_totals
            .get(activity)
            .map(|total| *total)
            .unwrap_or(Decimal::ZERO)
    }

    /// Start the cost warm-up of a new activity.
    pub fn register_activity(&self, activity: &ResourceId) {
        self.ledger().costs.start(activity, Utc::now());
    }

    pub fn record_results(&self, activity: &ResourceId, count: u64) {
        self.ledger().costs.add_results(activity, count, Utc::now());
    }

    pub fn activity_cost(&self, activity: &ResourceId) -> Option<ActivityCost> {
        self.ledger().costs.get(activity)
    }

    pub fn spent_last_hour(&self) -> Decimal {
        self.ledger().budget.spent(Utc::now())
    }

    pub fn is_exhausted(&self) -> bool {
        self.ledger().budget.is_exhausted()
    }

    async fn handle(&self, event: RequestorEvent) -> PaymentResult<()> {
        let RequestorEvent::NewResource { resource, .. } = event else {
            return Ok(());
        };
        match resource.kind {
            ResourceKind::DebitNote => {
                let note = DebitNote::lookup(&self.session, &resource.id)?;
                self.on_debit_note(note).await
            }
            ResourceKind::Invoice => {
                let invoice = Invoice::lookup(&self.session, &resource.id)?;
                self.on_invoice(invoice).await
            }
            _ => Err(PaymentError::UnexpectedResource(resource.to_string())),
        }
    }

    /// Check `amount` against the budget; announces exhaustion the first time.
    fn check_budget(&self, resource: &ResourceRef, amount: Decimal) -> BudgetDecision {
        let (decision, newly_exhausted) = {
            let mut ledger = self.ledger();
            let was_exhausted = ledger.budget.is_exhausted();
            let decision = ledger.budget.check(amount, Utc::now());
            (decision, !was_exhausted && ledger.budget.is_exhausted())
        };
        if let BudgetDecision::Refused { spent, budget } = decision {
            warn!(%resource, %amount, %spent, %budget, "Payment refused by budget");
            if newly_exhausted {
                self.session.publish(RequestorEvent::BudgetExceeded { spent, budget });
            }
        }
        decision
    }

    fn announce_rejection(&self, resource: &ResourceRef) {
        self.session.publish(RequestorEvent::PaymentRejected {
            resource: resource.clone(),
            reason: StopReason::BudgetExhausted.to_string(),
        });
    }

    async fn on_debit_note(&self, note: DebitNote) -> PaymentResult<()> {
        if note.status() != DocumentStatus::Received {
            return Ok(());
        }
        let data = note.data(false).await?;
        let resource = note.resource().clone();
        let previous = self.accepted_total(&data.activity_id);
        let increase = (data.total_amount_due - previous).max(Decimal::ZERO);

        if !self.check_budget(&resource, increase).is_allowed() {
            note.reject(StopReason::BudgetExhausted.as_str()).await?;
            self.announce_rejection(&resource);
            return Ok(());
        }

        let allocation = self.allocations.current().await?;
        let total = note.accept_full(&allocation).await?;
        let now = Utc::now();
        let flagged = {
            let mut ledger = self.ledger();
            ledger.budget.record(increase, now);
            ledger.costs.add_payment(&data.activity_id, increase, now)
        };
        self.accepted_totals
            .entry(data.activity_id.clone())
            .and_modify(|accepted| *accepted = (*accepted).max(total))
            .or_insert(total);
        *self.covered.entry(data.agreement_id.clone()).or_insert(Decimal::ZERO) += increase;

        debug!(debit_note_id = %note.id(), activity_id = %data.activity_id, %increase, %total, "Debit note accepted");
        self.session.publish(RequestorEvent::DebitNoteAccepted {
            resource,
            activity_id: data.activity_id.clone(),
            agreement_id: data.agreement_id.clone(),
            amount: increase,
            total,
        });

        if let Some(ratio) = flagged {
            warn!(activity_id = %data.activity_id, cost_per_result = %ratio, max_price = ?self.config.max_price, "Activity too expensive");
            self.session.publish(RequestorEvent::ActivityFlagged {
                resource: ResourceRef::new(ResourceKind::Activity, data.activity_id),
                reason: StopReason::TooExpensive,
                cost_per_result: Some(ratio),
            });
        }
        Ok(())
    }

    /// Only the part of an invoice not already paid through debit notes
    /// counts against the budget.
    async fn on_invoice(&self, invoice: Invoice) -> PaymentResult<()> {
        if invoice.status() != DocumentStatus::Received {
            return Ok(());
        }
        let data = invoice.data(false).await?;
        let resource = invoice.resource().clone();
        let covered = self
            .covered
            .get(&data.agreement_id)
            .map(|c| *c)
            .unwrap_or(Decimal::ZERO);
        let due = (data.amount - covered).max(Decimal::ZERO);

        if !self.check_budget(&resource, due).is_allowed() {
            invoice.reject(StopReason::BudgetExhausted.as_str()).await?;
            self.announce_rejection(&resource);
            return Ok(());
        }

        let allocation = self.allocations.current().await?;
        let amount = invoice.accept_full(&allocation).await?;
        self.ledger().budget.record(due, Utc::now());

        info!(invoice_id = %invoice.id(), agreement_id = %data.agreement_id, %amount, %due, "Invoice accepted");
        self.session.publish(RequestorEvent::InvoiceAccepted {
            resource,
            agreement_id: data.agreement_id,
            amount,
        });
        Ok(())
    }
}
