//! Allocation, DebitNote and Invoice handles, and the payment collector

use crate::collector::EventSource;
use crate::error::{ApiError, ApiResult, RequestorError, RequestorResult};
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requestor_types::{
    AllocationData, AllocationState, DebitNoteData, DocumentStatus, InvoiceData, LifecycleState,
    PaymentEvent, ResourceData, ResourceId, ResourceKind,
};
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Collector key of the session-wide payment collector
pub const PAYMENT_COLLECTOR: &str = "payments";

resource_handle!(
    /// Spending reservation payment documents are accepted against
    Allocation,
    ResourceKind::Allocation,
    Allocation,
    AllocationData
);

resource_handle!(
    /// Interim payment claim for one activity
    DebitNote,
    ResourceKind::DebitNote,
    DebitNote,
    DebitNoteData
);

resource_handle!(
    /// Final payment claim for one agreement
    Invoice,
    ResourceKind::Invoice,
    Invoice,
    InvoiceData
);

impl Allocation {
    /// Reserve `amount` on `platform`, optionally expiring at `expires`.
    pub async fn create(
        session: &Session,
        amount: Decimal,
        platform: &str,
        expires: Option<DateTime<Utc>>,
    ) -> RequestorResult<Self> {
        session.ensure_open()?;
        let data = session.api().create_allocation(amount, platform, expires).await?;
        let node = session.get_or_create(
            ResourceKind::Allocation,
            data.allocation_id.clone(),
            None,
            Some(ResourceData::Allocation(data)),
        );
        info!(allocation_id = %node.resource().id, %amount, platform, "Allocation created");
        Ok(Self::from_node(node, session.clone()))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Allocation(AllocationState::Active)
    }

    pub async fn release(&self) -> RequestorResult<()> {
        if !self.is_active() {
            return Err(RequestorError::precondition(self.resource(), "allocation already released"));
        }
        match self.session.api().release_allocation(self.id()).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.session.update_state(&self.node, |_| {
            Some(LifecycleState::Allocation(AllocationState::Released))
        });
        info!(allocation_id = %self.id(), "Allocation released");
        Ok(())
    }
}

/// Accept or reject a payment document exactly once
#[async_trait]
trait Decide {
    async fn accept_remote(&self, amount: Decimal, allocation: &ResourceId) -> ApiResult<()>;
    async fn reject_remote(&self, reason: &str) -> ApiResult<()>;
}

macro_rules! document_decisions {
    ($handle:ident, $amount:ident, $accept:ident, $reject:ident) => {
        #[async_trait]
        impl Decide for $handle {
            async fn accept_remote(&self, amount: Decimal, allocation: &ResourceId) -> ApiResult<()> {
                self.session.api().$accept(self.id(), amount, allocation).await
            }

            async fn reject_remote(&self, reason: &str) -> ApiResult<()> {
                self.session.api().$reject(self.id(), reason).await
            }
        }

        impl $handle {
            pub fn status(&self) -> DocumentStatus {
                self.state().document().unwrap_or(DocumentStatus::Received)
            }

            /// Accept the full amount against `allocation` and return it. The
            /// decision is final.
            pub async fn accept_full(&self, allocation: &Allocation) -> RequestorResult<Decimal> {
                self.ensure_undecided()?;
                if !allocation.is_active() {
                    return Err(RequestorError::precondition(
                        allocation.resource(),
                        "allocation is released",
                    ));
                }
                let amount = self.data(false).await?.$amount;
                self.accept_remote(amount, allocation.id()).await?;
                self.decide(DocumentStatus::Accepted);
                debug!(resource = %self.resource(), %amount, "Payment document accepted");
                Ok(amount)
            }

            /// Reject the document. The decision is final.
            pub async fn reject(&self, reason: &str) -> RequestorResult<()> {
                self.ensure_undecided()?;
                self.reject_remote(reason).await?;
                self.decide(DocumentStatus::Rejected);
                debug!(resource = %self.resource(), reason, "Payment document rejected");
                Ok(())
            }

            fn ensure_undecided(&self) -> RequestorResult<()> {
                match self.status() {
                    DocumentStatus::Received => Ok(()),
                    decided => Err(RequestorError::precondition(
                        self.resource(),
                        format!("already {:?}", decided).to_lowercase(),
                    )),
                }
            }

            fn decide(&self, status: DocumentStatus) {
                self.session.update_state(&self.node, |s| match s.document() {
                    Some(DocumentStatus::Received) => Some(LifecycleState::Document(status)),
                    _ => None,
                });
            }
        }
    };
}

document_decisions!(DebitNote, total_amount_due, accept_debit_note, reject_debit_note);
document_decisions!(Invoice, amount, accept_invoice, reject_invoice);

impl DebitNote {
    pub async fn activity_id(&self) -> RequestorResult<ResourceId> {
        Ok(self.data(false).await?.activity_id)
    }
}

/// Start the session-wide payment collector, reporting events after
/// `since` (or everything when `None`).
pub fn collect_payments(session: &Session, since: Option<DateTime<Utc>>) {
    session.spawn_collector(
        PAYMENT_COLLECTOR.to_string(),
        None,
        PaymentSource {
            session: session.clone(),
            min_ts: since,
        },
    );
}

/// Attaches incoming debit notes and invoices to the tree
struct PaymentSource {
    session: Session,
    /// Timestamp of the newest event seen
    min_ts: Option<DateTime<Utc>>,
}

#[async_trait]
impl EventSource for PaymentSource {
    type Event = PaymentEvent;

    fn name(&self) -> String {
        PAYMENT_COLLECTOR.to_string()
    }

    async fn poll(&mut self) -> ApiResult<Vec<PaymentEvent>> {
        let config = self.session.config();
        self.session
            .api()
            .collect_payment_events(self.min_ts, config.payment_poll_timeout, config.payment_poll_max_events)
            .await
    }

    async fn process(&mut self, event: PaymentEvent) -> RequestorResult<()> {
        let event_date = event.event_date();
        self.min_ts = Some(self.min_ts.map_or(event_date, |ts| ts.max(event_date)));

        match event {
            PaymentEvent::DebitNoteReceived { debit_note_id, .. } => {
                let data = self.session.api().get_debit_note(&debit_note_id).await?;
                let agreement = self.session.get_or_create(
                    ResourceKind::Agreement,
                    data.agreement_id.clone(),
                    None,
                    None,
                );
                let activity = self.session.get_or_create(
                    ResourceKind::Activity,
                    data.activity_id.clone(),
                    Some(&agreement),
                    None,
                );
                debug!(%debit_note_id, activity_id = %data.activity_id, total = %data.total_amount_due, "Debit note received");
                self.session.get_or_create(
                    ResourceKind::DebitNote,
                    debit_note_id,
                    Some(&activity),
                    Some(ResourceData::DebitNote(data)),
                );
            }
            PaymentEvent::InvoiceReceived { invoice_id, .. } => {
                let data = self.session.api().get_invoice(&invoice_id).await?;
                let agreement = self.session.get_or_create(
                    ResourceKind::Agreement,
                    data.agreement_id.clone(),
                    None,
                    None,
                );
                debug!(%invoice_id, agreement_id = %data.agreement_id, amount = %data.amount, "Invoice received");
                self.session.get_or_create(
                    ResourceKind::Invoice,
                    invoice_id,
                    Some(&agreement),
                    Some(ResourceData::Invoice(data)),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::api::MockDaemon;
    use crate::session::SessionConfig;
    use requestor_types::RequestorEvent;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            payment_poll_timeout: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    async fn next_new(sub: &mut crate::events::EventSubscription) -> RequestorEvent {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_debit_note_attaches_under_activity() {
        let mock = Arc::new(MockDaemon::new());
        let (agreement_id, activity_id) = mock.seed_live_activity("p1").await;
        let session = Session::new(mock.clone(), fast_config());
        let mut sub = session.bus().subscribe(|e| {
            matches!(e, RequestorEvent::NewResource { resource, .. } if resource.kind == ResourceKind::DebitNote)
        });

        collect_payments(&session, None);
        let note_id = mock.issue_debit_note(&activity_id, Decimal::new(25, 2)).await.unwrap();

        match next_new(&mut sub).await {
            RequestorEvent::NewResource { resource, parent } => {
                assert_eq!(resource.id, note_id);
                assert_eq!(parent.map(|p| p.id), Some(activity_id.clone()));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let activity = Activity::from_node(
            session.require(ResourceKind::Activity, &activity_id).unwrap(),
            session.clone(),
        );
        assert_eq!(activity.agreement().unwrap().id(), &agreement_id);
    }

    #[tokio::test]
    async fn test_decisions_are_final() {
        let mock = Arc::new(MockDaemon::new());
        let (_, activity_id) = mock.seed_live_activity("p1").await;
        let session = Session::new(mock.clone(), fast_config());
        let allocation = Allocation::create(&session, Decimal::from(5), "erc20-holesky-tglm", None)
            .await
            .unwrap();

        let first = mock.issue_debit_note(&activity_id, Decimal::new(4, 1)).await.unwrap();
        let second = mock.issue_debit_note(&activity_id, Decimal::new(4, 1)).await.unwrap();
        let note = |id: ResourceId| {
            DebitNote::from_node(
                session.get_or_create(ResourceKind::DebitNote, id, None, None),
                session.clone(),
            )
        };

        let accepted = note(first.clone());
        assert_eq!(accepted.accept_full(&allocation).await.unwrap(), Decimal::new(4, 1));
        assert!(accepted.reject("late").await.is_err());
        assert!(accepted.accept_full(&allocation).await.is_err());

        let rejected = note(second.clone());
        rejected.reject("over budget").await.unwrap();
        assert!(rejected.accept_full(&allocation).await.is_err());

        assert_eq!(mock.debit_note_status(&first).await, Some(DocumentStatus::Accepted));
        assert_eq!(mock.debit_note_status(&second).await, Some(DocumentStatus::Rejected));
        assert_eq!(mock.total_accepted().await, Decimal::new(4, 1));
    }

    #[tokio::test]
    async fn test_released_allocation_cannot_pay() {
        let mock = Arc::new(MockDaemon::new());
        let (agreement_id, _) = mock.seed_live_activity("p1").await;
        let session = Session::new(mock.clone(), fast_config());
        let allocation = Allocation::create(&session, Decimal::ONE, "erc20-holesky-tglm", None)
            .await
            .unwrap();
        allocation.release().await.unwrap();
        assert!(allocation.release().await.is_err());

        let invoice_id = mock.issue_invoice(&agreement_id, Decimal::new(5, 1)).await.unwrap();
        let invoice = Invoice::from_node(
            session.get_or_create(ResourceKind::Invoice, invoice_id, None, None),
            session.clone(),
        );
        assert!(matches!(
            invoice.accept_full(&allocation).await,
            Err(RequestorError::StatePrecondition { .. })
        ));
        assert_eq!(invoice.status(), DocumentStatus::Received);
    }
}
