use requestor_core::{EventSubscription, MockDaemon, Session, SessionConfig};
use requestor_payment::{PaymentConfig, PaymentMonitor};
use requestor_types::{DocumentStatus, RequestorEvent, ResourceId, StopReason};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    mock: Arc<MockDaemon>,
    monitor: Arc<PaymentMonitor>,
    events: EventSubscription,
    agreement_id: ResourceId,
    activity_id: ResourceId,
}

async fn harness(config: PaymentConfig) -> Harness {
    let mock = Arc::new(MockDaemon::new());
    let (agreement_id, activity_id) = mock.seed_live_activity("provider-1").await;
    let session = Session::new(
        mock.clone(),
        SessionConfig {
            payment_poll_timeout: Duration::from_millis(10),
            ..SessionConfig::default()
        },
    );
    let events = session.bus().subscribe(|e| {
        matches!(
            e,
            RequestorEvent::DebitNoteAccepted { .. }
                | RequestorEvent::InvoiceAccepted { .. }
                | RequestorEvent::PaymentRejected { .. }
                | RequestorEvent::BudgetExceeded { .. }
                | RequestorEvent::ActivityFlagged { .. }
        )
    });
    let monitor = PaymentMonitor::new(session, config);
    monitor.start(None).await.expect("monitor should start");
    Harness {
        mock,
        monitor,
        events,
        agreement_id,
        activity_id,
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("decimal literal")
}

async fn next(events: &mut EventSubscription) -> RequestorEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("payment event should arrive")
        .expect("bus should stay open")
}

#[tokio::test]
async fn second_note_over_hourly_budget_is_rejected() {
    let mut h = harness(PaymentConfig {
        budget_per_hour: Decimal::ONE,
        ..PaymentConfig::default()
    })
    .await;

    let first = h.mock.issue_debit_note(&h.activity_id, dec("0.6")).await.expect("issue");
    let second = h.mock.issue_debit_note(&h.activity_id, dec("0.6")).await.expect("issue");

    assert!(matches!(next(&mut h.events).await, RequestorEvent::DebitNoteAccepted { amount, .. } if amount == dec("0.6")));
    assert!(matches!(next(&mut h.events).await, RequestorEvent::BudgetExceeded { spent, budget } if spent == dec("1.2") && budget == Decimal::ONE));
    assert!(matches!(next(&mut h.events).await, RequestorEvent::PaymentRejected { resource, .. } if resource.id == second));

    assert_eq!(h.mock.debit_note_status(&first).await, Some(DocumentStatus::Accepted));
    assert_eq!(h.mock.debit_note_status(&second).await, Some(DocumentStatus::Rejected));
    assert!(h.monitor.is_exhausted());
    assert_eq!(h.monitor.spent_last_hour(), dec("0.6"));
}

#[tokio::test]
async fn running_totals_count_only_their_increase() {
    let mut h = harness(PaymentConfig {
        budget_per_hour: Decimal::ONE,
        ..PaymentConfig::default()
    })
    .await;

    // Notes state totals of 0.2, 0.4 and 0.6 for the same activity
    for _ in 0..3 {
        h.mock.issue_debit_note(&h.activity_id, dec("0.2")).await.expect("issue");
    }
    for expected_total in ["0.2", "0.4", "0.6"] {
        match next(&mut h.events).await {
            RequestorEvent::DebitNoteAccepted { amount, total, .. } => {
                assert_eq!(amount, dec("0.2"));
                assert_eq!(total, dec(expected_total));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(h.monitor.spent_last_hour(), dec("0.6"));
    assert_eq!(h.monitor.accepted_total(&h.activity_id), dec("0.6"));
    assert!(!h.monitor.is_exhausted());
    assert_eq!(h.mock.total_accepted().await, dec("0.6"));
}

#[tokio::test]
async fn expensive_activity_is_flagged_after_warmup() {
    let mut h = harness(PaymentConfig {
        budget_per_hour: Decimal::TEN,
        max_price: Some(dec("0.01")),
        warmup: Duration::ZERO,
        ..PaymentConfig::default()
    })
    .await;
    h.monitor.register_activity(&h.activity_id);
    h.monitor.record_results(&h.activity_id, 1);

    h.mock.issue_debit_note(&h.activity_id, dec("0.02")).await.expect("issue");

    assert!(matches!(next(&mut h.events).await, RequestorEvent::DebitNoteAccepted { .. }));
    match next(&mut h.events).await {
        RequestorEvent::ActivityFlagged {
            resource,
            reason,
            cost_per_result,
        } => {
            assert_eq!(resource.id, h.activity_id);
            assert_eq!(reason, StopReason::TooExpensive);
            assert_eq!(cost_per_result, Some(dec("0.02")));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn cheap_running_totals_are_not_flagged() {
    let mut h = harness(PaymentConfig {
        budget_per_hour: Decimal::TEN,
        max_price: Some(dec("0.05")),
        warmup: Duration::ZERO,
        ..PaymentConfig::default()
    })
    .await;
    h.monitor.register_activity(&h.activity_id);
    h.monitor.record_results(&h.activity_id, 2);

    // Totals 0.04 then 0.08 over two results: 0.04 per result
    h.mock.issue_debit_note(&h.activity_id, dec("0.04")).await.expect("issue");
    h.mock.issue_debit_note(&h.activity_id, dec("0.04")).await.expect("issue");
    assert!(matches!(next(&mut h.events).await, RequestorEvent::DebitNoteAccepted { .. }));
    assert!(matches!(next(&mut h.events).await, RequestorEvent::DebitNoteAccepted { .. }));

    let cost = h.monitor.activity_cost(&h.activity_id).expect("tracked");
    assert_eq!(cost.accepted, dec("0.08"));
    assert!(!cost.flagged);
}

#[tokio::test]
async fn invoice_is_budgeted_on_uncovered_part() {
    let mut h = harness(PaymentConfig {
        budget_per_hour: dec("0.6"),
        ..PaymentConfig::default()
    })
    .await;

    h.mock.issue_debit_note(&h.activity_id, dec("0.2")).await.expect("issue");
    h.mock.issue_debit_note(&h.activity_id, dec("0.1")).await.expect("issue");
    assert!(matches!(next(&mut h.events).await, RequestorEvent::DebitNoteAccepted { .. }));
    assert!(matches!(next(&mut h.events).await, RequestorEvent::DebitNoteAccepted { .. }));

    let invoice = h.mock.issue_invoice(&h.agreement_id, dec("0.5")).await.expect("issue");
    match next(&mut h.events).await {
        RequestorEvent::InvoiceAccepted { resource, amount, .. } => {
            assert_eq!(resource.id, invoice);
            assert_eq!(amount, dec("0.5"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    // 0.3 through debit notes plus the uncovered 0.2 of the invoice
    assert_eq!(h.monitor.spent_last_hour(), dec("0.5"));
    assert!(!h.monitor.is_exhausted());
}

#[tokio::test]
async fn seeded_totals_are_not_paid_twice() {
    let mut h = harness(PaymentConfig {
        budget_per_hour: Decimal::ONE,
        ..PaymentConfig::default()
    })
    .await;
    h.monitor
        .seed_totals([(h.activity_id.clone(), h.agreement_id.clone(), dec("0.7"))]);

    // The daemon's running total continues from the earlier process
    h.mock.issue_debit_note(&h.activity_id, dec("0.9")).await.expect("issue");
    match next(&mut h.events).await {
        RequestorEvent::DebitNoteAccepted { amount, total, .. } => {
            assert_eq!(amount, dec("0.2"));
            assert_eq!(total, dec("0.9"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.monitor.spent_last_hour(), dec("0.2"));
}
