use requestor_core::{
    accept_all, activity::PREPARE_TIMEOUT, collect_payments, Allocation, DebitNote, DefaultNegotiation,
    Demand, MockDaemon, MockProvider, NegotiationConfig, Negotiator, PricingConstraints, Session,
    SessionConfig,
};
use requestor_types::{
    AgreementState, Command, DemandData, DocumentStatus, Properties, RequestorEvent, ResourceKind,
    Script,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

fn fast_session(mock: Arc<MockDaemon>) -> Session {
    Session::new(
        mock,
        SessionConfig {
            offer_poll_timeout: Duration::from_millis(10),
            batch_poll_timeout: Duration::from_millis(10),
            payment_poll_timeout: Duration::from_millis(10),
            approval_poll_interval: Duration::from_millis(10),
            ..SessionConfig::default()
        },
    )
}

fn demand_data() -> DemandData {
    DemandData {
        properties: Properties::new(),
        constraints: "(golem.runtime.name=vm)".into(),
    }
}

fn negotiator() -> Negotiator {
    Negotiator::new(
        accept_all(),
        Arc::new(DefaultNegotiation {
            demand: demand_data(),
            constraints: PricingConstraints::default(),
            response_timeout: Duration::from_secs(1),
        }),
        NegotiationConfig::default(),
    )
}

#[tokio::test]
async fn negotiate_execute_and_pay() {
    let mock = Arc::new(MockDaemon::new());
    mock.add_provider(MockProvider::new("provider-1")).await;
    let session = fast_session(mock.clone());
    let mut events = session.bus().subscribe(|_| true);

    let demand = Demand::subscribe(&session, demand_data())
        .await
        .expect("demand should subscribe");
    let mut proposals = negotiator().start(&demand);
    let proposal = tokio::time::timeout(Duration::from_secs(2), proposals.next())
        .await
        .expect("an offer should arrive")
        .expect("offer stream should stay open");

    let agreement = negotiator()
        .agree(&proposal)
        .await
        .expect("agreement should be approved");
    let activity = agreement
        .create_activity()
        .await
        .expect("activity should be created");
    activity
        .prepare(None, PREPARE_TIMEOUT)
        .await
        .expect("activity should deploy and start");

    let batch = activity
        .execute(Script::new().with(Command::shell("echo hello")))
        .await
        .expect("batch should be submitted");
    let results = batch
        .wait(Duration::from_secs(2))
        .await
        .expect("batch should succeed");
    assert_eq!(results.len(), 1);

    let allocation = Allocation::create(&session, Decimal::TEN, "erc20-holesky-tglm", None)
        .await
        .expect("allocation should be created");
    collect_payments(&session, None);
    let mut notes = session.bus().subscribe(|e| {
        matches!(e, RequestorEvent::NewResource { resource, .. } if resource.kind == ResourceKind::DebitNote)
    });
    let note_id = mock
        .issue_debit_note(activity.id(), Decimal::new(5, 1))
        .await
        .expect("debit note should be issued");
    tokio::time::timeout(Duration::from_secs(2), notes.recv())
        .await
        .expect("debit note should be collected");

    let note = DebitNote::lookup(&session, &note_id).expect("debit note should be in the tree");
    assert_eq!(note.activity_id().await.expect("note data"), *activity.id());
    note.accept_full(&allocation).await.expect("note should be accepted");
    assert_eq!(
        mock.debit_note_status(&note_id).await,
        Some(DocumentStatus::Accepted)
    );

    session.close(true).await;
    assert_eq!(agreement.agreement_state(), AgreementState::Terminated);
    assert_eq!(mock.activity_destroyed(activity.id()).await, Some(true));

    // Every resource was announced before anything else was said about it
    let mut announced = std::collections::HashSet::new();
    while let Some(event) = events.try_recv() {
        match &event {
            RequestorEvent::NewResource { resource, .. } => {
                announced.insert(resource.clone());
            }
            RequestorEvent::BudgetExceeded { .. } | RequestorEvent::CollectorFailed { resource: None, .. } => {}
            other => {
                let resource = other.resource().expect("resource event");
                assert!(
                    announced.contains(resource),
                    "{} arrived before NewResource for {}",
                    other.name(),
                    resource
                );
            }
        }
    }
}

#[tokio::test]
async fn closed_session_refuses_new_work() {
    let mock = Arc::new(MockDaemon::new());
    let session = fast_session(mock.clone());
    session.close(false).await;

    assert!(Demand::subscribe(&session, demand_data()).await.is_err());
    assert_eq!(mock.calls("subscribe_demand"), 0);
}
