use chrono::Utc;
use requestor_core::api::CommandReply;
use requestor_core::{
    accept_all, DefaultNegotiation, MockDaemon, NegotiationConfig, Negotiator, PricingConstraints,
    Session, SessionConfig,
};
use requestor_core::api::mock::MockAgreementState;
use requestor_payment::{PaymentConfig, PaymentMonitor};
use requestor_state::{
    ActivityRecord, ActivityStatus, AgreementRecord, DemandRecord, InMemoryRunStore, ProposalRecord,
    RunStore,
};
use requestor_tasks::{
    Distributor, DistributorConfig, QueueTaskSource, RunOutcome, StopCause, TaskSource, TaskSpec,
};
use requestor_types::{
    AgreementState, Command, DemandData, Properties, ResourceId, RunId, StopReason, TaskId,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn demand_data() -> DemandData {
    DemandData {
        properties: Properties::new(),
        constraints: "(golem.runtime.name=vm)".into(),
    }
}

fn tasks(count: usize) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| TaskSpec {
            id: TaskId::new(format!("task-{}", i)),
            commands: vec![Command::shell(format!("echo {}", i))],
        })
        .collect()
}

struct Harness {
    mock: Arc<MockDaemon>,
    store: Arc<InMemoryRunStore>,
    distributor: Arc<Distributor>,
}

fn harness(
    mock: Arc<MockDaemon>,
    store: Arc<InMemoryRunStore>,
    run_id: RunId,
    source: Arc<dyn TaskSource>,
    payments: PaymentConfig,
    config: DistributorConfig,
) -> Harness {
    let session = Session::new(
        mock.clone(),
        SessionConfig {
            offer_poll_timeout: Duration::from_millis(10),
            batch_poll_timeout: Duration::from_millis(10),
            payment_poll_timeout: Duration::from_millis(10),
            approval_poll_interval: Duration::from_millis(10),
            terminate_backoff: Duration::from_millis(1),
            ..SessionConfig::default()
        },
    );
    let negotiator = Arc::new(Negotiator::new(
        accept_all(),
        Arc::new(DefaultNegotiation {
            demand: demand_data(),
            constraints: PricingConstraints::default(),
            response_timeout: Duration::from_secs(1),
        }),
        NegotiationConfig::default(),
    ));
    let payments = PaymentMonitor::new(session.clone(), payments);
    let distributor = Distributor::new(
        run_id,
        session,
        store.clone(),
        payments,
        negotiator,
        source,
        demand_data(),
        config,
    );
    Harness {
        mock,
        store,
        distributor,
    }
}

fn config(workers: usize) -> DistributorConfig {
    DistributorConfig {
        workers,
        task_timeout: Duration::from_secs(30),
        ..DistributorConfig::default()
    }
}

async fn finish<F>(distributor: &Arc<Distributor>, shutdown: F) -> RunOutcome
where
    F: Future<Output = ()> + Send,
{
    tokio::time::timeout(Duration::from_secs(20), distributor.run(shutdown))
        .await
        .expect("run should finish")
        .expect("run should not error")
}

/// Wait until the run has an activity recorded and return its id.
async fn stored_activity(store: &InMemoryRunStore, run_id: &RunId) -> ResourceId {
    for _ in 0..400 {
        let activities = store.activities(run_id).await.expect("activities");
        if let Some(activity) = activities.into_iter().next() {
            return activity.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no activity was recorded");
}

/// Store rows an earlier process would have left for one agreement.
async fn seed_run(
    store: &InMemoryRunStore,
    run_id: RunId,
    agreement_id: &ResourceId,
    activity: Option<(&ResourceId, ActivityStatus, Option<StopReason>)>,
) {
    let started_at = Utc::now() - chrono::Duration::minutes(10);
    store.create_run(run_id, started_at).await.expect("create run");
    store
        .insert_demand(DemandRecord {
            id: ResourceId::new("demand-1"),
            run_id,
            created_at: started_at,
        })
        .await
        .expect("insert demand");
    store
        .insert_proposal(ProposalRecord {
            id: ResourceId::new("proposal-1"),
            demand_id: ResourceId::new("demand-1"),
            initial: true,
            data: Value::Null,
            created_at: started_at,
        })
        .await
        .expect("insert proposal");
    store
        .insert_agreement(AgreementRecord {
            id: agreement_id.clone(),
            proposal_id: ResourceId::new("proposal-1"),
            status: AgreementState::Approved,
            created_at: started_at,
        })
        .await
        .expect("insert agreement");
    if let Some((id, status, stop_reason)) = activity {
        store
            .insert_activity(ActivityRecord {
                id: id.clone(),
                agreement_id: agreement_id.clone(),
                status,
                stop_reason,
                created_at: started_at,
            })
            .await
            .expect("insert activity");
    }
}

#[tokio::test]
async fn completes_all_tasks() {
    let mock = Arc::new(MockDaemon::with_providers(2));
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    let h = harness(
        mock,
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(6), 3)),
        PaymentConfig::default(),
        config(2),
    );

    let outcome = finish(&h.distributor, std::future::pending()).await;
    assert_eq!(outcome.cause, StopCause::Completed);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.tasks_completed, 6);
    assert_eq!(outcome.tasks_failed, 0);
    assert_eq!(h.mock.calls("subscribe_demand"), 1);

    let summary = h
        .store
        .summary(&run_id)
        .await
        .expect("summary")
        .expect("run should be stored");
    assert_eq!(summary.results, 6);
    assert!(summary.activities >= 1);
}

#[tokio::test]
async fn failing_activity_is_replaced() {
    let mock = Arc::new(MockDaemon::with_providers(2));
    mock.set_command_rule(|command| match command {
        Command::Run { .. } => CommandReply::Fail("boom".into()),
        _ => CommandReply::Ok(String::new()),
    })
    .await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    let h = harness(
        mock,
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(1), 3)),
        PaymentConfig::default(),
        DistributorConfig {
            max_activity_failures: 2,
            ..config(1)
        },
    );

    let outcome = finish(&h.distributor, std::future::pending()).await;
    assert_eq!(outcome.cause, StopCause::Completed);
    assert_eq!(outcome.tasks_completed, 0);
    assert_eq!(outcome.tasks_failed, 1);
    assert_eq!(h.mock.calls("create_activity"), 2);

    let activities = h.store.activities(&run_id).await.expect("activities");
    assert_eq!(activities.len(), 2);
    assert_eq!(activities[0].stop_reason, Some(StopReason::TooManyFailures));
    assert_eq!(activities[0].status, ActivityStatus::Stopped);
    assert_eq!(activities[1].stop_reason, Some(StopReason::AppClosing));
}

#[tokio::test]
async fn budget_exhaustion_stops_run() {
    let mock = Arc::new(MockDaemon::with_providers(1));
    mock.set_command_rule(|command| match command {
        Command::Run { .. } => CommandReply::Hang,
        _ => CommandReply::Ok(String::new()),
    })
    .await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    let h = harness(
        mock.clone(),
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(1), 3)),
        PaymentConfig {
            budget_per_hour: Decimal::ONE,
            ..PaymentConfig::default()
        },
        config(1),
    );

    let run = {
        let distributor = h.distributor.clone();
        tokio::spawn(async move { finish(&distributor, std::future::pending()).await })
    };
    let activity = stored_activity(&h.store, &run_id).await;
    // Running totals 0.6 then 1.2; the second note adds 0.6 and breaks the cap.
    mock.issue_debit_note(&activity, Decimal::new(6, 1)).await.expect("issue");
    mock.issue_debit_note(&activity, Decimal::new(6, 1)).await.expect("issue");

    let outcome = run.await.expect("run task");
    assert!(matches!(outcome.cause, StopCause::BudgetExhausted { budget, .. } if budget == Decimal::ONE));
    assert_eq!(outcome.exit_code(), 2);

    let activities = h.store.activities(&run_id).await.expect("activities");
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].stop_reason, Some(StopReason::BudgetExhausted));
    let notes = h.store.debit_notes(&run_id, None).await.expect("debit notes");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].amount, Decimal::new(6, 1));
    assert_eq!(mock.total_accepted().await, Decimal::new(6, 1));
}

#[tokio::test]
async fn user_stop_terminates_agreements() {
    let mock = Arc::new(MockDaemon::with_providers(1));
    mock.set_command_rule(|command| match command {
        Command::Run { .. } => CommandReply::Hang,
        _ => CommandReply::Ok(String::new()),
    })
    .await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    let h = harness(
        mock.clone(),
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(3), 3)),
        PaymentConfig::default(),
        config(1),
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let run = {
        let distributor = h.distributor.clone();
        tokio::spawn(async move {
            finish(&distributor, async {
                let _ = stop_rx.await;
            })
            .await
        })
    };
    let activity = stored_activity(&h.store, &run_id).await;
    stop_tx.send(()).expect("run should be waiting");

    let outcome = run.await.expect("run task");
    assert_eq!(outcome.cause, StopCause::UserRequested);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.tasks_completed, 0);

    for agreement in mock.agreement_ids().await {
        assert_eq!(mock.agreement_state(&agreement).await, Some(MockAgreementState::Terminated));
    }
    assert_eq!(mock.activity_destroyed(&activity).await, Some(true));

    let stored = h.store.activities(&run_id).await.expect("activities");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].stop_reason, Some(StopReason::AppClosing));
}

#[tokio::test]
async fn recovery_reattaches_live_activity() {
    let mock = Arc::new(MockDaemon::new());
    let (agreement_id, activity_id) = mock.seed_live_activity("provider-1").await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    seed_run(
        &store,
        run_id,
        &agreement_id,
        Some((&activity_id, ActivityStatus::Ready, None)),
    )
    .await;

    let h = harness(
        mock.clone(),
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(2), 3)),
        PaymentConfig::default(),
        config(1),
    );
    let outcome = finish(&h.distributor, std::future::pending()).await;

    assert_eq!(outcome.cause, StopCause::Completed);
    assert_eq!(outcome.tasks_completed, 2);
    assert_eq!(mock.calls("subscribe_demand"), 0);
    assert_eq!(mock.calls("create_activity"), 0);
    assert_eq!(mock.executed_commands(&activity_id).await.len(), 2);

    let rollup = h.store.rollup(&run_id).await.expect("rollup");
    assert_eq!(rollup.len(), 1);
    assert_eq!(rollup[0].results, 2);
}

#[tokio::test]
async fn recovery_reattaches_activity_left_busy() {
    let mock = Arc::new(MockDaemon::new());
    let (agreement_id, activity_id) = mock.seed_live_activity("provider-1").await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    seed_run(
        &store,
        run_id,
        &agreement_id,
        Some((&activity_id, ActivityStatus::Busy, None)),
    )
    .await;

    let h = harness(
        mock.clone(),
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(1), 3)),
        PaymentConfig::default(),
        config(1),
    );
    let outcome = finish(&h.distributor, std::future::pending()).await;

    assert_eq!(outcome.cause, StopCause::Completed);
    assert_eq!(outcome.tasks_completed, 1);
    assert_eq!(mock.calls("subscribe_demand"), 0);
    assert_eq!(mock.calls("create_activity"), 0);
    assert_eq!(mock.executed_commands(&activity_id).await.len(), 1);

    let activities = h.store.activities(&run_id).await.expect("activities");
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].stop_reason, Some(StopReason::AppClosing));
}

#[tokio::test]
async fn restart_after_user_stop_negotiates_fresh_agreements() {
    let mock = Arc::new(MockDaemon::with_providers(1));
    mock.set_command_rule(|command| match command {
        Command::Run { .. } => CommandReply::Hang,
        _ => CommandReply::Ok(String::new()),
    })
    .await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();

    let first = harness(
        mock.clone(),
        store.clone(),
        run_id,
        Arc::new(QueueTaskSource::new(tasks(2), 3)),
        PaymentConfig::default(),
        config(1),
    );
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let run = {
        let distributor = first.distributor.clone();
        tokio::spawn(async move {
            finish(&distributor, async {
                let _ = stop_rx.await;
            })
            .await
        })
    };
    let old_activity = stored_activity(&store, &run_id).await;
    stop_tx.send(()).expect("run should be waiting");
    assert_eq!(run.await.expect("run task").cause, StopCause::UserRequested);
    let old_agreements = mock.agreement_ids().await;
    assert_eq!(old_agreements.len(), 1);

    mock.set_command_rule(|_| CommandReply::Ok(String::new())).await;
    let second = harness(
        mock.clone(),
        store.clone(),
        run_id,
        Arc::new(QueueTaskSource::new(tasks(2), 3)),
        PaymentConfig::default(),
        config(1),
    );
    let outcome = finish(&second.distributor, std::future::pending()).await;

    assert_eq!(outcome.cause, StopCause::Completed);
    assert_eq!(outcome.tasks_completed, 2);
    assert_eq!(mock.calls("subscribe_demand"), 2);
    assert_eq!(mock.calls("create_activity"), 2);
    assert_eq!(mock.agreement_ids().await.len(), 2);
    assert_eq!(mock.activity_destroyed(&old_activity).await, Some(true));

    let agreements = store.agreements(&run_id).await.expect("agreements");
    assert_eq!(agreements.len(), 2);
    assert!(agreements.iter().any(|a| old_agreements.contains(&a.id)));
    let activities = store.activities(&run_id).await.expect("activities");
    assert_eq!(activities.len(), 2);
    assert!(activities.iter().all(|a| a.stop_reason == Some(StopReason::AppClosing)));
}

#[tokio::test]
async fn recovery_reuses_agreement_of_stopped_activity() {
    let mock = Arc::new(MockDaemon::new());
    let (agreement_id, old_activity) = mock.seed_live_activity("provider-1").await;
    let store = Arc::new(InMemoryRunStore::new());
    let run_id = RunId::generate();
    seed_run(
        &store,
        run_id,
        &agreement_id,
        Some((
            &old_activity,
            ActivityStatus::Stopped,
            Some(StopReason::TooManyFailures),
        )),
    )
    .await;

    let h = harness(
        mock.clone(),
        store,
        run_id,
        Arc::new(QueueTaskSource::new(tasks(2), 3)),
        PaymentConfig::default(),
        config(1),
    );
    let outcome = finish(&h.distributor, std::future::pending()).await;

    assert_eq!(outcome.cause, StopCause::Completed);
    assert_eq!(outcome.tasks_completed, 2);
    assert_eq!(mock.calls("subscribe_demand"), 0);
    assert_eq!(mock.calls("create_activity"), 1);
    assert!(mock.executed_commands(&old_activity).await.is_empty());

    let activities = h.store.activities(&run_id).await.expect("activities");
    assert_eq!(activities.len(), 2);
    assert_eq!(activities[0].stop_reason, Some(StopReason::TooManyFailures));
}
