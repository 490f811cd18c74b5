//! Batch execution
//!
//! A [`PoolingBatch`] tracks one submitted script. Its collector polls the
//! daemon for per-command results, ignores indexes it has already seen and
//! stops the batch at the first failing command; commands after it are
//! marked cancelled and never run.

use crate::collector::EventSource;
use crate::error::{ApiResult, RequestorError, RequestorResult};
use crate::resource::ResourceNode;
use crate::session::{collector_key, Session};
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use requestor_types::{
    ActivityState, BatchData, BatchState, CancelReason, CommandOutcome, CommandResult,
    CommandStatus, LifecycleState, RequestorEvent, ResourceData, ResourceKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

resource_handle!(
    /// One submitted script on an activity
    PoolingBatch,
    ResourceKind::PoolingBatch,
    PoolingBatch,
    BatchData
);

impl PoolingBatch {
    pub fn batch_state(&self) -> BatchState {
        self.state().batch().unwrap_or(BatchState::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        self.batch_state() == BatchState::Running
    }

    fn snapshot(&self) -> Option<BatchData> {
        match self.node.cached_data().as_deref() {
            Some(ResourceData::PoolingBatch(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn command_status(&self, index: usize) -> Option<CommandStatus> {
        self.snapshot().and_then(|d| d.commands.get(index).cloned())
    }

    /// Result of one command, or why it has none.
    pub fn command_outcome(&self, index: usize) -> RequestorResult<CommandResult> {
        match self.command_status(index) {
            Some(CommandStatus::Succeeded(result)) => Ok(result),
            Some(CommandStatus::Failed(result)) => Err(command_failed(self.id(), result)),
            Some(CommandStatus::Cancelled(reason)) => Err(RequestorError::CommandCancelled {
                batch_id: self.id().clone(),
                index,
                reason,
            }),
            Some(CommandStatus::Pending) => Err(RequestorError::precondition(
                self.resource(),
                format!("command {} has not reported yet", index),
            )),
            None => Err(RequestorError::precondition(
                self.resource(),
                format!("batch has no command {}", index),
            )),
        }
    }

    /// Per-command statuses in command order as they become final. The
    /// stream ends after the last command.
    pub fn events(&self) -> impl Stream<Item = (usize, CommandStatus)> + Send + 'static {
        let rx = self.node.data_watch();
        futures::stream::unfold((rx, 0usize), |(mut rx, index)| async move {
            loop {
                let status = match rx.borrow_and_update().as_deref() {
                    Some(ResourceData::PoolingBatch(data)) => match data.commands.get(index) {
                        Some(status) => status.clone(),
                        None => return None,
                    },
                    _ => return None,
                };
                if !status.is_pending() {
                    return Some(((index, status), (rx, index + 1)));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    /// Wait until the batch is final, without blocking other batches.
    ///
    /// Success yields every command result in order. A batch still running
    /// when `timeout` elapses is finalized as timed out: its unreported
    /// commands are cancelled and `BatchTimeout` is returned.
    pub async fn wait(&self, timeout: Duration) -> RequestorResult<Vec<CommandResult>> {
        let mut state = self.node.state_watch();
        let finished = tokio::time::timeout(timeout, async {
            state
                .wait_for(|s| s.batch().map_or(true, |b| b.is_terminal()))
                .await
                .map(|_| ())
        })
        .await;

        match finished {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(RequestorError::SessionClosed),
            Err(_) => {
                if self.finalize(BatchState::TimedOut, CancelReason::TimedOut).await {
                    debug!(batch_id = %self.id(), ?timeout, "Batch timed out");
                }
            }
        }
        self.outcome(timeout)
    }

    /// Cancel the batch. Returns `false` if it had already finished.
    pub async fn cancel(&self) -> bool {
        self.finalize(BatchState::Cancelled, CancelReason::Explicit).await
    }

    async fn finalize(&self, state: BatchState, reason: CancelReason) -> bool {
        let finished = {
            let _guard = self.node.lock().await;
            let activity = self.node.parent();
            finish(&self.session, &self.node, activity.as_deref(), state, Some(reason))
        };
        if finished {
            self.session.stop_collector(&collector_key(self.resource()));
        }
        finished
    }

    fn outcome(&self, timeout: Duration) -> RequestorResult<Vec<CommandResult>> {
        let data = self.snapshot().ok_or_else(|| {
            RequestorError::precondition(self.resource(), "batch has no data")
        })?;

        match self.batch_state() {
            BatchState::Success => Ok(data
                .commands
                .iter()
                .filter_map(|c| c.result().cloned())
                .collect()),
            BatchState::Failed => {
                let failed = data.commands.iter().enumerate().find_map(|(i, c)| match c {
                    CommandStatus::Failed(result) => Some(command_failed(self.id(), result.clone())),
                    CommandStatus::Succeeded(_) => None,
                    _ => Some(RequestorError::CommandFailed {
                        batch_id: self.id().clone(),
                        index: i,
                        message: data.failure.clone().unwrap_or_else(|| "batch failed".into()),
                        stdout: None,
                        stderr: None,
                    }),
                });
                Err(failed.unwrap_or_else(|| RequestorError::precondition(self.resource(), "failed batch without failure")))
            }
            BatchState::TimedOut => Err(RequestorError::BatchTimeout {
                batch_id: self.id().clone(),
                elapsed: (Utc::now() - self.node.created_at()).to_std().unwrap_or_default(),
                timeout,
            }),
            BatchState::Cancelled => Err(RequestorError::BatchCancelled {
                batch_id: self.id().clone(),
            }),
            BatchState::Running => Err(RequestorError::precondition(self.resource(), "batch still running")),
        }
    }
}

fn command_failed(batch_id: &requestor_types::ResourceId, result: CommandResult) -> RequestorError {
    RequestorError::CommandFailed {
        batch_id: batch_id.clone(),
        index: result.index,
        message: result.message.unwrap_or_else(|| "command failed".into()),
        stdout: result.stdout,
        stderr: result.stderr,
    }
}

/// Move a running batch to `state`. Unreported commands become cancelled
/// with `pending_as`. Callers hold the batch node lock.
///
/// Returns `false` if the batch had already finished.
fn finish(
    session: &Session,
    batch: &ResourceNode,
    activity: Option<&ResourceNode>,
    state: BatchState,
    pending_as: Option<CancelReason>,
) -> bool {
    if batch.state().batch() != Some(BatchState::Running) {
        return false;
    }
    if let Some(reason) = pending_as {
        batch.modify_data(|data| match data {
            ResourceData::PoolingBatch(batch) => {
                let mut changed = false;
                for status in batch.commands.iter_mut().filter(|s| s.is_pending()) {
                    *status = CommandStatus::Cancelled(reason);
                    changed = true;
                }
                changed
            }
            _ => false,
        });
    }
    session.update_state(batch, |_| Some(LifecycleState::Batch(state)));

    let activity_id = batch.parent_ref().map(|p| p.id.clone()).unwrap_or_default();
    session.publish(RequestorEvent::BatchFinished {
        resource: batch.resource().clone(),
        activity_id,
        state,
    });

    if let Some(activity) = activity {
        if activity.end_batch() == 0 {
            session.update_state(activity, |s| match s.activity() {
                Some(ActivityState::Busy) => Some(LifecycleState::Activity(ActivityState::Idle)),
                _ => None,
            });
        }
    }
    true
}

/// Record one reported result. Returns the terminal state it implies.
fn apply_result(data: &mut BatchData, result: CommandResult) -> Option<BatchState> {
    let index = result.index;
    let Some(slot) = data.commands.get_mut(index) else {
        warn!(batch_id = %data.batch_id, index, "Result for unknown command index");
        return None;
    };
    if !slot.is_pending() {
        return None;
    }

    match result.outcome {
        CommandOutcome::Ok => {
            let batch_finished = result.is_batch_finished;
            *slot = CommandStatus::Succeeded(result);
            if data.commands.iter().all(CommandStatus::is_success) {
                Some(BatchState::Success)
            } else if batch_finished {
                data.failure = Some("batch finished before every command reported".into());
                cancel_pending(data, index);
                Some(BatchState::Failed)
            } else {
                None
            }
        }
        CommandOutcome::Error => {
            *slot = CommandStatus::Failed(result);
            cancel_pending(data, index);
            Some(BatchState::Failed)
        }
    }
}

fn cancel_pending(data: &mut BatchData, after: usize) {
    for status in data.commands.iter_mut().skip(after + 1) {
        if status.is_pending() {
            *status = CommandStatus::Cancelled(CancelReason::PriorFailure);
        }
    }
}

/// Polls the daemon for results of one batch
pub(crate) struct BatchSource {
    session: Session,
    batch: Arc<ResourceNode>,
    activity: Arc<ResourceNode>,
}

impl BatchSource {
    pub(crate) fn new(session: Session, batch: Arc<ResourceNode>, activity: Arc<ResourceNode>) -> Self {
        Self {
            session,
            batch,
            activity,
        }
    }

    fn is_finished(&self) -> bool {
        self.batch.state().batch().map_or(true, |s| s.is_terminal())
    }
}

#[async_trait]
impl EventSource for BatchSource {
    type Event = CommandResult;

    fn name(&self) -> String {
        collector_key(self.batch.resource())
    }

    async fn poll(&mut self) -> ApiResult<Vec<CommandResult>> {
        self.session
            .api()
            .get_exec_batch_results(
                &self.activity.resource().id,
                &self.batch.resource().id,
                self.session.config().batch_poll_timeout,
            )
            .await
    }

    async fn process(&mut self, result: CommandResult) -> RequestorResult<()> {
        let _guard = self.batch.lock().await;
        if self.is_finished() {
            return Ok(());
        }

        let mut terminal = None;
        self.batch.modify_data(|data| match data {
            ResourceData::PoolingBatch(batch) => {
                let before = batch.commands.iter().filter(|c| c.is_pending()).count();
                terminal = apply_result(batch, result);
                batch.commands.iter().filter(|c| c.is_pending()).count() != before
            }
            _ => false,
        });

        if let Some(state) = terminal {
            debug!(batch_id = %self.batch.resource().id, state = state.as_str(), "Batch finished");
            finish(&self.session, &self.batch, Some(&*self.activity), state, None);
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.is_finished()
    }

    async fn on_failure(&mut self, error: &RequestorError) {
        let _guard = self.batch.lock().await;
        let reason = error.to_string();
        self.batch.modify_data(|data| match data {
            ResourceData::PoolingBatch(batch) => {
                batch.failure = Some(reason);
                true
            }
            _ => false,
        });
        finish(
            &self.session,
            &self.batch,
            Some(&*self.activity),
            BatchState::Failed,
            Some(CancelReason::PriorFailure),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::api::{CommandReply, MockDaemon};
    use crate::error::ApiError;
    use crate::session::SessionConfig;
    use futures::StreamExt;
    use requestor_types::{Command, ResourceId, Script};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            batch_poll_timeout: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    async fn activity_with(mock: Arc<MockDaemon>) -> Activity {
        let (agreement_id, activity_id) = mock.seed_live_activity("p1").await;
        let session = Session::new(mock, fast_config());
        let agreement = session.get_or_create(ResourceKind::Agreement, agreement_id, None, None);
        let node = session.get_or_create(ResourceKind::Activity, activity_id, Some(&agreement), None);
        Activity::from_node(node, session)
    }

    fn abc() -> Script {
        Script::new()
            .with(Command::shell("echo A"))
            .with(Command::shell("fail B"))
            .with(Command::shell("echo C"))
    }

    async fn failing_b() -> Arc<MockDaemon> {
        let mock = Arc::new(MockDaemon::new());
        mock.set_command_rule(|cmd| match cmd {
            Command::Run { args, .. } if args.iter().any(|a| a.starts_with("fail")) => {
                CommandReply::Fail("exit status 1".into())
            }
            _ => CommandReply::Ok("ok".into()),
        })
        .await;
        mock
    }

    #[tokio::test]
    async fn test_failure_cancels_later_commands() {
        let mock = failing_b().await;
        let activity = activity_with(mock.clone()).await;
        let batch = activity.execute(abc()).await.unwrap();

        let err = batch.wait(Duration::from_secs(2)).await.unwrap_err();
        match err {
            RequestorError::CommandFailed { index, message, .. } => {
                assert_eq!(index, 1);
                assert_eq!(message, "exit status 1");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(batch.batch_state(), BatchState::Failed);
        assert!(batch.command_outcome(0).is_ok());
        assert!(matches!(batch.command_outcome(1), Err(RequestorError::CommandFailed { .. })));
        assert!(matches!(
            batch.command_outcome(2),
            Err(RequestorError::CommandCancelled {
                reason: CancelReason::PriorFailure,
                ..
            })
        ));
        assert_eq!(mock.executed_commands(activity.id()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_events_stream_in_command_order() {
        let mock = failing_b().await;
        let activity = activity_with(mock).await;
        let batch = activity.execute(abc()).await.unwrap();

        let statuses: Vec<_> = batch.events().collect().await;
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(statuses[0].1.is_success());
        assert!(matches!(statuses[1].1, CommandStatus::Failed(_)));
        assert!(matches!(statuses[2].1, CommandStatus::Cancelled(CancelReason::PriorFailure)));
    }

    #[tokio::test]
    async fn test_success_returns_results_in_order() {
        let mock = Arc::new(MockDaemon::new());
        let activity = activity_with(mock).await;
        let batch = activity
            .execute(Script::new().with(Command::deploy()).with(Command::start()))
            .await
            .unwrap();
        let results = batch.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(batch.batch_state(), BatchState::Success);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_failure() {
        let mock = Arc::new(MockDaemon::new());
        mock.set_command_rule(|cmd| match cmd {
            Command::Run { .. } => CommandReply::Hang,
            _ => CommandReply::Ok(String::new()),
        })
        .await;
        let activity = activity_with(mock).await;
        let batch = activity
            .execute(Script::new().with(Command::start()).with(Command::shell("sleep 1000")))
            .await
            .unwrap();

        let err = batch.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(err.is_timeout());
        match err {
            RequestorError::BatchTimeout { elapsed, timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(100));
                assert!(elapsed >= timeout);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(batch.batch_state(), BatchState::TimedOut);
        assert!(matches!(
            batch.command_status(1),
            Some(CommandStatus::Cancelled(CancelReason::TimedOut))
        ));
        assert_eq!(activity.activity_state(), ActivityState::Idle);
    }

    #[tokio::test]
    async fn test_explicit_cancel() {
        let mock = Arc::new(MockDaemon::new());
        mock.set_command_rule(|_| CommandReply::Hang).await;
        let activity = activity_with(mock).await;
        let batch = activity.execute(Script::new().with(Command::start())).await.unwrap();

        assert!(batch.cancel().await);
        assert!(!batch.cancel().await);
        let err = batch.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RequestorError::BatchCancelled { .. }));
        assert!(matches!(
            batch.command_status(0),
            Some(CommandStatus::Cancelled(CancelReason::Explicit))
        ));
    }

    #[tokio::test]
    async fn test_collector_failure_fails_batch() {
        let mock = Arc::new(MockDaemon::new());
        mock.set_command_rule(|_| CommandReply::Hang).await;
        let activity = activity_with(mock.clone()).await;
        mock.fail_next("get_exec_batch_results", ApiError::NotFound("activity".into()));
        let batch = activity.execute(Script::new().with(Command::start())).await.unwrap();

        let err = batch.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, RequestorError::CommandFailed { index: 0, .. }));
    }

    #[test]
    fn test_repeated_indexes_are_ignored() {
        let mut data = BatchData::new(ResourceId::new("b"), ResourceId::new("a"), 2);
        assert_eq!(apply_result(&mut data, CommandResult::ok(0, "first", false)), None);
        assert_eq!(apply_result(&mut data, CommandResult::ok(0, "again", false)), None);
        assert_eq!(
            data.commands[0].result().and_then(|r| r.stdout.clone()),
            Some("first".to_string())
        );
        assert_eq!(apply_result(&mut data, CommandResult::ok(7, "", false)), None);
        assert_eq!(
            apply_result(&mut data, CommandResult::ok(1, "", true)),
            Some(BatchState::Success)
        );
    }
}
