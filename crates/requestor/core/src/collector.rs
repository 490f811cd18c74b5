//! Background polling loops
//!
//! A collector repeatedly polls one daemon event endpoint and feeds the
//! results into the resource tree. Transient daemon errors are absorbed with
//! a bounded retry; anything else, or exhausting the retries, ends the
//! collector for good.

use crate::error::{ApiError, ApiResult, RequestorError, RequestorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry of transient daemon errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive transient failures tolerated before giving up
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(3),
        }
    }
}

/// One daemon event endpoint polled by a collector
#[async_trait]
pub trait EventSource: Send + 'static {
    type Event: Send;

    /// Name used in logs and failure events
    fn name(&self) -> String;

    async fn poll(&mut self) -> ApiResult<Vec<Self::Event>>;

    async fn process(&mut self, event: Self::Event) -> RequestorResult<()>;

    /// Whether the collector has nothing left to collect
    fn is_done(&self) -> bool {
        false
    }

    /// Called once when the collector fails fatally.
    async fn on_failure(&mut self, _error: &RequestorError) {}
}

/// Drive `source` until it is done or fails.
///
/// Retry counting restarts after every successful poll.
pub async fn run_collector<S: EventSource>(source: &mut S, policy: RetryPolicy) -> RequestorResult<()> {
    let name = source.name();
    let mut failures = 0u32;

    while !source.is_done() {
        let events = match source.poll().await {
            Ok(events) => {
                failures = 0;
                events
            }
            Err(e) if e.is_transient() && failures < policy.max_attempts => {
                failures += 1;
                warn!(
                    collector = %name,
                    attempt = failures,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transient daemon error, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                continue;
            }
            Err(e) => return Err(fatal(&name, e)),
        };

        for event in events {
            match source.process(event).await {
                Ok(()) => {}
                Err(RequestorError::Api(e)) if !e.is_transient() => {
                    warn!(collector = %name, error = %e, "Dropping event the daemon refused to describe");
                }
                Err(e) => warn!(collector = %name, error = %e, "Failed to process collected event"),
            }
            if source.is_done() {
                break;
            }
        }
    }

    debug!(collector = %name, "Collector finished");
    Ok(())
}

fn fatal(name: &str, error: ApiError) -> RequestorError {
    RequestorError::CollectorFailed {
        collector: name.to_string(),
        reason: error.to_string(),
    }
}
