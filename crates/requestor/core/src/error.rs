//! Error types for requestor-core

use requestor_types::{CancelReason, CommandError, ResourceId, ResourceKind, ResourceRef};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single daemon call, classified by retry safety
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Connection reset, broken pipe and similar blips
    #[error("Transient daemon error: {0}")]
    Transient(String),

    /// The daemon reported that an internal endpoint is not ready yet
    #[error("Daemon endpoint not ready: {0}")]
    EndpointNotReady(String),

    /// The request timed out on either side
    #[error("Daemon request timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The entity is permanently gone (e.g. rejected or already terminated)
    #[error("Gone: {0}")]
    Gone(String),

    #[error("Daemon returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid daemon response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify an HTTP error response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            body.to_string()
        };

        match status {
            404 => ApiError::NotFound(message),
            408 | 504 => ApiError::Timeout(message),
            409 => ApiError::Conflict(message),
            410 => ApiError::Gone(message),
            500 if is_endpoint_not_found(body) => ApiError::EndpointNotReady(message),
            502 | 503 => ApiError::Transient(message),
            _ => ApiError::Status { status, message },
        }
    }

    /// Whether the call is safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Transient(_) | ApiError::EndpointNotReady(_) | ApiError::Timeout(_)
        )
    }
}

fn is_endpoint_not_found(body: &str) -> bool {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    message.contains("GSB error") && message.contains("endpoint address not found")
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ApiError::Transient(err.to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), &err.to_string())
        } else {
            ApiError::Transient(err.to_string())
        }
    }
}

/// Errors surfaced by resource operations
#[derive(Debug, Error)]
pub enum RequestorError {
    #[error("Daemon error: {0}")]
    Api(#[from] ApiError),

    /// The operation is not valid in the resource's current state
    #[error("State precondition failed for {resource}: {message}")]
    StatePrecondition {
        resource: ResourceRef,
        message: String,
    },

    #[error("{kind} {id} not found")]
    ResourceNotFound { kind: ResourceKind, id: ResourceId },

    #[error("Agreement {agreement_id} not approved within {timeout:?}")]
    ApprovalTimeout {
        agreement_id: ResourceId,
        timeout: Duration,
    },

    #[error("Batch {batch_id} timed out after {elapsed:?} (requested {timeout:?})")]
    BatchTimeout {
        batch_id: ResourceId,
        elapsed: Duration,
        timeout: Duration,
    },

    #[error("Command {index} of batch {batch_id} failed: {message}")]
    CommandFailed {
        batch_id: ResourceId,
        index: usize,
        message: String,
        stdout: Option<String>,
        stderr: Option<String>,
    },

    #[error("Command {index} of batch {batch_id} cancelled ({reason:?})")]
    CommandCancelled {
        batch_id: ResourceId,
        index: usize,
        reason: CancelReason,
    },

    #[error("Batch {batch_id} was cancelled")]
    BatchCancelled { batch_id: ResourceId },

    #[error("Network {network_id} has no free addresses")]
    NetworkFull { network_id: ResourceId },

    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    #[error("Collector {collector} failed: {reason}")]
    CollectorFailed { collector: String, reason: String },

    #[error("Session is closed")]
    SessionClosed,
}

impl RequestorError {
    pub fn precondition(resource: &ResourceRef, message: impl Into<String>) -> Self {
        RequestorError::StatePrecondition {
            resource: resource.clone(),
            message: message.into(),
        }
    }

    /// Timeouts are reported separately from failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RequestorError::ApprovalTimeout { .. }
                | RequestorError::BatchTimeout { .. }
                | RequestorError::Api(ApiError::Timeout(_))
        )
    }
}

/// Result type alias for daemon calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for resource operations
pub type RequestorResult<T> = Result<T, RequestorError>;
