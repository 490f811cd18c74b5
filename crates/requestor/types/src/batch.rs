//! Per-command results of a batch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Ok,
    Error,
}

/// A single result entry as reported by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub index: usize,
    pub event_date: DateTime<Utc>,
    pub outcome: CommandOutcome,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub message: Option<String>,
    pub is_batch_finished: bool,
}

impl CommandResult {
    pub fn ok(index: usize, stdout: impl Into<String>, is_batch_finished: bool) -> Self {
        Self {
            index,
            event_date: Utc::now(),
            outcome: CommandOutcome::Ok,
            stdout: Some(stdout.into()),
            stderr: None,
            message: None,
            is_batch_finished,
        }
    }

    pub fn error(index: usize, message: impl Into<String>, stderr: Option<String>) -> Self {
        Self {
            index,
            event_date: Utc::now(),
            outcome: CommandOutcome::Error,
            stdout: None,
            stderr,
            message: Some(message.into()),
            is_batch_finished: true,
        }
    }
}

/// Why a command did not run to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The caller cancelled the batch
    Explicit,
    /// An earlier command in the same batch failed, so this one never started
    PriorFailure,
    /// The caller's wait timed out before this command reported
    TimedOut,
}

/// Terminal or pending status of one command in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Succeeded(CommandResult),
    Failed(CommandResult),
    Cancelled(CancelReason),
}

impl CommandStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, CommandStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Succeeded(_))
    }

    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            CommandStatus::Succeeded(r) | CommandStatus::Failed(r) => Some(r),
            _ => None,
        }
    }
}
