//! Task state machine for the queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Active -> Complete
/// - Pending -> Active -> Retrying -> Active (loop while the retry budget lasts)
/// - Pending -> Active -> Failed (budget exhausted or permanent error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Added, never executed yet.
    Pending,

    /// Currently being executed by a worker.
    Active,

    /// Failed at least once; waiting for its retry delay, or queued again after it.
    Retrying,

    /// Processor succeeded.
    Complete,

    /// Failed permanently.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }

    /// Can a worker claim a task in this state?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retrying)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retrying => "retrying",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}
