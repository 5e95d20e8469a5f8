use std::time::Duration;

use serde::Serialize;

use crate::domain::{ProcessError, RunId, TaskId};
use crate::queue::TaskState;

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub retrying: usize,
    pub complete: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.retrying + self.complete + self.failed
    }

    pub fn terminal(&self) -> usize {
        self.complete + self.failed
    }

    pub(crate) fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Active => self.active += 1,
            TaskState::Retrying => self.retrying += 1,
            TaskState::Complete => self.complete += 1,
            TaskState::Failed => self.failed += 1,
        }
    }
}

/// Summary returned by [`BatchQueue::start`](crate::queue::BatchQueue::start).
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,

    /// Tasks known to the queue when the run resolved.
    pub total: usize,

    /// Terminal tasks when the run resolved (all runs, not just this one).
    pub completed: usize,

    /// Tasks that reached Complete during this run.
    pub succeeded: usize,

    /// Tasks that reached Failed during this run.
    pub failed: usize,

    /// Tasks left Pending or Retrying (only non-zero after `cancel()`).
    pub remaining: usize,

    pub cancelled: bool,

    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot<T> {
    pub id: TaskId,
    pub item: T,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<ProcessError>,
}

/// A terminal task removed from the queue by `drain_finished()`.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTask<T, R> {
    pub id: TaskId,
    pub item: T,
    pub attempts: u32,
    pub outcome: Result<R, ProcessError>,
}

impl<T, R> FinishedTask<T, R> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}
