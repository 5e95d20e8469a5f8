//! Task record: caller item + scheduling state.

use tokio::time::Instant;

use super::TaskState;
use crate::domain::{ProcessError, TaskId};
use crate::error::{QueueError, Result};

/// One unit of work in the queue.
///
/// Design:
/// - This is the "single source of truth" for task state.
/// - Queue structures (ready/scheduled) hold TaskId only.
/// - All state transitions happen here; an illegal transition is an
///   invariant violation and is reported, never silently applied.
#[derive(Debug, Clone)]
pub struct TaskRecord<T, R> {
    pub id: TaskId,
    pub item: T,
    pub state: TaskState,

    /// Number of execution attempts so far (including the current one if Active).
    pub attempts: u32,

    /// Last processor error (if any).
    pub last_error: Option<ProcessError>,

    /// Processor result once Complete.
    pub output: Option<R>,

    /// When a Retrying task becomes eligible again.
    pub next_run_at: Option<Instant>,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl<T, R> TaskRecord<T, R> {
    pub fn new(id: TaskId, item: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            item,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
            output: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending/Retrying -> Active (increment attempts).
    pub fn start_attempt(&mut self) -> Result<()> {
        self.expect(TaskState::is_claimable, "start_attempt")?;
        self.state = TaskState::Active;
        self.attempts += 1;
        self.next_run_at = None;
        self.touch();
        Ok(())
    }

    /// Active -> Complete.
    pub fn mark_complete(&mut self, output: R) -> Result<()> {
        self.expect(|s| s == TaskState::Active, "mark_complete")?;
        self.state = TaskState::Complete;
        self.output = Some(output);
        self.touch();
        Ok(())
    }

    /// Active -> Retrying.
    pub fn schedule_retry(&mut self, next_run_at: Instant, error: ProcessError) -> Result<()> {
        self.expect(|s| s == TaskState::Active, "schedule_retry")?;
        self.state = TaskState::Retrying;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        self.touch();
        Ok(())
    }

    /// Active -> Failed.
    pub fn mark_failed(&mut self, error: ProcessError) -> Result<()> {
        self.expect(|s| s == TaskState::Active, "mark_failed")?;
        self.state = TaskState::Failed;
        self.last_error = Some(error);
        self.touch();
        Ok(())
    }

    fn expect(&self, allowed: impl Fn(TaskState) -> bool, transition: &str) -> Result<()> {
        if allowed(self.state) {
            return Ok(());
        }
        tracing::error!(
            task_id = %self.id,
            state = %self.state,
            transition,
            "illegal task state transition"
        );
        Err(QueueError::Invariant(format!(
            "{transition} is not allowed for {} in state {}",
            self.id, self.state
        )))
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }
}
