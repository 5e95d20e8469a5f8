//! Retry policy: decides retry vs. permanent failure, and the delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::QueueOptions;
use crate::domain::ProcessError;

/// How the retry delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `retry_delay` every time.
    #[default]
    Fixed,

    /// `retry_delay * attempts`
    Linear,

    /// `retry_delay * multiplier^(attempts - 1)`
    Exponential { multiplier: f64 },
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back after `delay`.
    Retry { delay: Duration },

    /// Mark the task Failed.
    GiveUp,
}

/// Retry policy for failed tasks.
///
/// Pure function of the attempt count and the error; holds no state.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure.
    pub retry_attempts: u32,

    /// Base delay before a retried task becomes eligible again.
    pub retry_delay: Duration,

    pub backoff: Backoff,

    /// Upper bound on any computed delay.
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            retry_attempts: 0,
            retry_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            max_delay: None,
        }
    }

    pub fn from_options(options: &QueueOptions) -> Self {
        Self {
            retry_attempts: options.retry_attempts,
            retry_delay: options.retry_delay,
            backoff: options.backoff,
            max_delay: options.max_retry_delay,
        }
    }

    /// Decide what happens after a failed attempt.
    ///
    /// # Arguments
    /// * `attempts` - attempts made so far, including the one that just failed (1-indexed).
    /// * `error` - the error that attempt produced.
    ///
    /// The task is retried while `attempts <= retry_attempts`, so an always
    /// failing task runs `retry_attempts + 1` times. Permanent errors give up
    /// immediately regardless of the remaining budget.
    pub fn decide(&self, attempts: u32, error: &ProcessError) -> RetryDecision {
        if !error.is_retriable() || attempts > self.retry_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.next_delay(attempts),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempts`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let n = attempts.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Linear => self.retry_delay.saturating_mul(n),
            Backoff::Exponential { multiplier } => {
                let secs = self.retry_delay.as_secs_f64() * multiplier.powi((n - 1) as i32);
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        };
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
