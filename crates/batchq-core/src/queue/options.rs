//! Queue options (concurrency ceiling + retry budget).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Backoff;
use crate::error::{QueueError, Result};

pub const DEFAULT_CONCURRENCY: usize = 3;

/// Run options for a [`BatchQueue`](super::BatchQueue).
///
/// Durations are written as milliseconds in config files
/// (`retry_delay_ms`, `max_retry_delay_ms`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Maximum number of tasks executing at the same time. Must be >= 1.
    pub concurrency: usize,

    /// Retries allowed per task after its first failure.
    pub retry_attempts: u32,

    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,

    pub backoff: Backoff,

    #[serde(rename = "max_retry_delay_ms", with = "option_millis")]
    pub max_retry_delay: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_attempts: 0,
            retry_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            max_retry_delay: None,
        }
    }
}

impl QueueOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_retry_delay(mut self, max: Duration) -> Self {
        self.max_retry_delay = Some(max);
        self
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if let Backoff::Exponential { multiplier } = self.backoff
            && !(multiplier.is_finite() && multiplier >= 1.0)
        {
            return Err(QueueError::InvalidConfig(format!(
                "exponential backoff multiplier must be a finite number >= 1.0, got {multiplier}"
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
