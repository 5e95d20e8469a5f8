use thiserror::Error;

/// Errors raised by the queue itself.
///
/// Individual item failures are never reported here; they go through
/// [`QueueObserver::on_item_error`](crate::queue::QueueObserver::on_item_error).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("a run is already in flight; wait for start() to resolve first")]
    AlreadyRunning,

    #[error("queue invariant violated: {0}")]
    Invariant(String),

    #[error("worker terminated abnormally: {0}")]
    WorkerJoin(String),

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
