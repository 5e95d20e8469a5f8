//! Queue module: task state machine, retry policy, worker pool and the controller.

mod controller;
mod observer;
mod options;
mod processor;
mod record;
mod retry;
mod state;
mod worker;

pub use controller::{BatchQueue, BatchQueueBuilder};
pub use observer::{FnObserver, NoopObserver, QueueObserver};
pub use options::{DEFAULT_CONCURRENCY, QueueOptions};
pub use processor::{Processor, ProcessorFn, processor_fn};
pub use record::TaskRecord;
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use state::TaskState;
