//! batchq-core
//!
//! Bounded-concurrency batch processing queue.
//!
//! # モジュール構成
//! - **domain**: ids, processor エラー（ErrorKind / ProcessError）
//! - **queue**: TaskRecord + TaskState, RetryPolicy, WorkerPool, BatchQueue（controller）, observer hooks
//! - **config**: 設定ファイル + 環境変数からの QueueOptions 読み込み
//! - **logging**: tracing subscriber の初期化
//! - **observability**: QueueCounts, RunReport, snapshot 型
//! - **error**: QueueError（キュー自体の誤用・内部エラー）

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod queue;

pub use domain::{ErrorKind, ProcessError, RunId, TaskId};
pub use error::{QueueError, Result};
pub use observability::{FinishedTask, QueueCounts, RunReport, TaskSnapshot};
pub use queue::{
    Backoff, BatchQueue, BatchQueueBuilder, Processor, QueueObserver, QueueOptions, TaskState,
    processor_fn,
};
