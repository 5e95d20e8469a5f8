//! Worker pool: `concurrency` workers pulling from the controller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error};

use super::controller::Shared;
use crate::domain::ProcessError;
use crate::error::{QueueError, Result};

/// Worker group handle for one run.
/// - 各ワーカーは lease → process → report をループする
/// - `join()` で全ワーカーの終了を待つ。1 本でも異常終了したら run をキャンセルする
pub(crate) struct WorkerPool<T, R> {
    shared: Arc<Shared<T, R>>,
    workers: JoinSet<Result<()>>,
}

impl<T, R> WorkerPool<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Spawn `n` workers inside the caller's span.
    pub(crate) fn spawn(n: usize, shared: Arc<Shared<T, R>>) -> Self {
        let mut workers = JoinSet::new();
        for worker_id in 0..n {
            let s = Arc::clone(&shared);
            workers.spawn(worker_loop(worker_id, s).instrument(Span::current()));
        }
        Self { shared, workers }
    }

    /// Wait for every worker. Returns the first worker error, if any.
    pub(crate) async fn join(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.workers.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(QueueError::WorkerJoin(e.to_string())),
            };
            if let Err(e) = outcome {
                error!(error = %e, "worker stopped abnormally; cancelling run");
                // 残りのワーカーが待ち続けないように止める
                self.shared.request_cancel();
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn worker_loop<T, R>(worker_id: usize, shared: Arc<Shared<T, R>>) -> Result<()>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    while let Some(claim) = shared.lease().await? {
        debug!(worker_id, task_id = %claim.id, attempt = claim.attempt, "claimed task");

        // processor の panic は失敗した attempt として扱う（ワーカーは生かす）
        let result = AssertUnwindSafe(shared.processor.process(claim.item))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessError::transient(panic_message(&*panic))));

        shared.report(claim.id, result).await?;
    }
    debug!(worker_id, "worker exiting");
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("processor panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("processor panicked: {s}")
    } else {
        "processor panicked".to_string()
    }
}
