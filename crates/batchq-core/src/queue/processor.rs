//! Processor - the caller-supplied work function.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::ProcessError;

/// Executes one item.
///
/// The queue treats this as an opaque async operation: it may have its own
/// side effects (an HTTP lookup, ...) but never sees the queue's task records.
/// It is called again with the same item when a failed attempt is retried.
///
/// # 使用例
/// ```ignore
/// struct ValuationLookup { client: reqwest::Client }
///
/// #[async_trait]
/// impl Processor<Address, Valuation> for ValuationLookup {
///     async fn process(&self, item: Address) -> Result<Valuation, ProcessError> {
///         ...
///     }
/// }
/// ```
#[async_trait]
pub trait Processor<T, R>: Send + Sync {
    async fn process(&self, item: T) -> Result<R, ProcessError>;
}

/// Closure adapter returned by [`processor_fn`].
pub struct ProcessorFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Processor`].
///
/// ```
/// use batchq_core::{processor_fn, ProcessError};
///
/// let double = processor_fn(|n: u32| async move { Ok::<_, ProcessError>(n * 2) });
/// # let _ = double;
/// ```
pub fn processor_fn<F>(f: F) -> ProcessorFn<F> {
    ProcessorFn { f }
}

#[async_trait]
impl<T, R, F, Fut> Processor<T, R> for ProcessorFn<F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, ProcessError>> + Send + 'static,
{
    async fn process(&self, item: T) -> Result<R, ProcessError> {
        (self.f)(item).await
    }
}
