//! Observer hooks: progress and per-item failure callbacks.
//!
//! Every call is delivered by one dispatcher task per run, in the order the
//! controller updated its counters. A callback body never runs concurrently
//! with itself, and workers never wait for it: a slow callback only delays
//! later callbacks. Keep them non-blocking all the same, since they occupy a
//! runtime thread while they run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::domain::ProcessError;

/// Receives run events from a [`BatchQueue`](super::BatchQueue).
pub trait QueueObserver<T>: Send + Sync {
    /// A task reached a terminal state. `completed` is non-decreasing across
    /// calls and equals `total` on the last call of a drained run.
    fn on_progress(&self, _completed: usize, _total: usize) {}

    /// A task failed permanently. Called once per failed task, before the
    /// matching `on_progress` call. Never called for tasks that eventually succeed.
    fn on_item_error(&self, _item: &T, _error: &ProcessError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl<T> QueueObserver<T> for NoopObserver {}

type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;
type ItemErrorFn<T> = Box<dyn Fn(&T, &ProcessError) + Send + Sync>;

/// Observer built from closures; used by the queue builder.
pub struct FnObserver<T> {
    on_progress: Option<ProgressFn>,
    on_item_error: Option<ItemErrorFn<T>>,
}

impl<T> FnObserver<T> {
    pub fn new() -> Self {
        Self {
            on_progress: None,
            on_item_error: None,
        }
    }

    pub fn on_progress(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_item_error(mut self, f: impl Fn(&T, &ProcessError) + Send + Sync + 'static) -> Self {
        self.on_item_error = Some(Box::new(f));
        self
    }
}

impl<T> Default for FnObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueObserver<T> for FnObserver<T> {
    fn on_progress(&self, completed: usize, total: usize) {
        if let Some(f) = &self.on_progress {
            f(completed, total);
        }
    }

    fn on_item_error(&self, item: &T, error: &ProcessError) {
        if let Some(f) = &self.on_item_error {
            f(item, error);
        }
    }
}

/// Sent by the controller while it holds the state lock, so channel order is
/// counter order.
pub(crate) enum ObserverEvent<T> {
    Settled {
        completed: usize,
        total: usize,
        failure: Option<(T, ProcessError)>,
    },
    /// Acknowledged once every earlier event has been delivered.
    Flush(oneshot::Sender<()>),
}

/// Deliver events until every sender is dropped.
/// A panicking callback loses its own event only; the dispatcher keeps going.
pub(crate) async fn dispatch<T>(
    observer: Arc<dyn QueueObserver<T>>,
    mut events: mpsc::UnboundedReceiver<ObserverEvent<T>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ObserverEvent::Settled {
                completed,
                total,
                failure,
            } => {
                let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    if let Some((item, err)) = &failure {
                        observer.on_item_error(item, err);
                    }
                    observer.on_progress(completed, total);
                }));
                if delivered.is_err() {
                    error!(completed, total, "observer panicked; callback skipped");
                }
            }
            ObserverEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fn_observer_forwards_to_closures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let observer = FnObserver::<String>::new()
            .on_progress({
                let seen = Arc::clone(&seen);
                move |c, t| seen.lock().unwrap().push((c, t))
            })
            .on_item_error({
                let errors = Arc::clone(&errors);
                move |item, e| errors.lock().unwrap().push(format!("{item}: {e}"))
            });

        QueueObserver::on_progress(&observer, 1, 2);
        QueueObserver::on_item_error(&observer, &"4 Oak Ave".to_string(), &"not found".into());

        assert_eq!(*seen.lock().unwrap(), vec![(1, 2)]);
        assert_eq!(*errors.lock().unwrap(), vec!["4 Oak Ave: not found"]);
    }

    #[test]
    fn unset_callbacks_are_no_ops() {
        let observer = FnObserver::<u8>::default();
        QueueObserver::on_progress(&observer, 1, 1);
        QueueObserver::on_item_error(&observer, &1, &"x".into());
        QueueObserver::<u8>::on_progress(&NoopObserver, 3, 3);
    }

    #[tokio::test]
    async fn dispatcher_delivers_in_order_and_acks_flush() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = FnObserver::<&'static str>::new()
            .on_progress({
                let log = Arc::clone(&log);
                move |c, t| log.lock().unwrap().push(format!("progress {c}/{t}"))
            })
            .on_item_error({
                let log = Arc::clone(&log);
                move |item, e| log.lock().unwrap().push(format!("error {item}: {e}"))
            });

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(Arc::new(observer), rx));

        tx.send(ObserverEvent::Settled {
            completed: 1,
            total: 2,
            failure: None,
        })
        .unwrap();
        tx.send(ObserverEvent::Settled {
            completed: 2,
            total: 2,
            failure: Some(("9 Pine Rd", "no such parcel".into())),
        })
        .unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(ObserverEvent::Flush(done_tx)).unwrap();
        done_rx.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "progress 1/2",
                "error 9 Pine Rd: no such parcel",
                "progress 2/2",
            ]
        );

        drop(tx);
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_the_dispatcher() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = FnObserver::<u8>::new().on_progress({
            let seen = Arc::clone(&seen);
            move |c, _| {
                if c == 1 {
                    panic!("redraw failed");
                }
                seen.lock().unwrap().push(c);
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(Arc::new(observer), rx));
        for completed in 1..=3 {
            tx.send(ObserverEvent::Settled {
                completed,
                total: 3,
                failure: None,
            })
            .unwrap();
        }
        drop(tx);
        dispatcher.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }
}
