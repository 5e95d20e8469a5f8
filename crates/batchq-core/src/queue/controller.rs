//! Queue controller: owns the task table and drives runs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::observer::{ObserverEvent, dispatch};
use super::worker::WorkerPool;
use super::{
    FnObserver, NoopObserver, Processor, QueueObserver, QueueOptions, RetryDecision, RetryPolicy,
    TaskRecord, TaskState,
};
use crate::domain::{ProcessError, RunId, TaskId};
use crate::error::{QueueError, Result};
use crate::observability::{FinishedTask, QueueCounts, RunReport, TaskSnapshot};

/// Retry entry waiting for its delay.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first);
/// `seq` keeps equal deadlines in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    next_run_at: Instant,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next_run_at
            .cmp(&self.next_run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Idle,
    Running,
}

#[derive(Debug, Default)]
struct RunTally {
    succeeded: usize,
    failed: usize,
}

/// A task claimed by a worker for one attempt.
pub(crate) struct Claim<T> {
    pub id: TaskId,
    pub item: T,
    pub attempt: u32,
}

enum Terminal<T> {
    Complete,
    Failed(T, ProcessError),
}

struct QueueState<T, R> {
    records: HashMap<TaskId, TaskRecord<T, R>>,

    /// Insertion order, for snapshots and draining.
    order: Vec<TaskId>,

    /// Claimable tasks in FIFO order.
    ready: VecDeque<TaskId>,

    /// Retrying tasks whose delay has not elapsed yet.
    scheduled: BinaryHeap<ScheduledTask>,
    next_seq: u64,

    /// Tasks currently executing.
    active: usize,

    /// Tasks that reached a terminal state.
    completed: usize,
    total: usize,

    status: RunStatus,
    tally: RunTally,

    /// Observer channel of the run in flight.
    events: Option<mpsc::UnboundedSender<ObserverEvent<T>>>,
}

impl<T: Clone, R> QueueState<T, R> {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            next_seq: 0,
            active: 0,
            completed: 0,
            total: 0,
            status: RunStatus::Idle,
            tally: RunTally::default(),
            events: None,
        }
    }

    fn push(&mut self, item: T) -> TaskId {
        let id = TaskId::generate();
        self.records.insert(id, TaskRecord::new(id, item));
        self.order.push(id);
        self.ready.push_back(id);
        self.total += 1;
        id
    }

    fn schedule(&mut self, task_id: TaskId, next_run_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(ScheduledTask {
            next_run_at,
            seq,
            task_id,
        });
    }

    /// Move retries whose delay has elapsed to the back of the ready list.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.task_id);
            }
        }
    }

    /// Atomic claim: pop the ready list, mark Active, count it.
    fn claim_next(&mut self) -> Result<Option<Claim<T>>> {
        let Some(id) = self.ready.pop_front() else {
            return Ok(None);
        };
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| invariant(format!("ready task {id} has no record")))?;
        record.start_attempt()?;
        let claim = Claim {
            id,
            item: record.item.clone(),
            attempt: record.attempts,
        };
        self.active += 1;
        Ok(Some(claim))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.peek().map(|entry| entry.next_run_at)
    }

    /// Nothing left to claim and nothing executing.
    fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.scheduled.is_empty() && self.active == 0
    }

    /// Claimable now or once a retry delay elapses.
    fn has_work(&self) -> bool {
        !self.ready.is_empty() || !self.scheduled.is_empty()
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            counts.record(record.state);
        }
        counts
    }

    fn remaining(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    fn snapshot(&self) -> Vec<TaskSnapshot<T>> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| TaskSnapshot {
                id: r.id,
                item: r.item.clone(),
                state: r.state,
                attempts: r.attempts,
                last_error: r.last_error.clone(),
            })
            .collect()
    }

    /// Remove terminal tasks; counters forget them too.
    fn drain_terminal(&mut self) -> Result<Vec<FinishedTask<T, R>>> {
        let mut finished = Vec::new();
        let mut kept = Vec::with_capacity(self.order.len());
        for id in std::mem::take(&mut self.order) {
            let terminal = self
                .records
                .get(&id)
                .is_some_and(|r| r.state.is_terminal());
            if !terminal {
                kept.push(id);
                continue;
            }
            let Some(record) = self.records.remove(&id) else {
                continue;
            };
            let outcome = match (record.state, record.output, record.last_error) {
                (TaskState::Complete, Some(output), _) => Ok(output),
                (TaskState::Failed, _, Some(error)) => Err(error),
                (state, _, _) => {
                    return Err(invariant(format!(
                        "terminal task {id} in state {state} has no outcome"
                    )));
                }
            };
            finished.push(FinishedTask {
                id,
                item: record.item,
                attempts: record.attempts,
                outcome,
            });
        }
        self.order = kept;
        self.total -= finished.len();
        self.completed -= finished.len();
        Ok(finished)
    }
}

fn invariant(message: String) -> QueueError {
    error!(%message, "queue invariant violated");
    QueueError::Invariant(message)
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    // 巨大な backoff でも panic しないように、遠い未来で打ち止める
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// State shared between the controller handle and its workers.
pub(crate) struct Shared<T, R> {
    state: Mutex<QueueState<T, R>>,
    notify: Notify,
    cancel: watch::Sender<bool>,
    observer: Arc<dyn QueueObserver<T>>,

    pub(crate) processor: Arc<dyn Processor<T, R>>,
    policy: RetryPolicy,
}

impl<T, R> Shared<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Claim the next eligible task, waiting while other tasks are active or
    /// retries are scheduled. `None` means the run is drained or cancelled.
    pub(crate) async fn lease(&self) -> Result<Option<Claim<T>>> {
        loop {
            // ロック前に Notified を作る: 判定〜待機の間の notify_waiters を取りこぼさない
            let notified = self.notify.notified();
            let wake_at = {
                let mut state = self.state.lock().await;
                if *self.cancel.borrow() {
                    return Ok(None);
                }
                state.promote_due(Instant::now());
                if let Some(claim) = state.claim_next()? {
                    return Ok(Some(claim));
                }
                if state.is_drained() {
                    return Ok(None);
                }
                state.next_deadline()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Record the result of one attempt and fire observers if the task is now terminal.
    pub(crate) async fn report(&self, id: TaskId, result: Result<R, ProcessError>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.active = state
            .active
            .checked_sub(1)
            .ok_or_else(|| invariant(format!("{id} reported with no active tasks")))?;

        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| invariant(format!("reported task {id} has no record")))?;

        let terminal = match result {
            Ok(output) => {
                record.mark_complete(output)?;
                debug!(task_id = %id, attempts = record.attempts, "task complete");
                Some(Terminal::Complete)
            }
            Err(err) => match self.policy.decide(record.attempts, &err) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        task_id = %id,
                        attempt = record.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retry scheduled"
                    );
                    let at = deadline_after(delay);
                    record.schedule_retry(at, err)?;
                    state.schedule(id, at);
                    None
                }
                RetryDecision::GiveUp => {
                    error!(
                        task_id = %id,
                        attempts = record.attempts,
                        kind = %err.kind(),
                        error = %err,
                        "task failed permanently"
                    );
                    let item = record.item.clone();
                    record.mark_failed(err.clone())?;
                    Some(Terminal::Failed(item, err))
                }
            },
        };

        let Some(terminal) = terminal else {
            drop(state);
            self.notify.notify_waiters();
            return Ok(());
        };

        state.completed += 1;
        let failure = match terminal {
            Terminal::Complete => {
                state.tally.succeeded += 1;
                None
            }
            Terminal::Failed(item, err) => {
                state.tally.failed += 1;
                Some((item, err))
            }
        };
        let event = ObserverEvent::Settled {
            completed: state.completed,
            total: state.total,
            failure,
        };
        // ロック中に送るので、配送順 = カウンタ更新順になる
        if let Some(events) = &state.events
            && events.send(event).is_err()
        {
            warn!(task_id = %id, "observer dispatcher is gone; callback dropped");
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait until every observer event sent so far has been delivered.
    async fn flush_observer(&self) {
        let events = self.state.lock().await.events.clone();
        let Some(events) = events else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if events.send(ObserverEvent::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.send_replace(true);
        self.notify.notify_waiters();
    }
}

/// Bounded-concurrency batch queue.
///
/// Items are added with [`add`](Self::add) and processed by [`start`](Self::start),
/// which resolves once every task is terminal. At most `concurrency` items run
/// at once; failures are retried per the configured budget; progress and
/// permanent failures are reported through a [`QueueObserver`].
///
/// `T` must be `Clone`: a retried task runs again with the same item, and a
/// failed one hands its item to `on_item_error`.
///
/// The handle is cheap to clone; clones share the same queue, which lets one
/// task run `start()` while another adds items or calls `cancel()`.
///
/// # 使用例
/// ```ignore
/// let queue = BatchQueue::builder(processor_fn(lookup))
///     .concurrency(3)
///     .retry_attempts(2)
///     .on_progress(|done, total| println!("{done}/{total}"))
///     .build()?;
/// queue.add(addresses).await;
/// let report = queue.start().await?;
/// ```
pub struct BatchQueue<T, R> {
    shared: Arc<Shared<T, R>>,
    options: QueueOptions,
}

impl<T, R> Clone for BatchQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            options: self.options.clone(),
        }
    }
}

impl<T, R> BatchQueue<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Queue without observers. Fails fast on invalid options.
    pub fn new<P>(processor: P, options: QueueOptions) -> Result<Self>
    where
        P: Processor<T, R> + 'static,
    {
        Self::with_observer(Arc::new(processor), options, Arc::new(NoopObserver))
    }

    pub fn builder<P>(processor: P) -> BatchQueueBuilder<T, R>
    where
        P: Processor<T, R> + 'static,
    {
        BatchQueueBuilder::new(Arc::new(processor))
    }

    pub fn with_observer(
        processor: Arc<dyn Processor<T, R>>,
        options: QueueOptions,
        observer: Arc<dyn QueueObserver<T>>,
    ) -> Result<Self> {
        options.validate()?;
        let (cancel, _) = watch::channel(false);
        let shared = Shared {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            cancel,
            observer,
            processor,
            policy: RetryPolicy::from_options(&options),
        };
        Ok(Self {
            shared: Arc::new(shared),
            options,
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Append items as Pending tasks, in order. Allowed while a run is in flight;
    /// idle workers pick the new tasks up immediately.
    pub async fn add<I>(&self, items: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = T>,
    {
        let ids: Vec<TaskId> = {
            let mut state = self.shared.state.lock().await;
            items.into_iter().map(|item| state.push(item)).collect()
        };
        if !ids.is_empty() {
            debug!(added = ids.len(), "tasks added");
            self.shared.notify.notify_waiters();
        }
        ids
    }

    /// Run until every task is terminal, or until in-flight work finishes after
    /// [`cancel`](Self::cancel).
    ///
    /// The run itself is a spawned task: dropping this future (a timeout, a
    /// losing `select!` branch) does not abort in-flight work. The run carries
    /// on to the end, delivers its callbacks and returns the queue to idle.
    ///
    /// Item failures never make this return `Err`. Errors mean misuse
    /// (`AlreadyRunning` when a run is in flight) or an internal fault.
    pub async fn start(&self) -> Result<RunReport> {
        let run_id = RunId::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let total = {
            let mut state = self.shared.state.lock().await;
            if state.status == RunStatus::Running {
                warn!(%run_id, "start() called while a run is in flight");
                return Err(QueueError::AlreadyRunning);
            }
            state.status = RunStatus::Running;
            state.tally = RunTally::default();
            state.events = Some(events_tx);
            state.total
        };

        let span = info_span!("batch_run", %run_id, concurrency = self.options.concurrency);
        let run = tokio::spawn(self.clone().run(run_id, total, events_rx).instrument(span));
        run.await
            .map_err(|e| QueueError::WorkerJoin(format!("run {run_id}: {e}")))?
    }

    async fn run(
        self,
        run_id: RunId,
        total: usize,
        events: mpsc::UnboundedReceiver<ObserverEvent<T>>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        info!(total, "batch run started");
        let dispatcher =
            tokio::spawn(dispatch(Arc::clone(&self.shared.observer), events).in_current_span());

        let outcome = loop {
            let joined = WorkerPool::spawn(self.options.concurrency, Arc::clone(&self.shared))
                .join()
                .await;
            // コールバック内の add() もこの run で拾うため、判定の前に配送を終わらせる
            self.shared.flush_observer().await;

            // 「もう仕事がない」の判定と Idle への遷移は同じロック区間で行う
            let mut state = self.shared.state.lock().await;
            let cancelled = *self.shared.cancel.borrow();
            if joined.is_ok() && !cancelled && state.has_work() {
                debug!("tasks arrived while workers were exiting; respawning the pool");
                continue;
            }
            state.status = RunStatus::Idle;
            state.events = None;
            self.shared.cancel.send_replace(false);

            break joined.map(|()| RunReport {
                run_id,
                total: state.total,
                completed: state.completed,
                succeeded: state.tally.succeeded,
                failed: state.tally.failed,
                remaining: state.remaining(),
                cancelled,
                elapsed: started.elapsed(),
            });
        };

        // 送信側はすべて閉じたので、残りを配り終えたら dispatcher は終わる
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "observer dispatcher stopped abnormally");
        }
        if let Ok(report) = &outcome {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                remaining = report.remaining,
                cancelled = report.cancelled,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "batch run finished"
            );
        }
        outcome
    }

    /// Stop claiming new tasks. Executions already in flight run to completion
    /// and are recorded normally; Pending/Retrying tasks stay where they are and
    /// a later `start()` resumes them.
    ///
    /// The request holds until the current run ends. Called while idle, it
    /// applies to the next `start()`, which then dispatches nothing.
    /// This never interrupts a processor call.
    pub fn cancel(&self) {
        info!("cancel requested; in-flight tasks will finish");
        self.shared.request_cancel();
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.status == RunStatus::Running
    }

    pub async fn counts(&self) -> QueueCounts {
        self.shared.state.lock().await.counts()
    }

    /// All tasks in insertion order.
    pub async fn snapshot(&self) -> Vec<TaskSnapshot<T>> {
        self.shared.state.lock().await.snapshot()
    }

    /// Remove and return terminal tasks with their results. Not allowed while
    /// a run is in flight.
    pub async fn drain_finished(&self) -> Result<Vec<FinishedTask<T, R>>> {
        let mut state = self.shared.state.lock().await;
        if state.status == RunStatus::Running {
            return Err(QueueError::AlreadyRunning);
        }
        state.drain_terminal()
    }
}

/// Builder for [`BatchQueue`] with observer callbacks.
pub struct BatchQueueBuilder<T, R> {
    processor: Arc<dyn Processor<T, R>>,
    options: QueueOptions,
    callbacks: FnObserver<T>,
    observer: Option<Arc<dyn QueueObserver<T>>>,
}

impl<T, R> BatchQueueBuilder<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn new(processor: Arc<dyn Processor<T, R>>) -> Self {
        Self {
            processor,
            options: QueueOptions::default(),
            callbacks: FnObserver::new(),
            observer: None,
        }
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    pub fn retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.options.retry_attempts = retry_attempts;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.options.retry_delay = retry_delay;
        self
    }

    pub fn backoff(mut self, backoff: super::Backoff) -> Self {
        self.options.backoff = backoff;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.callbacks = self.callbacks.on_progress(f);
        self
    }

    pub fn on_item_error(mut self, f: impl Fn(&T, &ProcessError) + Send + Sync + 'static) -> Self {
        self.callbacks = self.callbacks.on_item_error(f);
        self
    }

    /// Use a custom observer. Takes precedence over `on_progress`/`on_item_error`.
    pub fn observer(mut self, observer: Arc<dyn QueueObserver<T>>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<BatchQueue<T, R>> {
        let observer = match self.observer {
            Some(observer) => observer,
            None => Arc::new(self.callbacks),
        };
        BatchQueue::with_observer(self.processor, self.options, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(items: &[&'static str]) -> QueueState<&'static str, ()> {
        let mut state = QueueState::new();
        for item in items {
            state.push(*item);
        }
        state
    }

    #[test]
    fn claims_in_insertion_order() {
        let mut state = state_with(&["a", "b", "c"]);
        let order: Vec<_> = std::iter::from_fn(|| state.claim_next().unwrap())
            .map(|c| c.item)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(state.active, 3);
        assert!(!state.is_drained());
    }

    #[test]
    fn claim_increments_attempts_once() {
        let mut state = state_with(&["a"]);
        let claim = state.claim_next().unwrap().unwrap();
        assert_eq!(claim.attempt, 1);
        assert_eq!(state.records[&claim.id].state, TaskState::Active);
        assert!(state.claim_next().unwrap().is_none());
    }

    #[test]
    fn equal_deadlines_keep_fifo_order() {
        let mut state = state_with(&[]);
        let now = Instant::now();
        let ids: Vec<TaskId> = (0..4).map(|_| TaskId::generate()).collect();
        for id in &ids {
            state.schedule(*id, now);
        }
        state.promote_due(now);
        assert_eq!(state.ready.iter().copied().collect::<Vec<_>>(), ids);
    }

    #[test]
    fn retries_wait_for_their_deadline() {
        let mut state = state_with(&[]);
        let now = Instant::now();
        let late = TaskId::generate();
        let early = TaskId::generate();
        state.schedule(late, now + Duration::from_secs(10));
        state.schedule(early, now + Duration::from_secs(1));

        state.promote_due(now);
        assert!(state.ready.is_empty());
        assert_eq!(state.next_deadline(), Some(now + Duration::from_secs(1)));

        state.promote_due(now + Duration::from_secs(1));
        assert_eq!(state.ready.front(), Some(&early));
        assert_eq!(state.scheduled.len(), 1);
    }

    #[test]
    fn drain_removes_only_terminal_tasks() {
        let mut state = state_with(&["ok", "bad", "waiting"]);
        let ok = state.claim_next().unwrap().unwrap();
        let bad = state.claim_next().unwrap().unwrap();
        state.records.get_mut(&ok.id).unwrap().mark_complete(()).unwrap();
        state
            .records
            .get_mut(&bad.id)
            .unwrap()
            .mark_failed("gone".into())
            .unwrap();
        state.completed = 2;

        let finished = state.drain_terminal().unwrap();
        assert_eq!(finished.len(), 2);
        assert!(finished[0].is_success());
        assert_eq!(finished[1].outcome.as_ref().unwrap_err().message(), "gone");
        assert_eq!(state.total, 1);
        assert_eq!(state.completed, 0);
        assert_eq!(state.snapshot()[0].item, "waiting");
    }
}
