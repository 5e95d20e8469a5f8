#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use batchq_core::{BatchQueue, ProcessError, Processor, QueueObserver, QueueOptions};
use tokio::time::Instant;

/// Instrumented processor: records every call and how many run at once.
/// Succeeds with `item * 10` unless configured otherwise.
#[derive(Default)]
pub struct Probe {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<(u32, Instant)>>,
    failures_before_success: HashMap<u32, u32>,
    always_fail: HashSet<u32>,
    permanent: HashSet<u32>,
    panics: HashSet<u32>,
    work: Duration,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated lookup latency.
    pub fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    /// Fail the first `failures` attempts of `item`, then succeed.
    pub fn flaky(mut self, item: u32, failures: u32) -> Self {
        self.failures_before_success.insert(item, failures);
        self
    }

    pub fn always_fail(mut self, item: u32) -> Self {
        self.always_fail.insert(item);
        self
    }

    pub fn permanent(mut self, item: u32) -> Self {
        self.permanent.insert(item);
        self
    }

    pub fn panics(mut self, item: u32) -> Self {
        self.panics.insert(item);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Items in the order the processor was entered.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }

    pub fn call_times(&self, item: u32) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == item)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn attempts(&self, item: u32) -> usize {
        self.call_times(item).len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor<u32, u32> for Probe {
    async fn process(&self, item: u32) -> Result<u32, ProcessError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((item, Instant::now()));
            calls.iter().filter(|(i, _)| *i == item).count() as u32
        };

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.contains(&item) {
            panic!("bad item {item}");
        }
        if self.permanent.contains(&item) {
            return Err(ProcessError::permanent(format!("item {item} is malformed")));
        }
        if self.always_fail.contains(&item) {
            return Err(ProcessError::transient(format!("item {item} lookup failed")));
        }
        if let Some(&failures) = self.failures_before_success.get(&item)
            && attempt <= failures
        {
            return Err(format!("item {item} flaked on attempt {attempt}").into());
        }
        Ok(item * 10)
    }
}

/// One observer callback, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Progress(usize),
    ItemError(u32),
}

/// Observer that records every callback and flags overlapping calls.
#[derive(Default)]
pub struct Events {
    timeline: Mutex<Vec<Callback>>,
    progress: Mutex<Vec<(usize, usize)>>,
    errors: Mutex<Vec<(u32, ProcessError)>>,
    busy: AtomicBool,
    overlapped: AtomicBool,
}

impl Events {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn progress(&self) -> Vec<(usize, usize)> {
        self.progress.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(u32, ProcessError)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn timeline(&self) -> Vec<Callback> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn error_items(&self) -> Vec<u32> {
        self.errors().into_iter().map(|(item, _)| item).collect()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl QueueObserver<u32> for Events {
    fn on_progress(&self, completed: usize, total: usize) {
        self.enter();
        self.progress.lock().unwrap().push((completed, total));
        self.timeline.lock().unwrap().push(Callback::Progress(completed));
        // widen the window in which a concurrent call would be noticed
        std::thread::sleep(Duration::from_micros(200));
        self.leave();
    }

    fn on_item_error(&self, item: &u32, error: &ProcessError) {
        self.enter();
        self.errors.lock().unwrap().push((*item, error.clone()));
        self.timeline.lock().unwrap().push(Callback::ItemError(*item));
        self.leave();
    }
}

pub fn queue(
    probe: &Arc<Probe>,
    events: &Arc<Events>,
    options: QueueOptions,
) -> BatchQueue<u32, u32> {
    BatchQueue::<u32, u32>::with_observer(probe.clone(), options, events.clone()).unwrap()
}

pub fn options(concurrency: usize, retry_attempts: u32) -> QueueOptions {
    QueueOptions::default()
        .with_concurrency(concurrency)
        .with_retry_attempts(retry_attempts)
}
