//! Producer/consumer queue that keeps the feed thread from blocking on
//! message processing.
//!
//! One queue type, three delivery strategies chosen at `start()`:
//! - `Delivery::DedicatedThread`: one consumer thread, FIFO
//! - `Delivery::ThreadPool`: several consumer threads, optional cap on items
//!   in flight, no ordering between items
//! - `Delivery::Direct`: processed on the caller's thread inside `enqueue()`
//!
//! Items enqueued before `start()` are buffered and delivered once it runs.
//! With `Direct` delivery, items arriving while that backlog drains join the
//! back of it, so nothing overtakes an earlier item.
//! A bounded queue drops its oldest items past `max_depth` and counts them.
//! Processing errors and panics go to the failure handler; the consumer
//! keeps running. `shutdown()` stops accepting, delivers what is already
//! queued, and waits for the consumers to finish.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::lock;
use crate::types::{AdsbError, Result};

/// How queued items reach the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    DedicatedThread,
    ThreadPool {
        workers: usize,
        max_in_flight: Option<usize>,
    },
}

/// Why an item failed to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueFailure {
    Error(String),
    Panic(String),
}

impl std::fmt::Display for QueueFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueFailure::Error(e) => write!(f, "error: {e}"),
            QueueFailure::Panic(p) => write!(f, "panic: {p}"),
        }
    }
}

pub type ProcessResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

struct Handler<T> {
    process: Box<dyn Fn(T) -> ProcessResult + Send + Sync>,
    on_failure: Box<dyn Fn(QueueFailure) + Send + Sync>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    accepting: bool,
    stopping: bool,
    in_flight: usize,
    delivery: Option<Delivery>,
    handler: Option<Arc<Handler<T>>>,
    /// Direct delivery is still working through the pre-start backlog.
    draining: bool,
}

struct Shared<T> {
    name: String,
    max_depth: Option<usize>,
    state: Mutex<QueueState<T>>,
    available: Condvar,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        lock(&self.state)
    }

    fn run(&self, handler: &Handler<T>, item: T) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (handler.process)(item)));
        let failure = match outcome {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => QueueFailure::Error(e.to_string()),
            Err(payload) => QueueFailure::Panic(panic_message(payload.as_ref())),
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(queue = %self.name, %failure, "queued item failed");
        // A panicking failure handler must not take the consumer down either.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| (handler.on_failure)(failure)));
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct BackgroundQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> BackgroundQueue<T> {
    /// Unbounded queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Queue that drops its oldest items once more than `max_depth` are waiting.
    pub fn bounded(name: impl Into<String>, max_depth: usize) -> Result<Self> {
        let name = name.into();
        if max_depth == 0 {
            return Err(AdsbError::Config(format!(
                "queue {name}: max depth must be at least 1"
            )));
        }
        Ok(Self::build(name, Some(max_depth)))
    }

    fn build(name: String, max_depth: Option<usize>) -> Self {
        BackgroundQueue {
            shared: Arc::new(Shared {
                name,
                max_depth,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    accepting: true,
                    stopping: false,
                    in_flight: 0,
                    delivery: None,
                    handler: None,
                    draining: false,
                }),
                available: Condvar::new(),
                dropped: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Begin delivering items. Starting a queue twice is an error.
    pub fn start<P, F>(&self, delivery: Delivery, process: P, on_failure: F) -> Result<()>
    where
        P: Fn(T) -> ProcessResult + Send + Sync + 'static,
        F: Fn(QueueFailure) + Send + Sync + 'static,
    {
        let (consumers, cap) = match delivery {
            Delivery::Direct => (0, 0),
            Delivery::DedicatedThread => (1, 1),
            Delivery::ThreadPool {
                workers,
                max_in_flight,
            } => {
                if workers == 0 || max_in_flight == Some(0) {
                    return Err(AdsbError::Config(format!(
                        "queue {}: thread pool needs at least one worker and one in-flight slot",
                        self.shared.name
                    )));
                }
                (workers, max_in_flight.unwrap_or(workers).min(workers))
            }
        };

        let handler = Arc::new(Handler {
            process: Box::new(process),
            on_failure: Box::new(on_failure),
        });

        {
            let mut state = self.shared.state();
            if state.delivery.is_some() {
                return Err(AdsbError::AlreadyStarted(format!("queue {}", self.shared.name)));
            }
            if !state.accepting {
                return Err(AdsbError::ShutDown(format!("queue {}", self.shared.name)));
            }
            state.delivery = Some(delivery);
            state.handler = Some(Arc::clone(&handler));
            state.draining = delivery == Delivery::Direct;
        }

        info!(queue = %self.shared.name, ?delivery, "queue started");

        if delivery == Delivery::Direct {
            self.drain_backlog(&handler);
        }

        let mut workers = lock(&self.workers);
        for i in 0..consumers {
            let shared = Arc::clone(&self.shared);
            let handler = Arc::clone(&handler);
            let worker = thread::Builder::new()
                .name(format!("{}-{i}", self.shared.name))
                .spawn(move || consume(shared, handler, cap))?;
            workers.push(worker);
        }
        Ok(())
    }

    /// Run buffered items on this thread until none are left, then switch
    /// to running each item inside `enqueue()`.
    fn drain_backlog(&self, handler: &Handler<T>) {
        loop {
            let item = {
                let mut state = self.shared.state();
                match state.items.pop_front() {
                    Some(item) => item,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            self.shared.run(handler, item);
        }
    }

    /// Hand an item to the queue. Returns false once the queue is shut down.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.shared.state();
        if !state.accepting {
            return false;
        }

        if state.delivery == Some(Delivery::Direct) && !state.draining {
            if let Some(handler) = state.handler.clone() {
                drop(state);
                self.shared.run(&handler, item);
                return true;
            }
        }

        state.items.push_back(item);
        if let Some(max) = self.shared.max_depth {
            let excess = state.items.len().saturating_sub(max);
            if excess > 0 {
                state.items.drain(..excess);
                let total = self.shared.dropped.fetch_add(excess as u64, Ordering::Relaxed)
                    + excess as u64;
                debug!(queue = %self.shared.name, dropped = total, "queue full, oldest dropped");
            }
        }
        drop(state);
        self.shared.available.notify_one();
        true
    }

    /// Items waiting for a consumer.
    pub fn len(&self) -> usize {
        self.shared.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state().in_flight
    }

    /// Items discarded by the depth bound. Never decreases.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.state().accepting
    }

    /// Stop accepting, deliver what is queued, and join the consumers.
    ///
    /// A queue that was never started keeps its buffered items undelivered.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state();
            if !state.accepting && state.stopping {
                return;
            }
            state.accepting = false;
            state.stopping = true;
        }
        self.shared.available.notify_all();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        info!(
            queue = %self.shared.name,
            processed = self.processed_count(),
            dropped = self.dropped_count(),
            "queue shut down"
        );
    }
}

impl<T: Send + 'static> Drop for BackgroundQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consume<T>(shared: Arc<Shared<T>>, handler: Arc<Handler<T>>, cap: usize) {
    loop {
        let item = {
            let mut state = shared.state();
            loop {
                if !state.items.is_empty() && state.in_flight < cap {
                    state.in_flight += 1;
                    break state.items.pop_front();
                }
                if state.stopping && state.items.is_empty() {
                    break None;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(item) = item else {
            return;
        };
        shared.run(&handler, item);
        shared.state().in_flight -= 1;
        shared.available.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, Weak};
    use std::time::Duration;

    fn collector() -> (
        Arc<Mutex<Vec<u32>>>,
        impl Fn(u32) -> ProcessResult + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |item| {
            lock(&sink).push(item);
            Ok(())
        })
    }

    fn ignore_failure(_: QueueFailure) {}

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let queue = BackgroundQueue::bounded("bounded", 10).unwrap();
        for i in 0..15 {
            assert!(queue.enqueue(i));
        }
        assert_eq!(queue.dropped_count(), 5);
        assert_eq!(queue.len(), 10);

        let (seen, process) = collector();
        queue
            .start(Delivery::DedicatedThread, process, ignore_failure)
            .unwrap();
        queue.shutdown();

        assert_eq!(*lock(&seen), (5..15).collect::<Vec<u32>>());
        assert_eq!(queue.dropped_count(), 5, "drop counter never double counts");
        assert_eq!(queue.processed_count(), 10);
    }

    #[test]
    fn test_dedicated_thread_is_fifo() {
        let queue = BackgroundQueue::new("fifo");
        let (seen, process) = collector();
        queue
            .start(Delivery::DedicatedThread, process, ignore_failure)
            .unwrap();
        for i in 0..200 {
            queue.enqueue(i);
        }
        queue.shutdown();
        assert_eq!(*lock(&seen), (0..200).collect::<Vec<u32>>());
    }

    #[test]
    fn test_direct_delivery_is_synchronous() {
        let queue = BackgroundQueue::new("direct");
        queue.enqueue(1);
        let (seen, process) = collector();
        queue.start(Delivery::Direct, process, ignore_failure).unwrap();
        assert_eq!(*lock(&seen), vec![1], "buffered items delivered at start");

        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(*lock(&seen), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_direct_backlog_not_overtaken() {
        let queue = Arc::new(BackgroundQueue::new("direct-order"));
        for i in 0..3 {
            queue.enqueue(i);
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let weak: Weak<BackgroundQueue<u32>> = Arc::downgrade(&queue);
        queue
            .start(
                Delivery::Direct,
                move |item: u32| {
                    lock(&sink).push(item);
                    let Some(queue) = weak.upgrade() else {
                        return Ok(());
                    };
                    match item {
                        // Another producer while the backlog drains.
                        0 => {
                            let other = Arc::clone(&queue);
                            thread::spawn(move || other.enqueue(100)).join().unwrap();
                        }
                        // The processor itself enqueues.
                        1 => {
                            queue.enqueue(101);
                        }
                        _ => {}
                    }
                    Ok(())
                },
                ignore_failure,
            )
            .unwrap();
        assert_eq!(*lock(&seen), vec![0, 1, 2, 100, 101]);

        queue.enqueue(3);
        assert_eq!(*lock(&seen), vec![0, 1, 2, 100, 101, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_queue_behind_slow_consumer() {
        let queue = BackgroundQueue::bounded("slow", 3).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (g, sink) = (Arc::clone(&gate), Arc::clone(&seen));
        queue
            .start(
                Delivery::DedicatedThread,
                move |item: u32| {
                    if item == 0 {
                        g.wait();
                        g.wait();
                    }
                    lock(&sink).push(item);
                    Ok(())
                },
                ignore_failure,
            )
            .unwrap();

        queue.enqueue(0);
        gate.wait();
        assert_eq!(queue.in_flight(), 1);
        for i in 1..=10 {
            assert!(queue.enqueue(i));
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 7);

        gate.wait();
        queue.shutdown();
        assert_eq!(*lock(&seen), vec![0, 8, 9, 10]);
        assert_eq!(queue.dropped_count(), 7);
        assert_eq!(queue.processed_count(), 4);
    }

    #[test]
    fn test_errors_and_panics_reach_handler() {
        let queue = BackgroundQueue::new("failing");
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        queue
            .start(
                Delivery::DedicatedThread,
                |item: u32| {
                    if item == 2 {
                        return Err("bad item".into());
                    }
                    if item == 3 {
                        panic!("boom");
                    }
                    Ok(())
                },
                move |failure| lock(&sink).push(failure),
            )
            .unwrap();
        for i in 0..5 {
            queue.enqueue(i);
        }
        queue.shutdown();

        let failures = lock(&failures);
        assert_eq!(
            *failures,
            vec![
                QueueFailure::Error("bad item".into()),
                QueueFailure::Panic("boom".into())
            ]
        );
        assert_eq!(queue.processed_count(), 3);
        assert_eq!(queue.failed_count(), 2);
    }

    #[test]
    fn test_double_start_is_an_error() {
        let queue = BackgroundQueue::new("twice");
        queue
            .start(Delivery::DedicatedThread, |_: u32| Ok(()), ignore_failure)
            .unwrap();
        let second = queue.start(Delivery::Direct, |_: u32| Ok(()), ignore_failure);
        assert!(matches!(second, Err(AdsbError::AlreadyStarted(_))));
    }

    #[test]
    fn test_shutdown_stops_acceptance() {
        let queue = BackgroundQueue::new("closed");
        let (seen, process) = collector();
        queue.start(Delivery::Direct, process, ignore_failure).unwrap();
        queue.shutdown();
        assert!(!queue.enqueue(7));
        assert!(lock(&seen).is_empty());
        assert!(!queue.is_accepting());
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            BackgroundQueue::<u32>::bounded("zero", 0),
            Err(AdsbError::Config(_))
        ));
        let queue = BackgroundQueue::new("pool");
        let bad = queue.start(
            Delivery::ThreadPool {
                workers: 0,
                max_in_flight: None,
            },
            |_: u32| Ok(()),
            ignore_failure,
        );
        assert!(matches!(bad, Err(AdsbError::Config(_))));
    }

    #[test]
    fn test_thread_pool_respects_in_flight_cap() {
        let queue = BackgroundQueue::new("pool");
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (c, p, d) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&done));
        queue
            .start(
                Delivery::ThreadPool {
                    workers: 4,
                    max_in_flight: Some(2),
                },
                move |_: u32| {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    c.fetch_sub(1, Ordering::SeqCst);
                    d.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                ignore_failure,
            )
            .unwrap();
        for i in 0..40 {
            queue.enqueue(i);
        }
        queue.shutdown();

        assert_eq!(done.load(Ordering::SeqCst), 40);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.in_flight(), 0);
    }
}
