//! Shared periodic tick source.
//!
//! Sweeps and refresh cycles subscribe to one of two pulses instead of
//! owning timer threads:
//! - `Tick::Fast`: about once a second
//! - `Tick::Slow`: about once every ten seconds
//!
//! A `Heartbeat` that is never started can be driven by hand with `fire()`,
//! which is how the tests get deterministic sweeps.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::lock;
use crate::queue::panic_message;
use crate::types::{AdsbError, Result};

pub const FAST_INTERVAL: Duration = Duration::from_secs(1);
pub const SLOW_INTERVAL: Duration = Duration::from_secs(10);

/// Longest single sleep of the tick thread, bounds how long `stop()` waits.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tick {
    Fast,
    Slow,
}

impl Tick {
    /// The pulse to use for work that should run every `interval`.
    pub fn for_interval(interval: Duration) -> Tick {
        if interval < SLOW_INTERVAL {
            Tick::Fast
        } else {
            Tick::Slow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    tick: Tick,
    callback: Callback,
}

pub struct Heartbeat {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new() -> Arc<Self> {
        Arc::new(Heartbeat {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn subscribe<F>(&self, tick: Tick, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push(Subscriber {
            id,
            tick,
            callback: Arc::new(callback),
        });
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self, tick: Tick) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|s| s.tick == tick)
            .count()
    }

    /// Run every callback subscribed to `tick` on the calling thread.
    ///
    /// Callbacks run after the subscriber list is released, so they may
    /// subscribe or unsubscribe. A panicking callback is logged and the
    /// rest still run.
    pub fn fire(&self, tick: Tick) {
        let callbacks: Vec<(SubscriptionId, Callback)> = lock(&self.subscribers)
            .iter()
            .filter(|s| s.tick == tick)
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();
        for (id, callback) in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                error!(
                    ?tick,
                    subscription = id.0,
                    panic = %panic_message(payload.as_ref()),
                    "heartbeat subscriber panicked"
                );
            }
        }
    }

    /// Start the tick thread with the standard 1 s / 10 s pulses.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.start_with(FAST_INTERVAL, SLOW_INTERVAL)
    }

    pub fn start_with(self: &Arc<Self>, fast: Duration, slow: Duration) -> Result<()> {
        let mut handle = lock(&self.thread);
        if handle.is_some() || self.running.swap(true, Ordering::SeqCst) {
            return Err(AdsbError::AlreadyStarted("heartbeat".into()));
        }

        let weak = Arc::downgrade(self);
        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || tick_loop(weak, running, fast, slow));
        match spawned {
            Ok(thread) => *handle = Some(thread),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
        debug!(?fast, ?slow, "heartbeat started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the tick thread and wait for it, unless called from it.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
            debug!("heartbeat stopped");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        // The thread only holds a Weak; it exits on its next wake.
        self.running.store(false, Ordering::SeqCst);
    }
}

fn tick_loop(heartbeat: Weak<Heartbeat>, running: Arc<AtomicBool>, fast: Duration, slow: Duration) {
    let start = Instant::now();
    let mut next_fast = start + fast;
    let mut next_slow = start + slow;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        let wake = next_fast.min(next_slow);
        if now < wake {
            thread::sleep((wake - now).min(POLL_INTERVAL));
            continue;
        }

        let Some(heartbeat) = heartbeat.upgrade() else {
            break;
        };
        if now >= next_fast {
            heartbeat.fire(Tick::Fast);
            next_fast += fast;
        }
        if now >= next_slow {
            heartbeat.fire(Tick::Slow);
            next_slow += slow;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
