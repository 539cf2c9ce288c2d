//! Background lookup of detail records for keys that are currently of
//! interest, e.g. registry data for aircraft being tracked.
//!
//! Callers `register()` a key every time they see it and get back whatever
//! detail has been fetched so far. The fetching itself happens on heartbeat
//! ticks, never on the caller's thread:
//! - fast tick: fetch keys registered since the last tick (or every key,
//!   after `force_refetch()`)
//! - slow tick: forget keys not registered within the deregistration
//!   window, and fetch again details older than the refresh interval
//!
//! Sources are offered batches first and asked one key at a time when they
//! decline.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::clock::Clock;
use crate::config::FetcherConfig;
use crate::heartbeat::{Heartbeat, SubscriptionId, Tick};
use crate::lock;
use crate::types::Result;

/// Where detail records come from.
pub trait DetailSource: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    /// Extra information the caller has about a key, passed through to the
    /// fetch.
    type Hint: Clone + Send + Sync + 'static;
    type Detail: Clone + Send + Sync + 'static;

    fn fetch_one(&self, key: &Self::Key, hint: &Self::Hint) -> Option<Self::Detail>;

    /// Fetch many keys at once. Return `None` to have them fetched one at a
    /// time instead.
    fn fetch_batch(
        &self,
        _requests: &[(Self::Key, Self::Hint)],
    ) -> Option<Vec<(Self::Key, Option<Self::Detail>)>> {
        None
    }
}

struct Interest<S: DetailSource> {
    hint: S::Hint,
    last_registered: f64,
    detail: Option<S::Detail>,
    fetched_at: Option<f64>,
}

struct State<S: DetailSource> {
    interests: HashMap<S::Key, Interest<S>>,
    pending: Vec<S::Key>,
    refetch_all: bool,
}

pub struct DetailFetcher<S: DetailSource> {
    source: S,
    clock: Arc<dyn Clock>,
    heartbeat: Arc<Heartbeat>,
    config: FetcherConfig,
    state: Mutex<State<S>>,
    /// Held for a whole fetch cycle so ticks don't overlap.
    cycle: Mutex<()>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl<S: DetailSource> DetailFetcher<S> {
    /// Fails if the config has a zero batch size or a non-positive window.
    pub fn new(
        source: S,
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        config: FetcherConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let fetcher = Arc::new(DetailFetcher {
            source,
            clock,
            heartbeat: Arc::clone(&heartbeat),
            config,
            state: Mutex::new(State {
                interests: HashMap::new(),
                pending: Vec::new(),
                refetch_all: false,
            }),
            cycle: Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let fast: Weak<Self> = Arc::downgrade(&fetcher);
        let slow: Weak<Self> = Arc::downgrade(&fetcher);
        let ids = vec![
            heartbeat.subscribe(Tick::Fast, move || {
                if let Some(f) = fast.upgrade() {
                    f.on_fast_tick();
                }
            }),
            heartbeat.subscribe(Tick::Slow, move || {
                if let Some(f) = slow.upgrade() {
                    f.on_slow_tick();
                }
            }),
        ];
        *lock(&fetcher.subscriptions) = ids;
        Ok(fetcher)
    }

    /// Mark `key` as wanted and return its detail if one has been fetched.
    pub fn register(&self, key: S::Key, hint: S::Hint) -> Option<S::Detail> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        if let Some(interest) = state.interests.get_mut(&key) {
            interest.last_registered = now;
            interest.hint = hint;
            return interest.detail.clone();
        }
        state.interests.insert(
            key.clone(),
            Interest {
                hint,
                last_registered: now,
                detail: None,
                fetched_at: None,
            },
        );
        state.pending.push(key);
        None
    }

    /// Fetched detail for `key`, without renewing the registration.
    pub fn detail(&self, key: &S::Key) -> Option<S::Detail> {
        lock(&self.state)
            .interests
            .get(key)
            .and_then(|i| i.detail.clone())
    }

    pub fn is_registered(&self, key: &S::Key) -> bool {
        lock(&self.state).interests.contains_key(key)
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        lock(&self.state).interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch every registered key again on the next fast tick.
    pub fn force_refetch(&self) {
        lock(&self.state).refetch_all = true;
    }

    fn on_fast_tick(&self) {
        let _cycle = lock(&self.cycle);
        let requests = {
            let mut state = lock(&self.state);
            let keys: Vec<S::Key> = if state.refetch_all {
                state.refetch_all = false;
                state.pending.clear();
                state.interests.keys().cloned().collect()
            } else {
                std::mem::take(&mut state.pending)
            };
            requests_for(&state, keys)
        };
        self.fetch_and_store(requests);
    }

    fn on_slow_tick(&self) {
        let _cycle = lock(&self.cycle);
        let now = self.clock.now();
        let requests = {
            let mut state = lock(&self.state);
            let cutoff = now - self.config.deregister_after_secs;
            let before = state.interests.len();
            state.interests.retain(|_, i| i.last_registered >= cutoff);
            let evicted = before - state.interests.len();
            if evicted > 0 {
                let State {
                    interests, pending, ..
                } = &mut *state;
                pending.retain(|k| interests.contains_key(k));
                debug!(evicted, "dropped unregistered detail keys");
            }

            let stale_before = now - self.config.refresh_after_secs;
            let stale: Vec<S::Key> = state
                .interests
                .iter()
                .filter(|(_, i)| i.fetched_at.is_some_and(|t| t < stale_before))
                .map(|(k, _)| k.clone())
                .collect();
            requests_for(&state, stale)
        };
        self.fetch_and_store(requests);
    }

    fn fetch_and_store(&self, requests: Vec<(S::Key, S::Hint)>) {
        if requests.is_empty() {
            return;
        }
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(self.config.max_batch) {
            match self.source.fetch_batch(chunk) {
                Some(batch) => results.extend(batch),
                None => results.extend(
                    chunk
                        .iter()
                        .map(|(key, hint)| (key.clone(), self.source.fetch_one(key, hint))),
                ),
            }
        }

        let now = self.clock.now();
        let mut found = 0usize;
        let mut state = lock(&self.state);
        for (key, detail) in results {
            // Keys evicted while the fetch ran stay evicted.
            let Some(interest) = state.interests.get_mut(&key) else {
                continue;
            };
            interest.fetched_at = Some(now);
            if detail.is_some() {
                found += 1;
                interest.detail = detail;
            }
        }
        debug!(requested = requests.len(), found, "detail fetch cycle");
    }
}

fn requests_for<S: DetailSource>(state: &State<S>, keys: Vec<S::Key>) -> Vec<(S::Key, S::Hint)> {
    keys.into_iter()
        .filter_map(|key| {
            let hint = state.interests.get(&key)?.hint.clone();
            Some((key, hint))
        })
        .collect()
}

impl<S: DetailSource> Drop for DetailFetcher<S> {
    fn drop(&mut self) {
        for id in lock(&self.subscriptions).drain(..) {
            self.heartbeat.unsubscribe(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
