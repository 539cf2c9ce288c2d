//! List and map collections whose entries expire.
//!
//! Every insert stamps the entry with the clock's "now". A heartbeat
//! subscription sweeps entries older than `now - expiry`:
//! - the fast tick when the sweep interval is under ten seconds, else the slow tick
//! - subscribed on the first insert, unsubscribed once the collection empties
//! - a tick sweeps only when a full sweep interval has passed since the last one
//!
//! Lookups never hand back an entry that is already past its expiry, even if
//! the sweep has not run yet. `*_and_refresh` lookups restamp the entry
//! (sliding expiry); plain lookups leave it alone (absolute expiry).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::heartbeat::{Heartbeat, SubscriptionId, Tick};
use crate::lock;
use crate::types::{AdsbError, Result};

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    stamp: f64,
}

/// Storage that can drop stale entries.
trait Store: Send + 'static {
    /// Remove entries stamped before `threshold`, returning how many went.
    fn sweep(&mut self, threshold: f64) -> usize;
    fn is_empty(&self) -> bool;
}

impl<K, V> Store for HashMap<K, Stamped<V>>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    fn sweep(&mut self, threshold: f64) -> usize {
        let before = self.len();
        self.retain(|_, entry| entry.stamp >= threshold);
        before - self.len()
    }

    fn is_empty(&self) -> bool {
        HashMap::is_empty(self)
    }
}

impl<T: Send + 'static> Store for Vec<Stamped<T>> {
    fn sweep(&mut self, threshold: f64) -> usize {
        let before = self.len();
        self.retain(|entry| entry.stamp >= threshold);
        before - self.len()
    }

    fn is_empty(&self) -> bool {
        <[Stamped<T>]>::is_empty(self)
    }
}

struct State<S> {
    store: S,
    expiry: Duration,
    sweep_interval: Duration,
    last_sweep: f64,
    subscription: Option<(SubscriptionId, Tick)>,
}

impl<S: Store> State<S> {
    fn threshold(&self, now: f64) -> f64 {
        now - self.expiry.as_secs_f64()
    }

    fn is_live(&self, stamp: f64, now: f64) -> bool {
        stamp >= self.threshold(now)
    }
}

/// Shared sweep and subscription machinery.
struct Core<S: Store> {
    state: Mutex<State<S>>,
    clock: Arc<dyn Clock>,
    heartbeat: Arc<Heartbeat>,
}

impl<S: Store> Core<S> {
    fn new(
        store: S,
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        expiry: Duration,
        sweep_interval: Duration,
    ) -> Result<Arc<Self>> {
        check_durations(expiry, sweep_interval)?;
        let now = clock.now();
        Ok(Arc::new(Core {
            state: Mutex::new(State {
                store,
                expiry,
                sweep_interval,
                last_sweep: now,
                subscription: None,
            }),
            clock,
            heartbeat,
        }))
    }

    fn state(&self) -> MutexGuard<'_, State<S>> {
        lock(&self.state)
    }

    /// Subscribe, resubscribe or unsubscribe so the collection holds exactly
    /// the subscription its contents and interval call for.
    fn reconcile(self: &Arc<Self>, state: &mut State<S>) {
        let wanted = (!state.store.is_empty()).then(|| Tick::for_interval(state.sweep_interval));
        let current = state.subscription.map(|(_, tick)| tick);
        if wanted == current {
            return;
        }
        if let Some((id, _)) = state.subscription.take() {
            self.heartbeat.unsubscribe(id);
        }
        if let Some(tick) = wanted {
            let weak: Weak<Self> = Arc::downgrade(self);
            let id = self.heartbeat.subscribe(tick, move || {
                if let Some(core) = weak.upgrade() {
                    core.on_tick();
                }
            });
            state.subscription = Some((id, tick));
        }
    }

    fn on_tick(self: &Arc<Self>) {
        let now = self.clock.now();
        let mut state = self.state();
        if now - state.last_sweep < state.sweep_interval.as_secs_f64() {
            return;
        }
        self.sweep_locked(&mut state, now);
    }

    fn sweep_locked(self: &Arc<Self>, state: &mut State<S>, now: f64) -> usize {
        let threshold = state.threshold(now);
        let removed = state.store.sweep(threshold);
        state.last_sweep = now;
        if removed > 0 {
            debug!(removed, "expired entries swept");
        }
        self.reconcile(state);
        removed
    }

    fn sweep(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        let mut state = self.state();
        self.sweep_locked(&mut state, now)
    }

    fn set_expiry(self: &Arc<Self>, expiry: Duration) -> Result<()> {
        let mut state = self.state();
        check_durations(expiry, state.sweep_interval)?;
        state.expiry = expiry;
        self.reconcile(&mut state);
        Ok(())
    }

    fn set_sweep_interval(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut state = self.state();
        check_durations(state.expiry, interval)?;
        state.sweep_interval = interval;
        self.reconcile(&mut state);
        Ok(())
    }

    fn subscribed_tick(&self) -> Option<Tick> {
        self.state().subscription.map(|(_, tick)| tick)
    }
}

fn check_durations(expiry: Duration, sweep_interval: Duration) -> Result<()> {
    if expiry.is_zero() || sweep_interval.is_zero() {
        return Err(AdsbError::Config(format!(
            "expiry ({expiry:?}) and sweep interval ({sweep_interval:?}) must be non-zero"
        )));
    }
    Ok(())
}

impl<S: Store> Drop for Core<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some((id, _)) = state.subscription.take() {
            self.heartbeat.unsubscribe(id);
        }
    }
}

// ---------------------------------------------------------------------------
// ExpiringMap
// ---------------------------------------------------------------------------

/// Map whose entries disappear `expiry` after their last stamp.
pub struct ExpiringMap<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    core: Arc<Core<HashMap<K, Stamped<V>>>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        expiry: Duration,
        sweep_interval: Duration,
    ) -> Result<Self> {
        Ok(ExpiringMap {
            core: Core::new(HashMap::new(), clock, heartbeat, expiry, sweep_interval)?,
        })
    }

    /// Insert or replace, stamping the entry now. Returns the previous live value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let now = self.core.clock.now();
        let mut state = self.core.state();
        let previous = state
            .store
            .insert(key, Stamped { value, stamp: now })
            .filter(|old| state.is_live(old.stamp, now))
            .map(|old| old.value);
        self.core.reconcile(&mut state);
        previous
    }

    /// Look up without touching the entry's stamp.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key, false)
    }

    /// Look up and restamp the entry, extending its life by a full expiry.
    pub fn get_and_refresh(&self, key: &K) -> Option<V> {
        self.lookup(key, true)
    }

    fn lookup(&self, key: &K, refresh: bool) -> Option<V> {
        let now = self.core.clock.now();
        let mut state = self.core.state();
        let threshold = state.threshold(now);
        let entry = state.store.get_mut(key)?;
        if entry.stamp < threshold {
            return None;
        }
        if refresh {
            entry.stamp = now;
        }
        Some(entry.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Restamp an entry without reading it. Returns false if absent or expired.
    pub fn refresh(&self, key: &K) -> bool {
        self.get_and_refresh(key).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let now = self.core.clock.now();
        let mut state = self.core.state();
        let removed = state
            .store
            .remove(key)
            .filter(|old| state.is_live(old.stamp, now))
            .map(|old| old.value);
        self.core.reconcile(&mut state);
        removed
    }

    /// Live values, in no particular order.
    pub fn values(&self) -> Vec<V> {
        let now = self.core.clock.now();
        let state = self.core.state();
        state
            .store
            .values()
            .filter(|e| state.is_live(e.stamp, now))
            .map(|e| e.value.clone())
            .collect()
    }

    /// Number of stored entries, including any expired ones awaiting a sweep.
    pub fn len(&self) -> usize {
        self.core.state().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.core.state();
        state.store.clear();
        self.core.reconcile(&mut state);
    }

    /// Sweep now regardless of the interval. Returns entries removed.
    pub fn sweep(&self) -> usize {
        self.core.sweep()
    }

    pub fn expiry(&self) -> Duration {
        self.core.state().expiry
    }

    pub fn set_expiry(&self, expiry: Duration) -> Result<()> {
        self.core.set_expiry(expiry)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.core.state().sweep_interval
    }

    pub fn set_sweep_interval(&self, interval: Duration) -> Result<()> {
        self.core.set_sweep_interval(interval)
    }

    /// The heartbeat pulse the map currently sweeps on, if any.
    pub fn subscribed_tick(&self) -> Option<Tick> {
        self.core.subscribed_tick()
    }
}

// ---------------------------------------------------------------------------
// ExpiringList
// ---------------------------------------------------------------------------

/// Insertion-ordered list whose entries disappear `expiry` after their stamp.
pub struct ExpiringList<T: Send + 'static> {
    core: Arc<Core<Vec<Stamped<T>>>>,
}

impl<T: Clone + Send + 'static> ExpiringList<T> {
    pub fn new(
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        expiry: Duration,
        sweep_interval: Duration,
    ) -> Result<Self> {
        Ok(ExpiringList {
            core: Core::new(Vec::new(), clock, heartbeat, expiry, sweep_interval)?,
        })
    }

    pub fn push(&self, value: T) {
        let now = self.core.clock.now();
        let mut state = self.core.state();
        state.store.push(Stamped { value, stamp: now });
        self.core.reconcile(&mut state);
    }

    /// Live entries, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        let now = self.core.clock.now();
        let state = self.core.state();
        state
            .store
            .iter()
            .filter(|e| state.is_live(e.stamp, now))
            .map(|e| e.value.clone())
            .collect()
    }

    /// First live entry matching `predicate`, stamp untouched.
    pub fn find<P: Fn(&T) -> bool>(&self, predicate: P) -> Option<T> {
        self.find_inner(predicate, false)
    }

    /// First live entry matching `predicate`, restamped.
    pub fn find_and_refresh<P: Fn(&T) -> bool>(&self, predicate: P) -> Option<T> {
        self.find_inner(predicate, true)
    }

    fn find_inner<P: Fn(&T) -> bool>(&self, predicate: P, refresh: bool) -> Option<T> {
        let now = self.core.clock.now();
        let mut state = self.core.state();
        let threshold = state.threshold(now);
        let entry = state
            .store
            .iter_mut()
            .find(|e| e.stamp >= threshold && predicate(&e.value))?;
        if refresh {
            entry.stamp = now;
        }
        Some(entry.value.clone())
    }

    /// Remove every entry matching `predicate`. Returns how many went.
    pub fn remove_where<P: Fn(&T) -> bool>(&self, predicate: P) -> usize {
        let mut state = self.core.state();
        let before = state.store.len();
        state.store.retain(|e| !predicate(&e.value));
        let removed = before - state.store.len();
        self.core.reconcile(&mut state);
        removed
    }

    /// Number of stored entries, including any expired ones awaiting a sweep.
    pub fn len(&self) -> usize {
        self.core.state().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.core.state();
        state.store.clear();
        self.core.reconcile(&mut state);
    }

    pub fn sweep(&self) -> usize {
        self.core.sweep()
    }

    pub fn set_expiry(&self, expiry: Duration) -> Result<()> {
        self.core.set_expiry(expiry)
    }

    pub fn set_sweep_interval(&self, interval: Duration) -> Result<()> {
        self.core.set_sweep_interval(interval)
    }

    pub fn subscribed_tick(&self) -> Option<Tick> {
        self.core.subscribed_tick()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, Arc<Heartbeat>) {
        (Arc::new(ManualClock::new(1000.0)), Heartbeat::new())
    }

    fn map(clock: &Arc<ManualClock>, heartbeat: &Arc<Heartbeat>) -> ExpiringMap<u32, &'static str> {
        ExpiringMap::new(
            clock.clone(),
            heartbeat.clone(),
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .unwrap()
    }

    #[test]
    fn test_entry_gone_after_expiry() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        m.insert(1, "a");

        clock.advance(0.9);
        assert_eq!(m.get(&1), Some("a"));

        clock.advance(0.2); // 1.1 s after insert
        assert_eq!(m.get(&1), None);
    }

    #[test]
    fn test_refresh_extends_life() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        m.insert(1, "a");

        clock.advance(0.9);
        assert_eq!(m.get_and_refresh(&1), Some("a"));

        clock.advance(0.9); // 1.8 s after insert, 0.9 s after refresh
        assert_eq!(m.get(&1), Some("a"));

        clock.advance(0.2);
        assert_eq!(m.get(&1), None);
    }

    #[test]
    fn test_plain_get_does_not_refresh() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        m.insert(1, "a");
        clock.advance(0.9);
        assert!(m.get(&1).is_some());
        clock.advance(0.2);
        assert!(m.get(&1).is_none());
    }

    #[test]
    fn test_subscribes_on_first_insert_and_leaves_when_empty() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        assert_eq!(m.subscribed_tick(), None);
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 0);

        m.insert(1, "a");
        m.insert(2, "b");
        assert_eq!(m.subscribed_tick(), Some(Tick::Fast));
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 1);

        m.remove(&1);
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 1);
        m.remove(&2);
        assert_eq!(m.subscribed_tick(), None);
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 0);
    }

    #[test]
    fn test_heartbeat_sweep_removes_and_unsubscribes() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        m.insert(1, "a");
        clock.advance(0.5);
        m.insert(2, "b");

        clock.advance(0.7); // 1 is 1.2 s old, 2 is 0.7 s old
        heartbeat.fire(Tick::Fast);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&2), Some("b"));

        clock.advance(0.5);
        heartbeat.fire(Tick::Fast);
        assert!(m.is_empty());
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 0);
    }

    #[test]
    fn test_tick_before_interval_does_not_sweep() {
        let (clock, heartbeat) = setup();
        let m: ExpiringMap<u32, u32> = ExpiringMap::new(
            clock.clone(),
            heartbeat.clone(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .unwrap();
        m.insert(1, 1);
        clock.advance(2.0);
        heartbeat.fire(Tick::Fast);
        assert_eq!(m.len(), 1, "sweep interval not yet reached");
        assert_eq!(m.get(&1), None, "but the entry is already expired to readers");

        clock.advance(3.5);
        heartbeat.fire(Tick::Fast);
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn test_changing_interval_moves_subscription_once() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        m.insert(1, "a");

        m.set_sweep_interval(Duration::from_secs(30)).unwrap();
        assert_eq!(m.subscribed_tick(), Some(Tick::Slow));
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 0);
        assert_eq!(heartbeat.subscriber_count(Tick::Slow), 1);

        m.set_sweep_interval(Duration::from_secs(60)).unwrap();
        m.set_expiry(Duration::from_secs(120)).unwrap();
        assert_eq!(heartbeat.subscriber_count(Tick::Slow), 1);

        m.set_sweep_interval(Duration::from_millis(500)).unwrap();
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 1);
        assert_eq!(heartbeat.subscriber_count(Tick::Slow), 0);
    }

    #[test]
    fn test_longer_expiry_applies_to_existing_entries() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        m.insert(1, "a");
        m.set_expiry(Duration::from_secs(10)).unwrap();
        clock.advance(5.0);
        assert_eq!(m.get(&1), Some("a"));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let (clock, heartbeat) = setup();
        {
            let m = map(&clock, &heartbeat);
            m.insert(1, "a");
            assert_eq!(heartbeat.subscriber_count(Tick::Fast), 1);
        }
        assert_eq!(heartbeat.subscriber_count(Tick::Fast), 0);
    }

    #[test]
    fn test_insert_returns_live_previous_only() {
        let (clock, heartbeat) = setup();
        let m = map(&clock, &heartbeat);
        assert_eq!(m.insert(1, "a"), None);
        assert_eq!(m.insert(1, "b"), Some("a"));
        clock.advance(2.0);
        assert_eq!(m.insert(1, "c"), None);
    }

    #[test]
    fn test_list_snapshot_and_find() {
        let (clock, heartbeat) = setup();
        let list = ExpiringList::new(
            clock.clone(),
            heartbeat.clone(),
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .unwrap();
        list.push(10);
        clock.advance(0.6);
        list.push(20);
        assert_eq!(list.snapshot(), vec![10, 20]);

        assert_eq!(list.find_and_refresh(|v| *v == 10), Some(10));
        clock.advance(0.6);
        assert_eq!(list.find(|v| *v == 10), Some(10));

        clock.advance(0.5); // 20 is 1.1 s old, 10 was refreshed 1.1 s ago
        assert_eq!(list.snapshot(), Vec::<i32>::new());
        heartbeat.fire(Tick::Fast);
        assert!(list.is_empty());
        assert_eq!(list.subscribed_tick(), None);
    }

    #[test]
    fn test_list_remove_where() {
        let (clock, heartbeat) = setup();
        let list = ExpiringList::new(
            clock.clone(),
            heartbeat.clone(),
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
        .unwrap();
        for i in 0..5 {
            list.push(i);
        }
        assert_eq!(list.subscribed_tick(), Some(Tick::Slow));
        assert_eq!(list.remove_where(|v| v % 2 == 0), 3);
        assert_eq!(list.snapshot(), vec![1, 3]);
    }

    #[test]
    fn test_zero_durations_rejected() {
        let (clock, heartbeat) = setup();
        let result: Result<ExpiringMap<u32, u32>> = ExpiringMap::new(
            clock.clone(),
            heartbeat.clone(),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(AdsbError::Config(_))));

        let m = map(&clock, &heartbeat);
        assert!(m.set_sweep_interval(Duration::ZERO).is_err());
        assert_eq!(m.sweep_interval(), Duration::from_millis(100));
    }
}
