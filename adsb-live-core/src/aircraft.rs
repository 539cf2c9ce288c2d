//! Live aircraft table.
//!
//! Each aircraft lives behind its own mutex; the ICAO -> record map is
//! behind a spin lock held only long enough to find or insert an entry, so
//! updates to different aircraft never wait on each other.
//!
//! Every `apply_message` takes the next value of one table-wide data
//! version and stamps it on the record and on each field it changes.
//! Readers only ever get copies (`clone_snapshot`, `snapshot_all`), taken
//! under the record lock, so they see an apply either entirely or not at
//! all.
//!
//! Versions are allocated in order but applies to different aircraft finish
//! in any order, so `data_version()` reports a watermark: the highest
//! version below which every apply has finished. A reader that takes the
//! watermark before a snapshot can later ask for `changed_since(watermark)`
//! and miss nothing.
//!
//! Pruning and removal retire a record under its own lock before unmapping
//! it; an apply that finds a retired record starts over with a fresh one.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::config::{TableConfig, TrailConfig};
use crate::lock;
use crate::spin::SpinLock;
use crate::trail::{Coordinate, CoordinateTrail};
use crate::types::{icao_to_string, AltitudeType, FeedKind, Icao, SpeedType};
use crate::versioned::VersionedField;

// ---------------------------------------------------------------------------
// Aircraft detail (enrichment)
// ---------------------------------------------------------------------------

/// Metadata about an airframe from a registry or lookup service.
///
/// Absent fields leave the record's current value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AircraftDetail {
    pub registration: Option<String>,
    pub aircraft_type: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub operator: Option<String>,
    pub operator_icao: Option<String>,
    pub country: Option<String>,
    pub is_military: Option<bool>,
    pub species: Option<String>,
    pub wake_turbulence: Option<String>,
    pub serial: Option<String>,
    pub year_built: Option<String>,
    pub photo_count: Option<u32>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub stopovers: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Aircraft record
// ---------------------------------------------------------------------------

/// State for one aircraft.
///
/// Fields are public for reading snapshots; writes happen inside
/// `AircraftTable::apply_message` and stamp `data_version()`.
#[derive(Debug, Clone, Serialize)]
pub struct AircraftRecord {
    unique_id: u64,
    #[serde(skip)]
    icao: Icao,
    data_version: u64,
    first_seen: f64,
    last_update: f64,
    last_feed_update: [Option<f64>; 3],
    #[serde(skip)]
    retired: bool,

    pub icao_code: VersionedField<String>,
    pub callsign: VersionedField<Option<String>>,
    pub altitude: VersionedField<Option<i32>>,
    pub altitude_type: VersionedField<AltitudeType>,
    pub ground_speed: VersionedField<Option<f32>>,
    pub speed_type: VersionedField<SpeedType>,
    pub latitude: VersionedField<Option<f64>>,
    pub longitude: VersionedField<Option<f64>>,
    pub vertical_rate: VersionedField<Option<i32>>,
    pub squawk: VersionedField<Option<String>>,
    pub track: VersionedField<Option<f32>>,
    pub track_is_heading: VersionedField<bool>,
    pub on_ground: VersionedField<Option<bool>>,
    pub emergency: VersionedField<Option<bool>>,
    pub signal_level: VersionedField<Option<i32>>,

    // Enrichment
    pub registration: VersionedField<Option<String>>,
    pub aircraft_type: VersionedField<Option<String>>,
    pub manufacturer: VersionedField<Option<String>>,
    pub model: VersionedField<Option<String>>,
    pub operator: VersionedField<Option<String>>,
    pub operator_icao: VersionedField<Option<String>>,
    pub country: VersionedField<Option<String>>,
    pub is_military: VersionedField<bool>,
    pub species: VersionedField<Option<String>>,
    pub wake_turbulence: VersionedField<Option<String>>,
    pub serial: VersionedField<Option<String>>,
    pub year_built: VersionedField<Option<String>>,
    pub interested: VersionedField<bool>,
    pub user_tag: VersionedField<Option<String>>,
    pub photo_count: VersionedField<u32>,
    pub flights_count: VersionedField<u32>,
    pub origin: VersionedField<Option<String>>,
    pub destination: VersionedField<Option<String>>,
    pub stopovers: VersionedField<Vec<String>>,
    pub target_altitude: VersionedField<Option<i32>>,
    pub target_track: VersionedField<Option<f32>>,
    pub transponder_type: VersionedField<Option<String>>,
    pub receiver_id: VersionedField<Option<u32>>,

    pub trail: CoordinateTrail,
}

impl AircraftRecord {
    fn new(unique_id: u64, icao: Icao, now: f64) -> Self {
        AircraftRecord {
            unique_id,
            icao,
            data_version: 0,
            first_seen: now,
            last_update: now,
            last_feed_update: [None; 3],
            retired: false,
            icao_code: VersionedField::new(icao_to_string(&icao)),
            callsign: VersionedField::default(),
            altitude: VersionedField::default(),
            altitude_type: VersionedField::default(),
            ground_speed: VersionedField::default(),
            speed_type: VersionedField::default(),
            latitude: VersionedField::default(),
            longitude: VersionedField::default(),
            vertical_rate: VersionedField::default(),
            squawk: VersionedField::default(),
            track: VersionedField::default(),
            track_is_heading: VersionedField::default(),
            on_ground: VersionedField::default(),
            emergency: VersionedField::default(),
            signal_level: VersionedField::default(),
            registration: VersionedField::default(),
            aircraft_type: VersionedField::default(),
            manufacturer: VersionedField::default(),
            model: VersionedField::default(),
            operator: VersionedField::default(),
            operator_icao: VersionedField::default(),
            country: VersionedField::default(),
            is_military: VersionedField::default(),
            species: VersionedField::default(),
            wake_turbulence: VersionedField::default(),
            serial: VersionedField::default(),
            year_built: VersionedField::default(),
            interested: VersionedField::default(),
            user_tag: VersionedField::default(),
            photo_count: VersionedField::default(),
            flights_count: VersionedField::default(),
            origin: VersionedField::default(),
            destination: VersionedField::default(),
            stopovers: VersionedField::default(),
            target_altitude: VersionedField::default(),
            target_track: VersionedField::default(),
            transponder_type: VersionedField::default(),
            receiver_id: VersionedField::default(),
            trail: CoordinateTrail::new(),
        }
    }

    /// Session-unique id, assigned when the aircraft was first seen.
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn icao(&self) -> Icao {
        self.icao
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub fn first_seen(&self) -> f64 {
        self.first_seen
    }

    pub fn last_update(&self) -> f64 {
        self.last_update
    }

    /// Last message time from `kind`, or `None` if that feed never reported.
    pub fn last_feed_update(&self, kind: FeedKind) -> Option<f64> {
        self.last_feed_update[kind.index()]
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        Some(((*self.latitude.value())?, (*self.longitude.value())?))
    }

    /// Offer the current position to the coordinate trail.
    ///
    /// Returns true if a point was recorded.
    pub fn update_coordinates(
        &mut self,
        now: f64,
        window_secs: f64,
        config: &TrailConfig,
    ) -> bool {
        let Some((lat, lon)) = self.position() else {
            return false;
        };
        let point = Coordinate {
            lat,
            lon,
            heading: *self.track.value(),
            altitude: *self.altitude.value(),
            speed: *self.ground_speed.value(),
            data_version: self.data_version,
            tick: now,
        };
        self.trail.update(point, now, window_secs, config)
    }

    /// Copy every field, with the short trail pruned to the window.
    pub fn clone_snapshot(&self, now: f64, window_secs: f64) -> AircraftRecord {
        let mut copy = self.clone();
        copy.trail = self.trail.snapshot(now, window_secs);
        copy
    }

    /// Merge looked-up metadata. Returns true if any field changed.
    pub fn apply_detail(&mut self, detail: &AircraftDetail) -> bool {
        let v = self.data_version;
        let mut changed = false;
        changed |= self.registration.set_some(detail.registration.clone(), v);
        changed |= self.aircraft_type.set_some(detail.aircraft_type.clone(), v);
        changed |= self.manufacturer.set_some(detail.manufacturer.clone(), v);
        changed |= self.model.set_some(detail.model.clone(), v);
        changed |= self.operator.set_some(detail.operator.clone(), v);
        changed |= self.operator_icao.set_some(detail.operator_icao.clone(), v);
        changed |= self.country.set_some(detail.country.clone(), v);
        changed |= self.species.set_some(detail.species.clone(), v);
        changed |= self.wake_turbulence.set_some(detail.wake_turbulence.clone(), v);
        changed |= self.serial.set_some(detail.serial.clone(), v);
        changed |= self.year_built.set_some(detail.year_built.clone(), v);
        changed |= self.origin.set_some(detail.origin.clone(), v);
        changed |= self.destination.set_some(detail.destination.clone(), v);
        if let Some(military) = detail.is_military {
            changed |= self.is_military.set(military, v);
        }
        if let Some(photos) = detail.photo_count {
            changed |= self.photo_count.set(photos, v);
        }
        if let Some(stopovers) = &detail.stopovers {
            changed |= self.stopovers.set(stopovers.clone(), v);
        }
        changed
    }

    /// True if no feed has reported within its liveness timeout.
    fn is_stale(&self, now: f64, config: &TableConfig) -> bool {
        FeedKind::ALL.iter().all(|&kind| match self.last_feed_update(kind) {
            Some(t) => now - t > config.timeout(kind),
            None => true,
        })
    }
}

// ---------------------------------------------------------------------------
// Version sequence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SequenceState {
    last: u64,
    in_flight: BTreeSet<u64>,
}

/// Data versions handed out but not yet finished.
#[derive(Default)]
struct VersionSequence {
    state: Mutex<SequenceState>,
}

impl VersionSequence {
    fn begin(&self) -> InFlight<'_> {
        let mut state = lock(&self.state);
        state.last += 1;
        let version = state.last;
        state.in_flight.insert(version);
        InFlight {
            sequence: self,
            version,
        }
    }

    /// Highest version with no unfinished version at or below it.
    fn watermark(&self) -> u64 {
        let state = lock(&self.state);
        match state.in_flight.first() {
            Some(&oldest) => oldest - 1,
            None => state.last,
        }
    }
}

/// Finishes its version when dropped, including on a panicking mutator.
struct InFlight<'a> {
    sequence: &'a VersionSequence,
    version: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.sequence.state).in_flight.remove(&self.version);
    }
}

// ---------------------------------------------------------------------------
// Aircraft table
// ---------------------------------------------------------------------------

type Entry = Arc<Mutex<AircraftRecord>>;

pub struct AircraftTable {
    records: SpinLock<HashMap<Icao, Entry>>,
    next_unique_id: AtomicU64,
    versions: VersionSequence,
    clock: Arc<dyn Clock>,
    config: TableConfig,
    trail_window_secs: f64,
}

impl AircraftTable {
    pub fn new(clock: Arc<dyn Clock>, config: TableConfig, trail: &TrailConfig) -> Self {
        AircraftTable {
            records: SpinLock::new(HashMap::new()),
            next_unique_id: AtomicU64::new(1),
            versions: VersionSequence::default(),
            clock,
            config,
            trail_window_secs: trail.short_window_secs,
        }
    }

    fn entry(&self, icao: Icao, now: f64) -> Entry {
        let mut records = self.records.lock();
        let entry = records.entry(icao).or_insert_with(|| {
            let id = self.next_unique_id.fetch_add(1, Ordering::Relaxed);
            Arc::new(Mutex::new(AircraftRecord::new(id, icao, now)))
        });
        Arc::clone(entry)
    }

    fn lookup(&self, icao: &Icao) -> Option<Entry> {
        self.records.lock().get(icao).map(Arc::clone)
    }

    fn entries(&self) -> Vec<(Icao, Entry)> {
        self.records
            .lock()
            .iter()
            .map(|(icao, entry)| (*icao, Arc::clone(entry)))
            .collect()
    }

    /// Drop the mapping for `icao` if it still points at `entry`.
    fn unmap(&self, icao: &Icao, entry: &Entry) {
        let mut records = self.records.lock();
        if records.get(icao).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            records.remove(icao);
        }
    }

    /// Run `mutator` against the record for `icao`, creating it if needed.
    ///
    /// The record's data version is bumped once before the mutator runs;
    /// field writes inside should stamp `record.data_version()`. Returns
    /// that version.
    pub fn apply_message<F>(&self, icao: Icao, kind: FeedKind, mutator: F) -> u64
    where
        F: FnOnce(&mut AircraftRecord),
    {
        let now = self.clock.now();
        loop {
            let entry = self.entry(icao, now);
            let mut record = lock(&entry);
            if record.retired {
                drop(record);
                self.unmap(&icao, &entry);
                continue;
            }
            let in_flight = self.versions.begin();
            record.data_version = in_flight.version;
            record.last_update = now;
            record.last_feed_update[kind.index()] = Some(now);
            mutator(&mut record);
            return in_flight.version;
        }
    }

    /// Watermark: every apply stamped at or below it has finished, so a
    /// snapshot taken after reading it holds all of them.
    pub fn data_version(&self) -> u64 {
        self.versions.watermark()
    }

    pub fn get(&self, icao: &Icao) -> Option<AircraftRecord> {
        let now = self.clock.now();
        let entry = self.lookup(icao)?;
        let record = lock(&entry);
        (!record.retired).then(|| record.clone_snapshot(now, self.trail_window_secs))
    }

    /// Copies of every record, ordered by unique id.
    pub fn snapshot_all(&self) -> Vec<AircraftRecord> {
        self.snapshot_where(|_| true)
    }

    /// Copies of the records changed after `version`.
    pub fn changed_since(&self, version: u64) -> Vec<AircraftRecord> {
        self.snapshot_where(|record| record.data_version > version)
    }

    fn snapshot_where<P>(&self, predicate: P) -> Vec<AircraftRecord>
    where
        P: Fn(&AircraftRecord) -> bool,
    {
        let now = self.clock.now();
        let mut snapshots: Vec<AircraftRecord> = self
            .entries()
            .into_iter()
            .filter_map(|(_, entry)| {
                let record = lock(&entry);
                (!record.retired && predicate(&record))
                    .then(|| record.clone_snapshot(now, self.trail_window_secs))
            })
            .collect();
        snapshots.sort_by_key(|r| r.unique_id);
        snapshots
    }

    pub fn remove(&self, icao: &Icao) -> bool {
        match self.lookup(icao) {
            Some(entry) => self.retire_if(icao, &entry, |_| true),
            None => false,
        }
    }

    /// Drop aircraft that no feed has reported within its timeout.
    /// Returns the removed addresses.
    pub fn prune_stale(&self, now: f64) -> Vec<Icao> {
        let removed: Vec<Icao> = self
            .entries()
            .into_iter()
            .filter(|(icao, entry)| {
                self.retire_if(icao, entry, |record| record.is_stale(now, &self.config))
            })
            .map(|(icao, _)| icao)
            .collect();
        if !removed.is_empty() {
            debug!(removed = removed.len(), "pruned stale aircraft");
        }
        removed
    }

    /// Retire and unmap `entry` if `condition` holds under its lock.
    fn retire_if<C>(&self, icao: &Icao, entry: &Entry, condition: C) -> bool
    where
        C: FnOnce(&AircraftRecord) -> bool,
    {
        {
            let mut record = lock(entry);
            if record.retired || !condition(&record) {
                return false;
            }
            record.retired = true;
        }
        self.unmap(icao, entry);
        true
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::mpsc;
    use std::thread;

    const ICAO: Icao = [0x48, 0x40, 0xD6];

    fn table() -> (Arc<ManualClock>, AircraftTable) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let table =
            AircraftTable::new(clock.clone(), TableConfig::default(), &TrailConfig::default());
        (clock, table)
    }

    #[test]
    fn test_apply_creates_record() {
        let (_, table) = table();
        assert!(table.get(&ICAO).is_none());
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.icao_code.value(), "4840D6");
        assert_eq!(record.unique_id(), 1);
        assert_eq!(record.last_feed_update(FeedKind::ModeS), Some(1_000.0));
        assert_eq!(record.last_feed_update(FeedKind::Mlat), None);
    }

    #[test]
    fn test_report_at_time_zero_counts() {
        let clock = Arc::new(ManualClock::new(0.0));
        let table =
            AircraftTable::new(clock.clone(), TableConfig::default(), &TrailConfig::default());
        table.apply_message(ICAO, FeedKind::Mlat, |_| {});
        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.last_feed_update(FeedKind::Mlat), Some(0.0));
        assert!(table.prune_stale(100.0).is_empty());
    }

    #[test]
    fn test_one_version_bump_per_apply() {
        let (_, table) = table();
        let v1 = table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(35_000), v);
            r.callsign.set(Some("KLM1023".into()), v);
            r.squawk.set(Some("7700".into()), v);
            r.emergency.set(Some(true), v);
        });
        let v2 = table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(35_100), v);
        });
        assert_eq!(v2, v1 + 1);
        assert_eq!(table.data_version(), v2);

        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.data_version(), v2);
        assert_eq!(record.altitude.data_version(), v2);
        assert_eq!(record.callsign.data_version(), v1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let (_, table) = table();
        table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(1_000), v);
        });
        let before = table.get(&ICAO).unwrap();
        table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(2_000), v);
        });
        assert_eq!(before.altitude.value(), &Some(1_000));
        assert_eq!(table.get(&ICAO).unwrap().altitude.value(), &Some(2_000));
    }

    #[test]
    fn test_changed_since() {
        let (_, table) = table();
        let other: Icao = [0xA0, 0x00, 0x01];
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        let watermark = table.apply_message(other, FeedKind::ModeS, |_| {});
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});

        let changed = table.changed_since(watermark);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].icao(), ICAO);
        assert_eq!(table.snapshot_all().len(), 2);
    }

    #[test]
    fn test_prune_uses_per_feed_timeouts() {
        let (clock, table) = table();
        let satcom: Icao = [0x00, 0x00, 0x01];
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        table.apply_message(satcom, FeedKind::Satcom, |_| {});

        clock.advance(181.0);
        let removed = table.prune_stale(clock.now());
        assert_eq!(removed, vec![ICAO]);
        assert_eq!(table.len(), 1);

        clock.advance(3_600.0);
        assert_eq!(table.prune_stale(clock.now()), vec![satcom]);
        assert!(table.is_empty());

        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.unique_id(), 3, "recreated record gets a new id");
    }

    #[test]
    fn test_update_coordinates_records_trail() {
        let (clock, table) = table();
        let config = TrailConfig::default();
        for i in 0..5 {
            clock.advance(2.0);
            let now = clock.now();
            table.apply_message(ICAO, FeedKind::ModeS, |r| {
                let v = r.data_version();
                r.latitude.set(Some(35.0 + i as f64 * 0.01), v);
                r.longitude.set(Some(-82.0), v);
                r.update_coordinates(now, 30.0, &config);
            });
        }
        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.trail.short().len(), 5);
        assert_eq!(record.trail.full().len(), 2);
        assert_eq!(record.trail.full()[1].data_version, record.data_version());
    }

    #[test]
    fn test_apply_detail() {
        let (_, table) = table();
        let detail = AircraftDetail {
            registration: Some("N12345".into()),
            is_military: Some(true),
            ..Default::default()
        };
        table.apply_message(ICAO, FeedKind::ModeS, |r| {
            assert!(r.apply_detail(&detail));
            assert!(!r.apply_detail(&detail));
        });
        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.registration.value().as_deref(), Some("N12345"));
        assert!(*record.is_military.value());
        assert_eq!(record.operator.value(), &None);
    }

    #[test]
    fn test_concurrent_applies_each_bump_once() {
        let (_, table) = table();
        let table = Arc::new(table);
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..250 {
                        table.apply_message([0, 0, t % 4], FeedKind::ModeS, |r| {
                            let v = r.data_version();
                            let count = *r.flights_count.value();
                            r.flights_count.set(count + 1, v);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.data_version(), 2_000);
        assert_eq!(table.len(), 4);
        let total: u32 = table
            .snapshot_all()
            .iter()
            .map(|r| *r.flights_count.value())
            .sum();
        assert_eq!(total, 2_000);
    }

    #[test]
    fn test_watermark_waits_for_slower_apply() {
        let (_, table) = table();
        let table = Arc::new(table);
        let slow: Icao = [0xA0, 0x00, 0x01];
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.apply_message(slow, FeedKind::ModeS, move |r| {
                    started_tx.send(r.data_version()).unwrap();
                    go_rx.recv().unwrap();
                    let v = r.data_version();
                    r.altitude.set(Some(9_000), v);
                })
            })
        };
        let slow_version = started_rx.recv().unwrap();
        let fast_version = table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(1_000), v);
        });
        assert!(fast_version > slow_version);

        // The later version is done but the earlier one is not.
        let watermark = table.data_version();
        assert_eq!(watermark, slow_version - 1);

        go_tx.send(()).unwrap();
        assert_eq!(writer.join().unwrap(), slow_version);
        assert_eq!(table.data_version(), fast_version);

        let changed = table.changed_since(watermark);
        assert_eq!(changed.len(), 2, "the slow apply is not skipped");
        let slow_record = changed.iter().find(|r| r.icao() == slow).unwrap();
        assert_eq!(slow_record.altitude.value(), &Some(9_000));
    }

    #[test]
    fn test_watermark_survives_panicking_mutator() {
        let (_, table) = table();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            table.apply_message(ICAO, FeedKind::ModeS, |_| panic!("bad message"));
        }));
        assert!(result.is_err());
        let v = table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        assert_eq!(table.data_version(), v);
    }

    #[test]
    fn test_apply_skips_retired_record() {
        let (_, table) = table();
        table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(1_000), v);
        });
        // Retired by a prune that has not unmapped it yet.
        let old = table.lookup(&ICAO).unwrap();
        lock(&old).retired = true;
        assert!(table.get(&ICAO).is_none());

        table.apply_message(ICAO, FeedKind::ModeS, |r| {
            let v = r.data_version();
            r.altitude.set(Some(2_000), v);
        });
        assert_eq!(lock(&old).altitude.value(), &Some(1_000));
        let record = table.get(&ICAO).unwrap();
        assert_eq!(record.unique_id(), 2);
        assert_eq!(record.altitude.value(), &Some(2_000));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_prune_rechecks_refreshed_record() {
        let (clock, table) = table();
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        let entry = table.lookup(&ICAO).unwrap();
        let scan_time = clock.now() + 181.0;
        assert!(lock(&entry).is_stale(scan_time, &table.config));

        // A message lands between the scan and the removal.
        clock.set(scan_time);
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        let stale = |r: &AircraftRecord| r.is_stale(scan_time, &table.config);
        assert!(!table.retire_if(&ICAO, &entry, stale));
        assert_eq!(table.len(), 1);
        assert!(table.get(&ICAO).is_some());
    }

    #[test]
    fn test_remove_retires_record() {
        let (_, table) = table();
        table.apply_message(ICAO, FeedKind::ModeS, |_| {});
        let entry = table.lookup(&ICAO).unwrap();
        assert!(table.remove(&ICAO));
        assert!(!table.remove(&ICAO));
        assert!(lock(&entry).retired);
        assert!(table.is_empty());
    }
}
