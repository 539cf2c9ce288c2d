//! From decoded observations to the live aircraft table.
//!
//! The feed thread calls `submit()` and returns immediately; a
//! `BackgroundQueue` hands each `Observation` to the pipeline, which:
//! 1. gates altitude and position through the `SanityChecker`, holding
//!    back `Uncertain` values and discarding `CertainlyWrong` ones
//! 2. looks up registry details for the aircraft, if a lookup is attached
//! 3. applies everything in one `apply_message`, backfilling the trail
//!    with the first good position when a position run is newly trusted
//! 4. offers the new position to the coordinate trail

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::aircraft::{AircraftDetail, AircraftRecord, AircraftTable};
use crate::clock::Clock;
use crate::config::{secs, Config, TrailConfig};
use crate::expiring::ExpiringList;
use crate::fetcher::{DetailFetcher, DetailSource};
use crate::heartbeat::{Heartbeat, SubscriptionId, Tick};
use crate::queue::{BackgroundQueue, ProcessResult};
use crate::sanity::{Certainty, SanityChecker};
use crate::types::{
    icao_from_hex, icao_to_string, AltitudeType, FeedKind, Icao, Result, SpeedType,
};

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One decoded message. Absent fields were not in the message.
///
/// Serialized with the address as a 6-character hex string:
///
/// ```json
/// {"icao":"4840D6","timestamp":1700000000.5,"altitude":35000,"lat":52.1,"lon":4.7}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observation {
    #[serde(serialize_with = "icao_ser", deserialize_with = "icao_de")]
    pub icao: Icao,
    pub timestamp: f64,
    pub feed: FeedKind,
    pub altitude: Option<i32>,
    pub altitude_type: Option<AltitudeType>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub ground_speed: Option<f32>,
    pub speed_type: Option<SpeedType>,
    pub track: Option<f32>,
    pub track_is_heading: Option<bool>,
    pub vertical_rate: Option<i32>,
    pub callsign: Option<String>,
    pub squawk: Option<String>,
    pub on_ground: Option<bool>,
    pub emergency: Option<bool>,
    pub signal_level: Option<i32>,
    pub receiver_id: Option<u32>,
}

fn icao_ser<S: Serializer>(icao: &Icao, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&icao_to_string(icao))
}

fn icao_de<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Icao, D::Error> {
    let hex = String::deserialize(d)?;
    icao_from_hex(&hex)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid ICAO address: {hex}")))
}

impl Observation {
    pub fn new(icao: Icao, timestamp: f64) -> Self {
        Observation {
            icao,
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_altitude(mut self, altitude: i32) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_position(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    fn position(&self) -> Option<(f64, f64)> {
        Some((self.lat?, self.lon?))
    }
}

// ---------------------------------------------------------------------------
// Detail lookup
// ---------------------------------------------------------------------------

/// Registry details for an aircraft, given its address and callsign if known.
pub trait DetailLookup: Send + Sync {
    fn lookup(&self, icao: Icao, callsign: Option<String>) -> Option<AircraftDetail>;
}

impl<S> DetailLookup for DetailFetcher<S>
where
    S: DetailSource<Key = Icao, Hint = Option<String>, Detail = AircraftDetail>,
{
    fn lookup(&self, icao: Icao, callsign: Option<String>) -> Option<AircraftDetail> {
        self.register(icao, callsign)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub received: u64,
    pub applied: u64,
    pub altitudes_held: u64,
    pub altitudes_rejected: u64,
    pub positions_held: u64,
    pub positions_rejected: u64,
    pub queue_dropped: u64,
    pub queue_failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    applied: AtomicU64,
    altitudes_held: AtomicU64,
    altitudes_rejected: AtomicU64,
    positions_held: AtomicU64,
    positions_rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectedField {
    Altitude,
    Position,
}

/// A report the sanity checker called `CertainlyWrong`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    #[serde(serialize_with = "icao_ser")]
    pub icao: Icao,
    pub timestamp: f64,
    pub field: RejectedField,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Pipeline {
    table: Arc<AircraftTable>,
    sanity: SanityChecker,
    details: Option<Arc<dyn DetailLookup>>,
    rejections: ExpiringList<Rejection>,
    trail: TrailConfig,
    counters: Counters,
}

impl Pipeline {
    fn process(&self, obs: Observation) -> ProcessResult {
        bump(&self.counters.received);
        if let Some((lat, lon)) = obs.position() {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(format!(
                    "{}: position {lat},{lon} out of range",
                    icao_to_string(&obs.icao)
                )
                .into());
            }
        }

        let icao = obs.icao;
        let t = obs.timestamp;

        let altitude = obs.altitude.filter(|&alt| {
            match self.sanity.check_altitude(icao, t, alt) {
                Certainty::ProbablyRight => true,
                Certainty::Uncertain => {
                    bump(&self.counters.altitudes_held);
                    false
                }
                Certainty::CertainlyWrong => {
                    self.reject(icao, t, RejectedField::Altitude);
                    false
                }
            }
        });

        let mut backfill = None;
        let position = obs.position().filter(|&(lat, lon)| {
            match self.sanity.check_position(icao, t, lat, lon) {
                Certainty::ProbablyRight => {
                    backfill = self.sanity.first_good_position_at(&icao);
                    true
                }
                Certainty::Uncertain => {
                    bump(&self.counters.positions_held);
                    false
                }
                Certainty::CertainlyWrong => {
                    self.reject(icao, t, RejectedField::Position);
                    false
                }
            }
        });

        let detail = self
            .details
            .as_ref()
            .and_then(|d| d.lookup(icao, obs.callsign.clone()));

        let window = self.trail.short_window_secs;
        self.table.apply_message(icao, obs.feed, |record| {
            let v = record.data_version();
            apply_fields(record, &obs, altitude, v);
            if let Some(detail) = &detail {
                record.apply_detail(detail);
            }
            if let Some((lat, lon)) = position {
                if record.trail.is_empty() {
                    if let Some((t0, (lat0, lon0))) = backfill.filter(|&(t0, _)| t0 < t) {
                        record.latitude.set(Some(lat0), v);
                        record.longitude.set(Some(lon0), v);
                        record.update_coordinates(t0, window, &self.trail);
                    }
                }
                record.latitude.set(Some(lat), v);
                record.longitude.set(Some(lon), v);
                record.update_coordinates(t, window, &self.trail);
            }
        });
        bump(&self.counters.applied);
        Ok(())
    }

    fn reject(&self, icao: Icao, timestamp: f64, field: RejectedField) {
        match field {
            RejectedField::Altitude => bump(&self.counters.altitudes_rejected),
            RejectedField::Position => bump(&self.counters.positions_rejected),
        }
        debug!(icao = %icao_to_string(&icao), ?field, "implausible report discarded");
        self.rejections.push(Rejection {
            icao,
            timestamp,
            field,
        });
    }
}

fn apply_fields(record: &mut AircraftRecord, obs: &Observation, altitude: Option<i32>, v: u64) {
    if altitude.is_some() {
        record.altitude.set(altitude, v);
        if let Some(kind) = obs.altitude_type {
            record.altitude_type.set(kind, v);
        }
    }
    if obs.ground_speed.is_some() {
        record.ground_speed.set(obs.ground_speed, v);
        record.speed_type.set(obs.speed_type.unwrap_or_default(), v);
    }
    if obs.track.is_some() {
        record.track.set(obs.track, v);
        record.track_is_heading.set(obs.track_is_heading.unwrap_or(false), v);
    }
    let callsign = obs
        .callsign
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    record.callsign.set_some(callsign, v);
    record.squawk.set_some(obs.squawk.clone(), v);
    record.vertical_rate.set_some(obs.vertical_rate, v);
    record.on_ground.set_some(obs.on_ground, v);
    record.emergency.set_some(obs.emergency, v);
    record.signal_level.set_some(obs.signal_level, v);
    record.receiver_id.set_some(obs.receiver_id, v);
}

// ---------------------------------------------------------------------------
// FeedProcessor
// ---------------------------------------------------------------------------

pub struct FeedProcessor {
    pipeline: Arc<Pipeline>,
    queue: BackgroundQueue<Observation>,
    heartbeat: Arc<Heartbeat>,
    sweep: SubscriptionId,
}

impl FeedProcessor {
    /// Build the pipeline and start its queue with the configured delivery.
    pub fn start(
        config: &Config,
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        table: Arc<AircraftTable>,
        details: Option<Arc<dyn DetailLookup>>,
    ) -> Result<Self> {
        config.validate()?;
        let rejections_expiry = secs(config.expiry.rejections_secs);
        let pipeline = Arc::new(Pipeline {
            table,
            sanity: SanityChecker::new(config.sanity.clone())?,
            details,
            rejections: ExpiringList::new(
                Arc::clone(&clock),
                Arc::clone(&heartbeat),
                rejections_expiry,
                rejections_expiry.min(Duration::from_secs(10)),
            )?,
            trail: config.trail.clone(),
            counters: Counters::default(),
        });

        // Histories of aircraft that went quiet are forgotten even when no
        // further reports arrive to trigger the inline sweep.
        let weak: Weak<Pipeline> = Arc::downgrade(&pipeline);
        let sweep = heartbeat.subscribe(Tick::Slow, move || {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.sanity.sweep(clock.now());
            }
        });

        let queue = match config.queue.max_depth {
            Some(depth) => BackgroundQueue::bounded("feed", depth)?,
            None => BackgroundQueue::new("feed"),
        };
        let worker = Arc::clone(&pipeline);
        queue.start(
            config.queue.to_delivery(),
            move |obs| worker.process(obs),
            |failure| warn!(%failure, "observation not applied"),
        )?;

        Ok(FeedProcessor {
            pipeline,
            queue,
            heartbeat,
            sweep,
        })
    }

    /// Queue an observation. Returns false once the processor is shut down.
    pub fn submit(&self, obs: Observation) -> bool {
        self.queue.enqueue(obs)
    }

    pub fn table(&self) -> &Arc<AircraftTable> {
        &self.pipeline.table
    }

    pub fn sanity(&self) -> &SanityChecker {
        &self.pipeline.sanity
    }

    /// Rejected reports still inside the rejection window, oldest first.
    pub fn recent_rejections(&self) -> Vec<Rejection> {
        self.pipeline.rejections.snapshot()
    }

    pub fn stats(&self) -> FeedStats {
        let c = &self.pipeline.counters;
        FeedStats {
            received: c.received.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            altitudes_held: c.altitudes_held.load(Ordering::Relaxed),
            altitudes_rejected: c.altitudes_rejected.load(Ordering::Relaxed),
            positions_held: c.positions_held.load(Ordering::Relaxed),
            positions_rejected: c.positions_rejected.load(Ordering::Relaxed),
            queue_dropped: self.queue.dropped_count(),
            queue_failed: self.queue.failed_count(),
        }
    }

    /// Remove aircraft past their feed timeouts and forget their sanity
    /// history. Returns how many were removed.
    pub fn prune(&self, now: f64) -> usize {
        let removed = self.pipeline.table.prune_stale(now);
        for icao in &removed {
            self.pipeline.sanity.reset(icao);
        }
        removed.len()
    }

    /// Stop accepting observations and finish the queued ones.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

impl Drop for FeedProcessor {
    fn drop(&mut self) {
        self.heartbeat.unsubscribe(self.sweep);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
