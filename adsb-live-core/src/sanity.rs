//! Kinematic plausibility gate for altitudes and positions.
//!
//! Each aircraft keeps two independent runs of accepted reports, one for
//! altitude and one for position. A new report is compared with the last
//! accepted one:
//! - implied rate above the ceiling: `CertainlyWrong`, the report is
//!   discarded and the run starts over
//! - otherwise the report joins the run; a run of one is `Uncertain`, two
//!   or more is `ProbablyRight`
//!
//! Once a run is `ProbablyRight` its first value can be used to backfill
//! what was held back while it was `Uncertain`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::config::SanityConfig;
use crate::lock;
use crate::trail::haversine_nm;
use crate::types::{Icao, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Certainty {
    #[default]
    Uncertain,
    ProbablyRight,
    CertainlyWrong,
}

/// One run of accepted (time, value) reports.
#[derive(Debug)]
struct Run<T> {
    first: Option<(f64, T)>,
    recent: VecDeque<(f64, T)>,
    accepted: usize,
}

impl<T: Copy> Run<T> {
    fn new() -> Self {
        Run {
            first: None,
            recent: VecDeque::new(),
            accepted: 0,
        }
    }

    fn certainty(&self) -> Certainty {
        if self.accepted >= 2 {
            Certainty::ProbablyRight
        } else {
            Certainty::Uncertain
        }
    }

    /// `rate` maps (previous, next, elapsed seconds) to the implied rate.
    fn offer<R>(
        &mut self,
        time: f64,
        value: T,
        rate: R,
        ceiling: f64,
        config: &SanityConfig,
    ) -> Certainty
    where
        R: Fn(T, T, f64) -> f64,
    {
        if let Some(&(last_time, last_value)) = self.recent.back() {
            let elapsed = (time - last_time).max(config.min_rate_interval_secs);
            if rate(last_value, value, elapsed) > ceiling {
                self.clear();
                return Certainty::CertainlyWrong;
            }
        }
        if self.first.is_none() {
            self.first = Some((time, value));
        }
        self.recent.push_back((time, value));
        while self.recent.len() > config.history_len {
            self.recent.pop_front();
        }
        self.accepted += 1;
        self.certainty()
    }

    fn first_good(&self) -> Option<(f64, T)> {
        match self.certainty() {
            Certainty::ProbablyRight => self.first,
            _ => None,
        }
    }

    fn clear(&mut self) {
        self.first = None;
        self.recent.clear();
        self.accepted = 0;
    }
}

fn vertical_rate_fpm(from: i32, to: i32, elapsed: f64) -> f64 {
    (to as f64 - from as f64).abs() / elapsed * 60.0
}

fn ground_speed_kts(from: (f64, f64), to: (f64, f64), elapsed: f64) -> f64 {
    haversine_nm(from.0, from.1, to.0, to.1) / elapsed * 3_600.0
}

struct History {
    altitude: Run<i32>,
    position: Run<(f64, f64)>,
    last_touched: f64,
}

impl History {
    fn new(now: f64) -> Self {
        History {
            altitude: Run::new(),
            position: Run::new(),
            last_touched: now,
        }
    }
}

struct Inner {
    histories: HashMap<Icao, History>,
    last_sweep: Option<f64>,
}

pub struct SanityChecker {
    config: SanityConfig,
    inner: Mutex<Inner>,
}

impl SanityChecker {
    /// Fails if a ceiling, interval or history length is unusable.
    pub fn new(config: SanityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SanityConfig) -> Self {
        SanityChecker {
            config,
            inner: Mutex::new(Inner {
                histories: HashMap::new(),
                last_sweep: None,
            }),
        }
    }

    /// Check an altitude in feet reported at `time`.
    pub fn check_altitude(&self, icao: Icao, time: f64, altitude: i32) -> Certainty {
        let ceiling = self.config.max_vertical_rate_fpm;
        self.with_history(icao, time, |h, config| {
            h.altitude.offer(time, altitude, vertical_rate_fpm, ceiling, config)
        })
    }

    /// Check a position reported at `time`.
    pub fn check_position(&self, icao: Icao, time: f64, lat: f64, lon: f64) -> Certainty {
        let ceiling = self.config.max_ground_speed_kts;
        self.with_history(icao, time, |h, config| {
            h.position.offer(time, (lat, lon), ground_speed_kts, ceiling, config)
        })
    }

    fn with_history<F>(&self, icao: Icao, time: f64, check: F) -> Certainty
    where
        F: FnOnce(&mut History, &SanityConfig) -> Certainty,
    {
        let mut inner = lock(&self.inner);
        let due = match inner.last_sweep {
            Some(last) => time - last >= self.config.sweep_interval_secs,
            None => {
                inner.last_sweep = Some(time);
                false
            }
        };
        if due {
            self.sweep_locked(&mut inner, time);
        }

        let history = inner
            .histories
            .entry(icao)
            .or_insert_with(|| History::new(time));
        history.last_touched = history.last_touched.max(time);
        check(history, &self.config)
    }

    pub fn altitude_certainty(&self, icao: &Icao) -> Certainty {
        lock(&self.inner)
            .histories
            .get(icao)
            .map_or(Certainty::Uncertain, |h| h.altitude.certainty())
    }

    pub fn position_certainty(&self, icao: &Icao) -> Certainty {
        lock(&self.inner)
            .histories
            .get(icao)
            .map_or(Certainty::Uncertain, |h| h.position.certainty())
    }

    /// Earliest altitude of the current run, once the run is `ProbablyRight`.
    pub fn first_good_altitude(&self, icao: &Icao) -> Option<i32> {
        self.first_good_altitude_at(icao).map(|(_, alt)| alt)
    }

    /// Earliest position of the current run, once the run is `ProbablyRight`.
    pub fn first_good_position(&self, icao: &Icao) -> Option<(f64, f64)> {
        self.first_good_position_at(icao).map(|(_, pos)| pos)
    }

    /// As `first_good_altitude`, with the time it was reported.
    pub fn first_good_altitude_at(&self, icao: &Icao) -> Option<(f64, i32)> {
        lock(&self.inner).histories.get(icao)?.altitude.first_good()
    }

    /// As `first_good_position`, with the time it was reported.
    pub fn first_good_position_at(&self, icao: &Icao) -> Option<(f64, (f64, f64))> {
        lock(&self.inner).histories.get(icao)?.position.first_good()
    }

    /// Forget everything about `icao`.
    pub fn reset(&self, icao: &Icao) {
        lock(&self.inner).histories.remove(icao);
    }

    /// Drop histories untouched for `forget_after_secs`. Also runs on its
    /// own as reports arrive.
    pub fn sweep(&self, now: f64) -> usize {
        let mut inner = lock(&self.inner);
        self.sweep_locked(&mut inner, now)
    }

    fn sweep_locked(&self, inner: &mut Inner, now: f64) -> usize {
        let threshold = now - self.config.forget_after_secs;
        let before = inner.histories.len();
        inner.histories.retain(|_, h| h.last_touched >= threshold);
        inner.last_sweep = Some(now);
        let removed = before - inner.histories.len();
        if removed > 0 {
            debug!(removed, "forgot idle sanity histories");
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SanityChecker {
    fn default() -> Self {
        SanityChecker::build(SanityConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
