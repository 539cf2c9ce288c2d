//! Coordinate trails kept per aircraft.
//!
//! Two views of the same accepted positions:
//! - short trail: every accepted point inside a rolling time window
//! - full trail: only the points where the aircraft changed direction
//!
//! Points arriving less than `min_interval_secs` after the previous one are
//! dropped unless they show a turn, and a point identical to the previous
//! one (position, altitude and speed) is never stored twice.

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::TrailConfig;

const EARTH_RADIUS_NM: f64 = 3440.065;

/// Great-circle distance in nautical miles.
pub fn haversine_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_NM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial great-circle bearing from the first point to the second, 0-360.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlon = (lon2 - lon1).to_radians();
    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Smallest angle between two bearings, 0-180.
fn bearing_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

// ---------------------------------------------------------------------------
// Coordinate
// ---------------------------------------------------------------------------

/// One accepted position report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    pub heading: Option<f32>,
    pub altitude: Option<i32>,
    pub speed: Option<f32>,
    /// Record data version when the point was taken.
    pub data_version: u64,
    /// Seconds, from the table's clock.
    pub tick: f64,
}

impl Coordinate {
    fn same_point(&self, other: &Coordinate) -> bool {
        self.lat == other.lat
            && self.lon == other.lon
            && self.altitude == other.altitude
            && self.speed == other.speed
    }

    fn same_position(&self, other: &Coordinate) -> bool {
        self.lat == other.lat && self.lon == other.lon
    }

    fn bearing_to(&self, other: &Coordinate) -> f64 {
        bearing_deg(self.lat, self.lon, other.lat, other.lon)
    }
}

/// True if `b` lies on the straight path from `a` to `c`, within `tolerance`
/// degrees. A zero-length leg counts as straight.
pub fn is_colinear(a: &Coordinate, b: &Coordinate, c: &Coordinate, tolerance: f64) -> bool {
    if a.same_position(b) || b.same_position(c) {
        return true;
    }
    bearing_difference(a.bearing_to(b), b.bearing_to(c)) <= tolerance
}

// ---------------------------------------------------------------------------
// CoordinateTrail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinateTrail {
    short: VecDeque<Coordinate>,
    full: Vec<Coordinate>,
}

impl CoordinateTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn short(&self) -> &VecDeque<Coordinate> {
        &self.short
    }

    pub fn full(&self) -> &[Coordinate] {
        &self.full
    }

    /// Most recently accepted point.
    pub fn last(&self) -> Option<&Coordinate> {
        self.full.last()
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }

    /// Offer a new point. Returns true if it was recorded.
    ///
    /// The short trail is pruned to `now - window_secs` whether or not the
    /// point is kept.
    pub fn update(
        &mut self,
        point: Coordinate,
        now: f64,
        window_secs: f64,
        config: &TrailConfig,
    ) -> bool {
        let accepted = self.accepts(&point, config);
        if accepted {
            self.short.push_back(point);
            self.push_full(point, config.bearing_tolerance_deg);
        }
        self.prune_short(now - window_secs);
        accepted
    }

    fn accepts(&self, point: &Coordinate, config: &TrailConfig) -> bool {
        let Some(last) = self.full.last() else {
            return true;
        };
        if last.same_point(point) {
            return false;
        }
        if point.tick - last.tick >= config.min_interval_secs {
            return true;
        }
        self.turns_at(point, config.bearing_tolerance_deg)
    }

    /// True if `point` leaves the line of the last full-trail leg, or its
    /// reported heading differs from the previous one.
    fn turns_at(&self, point: &Coordinate, tolerance: f64) -> bool {
        let n = self.full.len();
        if let (Some(prev), Some(next)) = (self.full[n - 1].heading, point.heading) {
            if bearing_difference(prev as f64, next as f64) > tolerance {
                return true;
            }
        }
        n >= 2 && !is_colinear(&self.full[n - 2], &self.full[n - 1], point, tolerance)
    }

    fn push_full(&mut self, point: Coordinate, tolerance: f64) {
        self.full.push(point);
        while self.full.len() >= 3 {
            let n = self.full.len();
            if !is_colinear(&self.full[n - 3], &self.full[n - 2], &self.full[n - 1], tolerance) {
                break;
            }
            self.full.remove(n - 2);
            if self.full[n - 3].same_point(&self.full[n - 2]) {
                self.full.pop();
            }
        }
    }

    fn prune_short(&mut self, threshold: f64) {
        while self.short.front().is_some_and(|c| c.tick < threshold) {
            self.short.pop_front();
        }
    }

    /// Copy of the trail with the short trail pruned to the window.
    pub fn snapshot(&self, now: f64, window_secs: f64) -> CoordinateTrail {
        let mut copy = self.clone();
        copy.prune_short(now - window_secs);
        copy
    }

    pub fn clear(&mut self) {
        self.short.clear();
        self.full.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn point(lat: f64, lon: f64, tick: f64) -> Coordinate {
        Coordinate {
            lat,
            lon,
            heading: None,
            altitude: Some(10_000),
            speed: Some(250.0),
            data_version: 0,
            tick,
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // Asheville to Charlotte: ~96nm
        let d = haversine_nm(35.4362, -82.5418, 35.2140, -80.9431);
        assert!(d > 70.0 && d < 120.0, "AVL-CLT should be ~96nm, got {d}");
        assert!(haversine_nm(35.0, -82.0, 35.0, -82.0) < 0.01);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        assert!((bearing_deg(0.0, 0.0, 1.0, 0.0) - 0.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, 0.0, 1.0) - 90.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, -1.0, 0.0) - 180.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, 0.0, -1.0) - 270.0).abs() < 1e-6);
        assert!((bearing_difference(350.0, 10.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_straight_line_collapses_full_trail() {
        let config = TrailConfig::default();
        let mut trail = CoordinateTrail::new();
        for i in 0..10 {
            let t = i as f64 * 2.0;
            assert!(trail.update(point(0.0, i as f64 * 0.01, t), t, 60.0, &config));
        }
        assert_eq!(trail.short().len(), 10);
        assert_eq!(trail.full().len(), 2, "due east collapses to its endpoints");
        assert_eq!(trail.full()[1].tick, 18.0);
    }

    #[test]
    fn test_turn_is_kept() {
        let config = TrailConfig::default();
        let mut trail = CoordinateTrail::new();
        trail.update(point(0.0, 0.0, 0.0), 0.0, 60.0, &config);
        trail.update(point(0.0, 0.01, 2.0), 2.0, 60.0, &config);
        trail.update(point(0.0, 0.02, 4.0), 4.0, 60.0, &config);
        trail.update(point(0.01, 0.02, 6.0), 6.0, 60.0, &config);
        let lons: Vec<f64> = trail.full().iter().map(|c| c.lon).collect();
        assert_eq!(lons, vec![0.0, 0.02, 0.02]);
    }

    #[test]
    fn test_updates_within_interval_dropped_unless_turning() {
        let config = TrailConfig::default();
        let mut trail = CoordinateTrail::new();
        trail.update(point(0.0, 0.0, 0.0), 0.0, 60.0, &config);
        trail.update(point(0.0, 0.01, 2.0), 2.0, 60.0, &config);
        assert!(!trail.update(point(0.0, 0.011, 2.5), 2.5, 60.0, &config));
        assert!(trail.update(point(0.005, 0.01, 2.6), 2.6, 60.0, &config));
        assert_eq!(trail.short().len(), 3);
    }

    #[test]
    fn test_duplicate_point_not_appended() {
        let config = TrailConfig::default();
        let mut trail = CoordinateTrail::new();
        assert!(trail.update(point(1.0, 1.0, 0.0), 0.0, 60.0, &config));
        assert!(!trail.update(point(1.0, 1.0, 5.0), 5.0, 60.0, &config));
        assert_eq!(trail.short().len(), 1);
        assert_eq!(trail.full().len(), 1);
    }

    #[test]
    fn test_short_trail_pruned_to_window() {
        let config = TrailConfig::default();
        let mut trail = CoordinateTrail::new();
        for i in 0..20 {
            let t = i as f64 * 5.0;
            trail.update(point(i as f64 * 0.01, 0.0, t), t, 30.0, &config);
        }
        assert!(trail.short().iter().all(|c| c.tick >= 95.0 - 30.0));
        let later = trail.snapshot(200.0, 30.0);
        assert!(later.short().is_empty());
        assert_eq!(later.full(), trail.full());
    }

    #[test]
    fn test_random_walk_invariants() {
        let config = TrailConfig::default();
        let window = 45.0;
        let mut rng = StdRng::seed_from_u64(0xADB5);
        let mut trail = CoordinateTrail::new();
        let (mut lat, mut lon, mut t) = (35.0, -82.0, 0.0);

        for _ in 0..2_000 {
            t += rng.random_range(0.1..3.0);
            match rng.random_range(0..4) {
                0 => {}
                1 => lat += rng.random_range(-0.01..0.01),
                2 => lon += rng.random_range(-0.01..0.01),
                _ => {
                    lat += 0.002;
                    lon += 0.002;
                }
            }
            let mut p = point(lat, lon, t);
            p.altitude = Some(rng.random_range(0..3) * 100);
            trail.update(p, t, window, &config);

            let short: Vec<&Coordinate> = trail.short().iter().collect();
            assert!(short.windows(2).all(|w| !w[0].same_point(w[1])));
            assert!(short.iter().all(|c| c.tick >= t - window));
            let full = trail.full();
            assert!(full.windows(2).all(|w| !w[0].same_point(&w[1])));
            assert!(full
                .windows(3)
                .all(|w| !is_colinear(&w[0], &w[1], &w[2], config.bearing_tolerance_deg)));
        }
    }
}
