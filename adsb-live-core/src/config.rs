//! Tunable limits for the tracker.
//!
//! Every section has working defaults; a JSON file only needs the keys it
//! changes:
//!
//! ```json
//! { "sanity": { "max_ground_speed_kts": 900.0 }, "queue": { "delivery": "pool" } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::queue::Delivery;
use crate::types::{AdsbError, FeedKind, Result};

/// Full configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub trail: TrailConfig,
    pub sanity: SanityConfig,
    pub table: TableConfig,
    pub queue: QueueConfig,
    pub fetcher: FetcherConfig,
    pub expiry: ExpiryConfig,
}

/// Coordinate trail compaction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    /// Points closer than this to the previous one are dropped unless the
    /// aircraft turned.
    pub min_interval_secs: f64,
    /// Rolling window kept in the short trail.
    pub short_window_secs: f64,
    /// Bearing difference below which three points count as a straight line.
    pub bearing_tolerance_deg: f64,
}

impl Default for TrailConfig {
    fn default() -> Self {
        TrailConfig {
            min_interval_secs: 1.0,
            short_window_secs: 30.0,
            bearing_tolerance_deg: 1.0,
        }
    }
}

/// Kinematic ceilings for the sanity checker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SanityConfig {
    pub max_vertical_rate_fpm: f64,
    pub max_ground_speed_kts: f64,
    /// Rates are computed over at least this long, so two reports in the
    /// same instant don't imply infinite speed.
    pub min_rate_interval_secs: f64,
    /// Accepted points kept per aircraft.
    pub history_len: usize,
    /// History for an aircraft not heard from in this long is dropped.
    pub forget_after_secs: f64,
    pub sweep_interval_secs: f64,
}

impl Default for SanityConfig {
    fn default() -> Self {
        SanityConfig {
            max_vertical_rate_fpm: 20_000.0,
            max_ground_speed_kts: 1_500.0,
            min_rate_interval_secs: 1.0,
            history_len: 8,
            forget_after_secs: 600.0,
            sweep_interval_secs: 60.0,
        }
    }
}

/// Aircraft table liveness, per feed kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub mode_s_timeout_secs: f64,
    pub mlat_timeout_secs: f64,
    pub satcom_timeout_secs: f64,
}

impl TableConfig {
    pub fn timeout(&self, kind: FeedKind) -> f64 {
        match kind {
            FeedKind::ModeS => self.mode_s_timeout_secs,
            FeedKind::Mlat => self.mlat_timeout_secs,
            FeedKind::Satcom => self.satcom_timeout_secs,
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            mode_s_timeout_secs: 180.0,
            mlat_timeout_secs: 300.0,
            satcom_timeout_secs: 3_600.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Direct,
    #[default]
    Dedicated,
    Pool,
}

/// Message queue between the feed and the aircraft table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub delivery: DeliveryMode,
    /// `None` leaves the queue unbounded.
    pub max_depth: Option<usize>,
    pub workers: usize,
    pub max_in_flight: Option<usize>,
}

impl QueueConfig {
    pub fn to_delivery(&self) -> Delivery {
        match self.delivery {
            DeliveryMode::Direct => Delivery::Direct,
            DeliveryMode::Dedicated => Delivery::DedicatedThread,
            DeliveryMode::Pool => Delivery::ThreadPool {
                workers: self.workers,
                max_in_flight: self.max_in_flight,
            },
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            delivery: DeliveryMode::Dedicated,
            max_depth: Some(10_000),
            workers: 4,
            max_in_flight: None,
        }
    }
}

/// Detail fetcher timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Keys not registered again within this window are forgotten.
    pub deregister_after_secs: f64,
    /// Fetched details older than this are fetched again.
    pub refresh_after_secs: f64,
    /// Largest batch offered to a source in one call.
    pub max_batch: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            deregister_after_secs: 600.0,
            refresh_after_secs: 3_600.0,
            max_batch: 100,
        }
    }
}

/// Expiring lookups used alongside the table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// How long an address from a CRC-clean frame vouches for parity replies.
    pub icao_cache_secs: f64,
    pub icao_cache_sweep_secs: f64,
    /// How long rejected reports stay in the recent-rejections list.
    pub rejections_secs: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        ExpiryConfig {
            icao_cache_secs: 60.0,
            icao_cache_sweep_secs: 10.0,
            rejections_secs: 300.0,
        }
    }
}

impl Config {
    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| AdsbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        self.trail.validate()?;
        self.sanity.validate()?;
        self.table.validate()?;
        self.queue.validate()?;
        self.fetcher.validate()?;
        self.expiry.validate()
    }
}

impl TrailConfig {
    pub fn validate(&self) -> Result<()> {
        positive("trail.min_interval_secs", self.min_interval_secs)?;
        positive("trail.short_window_secs", self.short_window_secs)?;
        if !(self.bearing_tolerance_deg > 0.0 && self.bearing_tolerance_deg < 180.0) {
            return Err(AdsbError::Config(format!(
                "trail.bearing_tolerance_deg must be between 0 and 180, got {}",
                self.bearing_tolerance_deg
            )));
        }
        Ok(())
    }
}

impl SanityConfig {
    pub fn validate(&self) -> Result<()> {
        positive("sanity.max_vertical_rate_fpm", self.max_vertical_rate_fpm)?;
        positive("sanity.max_ground_speed_kts", self.max_ground_speed_kts)?;
        positive("sanity.min_rate_interval_secs", self.min_rate_interval_secs)?;
        positive("sanity.forget_after_secs", self.forget_after_secs)?;
        positive("sanity.sweep_interval_secs", self.sweep_interval_secs)?;
        if self.history_len < 2 {
            return Err(AdsbError::Config(
                "sanity.history_len must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        positive("table.mode_s_timeout_secs", self.mode_s_timeout_secs)?;
        positive("table.mlat_timeout_secs", self.mlat_timeout_secs)?;
        positive("table.satcom_timeout_secs", self.satcom_timeout_secs)
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == Some(0) {
            return Err(AdsbError::Config("queue.max_depth must be at least 1".into()));
        }
        if self.delivery == DeliveryMode::Pool
            && (self.workers == 0 || self.max_in_flight == Some(0))
        {
            return Err(AdsbError::Config(
                "queue: pool delivery needs workers and max_in_flight of at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl FetcherConfig {
    pub fn validate(&self) -> Result<()> {
        positive("fetcher.deregister_after_secs", self.deregister_after_secs)?;
        positive("fetcher.refresh_after_secs", self.refresh_after_secs)?;
        if self.max_batch == 0 {
            return Err(AdsbError::Config("fetcher.max_batch must be at least 1".into()));
        }
        Ok(())
    }
}

impl ExpiryConfig {
    pub fn validate(&self) -> Result<()> {
        positive("expiry.icao_cache_secs", self.icao_cache_secs)?;
        positive("expiry.icao_cache_sweep_secs", self.icao_cache_sweep_secs)?;
        positive("expiry.rejections_secs", self.rejections_secs)
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AdsbError::Config(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}

/// Seconds as a `Duration`, for callers that validated the value already.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Load config from a JSON file.
///
/// Returns default config if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)?;
    Config::from_json(&text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
