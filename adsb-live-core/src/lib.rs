//! adsb-live-core: primitives for a live Mode S / ADS-B aircraft picture.
//!
//! Bit-level field extraction and checksums for incoming frames, a
//! kinematic sanity gate, and a per-aircraft versioned state table, plus the
//! threading pieces (spin lock, expiring collections, background queue,
//! detail fetcher) that keep the feed thread from blocking.
//!
//! No network or disk I/O: byte sources, decoders, and metadata lookups
//! plug in from outside.

pub mod aircraft;
pub mod bitstream;
pub mod clock;
pub mod config;
pub mod crc;
pub mod expiring;
pub mod feed;
pub mod fetcher;
pub mod frame;
pub mod heartbeat;
pub mod queue;
pub mod sanity;
pub mod spin;
pub mod trail;
pub mod types;
pub mod versioned;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used types at crate root
pub use aircraft::{AircraftDetail, AircraftRecord, AircraftTable};
pub use bitstream::BitStream;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use feed::{DetailLookup, FeedProcessor, FeedStats, Observation};
pub use fetcher::{DetailFetcher, DetailSource};
pub use frame::{parse_frame, parse_hex, CrcVerdict, IcaoCache, ModeFrame};
pub use heartbeat::{Heartbeat, Tick};
pub use queue::{BackgroundQueue, Delivery, QueueFailure};
pub use sanity::{Certainty, SanityChecker};
pub use types::*;
pub use versioned::VersionedField;

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
