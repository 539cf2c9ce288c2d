//! Integrity gate for raw Mode S frames.
//!
//! Responsibilities:
//! - Classify Downlink Format (DF) from the first 5 bits
//! - Extract the ICAO address: explicit in bits 8-31 for DF11/17/18,
//!   recovered from the parity residual for DF0/4/5/16/20/21
//! - Attach a `CrcVerdict`; nothing here drops a frame for failing CRC
//! - Vouch for residual-recovered addresses only if the same address was
//!   recently seen in a CRC-clean frame
//!
//! Field-level decoding of the message body is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bitstream::BitStream;
use crate::clock::Clock;
use crate::config::{secs, ExpiryConfig};
use crate::crc;
use crate::expiring::ExpiringMap;
use crate::heartbeat::Heartbeat;
use crate::types::{df_info, hex_decode, icao_from_u32, AdsbError, Icao, Result};

// DFs where ICAO is explicit in bytes 1-3
const DF_EXPLICIT_ICAO: &[u8] = &[11, 17, 18];

// DFs where ICAO is recovered from CRC residual
const DF_RESIDUAL_ICAO: &[u8] = &[0, 4, 5, 16, 20, 21];

// DF11 replies may overlay an interrogator code on the low 7 PI bits.
const DF11_IC_MASK: u32 = 0x7F;

// ---------------------------------------------------------------------------
// ICAO cache
// ---------------------------------------------------------------------------

/// Addresses recently seen in CRC-clean DF11/17/18 frames.
///
/// For DF0/4/5/16/20/21 the address only exists as the CRC residual, so a
/// corrupted frame yields a plausible but fake address. Those are trusted
/// only if the cache has seen the address recently.
pub struct IcaoCache {
    seen: ExpiringMap<Icao, ()>,
}

impl IcaoCache {
    pub fn new(
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Result<Self> {
        Ok(IcaoCache {
            seen: ExpiringMap::new(clock, heartbeat, ttl, sweep_interval)?,
        })
    }

    pub fn from_config(
        clock: Arc<dyn Clock>,
        heartbeat: Arc<Heartbeat>,
        config: &ExpiryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(
            clock,
            heartbeat,
            secs(config.icao_cache_secs),
            secs(config.icao_cache_sweep_secs),
        )
    }

    /// Register an address from a CRC-clean frame.
    pub fn register(&self, icao: Icao) {
        self.seen.insert(icao, ());
    }

    pub fn is_known(&self, icao: &Icao) -> bool {
        self.seen.contains_key(icao)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ModeFrame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrcVerdict {
    /// Explicit address, parity matches.
    Clean,
    /// Address recovered from parity and seen recently in a clean frame.
    AddressMatched,
    /// Explicit address, parity does not match.
    Failed,
    /// Address recovered from parity but not vouched for.
    UnknownAddress,
}

impl CrcVerdict {
    pub fn is_trusted(self) -> bool {
        matches!(self, CrcVerdict::Clean | CrcVerdict::AddressMatched)
    }
}

/// A Mode S frame that passed length and format checks.
#[derive(Debug, Clone)]
pub struct ModeFrame {
    /// Downlink Format
    pub df: u8,
    /// 3-byte ICAO address
    pub icao: Icao,
    /// Full message bytes
    pub raw: Vec<u8>,
    /// Unix timestamp
    pub timestamp: f64,
    /// Message length in bits (56 or 112)
    pub msg_bits: usize,
    /// Payload parity XOR the PI field
    pub residual: u32,
    pub verdict: CrcVerdict,
}

impl ModeFrame {
    /// Human-readable Downlink Format name.
    pub fn df_name(&self) -> &'static str {
        df_info(self.df).map_or("Unknown", |info| info.name)
    }

    pub fn crc_ok(&self) -> bool {
        self.verdict.is_trusted()
    }

    /// True if this is an ADS-B extended squitter (DF17).
    pub fn is_adsb(&self) -> bool {
        self.df == 17
    }

    /// True if this is a 112-bit (long) message.
    pub fn is_long(&self) -> bool {
        self.msg_bits == 112
    }

    /// Message Extended field (bytes 4-10) for long frames, empty otherwise.
    pub fn me(&self) -> &[u8] {
        if self.is_long() {
            &self.raw[4..11]
        } else {
            &[]
        }
    }

    /// Capability / code format field (bits 5-7) of DF11/17/18.
    pub fn capability(&self) -> Option<u8> {
        if !DF_EXPLICIT_ICAO.contains(&self.df) {
            return None;
        }
        let mut bits = BitStream::new(&self.raw);
        bits.skip(5).ok()?;
        bits.read_u8(3).ok()
    }

    /// ADS-B Type Code (first 5 bits of ME). None for non-ADS-B.
    pub fn type_code(&self) -> Option<u8> {
        if (self.df != 17 && self.df != 18) || !self.is_long() {
            return None;
        }
        let mut bits = BitStream::new(&self.raw);
        bits.skip(32).ok()?;
        bits.read_u8(5).ok()
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Classify a raw frame and attach its CRC verdict.
///
/// Clean DF11/17/18 frames register their address in `cache`. Errors mean
/// the bytes are not a Mode S frame at all (wrong length, unknown DF).
pub fn parse_frame(bytes: &[u8], timestamp: f64, cache: &IcaoCache) -> Result<ModeFrame> {
    let msg_bits = bytes.len() * 8;
    if msg_bits != 56 && msg_bits != 112 {
        return Err(AdsbError::InvalidLength(msg_bits));
    }

    let mut bits = BitStream::new(bytes);
    let df = bits.read_u8(5)?;
    let info = df_info(df).ok_or(AdsbError::UnknownFormat(df))?;
    if msg_bits != info.bits {
        return Err(AdsbError::InvalidLength(msg_bits));
    }

    let residual = crc::mode_s_residual(bytes);

    let (icao, verdict) = if DF_EXPLICIT_ICAO.contains(&df) {
        bits.skip(3)?;
        let icao = icao_from_u32(bits.read_u32(24)?);
        let clean = if df == 11 {
            residual & !DF11_IC_MASK == 0
        } else {
            residual == 0
        };
        if clean {
            cache.register(icao);
            (icao, CrcVerdict::Clean)
        } else {
            (icao, CrcVerdict::Failed)
        }
    } else if DF_RESIDUAL_ICAO.contains(&df) {
        let icao = icao_from_u32(residual);
        if cache.is_known(&icao) {
            (icao, CrcVerdict::AddressMatched)
        } else {
            (icao, CrcVerdict::UnknownAddress)
        }
    } else {
        return Err(AdsbError::UnknownFormat(df));
    };

    Ok(ModeFrame {
        df,
        icao,
        raw: bytes.to_vec(),
        timestamp,
        msg_bits,
        residual,
        verdict,
    })
}

/// Parse a frame written as hex (14 or 28 characters).
pub fn parse_hex(hex: &str, timestamp: f64, cache: &IcaoCache) -> Result<ModeFrame> {
    let bytes = hex_decode(hex).ok_or_else(|| AdsbError::InvalidHex(hex.trim().to_string()))?;
    parse_frame(&bytes, timestamp, cache)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
