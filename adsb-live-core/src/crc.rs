//! Table-driven checksums used to validate and tag frames.
//!
//! - CRC-16 CCITT: polynomial 0x1021, MSB-first, seed 0x0000 or 0xFFFF
//! - Mode S parity: polynomial 0xFFFA0480 in a 32-bit register, zero seed.
//!   The 24-bit parity is the top three bytes of the register.
//! - CRC-64: polynomial 0xC96C5795D7870F42 (reflected ECMA-182), all-ones
//!   seed and final inversion
//!
//! Every table is built at compile time, so all functions are pure. The
//! bit-by-bit variants exist to audit the tables, not for the hot path.

use crate::types::{AdsbError, Result};

/// Byte order for the byte-array checksum variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

fn window(bytes: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    offset
        .checked_add(length)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(AdsbError::OutOfBounds {
            offset,
            length,
            len: bytes.len(),
        })
}

// ---------------------------------------------------------------------------
// CRC-16 CCITT
// ---------------------------------------------------------------------------

const CCITT_POLYNOMIAL: u16 = 0x1021;

const fn build_ccitt_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CCITT_POLYNOMIAL;
            } else {
                crc <<= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CCITT_TABLE: [u16; 256] = build_ccitt_table();

/// CRC-16 CCITT with a fixed seed.
///
/// `Crc16Ccitt::new(Crc16Ccitt::SEED_ZERO)` is the XMODEM flavour,
/// `Crc16Ccitt::new(Crc16Ccitt::SEED_ONES)` the "CCITT-FALSE" flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16Ccitt {
    seed: u16,
}

impl Crc16Ccitt {
    pub const SEED_ZERO: u16 = 0x0000;
    pub const SEED_ONES: u16 = 0xFFFF;

    pub fn new(seed: u16) -> Self {
        Crc16Ccitt { seed }
    }

    pub fn seed(&self) -> u16 {
        self.seed
    }

    /// Checksum of a whole slice.
    pub fn checksum(&self, data: &[u8]) -> u16 {
        data.iter().fold(self.seed, |crc, &b| {
            (crc << 8) ^ CCITT_TABLE[((crc >> 8) ^ b as u16) as usize & 0xFF]
        })
    }

    /// Checksum of `length` bytes starting at `offset`.
    pub fn compute(&self, bytes: &[u8], offset: usize, length: usize) -> Result<u16> {
        Ok(self.checksum(window(bytes, offset, length)?))
    }

    /// Same result as `compute`, one bit at a time.
    pub fn compute_slow(&self, bytes: &[u8], offset: usize, length: usize) -> Result<u16> {
        let mut crc = self.seed;
        for &byte in window(bytes, offset, length)? {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ CCITT_POLYNOMIAL;
                } else {
                    crc <<= 1;
                }
            }
        }
        Ok(crc)
    }

    pub fn compute_bytes(
        &self,
        bytes: &[u8],
        offset: usize,
        length: usize,
        endian: Endian,
    ) -> Result<[u8; 2]> {
        let crc = self.compute(bytes, offset, length)?;
        Ok(match endian {
            Endian::Big => crc.to_be_bytes(),
            Endian::Little => crc.to_le_bytes(),
        })
    }
}

impl Default for Crc16Ccitt {
    fn default() -> Self {
        Crc16Ccitt::new(Self::SEED_ZERO)
    }
}

// ---------------------------------------------------------------------------
// Mode S parity
// ---------------------------------------------------------------------------

/// Generator x^24 + ... + 1 left-aligned in a 32-bit register.
const MODE_S_POLYNOMIAL: u32 = 0xFFFA0480;

const fn build_mode_s_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x8000_0000 != 0 {
                crc ^= MODE_S_POLYNOMIAL;
            }
            crc <<= 1;
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static MODE_S_TABLE: [u32; 256] = build_mode_s_table();

/// 24-bit Mode S parity of a payload (the frame minus its 3-byte PI field).
pub fn mode_s_parity(data: &[u8]) -> u32 {
    let crc = data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ MODE_S_TABLE[((crc >> 24) ^ b as u32) as usize & 0xFF]
    });
    crc >> 8
}

/// Parity of `length` bytes starting at `offset`.
pub fn mode_s_compute(bytes: &[u8], offset: usize, length: usize) -> Result<u32> {
    Ok(mode_s_parity(window(bytes, offset, length)?))
}

/// Parity as three bytes.
pub fn mode_s_compute_bytes(
    bytes: &[u8],
    offset: usize,
    length: usize,
    endian: Endian,
) -> Result<[u8; 3]> {
    let parity = mode_s_compute(bytes, offset, length)?;
    let [_, b1, b2, b3] = parity.to_be_bytes();
    Ok(match endian {
        Endian::Big => [b1, b2, b3],
        Endian::Little => [b3, b2, b1],
    })
}

/// Shift-register parity exactly as the ICAO reference describes it: load
/// the first 32 data bits, then for each of the 88 (long) or 32 (short)
/// data bits XOR the generator when the top bit is set and shift one left,
/// feeding the remaining data bits in from the right.
pub fn mode_s_parity_reference(data: &[u8]) -> u32 {
    let total_bits = data.len() * 8;
    let bit_at = |index: usize| -> u32 {
        if index < total_bits {
            ((data[index / 8] >> (7 - (index % 8))) & 1) as u32
        } else {
            0
        }
    };

    let mut register = 0u32;
    for index in 0..32 {
        register = (register << 1) | bit_at(index);
    }
    for i in 0..total_bits {
        if register & 0x8000_0000 != 0 {
            register ^= MODE_S_POLYNOMIAL;
        }
        register = (register << 1) | bit_at(i + 32);
    }
    register >> 8
}

/// Parity of the payload XOR the trailing PI field.
///
/// - DF11/17/18: 0 when the frame is intact (DF11 may carry an
///   interrogator code in the low bits).
/// - DF0/4/5/16/20/21: the aircraft's ICAO address.
///
/// Frames of three bytes or fewer have no payload; their raw value is returned.
pub fn mode_s_residual(frame: &[u8]) -> u32 {
    if frame.len() <= 3 {
        return frame.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32) & 0xFF_FFFF;
    }
    let payload_len = frame.len() - 3;
    let pi = (frame[payload_len] as u32) << 16
        | (frame[payload_len + 1] as u32) << 8
        | frame[payload_len + 2] as u32;
    mode_s_parity(&frame[..payload_len]) ^ pi
}

// ---------------------------------------------------------------------------
// CRC-64
// ---------------------------------------------------------------------------

const CRC64_POLYNOMIAL: u64 = 0xC96C5795D7870F42;

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC64_POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = build_crc64_table();

/// CRC-64 of a whole slice.
pub fn crc64(data: &[u8]) -> u64 {
    let crc = data.iter().fold(u64::MAX, |crc, &b| {
        CRC64_TABLE[((crc ^ b as u64) & 0xFF) as usize] ^ (crc >> 8)
    });
    !crc
}

pub fn crc64_compute(bytes: &[u8], offset: usize, length: usize) -> Result<u64> {
    Ok(crc64(window(bytes, offset, length)?))
}

pub fn crc64_compute_bytes(
    bytes: &[u8],
    offset: usize,
    length: usize,
    endian: Endian,
) -> Result<[u8; 8]> {
    let crc = crc64_compute(bytes, offset, length)?;
    Ok(match endian {
        Endian::Big => crc.to_be_bytes(),
        Endian::Little => crc.to_le_bytes(),
    })
}

/// CRC-64 as a 16-character uppercase hex string.
pub fn crc64_hex(bytes: &[u8], offset: usize, length: usize) -> Result<String> {
    Ok(format!("{:016X}", crc64_compute(bytes, offset, length)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hex_decode;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const CHECK_INPUT: &[u8] = b"123456789";

    const VALID_FRAMES: &[&str] = &[
        "8D4840D6202CC371C32CE0576098",
        "8D40621D58C382D690C8AC2863A7",
        "8D485020994409940838175B284F",
    ];

    fn random_bytes(rng: &mut StdRng, max_len: usize) -> Vec<u8> {
        let len = rng.random_range(0..=max_len);
        (0..len).map(|_| rng.random::<u8>()).collect()
    }

    #[test]
    fn test_ccitt_table_entries() {
        assert_eq!(CCITT_TABLE[0], 0);
        assert_eq!(CCITT_TABLE[1], CCITT_POLYNOMIAL);
    }

    #[test]
    fn test_ccitt_check_values() {
        let zero = Crc16Ccitt::new(Crc16Ccitt::SEED_ZERO);
        let ones = Crc16Ccitt::new(Crc16Ccitt::SEED_ONES);
        assert_eq!(zero.checksum(CHECK_INPUT), 0x31C3);
        assert_eq!(ones.checksum(CHECK_INPUT), 0x29B1);
    }

    #[test]
    fn test_ccitt_empty_input_is_seed() {
        let ones = Crc16Ccitt::new(Crc16Ccitt::SEED_ONES);
        assert_eq!(ones.compute(&[], 0, 0).unwrap(), 0xFFFF);
    }

    #[test]
    fn test_ccitt_table_agrees_with_bitwise() {
        let mut rng = StdRng::seed_from_u64(0x1021);
        for seed in [Crc16Ccitt::SEED_ZERO, Crc16Ccitt::SEED_ONES] {
            let crc = Crc16Ccitt::new(seed);
            for _ in 0..10_000 {
                let data = random_bytes(&mut rng, 64);
                let offset = if data.is_empty() { 0 } else { rng.random_range(0..data.len()) };
                let length = data.len() - offset;
                assert_eq!(
                    crc.compute(&data, offset, length).unwrap(),
                    crc.compute_slow(&data, offset, length).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_ccitt_offset_and_length() {
        let crc = Crc16Ccitt::default();
        let mut padded = vec![0xAA, 0xBB];
        padded.extend_from_slice(CHECK_INPUT);
        padded.push(0xCC);
        assert_eq!(crc.compute(&padded, 2, 9).unwrap(), 0x31C3);
    }

    #[test]
    fn test_ccitt_bytes_endianness() {
        let crc = Crc16Ccitt::new(Crc16Ccitt::SEED_ONES);
        let n = CHECK_INPUT.len();
        assert_eq!(crc.compute_bytes(CHECK_INPUT, 0, n, Endian::Big).unwrap(), [0x29, 0xB1]);
        assert_eq!(crc.compute_bytes(CHECK_INPUT, 0, n, Endian::Little).unwrap(), [0xB1, 0x29]);
    }

    #[test]
    fn test_out_of_bounds_window() {
        let crc = Crc16Ccitt::default();
        assert!(matches!(crc.compute(&[1, 2, 3], 2, 2), Err(AdsbError::OutOfBounds { .. })));
        assert!(matches!(
            mode_s_compute(&[1, 2, 3], usize::MAX, 2),
            Err(AdsbError::OutOfBounds { .. })
        ));
        assert!(crc64_compute(&[1, 2, 3], 4, 0).is_err());
    }

    #[test]
    fn test_mode_s_all_zero_message() {
        assert_eq!(mode_s_parity(&[0u8; 11]), 0);
        assert_eq!(mode_s_parity(&[0u8; 4]), 0);
        assert_eq!(mode_s_residual(&[0u8; 14]), 0);
        assert_eq!(mode_s_parity_reference(&[0u8; 11]), 0);
    }

    #[test]
    fn test_mode_s_table_entry_one_is_generator() {
        // 0xFFFA0480 << 1, the x^24 term shifted out
        assert_eq!(MODE_S_TABLE[1], 0xFFF40900);
    }

    #[test]
    fn test_mode_s_parity_matches_pi_field() {
        for hex in VALID_FRAMES {
            let data = hex_decode(hex).unwrap();
            let pi = (data[11] as u32) << 16 | (data[12] as u32) << 8 | data[13] as u32;
            assert_eq!(mode_s_compute(&data, 0, 11).unwrap(), pi, "{hex}");
            assert_eq!(mode_s_residual(&data), 0, "{hex}");
        }
    }

    #[test]
    fn test_mode_s_residual_detects_corruption() {
        let mut data = hex_decode(VALID_FRAMES[0]).unwrap();
        data[5] ^= 0x01;
        assert_ne!(mode_s_residual(&data), 0);
    }

    #[test]
    fn test_mode_s_reference_agrees_with_table() {
        let mut rng = StdRng::seed_from_u64(0xFFFA0480);
        for _ in 0..2_000 {
            for len in [4usize, 11] {
                let data: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
                assert_eq!(mode_s_parity(&data), mode_s_parity_reference(&data));
            }
        }
    }

    #[test]
    fn test_mode_s_bytes_endianness() {
        let data = hex_decode(VALID_FRAMES[0]).unwrap();
        assert_eq!(mode_s_compute_bytes(&data, 0, 11, Endian::Big).unwrap(), [0x57, 0x60, 0x98]);
        assert_eq!(mode_s_compute_bytes(&data, 0, 11, Endian::Little).unwrap(), [0x98, 0x60, 0x57]);
    }

    #[test]
    fn test_crc64_check_value() {
        assert_eq!(crc64(CHECK_INPUT), 0x995DC9BBDF1939FA);
        assert_eq!(crc64_hex(CHECK_INPUT, 0, 9).unwrap(), "995DC9BBDF1939FA");
    }

    #[test]
    fn test_crc64_hex_is_fixed_width() {
        let hex = crc64_hex(&[], 0, 0).unwrap();
        assert_eq!(hex.len(), 16);
        assert_eq!(hex, "0000000000000000");
    }

    #[test]
    fn test_crc64_bytes_endianness() {
        let be = crc64_compute_bytes(CHECK_INPUT, 0, 9, Endian::Big).unwrap();
        let le = crc64_compute_bytes(CHECK_INPUT, 0, 9, Endian::Little).unwrap();
        assert_eq!(be[0], 0x99);
        assert_eq!(le[0], 0xFA);
        assert_eq!(u64::from_be_bytes(be), u64::from_le_bytes(le));
    }

    #[test]
    fn test_repeated_calls_are_stable() {
        let data = hex_decode(VALID_FRAMES[1]).unwrap();
        let crc = Crc16Ccitt::new(Crc16Ccitt::SEED_ONES);
        for _ in 0..3 {
            assert_eq!(crc.checksum(&data), crc.checksum(&data));
            assert_eq!(crc64(&data), crc64(&data));
            assert_eq!(mode_s_parity(&data), mode_s_parity(&data));
        }
    }
}
