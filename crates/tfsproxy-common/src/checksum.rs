//! Checksum utilities for tfsproxy
//!
//! The storage protocol uses a CRC-32 over the IEEE polynomial that is
//! neither pre- nor post-inverted and is seeded with the packet flag. The
//! same routine accumulates the per-segment data checksum sent on close.
//! Meta server selection uses `MurmurHash2` with a fixed seed.

/// Seed used by both the packet header CRC and the segment data CRC
pub const CRC_SEED: u32 = 0x4E53_4654;

/// Seed for the meta server hash
pub const MURMUR_SEED: u32 = 97;

const MURMUR_M: u32 = 0x5bd1_e995;

/// Compute the protocol CRC of `data` starting from `seed`
#[must_use]
pub fn tfs_crc(seed: u32, data: &[u8]) -> u32 {
    let mut crc = ProtocolCrc::with_seed(seed);
    crc.update(data);
    crc.value()
}

/// Streaming protocol CRC calculator
///
/// Feeding the data in several pieces yields the same value as a single
/// [`tfs_crc`] call over the concatenation.
#[derive(Clone, Debug)]
pub struct ProtocolCrc {
    hasher: crc32fast::Hasher,
}

impl ProtocolCrc {
    /// Create a calculator seeded with [`CRC_SEED`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(CRC_SEED)
    }

    /// Create a calculator with an explicit seed
    #[must_use]
    pub fn with_seed(seed: u32) -> Self {
        // crc32fast inverts on entry and exit, so both are cancelled here.
        Self {
            hasher: crc32fast::Hasher::new_with_initial(!seed),
        }
    }

    /// Update with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Current value without consuming the calculator
    #[must_use]
    pub fn value(&self) -> u32 {
        !self.hasher.clone().finalize()
    }
}

impl Default for ProtocolCrc {
    fn default() -> Self {
        Self::new()
    }
}

/// `MurmurHash2` (32 bit, little-endian block reads) with [`MURMUR_SEED`]
#[must_use]
pub fn murmur_hash2(data: &[u8]) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let mut h = MURMUR_SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(MURMUR_M);
        k ^= k >> 24;
        k = k.wrapping_mul(MURMUR_M);

        h = h.wrapping_mul(MURMUR_M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        if tail.len() >= 3 {
            h ^= u32::from(tail[2]) << 16;
        }
        if tail.len() >= 2 {
            h ^= u32::from(tail[1]) << 8;
        }
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(MURMUR_M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(MURMUR_M);
    h ^= h >> 15;
    h
}
