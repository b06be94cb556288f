//! Raw file names
//!
//! A raw file is addressed by an 18 character name: a type letter (`T` for
//! small files, `L` for large ones), the cluster id digit, and 16 symbols
//! that encode `block_id:u32 | seq_id:u32 | suffix:u32` after masking. Any
//! characters past the 18th are a client suffix whose hash fills the
//! `suffix` field.

use std::fmt;

use tfsproxy_common::{BlockId, Error, FileId, Result};

/// Length of a name without suffix
pub const FILE_NAME_LEN: usize = 18;

const ENCODED_BITS_LEN: usize = 12;

const KEY_MASK: &[u8; 10] = b"Taobao-inc";

const ENC_TABLE: &[u8; 64] = b"0JoU8EaN3xf19hIS2d.6pZRFBYurMDGw7K5m4CyXsbQjg_vTOAkcHVtzqWilnLPe";

#[allow(clippy::cast_possible_truncation)]
const DEC_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < ENC_TABLE.len() {
        table[ENC_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Small or large raw file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RawFileKind {
    Small,
    Large,
}

impl RawFileKind {
    const fn key_char(self) -> u8 {
        match self {
            Self::Small => b'T',
            Self::Large => b'L',
        }
    }

    const fn from_key_char(c: u8) -> Option<Self> {
        match c {
            b'T' => Some(Self::Small),
            b'L' => Some(Self::Large),
            _ => None,
        }
    }
}

/// Decoded raw file name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawFsName {
    pub kind: RawFileKind,
    pub cluster_id: u32,
    pub block_id: BlockId,
    pub seq_id: u32,
    pub suffix: u32,
}

impl RawFsName {
    /// Name for a freshly created file
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(kind: RawFileKind, cluster_id: u32, block_id: BlockId, file_id: FileId) -> Self {
        Self {
            kind,
            cluster_id,
            block_id,
            seq_id: file_id as u32,
            suffix: (file_id >> 32) as u32,
        }
    }

    /// Parse `name`, optionally checked against a separately supplied
    /// suffix. When both carry a suffix they must agree.
    pub fn parse(name: &str, suffix: Option<&str>) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.len() < FILE_NAME_LEN {
            return Err(Error::invalid_argument(format!("invalid file name \"{name}\"")));
        }
        let kind = RawFileKind::from_key_char(raw[0])
            .ok_or_else(|| Error::invalid_argument(format!("invalid file name \"{name}\"")))?;

        let name_suffix = &raw[FILE_NAME_LEN..];
        if let Some(given) = suffix {
            if !name_suffix.is_empty() && given.as_bytes() != name_suffix {
                return Err(Error::invalid_argument(format!(
                    "suffix \"{given}\" does not match file name \"{name}\""
                )));
            }
        }

        let bits = decode(&raw[2..FILE_NAME_LEN]);
        let mut parsed = Self {
            kind,
            cluster_id: u32::from(raw[1].wrapping_sub(b'0')),
            block_id: u32::from_le_bytes([bits[0], bits[1], bits[2], bits[3]]),
            seq_id: u32::from_le_bytes([bits[4], bits[5], bits[6], bits[7]]),
            suffix: u32::from_le_bytes([bits[8], bits[9], bits[10], bits[11]]),
        };

        let suffix = suffix.map_or(name_suffix, str::as_bytes);
        if !suffix.is_empty() {
            parsed.suffix = suffix_hash(suffix);
        }
        Ok(parsed)
    }

    #[must_use]
    pub const fn is_large(&self) -> bool {
        matches!(self.kind, RawFileKind::Large)
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        ((self.suffix as u64) << 32) | self.seq_id as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn set_file_id(&mut self, file_id: FileId) {
        self.suffix = (file_id >> 32) as u32;
        self.seq_id = file_id as u32;
    }

    /// Encoded name; `simple` drops the suffix bits
    #[must_use]
    pub fn name(&self, simple: bool) -> String {
        let suffix = if simple { 0 } else { self.suffix };
        let mut bits = [0u8; ENCODED_BITS_LEN];
        bits[..4].copy_from_slice(&self.block_id.to_le_bytes());
        bits[4..8].copy_from_slice(&self.seq_id.to_le_bytes());
        bits[8..].copy_from_slice(&suffix.to_le_bytes());

        let mut out = String::with_capacity(FILE_NAME_LEN);
        out.push(char::from(self.kind.key_char()));
        #[allow(clippy::cast_possible_truncation)]
        out.push(char::from(b'0'.wrapping_add(self.cluster_id as u8)));
        out.extend(encode(&bits).iter().map(|c| char::from(*c)));
        out
    }
}

impl fmt::Display for RawFsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name(false))
    }
}

/// Hash of a client suffix; the high bit is always set
#[must_use]
pub fn suffix_hash(suffix: &[u8]) -> u32 {
    if suffix.is_empty() {
        return 0;
    }
    let h = suffix
        .iter()
        .fold(0i32, |h, c| h.wrapping_add(i32::from(*c)).wrapping_mul(7));
    #[allow(clippy::cast_sign_loss)]
    let h = h as u32;
    h | 0x8000_0000
}

fn mask(data: &mut [u8; ENCODED_BITS_LEN]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= KEY_MASK[i % KEY_MASK.len()];
    }
}

fn encode(bits: &[u8; ENCODED_BITS_LEN]) -> [u8; 16] {
    let mut buf = *bits;
    mask(&mut buf);
    let mut out = [0u8; 16];
    for (group, chunk) in buf.chunks_exact(3).enumerate() {
        let value = (u32::from(chunk[0]) << 16) | (u32::from(chunk[1]) << 8) | u32::from(chunk[2]);
        let o = &mut out[group * 4..group * 4 + 4];
        o[0] = ENC_TABLE[(value >> 18) as usize];
        o[1] = ENC_TABLE[((value >> 12) & 0x3f) as usize];
        o[2] = ENC_TABLE[((value >> 6) & 0x3f) as usize];
        o[3] = ENC_TABLE[(value & 0x3f) as usize];
    }
    out
}

fn decode(symbols: &[u8]) -> [u8; ENCODED_BITS_LEN] {
    let mut buf = [0u8; ENCODED_BITS_LEN];
    for (group, chunk) in symbols.chunks_exact(4).enumerate() {
        let value = (u32::from(DEC_TABLE[chunk[0] as usize]) << 18)
            | (u32::from(DEC_TABLE[chunk[1] as usize]) << 12)
            | (u32::from(DEC_TABLE[chunk[2] as usize]) << 6)
            | u32::from(DEC_TABLE[chunk[3] as usize]);
        let [_, b0, b1, b2] = value.to_be_bytes();
        buf[group * 3..group * 3 + 3].copy_from_slice(&[b0, b1, b2]);
    }
    mask(&mut buf);
    buf
}
