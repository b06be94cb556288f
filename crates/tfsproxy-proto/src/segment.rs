//! Segment directory of a large file
//!
//! A large raw file is stored as data segments in ordinary blocks plus one
//! directory segment, written last, that lists them:
//!
//! ```text
//! count:u32 | size:u64 | reserve[64]
//! { block_id:u32 | file_id:u64 | offset:i64 | size:u32 | crc:u32 } * count
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tfsproxy_common::{BlockId, Error, FileId, Result};

/// Size of the directory head
pub const SEGMENT_HEAD_SIZE: usize = 76;

/// Size of one directory entry
pub const SEGMENT_INFO_SIZE: usize = 28;

const RESERVE_SIZE: usize = 64;

/// Location of one stored data segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentInfo {
    pub block_id: BlockId,
    pub file_id: FileId,
    /// Offset of the segment inside the logical file
    pub offset: i64,
    pub size: u32,
    pub crc: u32,
}

impl SegmentInfo {
    /// Offset just past the segment
    #[must_use]
    pub fn end(&self) -> i64 {
        self.offset + i64::from(self.size)
    }
}

/// Decoded directory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentDirectory {
    /// Total size of all data segments
    pub size: u64,
    pub segments: Vec<SegmentInfo>,
}

impl SegmentDirectory {
    /// Encoded length of a directory with `count` entries
    #[must_use]
    pub const fn encoded_len(count: usize) -> usize {
        SEGMENT_HEAD_SIZE + count * SEGMENT_INFO_SIZE
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(self.segments.len()));
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.segments.len() as u32);
        buf.put_u64_le(self.size);
        buf.put_bytes(0, RESERVE_SIZE);
        for seg in &self.segments {
            buf.put_u32_le(seg.block_id);
            buf.put_u64_le(seg.file_id);
            buf.put_i64_le(seg.offset);
            buf.put_u32_le(seg.size);
            buf.put_u32_le(seg.crc);
        }
        buf.freeze()
    }

    /// Decode a directory. The head must be followed by exactly `count`
    /// entries whose offsets ascend without overlap.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < SEGMENT_HEAD_SIZE {
            return Err(Error::decode(format!(
                "segment head needs {SEGMENT_HEAD_SIZE} bytes, have {}",
                data.len()
            )));
        }
        let count = data.get_u32_le() as usize;
        let size = data.get_u64_le();
        data.advance(RESERVE_SIZE);

        if data.len() != count * SEGMENT_INFO_SIZE {
            return Err(Error::decode(format!(
                "segment directory of {count} entries has {} entry bytes",
                data.len()
            )));
        }

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let seg = SegmentInfo {
                block_id: data.get_u32_le(),
                file_id: data.get_u64_le(),
                offset: data.get_i64_le(),
                size: data.get_u32_le(),
                crc: data.get_u32_le(),
            };
            if let Some(prev) = segments.last().map(SegmentInfo::end) {
                if seg.offset < prev {
                    return Err(Error::Corrupted(format!(
                        "segment at {} overlaps previous end {prev}",
                        seg.offset
                    )));
                }
            }
            segments.push(seg);
        }

        Ok(Self { size, segments })
    }

    /// Offset just past the last segment
    #[must_use]
    pub fn end(&self) -> i64 {
        self.segments.last().map_or(0, SegmentInfo::end)
    }
}
