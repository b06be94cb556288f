//! Segment planner
//!
//! Maps a byte range onto the segments that store it. Large raw files keep
//! their layout in a [`SegmentDirectory`]; named files get theirs from the
//! meta server as fragment lists, which may leave holes.

use bytes::Bytes;
use tfsproxy_common::{Error, Result, StatusCode};
use tfsproxy_proto::meta::FragMeta;
use tfsproxy_proto::{BlockInfo, SegmentDirectory, SegmentInfo};

use crate::block_cache::Provenance;

/// One contiguous piece of a file stored in exactly one block
#[derive(Debug, Clone)]
pub struct Segment {
    /// Position in the plan; output is emitted in this order
    pub index: usize,
    pub info: SegmentInfo,
    /// Offset inside the segment where the operation starts
    pub oper_offset: u32,
    /// Bytes the operation moves
    pub oper_size: u32,
    /// Replica list once resolved
    pub block: Option<BlockInfo>,
    pub provenance: Provenance,
    /// Payload for writes
    pub data: Bytes,
}

impl Segment {
    fn new(index: usize, info: SegmentInfo) -> Self {
        Self {
            index,
            oper_offset: 0,
            oper_size: info.size,
            info,
            block: None,
            provenance: Provenance::Network,
            data: Bytes::new(),
        }
    }

    /// File offset of the first byte the operation touches
    #[must_use]
    pub fn file_offset(&self) -> u64 {
        u64::try_from(self.info.offset).unwrap_or_default() + u64::from(self.oper_offset)
    }
}

/// Segments of a large raw file overlapping `[offset, offset + length)`.
///
/// `None` reads to the end of the file. Reading at the end yields nothing;
/// reading past it is a READ_OFFSET error.
pub fn plan_read(dir: &SegmentDirectory, offset: u64, length: Option<u64>) -> Result<Vec<Segment>> {
    let size = dir.size;
    if offset > size {
        return Err(Error::status(
            StatusCode::READ_OFFSET,
            format!("read offset {offset} beyond file size {size}"),
        ));
    }
    let end = length.map_or(size, |len| offset.saturating_add(len).min(size));
    if end <= offset {
        return Ok(Vec::new());
    }
    Ok(clip(&dir.segments, offset, end))
}

fn clip(segments: &[SegmentInfo], offset: u64, end: u64) -> Vec<Segment> {
    let start = to_i64(offset);
    let stop = to_i64(end);
    let first = segments.partition_point(|s| s.end() <= start);
    let last = segments.partition_point(|s| s.offset < stop);

    segments[first..last.max(first)]
        .iter()
        .enumerate()
        .map(|(index, info)| {
            let from = start.max(info.offset);
            let to = stop.min(info.end());
            let mut segment = Segment::new(index, *info);
            segment.oper_offset = u32::try_from(from - info.offset).unwrap_or_default();
            segment.oper_size = u32::try_from(to - from).unwrap_or_default();
            segment
        })
        .collect()
}

/// Data segments of a write plus the slot reserved for the directory
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub segments: Vec<Segment>,
    /// First file offset covered by the plan
    pub base_offset: u64,
    /// Payload length
    pub size: u64,
}

impl WritePlan {
    /// Index of the trailing directory segment
    #[must_use]
    pub fn directory_slot(&self) -> usize {
        self.segments.len()
    }

    /// The directory segment describing `written`, to be stored last
    #[must_use]
    pub fn directory(&self, written: &[SegmentInfo]) -> Segment {
        let dir = SegmentDirectory {
            size: self.base_offset + self.size,
            segments: written.to_vec(),
        };
        let data = dir.encode();
        let info = SegmentInfo {
            block_id: 0,
            file_id: 0,
            offset: 0,
            size: u32::try_from(data.len()).unwrap_or(u32::MAX),
            crc: 0,
        };
        let mut segment = Segment::new(self.directory_slot(), info);
        segment.data = data;
        segment
    }
}

/// Split `payload`, written at `base_offset`, into fragments of at most
/// `fragment_size` bytes
#[must_use]
pub fn plan_write(payload: &Bytes, base_offset: u64, fragment_size: u64) -> WritePlan {
    let step = usize::try_from(fragment_size.max(1)).unwrap_or(usize::MAX);
    let mut segments = Vec::with_capacity(payload.len().div_ceil(step));
    let mut pos = 0;
    while pos < payload.len() {
        let len = step.min(payload.len() - pos);
        let info = SegmentInfo {
            block_id: 0,
            file_id: 0,
            offset: to_i64(base_offset + pos as u64),
            size: u32::try_from(len).unwrap_or(u32::MAX),
            crc: 0,
        };
        let mut segment = Segment::new(segments.len(), info);
        segment.data = payload.slice(pos..pos + len);
        segments.push(segment);
        pos += len;
    }
    WritePlan {
        segments,
        base_offset,
        size: payload.len() as u64,
    }
}

/// Gap between two fragments of a named file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    pub offset: u64,
    pub length: u64,
}

/// Fragments of a named file clipped to a range, with the holes between them
#[derive(Debug, Clone, Default)]
pub struct FragPlan {
    pub segments: Vec<Segment>,
    pub holes: Vec<Hole>,
}

/// Clip `frags` to `[offset, end)`. Holes are only reported between
/// fragments, never past the last one.
#[must_use]
pub fn plan_frags(frags: &[FragMeta], offset: u64, end: u64) -> FragPlan {
    let mut sorted: Vec<SegmentInfo> = frags
        .iter()
        .map(|f| SegmentInfo {
            block_id: f.block_id,
            file_id: f.file_id,
            offset: f.offset,
            size: f.size,
            crc: 0,
        })
        .collect();
    sorted.sort_by_key(|s| s.offset);

    let segments = clip(&sorted, offset, end);
    let mut holes = Vec::new();
    let mut cursor = offset;
    for segment in &segments {
        let at = segment.file_offset();
        if at > cursor {
            holes.push(Hole {
                offset: cursor,
                length: at - cursor,
            });
        }
        cursor = cursor.max(at + u64::from(segment.oper_size));
    }
    FragPlan { segments, holes }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
