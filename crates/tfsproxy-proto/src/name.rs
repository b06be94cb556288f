//! Name server messages
//!
//! The name server resolves a block id to its replica list. Write-intent
//! lookups also return the block version and a lease id that the data
//! server checks on write and close.

use bytes::Bytes;
use tfsproxy_common::{BlockId, Error, Result, ServerAddr};

use crate::codec::{Frame, MessageType, PacketBuilder, Reader};
use crate::status;

/// Open mode bits sent with block lookups
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct OpenMode(pub u32);

impl OpenMode {
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const CREATE: Self = Self(4);
    pub const NEWBLK: Self = Self(8);
    pub const NOLEASE: Self = Self(16);
    pub const STAT: Self = Self(32);
    pub const LARGE: Self = Self(64);
    pub const UNLINK: Self = Self(128);

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Lookups whose answers carry version and lease slots
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Lookups whose answers may be cached
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        self.contains(Self::READ) || self.contains(Self::STAT)
    }
}

/// Number of trailing slots (flag, version, lease) in a write answer
const LEASE_SLOTS: u32 = 3;

/// Replica list of one block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub ds_addrs: Vec<ServerAddr>,
    /// Block version; only set by write-intent lookups
    pub version: i32,
    /// Lease id; only set by write-intent lookups
    pub lease_id: i32,
}

impl BlockInfo {
    fn parse_entry(r: &mut Reader<'_>, block_id: BlockId, mode: OpenMode) -> Result<Self> {
        let ds_count = r.u32()?;
        let addr_count = if mode.is_write() {
            if ds_count <= LEASE_SLOTS {
                return Err(Error::status(
                    tfsproxy_common::StatusCode::GENERAL,
                    format!("block {block_id}: write lookup returned {ds_count} slots"),
                ));
            }
            ds_count - LEASE_SLOTS
        } else {
            if ds_count == 0 {
                return Err(Error::status(
                    tfsproxy_common::StatusCode::GENERAL,
                    format!("block {block_id}: no data servers"),
                ));
            }
            ds_count
        };

        if addr_count as usize > r.remaining() / 8 {
            return Err(Error::decode(format!(
                "block {block_id}: {addr_count} replicas exceed the {} bytes left",
                r.remaining()
            )));
        }
        let ds_addrs = (0..addr_count)
            .map(|_| r.addr())
            .collect::<Result<Vec<_>>>()?;

        let (version, lease_id) = if mode.is_write() {
            // flag slot is unused
            r.u64()?;
            let version = low_i32(r.u64()?);
            let lease_id = low_i32(r.u64()?);
            (version, lease_id)
        } else {
            (0, 0)
        };

        Ok(Self {
            block_id,
            ds_addrs,
            version,
            lease_id,
        })
    }

    fn encode_entry(&self, b: &mut PacketBuilder, write: bool) {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.ds_addrs.len() as u32;
        b.put_u32(if write { count + LEASE_SLOTS } else { count });
        for addr in &self.ds_addrs {
            b.put_addr(*addr);
        }
        if write {
            b.put_u64(u64::MAX)
                .put_u64(u64::from(self.version as u32))
                .put_u64(u64::from(self.lease_id as u32));
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn low_i32(v: u64) -> i32 {
    v as u32 as i32
}

/// Encode a single block lookup
#[must_use]
pub fn encode_get_block_info(mode: OpenMode, block_id: BlockId) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::GET_BLOCK_INFO);
    b.put_u32(mode.0).put_u32(block_id).put_u32(0);
    b.finish()
}

/// Decode a single block lookup answer
pub fn parse_block_info(frame: &Frame, mode: OpenMode) -> Result<BlockInfo> {
    status::check(frame, "get block info (name server)")?;
    frame.expect(MessageType::SET_BLOCK_INFO)?;
    let mut r = frame.reader();
    let block_id = r.u32()?;
    BlockInfo::parse_entry(&mut r, block_id, mode)
}

/// Build a single block lookup answer
#[must_use]
pub fn block_info_response(info: &BlockInfo, write: bool) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::SET_BLOCK_INFO);
    b.put_u32(info.block_id);
    info.encode_entry(&mut b, write);
    b
}

/// Encode a batch lookup. Writes ask for `count` new blocks with zero ids.
#[must_use]
pub fn encode_batch_get_block_info(mode: OpenMode, block_ids: &[BlockId]) -> Bytes {
    let mut b = PacketBuilder::with_capacity(
        MessageType::BATCH_GET_BLOCK_INFO,
        8 + block_ids.len() * 4,
    );
    #[allow(clippy::cast_possible_truncation)]
    b.put_u32(mode.0).put_u32(block_ids.len() as u32);
    for id in block_ids {
        b.put_u32(*id);
    }
    b.finish()
}

/// Decode a batch lookup answer, in server order
pub fn parse_batch_block_info(frame: &Frame, mode: OpenMode) -> Result<Vec<BlockInfo>> {
    status::check(frame, "batch get block info (name server)")?;
    frame.expect(MessageType::BATCH_SET_BLOCK_INFO)?;
    let mut r = frame.reader();
    // block_id, ds_count and at least one address
    let count = r.count(16, "batch block")?;
    let mut infos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let block_id = r.u32()?;
        infos.push(BlockInfo::parse_entry(&mut r, block_id, mode)?);
    }
    Ok(infos)
}

/// Build a batch lookup answer
#[must_use]
pub fn batch_block_info_response(infos: &[BlockInfo], write: bool) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::BATCH_SET_BLOCK_INFO);
    #[allow(clippy::cast_possible_truncation)]
    b.put_u32(infos.len() as u32);
    for info in infos {
        b.put_u32(info.block_id);
        info.encode_entry(&mut b, write);
    }
    b
}

/// Control sub-commands answered with a number in a status message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientCmd {
    GetClusterId,
    GetGroupCount,
    GetGroupSeq,
}

impl ClientCmd {
    const SET_PARAM: i32 = 6;

    #[must_use]
    pub const fn wire_value(self) -> i32 {
        match self {
            Self::GetClusterId => 20,
            Self::GetGroupCount => 22,
            Self::GetGroupSeq => 23,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetClusterId => "get cluster id",
            Self::GetGroupCount => "get group count",
            Self::GetGroupSeq => "get group seq",
        }
    }
}

/// Encode a control command
#[must_use]
pub fn encode_client_cmd(cmd: ClientCmd) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::CLIENT_CMD);
    b.put_i32(ClientCmd::SET_PARAM)
        .put_i64(0)
        .put_i32(cmd.wire_value())
        .put_i32(0)
        .put_i64(0);
    b.finish()
}

/// Decode a control command answer.
///
/// The cluster id is published as a character code. A non-positive group
/// count means an old name server and is read as a single group; a
/// negative group sequence is read as zero.
pub fn parse_client_cmd(frame: &Frame, cmd: ClientCmd) -> Result<i32> {
    let reply = status::expect_ok(frame, cmd.as_str())?;
    let value = reply.value();
    match cmd {
        ClientCmd::GetClusterId => value
            .and_then(|v| i32::try_from(v - i64::from(b'0')).ok())
            .ok_or_else(|| Error::decode(format!("invalid cluster id \"{}\"", reply.error))),
        ClientCmd::GetGroupCount => Ok(value
            .and_then(|v| i32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(1)),
        ClientCmd::GetGroupSeq => Ok(value
            .and_then(|v| i32::try_from(v).ok())
            .filter(|v| *v >= 0)
            .unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoded, HEADER_SIZE};
    use bytes::BytesMut;
    use tfsproxy_common::StatusCode;

    fn addrs(n: u8) -> Vec<ServerAddr> {
        (1..=n)
            .map(|i| ServerAddr::new([10, 0, 0, i].into(), 3200))
            .collect()
    }

    #[test]
    fn test_block_info_read() {
        let info = BlockInfo {
            block_id: 77,
            ds_addrs: addrs(3),
            ..Default::default()
        };
        let frame = block_info_response(&info, false).into_frame();
        assert_eq!(parse_block_info(&frame, OpenMode::READ).unwrap(), info);
    }

    #[test]
    fn test_block_info_write_lease() {
        let info = BlockInfo {
            block_id: 78,
            ds_addrs: addrs(2),
            version: 5,
            lease_id: 9001,
        };
        let frame = block_info_response(&info, true).into_frame();
        let mode = OpenMode::WRITE.union(OpenMode::CREATE);
        assert_eq!(parse_block_info(&frame, mode).unwrap(), info);
    }

    #[test]
    fn test_write_lookup_without_replicas() {
        let info = BlockInfo {
            block_id: 1,
            ..Default::default()
        };
        let frame = block_info_response(&info, true).into_frame();
        let err = parse_block_info(&frame, OpenMode::WRITE).unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::GENERAL));
    }

    #[test]
    fn test_block_info_status() {
        let frame = status::frame(StatusCode::NO_BLOCK, "block not exist");
        let err = parse_block_info(&frame, OpenMode::READ).unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::NO_BLOCK));
    }

    #[test]
    fn test_batch_request_layout() {
        let packet = encode_batch_get_block_info(OpenMode::READ, &[4, 5, 6]);
        assert_eq!(packet.len(), HEADER_SIZE + 8 + 12);
        let mut buf = BytesMut::from(&packet[..]);
        let Decoded::Complete(frame) = Frame::decode(&mut buf).unwrap() else {
            panic!("complete packet");
        };
        let mut r = frame.reader();
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(r.u32().unwrap(), 3);
        assert_eq!(r.u32().unwrap(), 4);
    }

    #[test]
    fn test_batch_block_info() {
        let infos: Vec<BlockInfo> = (0..3)
            .map(|i| BlockInfo {
                block_id: 100 + i,
                ds_addrs: addrs(2),
                version: 1,
                lease_id: 40 + i as i32,
            })
            .collect();
        let frame = batch_block_info_response(&infos, true).into_frame();
        assert_eq!(parse_batch_block_info(&frame, OpenMode::WRITE).unwrap(), infos);
    }

    #[test]
    fn test_batch_count_larger_than_body() {
        let mut b = PacketBuilder::new(MessageType::BATCH_SET_BLOCK_INFO);
        b.put_u32(u32::MAX).put_u32(100).put_u32(1).put_u64(7);
        let frame = b.into_frame();
        assert!(matches!(
            parse_batch_block_info(&frame, OpenMode::READ),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_replica_count_larger_than_body() {
        let mut b = PacketBuilder::new(MessageType::SET_BLOCK_INFO);
        b.put_u32(100).put_u32(u32::MAX).put_u64(7);
        let frame = b.into_frame();
        assert!(matches!(
            parse_block_info(&frame, OpenMode::READ),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_client_cmd() {
        let frame = status::frame(StatusCode::OK, "49");
        assert_eq!(parse_client_cmd(&frame, ClientCmd::GetClusterId).unwrap(), 1);

        let frame = status::frame(StatusCode::OK, "0");
        assert_eq!(parse_client_cmd(&frame, ClientCmd::GetGroupCount).unwrap(), 1);

        let frame = status::frame(StatusCode::OK, "-3");
        assert_eq!(parse_client_cmd(&frame, ClientCmd::GetGroupSeq).unwrap(), 0);

        let frame = status::frame(StatusCode::OK, "abc");
        assert!(parse_client_cmd(&frame, ClientCmd::GetClusterId).is_err());

        let packet = encode_client_cmd(ClientCmd::GetGroupSeq);
        assert_eq!(packet.len(), HEADER_SIZE + 28);
    }
}
