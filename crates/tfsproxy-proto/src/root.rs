//! Root server messages
//!
//! The root server hands out the meta table: a zlib-compressed array of
//! [`META_SERVER_COUNT`] meta server addresses. A user's meta server is
//! picked by hashing `(app_id, user_id)` into that table.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tfsproxy_common::{AppId, Error, Result, ServerAddr, murmur_hash2};

use crate::codec::{Frame, MessageType, PacketBuilder};
use crate::status;

/// Number of slots in the meta table
pub const META_SERVER_COUNT: usize = 10240;

/// Meta server table as served by the root server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaTable {
    pub version: u64,
    pub servers: Vec<ServerAddr>,
}

impl MetaTable {
    /// Meta server responsible for `(app_id, user_id)`
    #[must_use]
    pub fn select(&self, app_id: AppId, user_id: u64) -> ServerAddr {
        self.servers[meta_index(app_id, user_id, self.servers.len())]
    }
}

/// Table slot for `(app_id, user_id)`; ids are hashed in network order
#[must_use]
pub fn meta_index(app_id: AppId, user_id: u64, slots: usize) -> usize {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&app_id.to_be_bytes());
    key[8..].copy_from_slice(&user_id.to_be_bytes());
    murmur_hash2(&key) as usize % slots.max(1)
}

/// Encode a meta table request (one reserved byte)
#[must_use]
pub fn encode_get_table() -> Bytes {
    let mut b = PacketBuilder::new(MessageType::REQ_RT_GET_TABLE);
    b.put_u8(0);
    b.finish()
}

/// Decode the meta table answer
pub fn parse_table(frame: &Frame) -> Result<MetaTable> {
    status::check(frame, "get meta table")?;
    frame.expect(MessageType::RSP_RT_GET_TABLE)?;
    let mut r = frame.reader();
    let version = r.u64()?;
    let length = usize::try_from(r.u64()?)
        .map_err(|_| Error::decode("meta table length overflows"))?;
    let compressed = r.bytes(length)?;

    let mut raw = Vec::with_capacity(META_SERVER_COUNT * 8);
    ZlibDecoder::new(compressed)
        .take((META_SERVER_COUNT * 8) as u64)
        .read_to_end(&mut raw)
        .map_err(|e| Error::decode(format!("meta table uncompress failed: {e}")))?;
    if raw.len() != META_SERVER_COUNT * 8 {
        return Err(Error::decode(format!(
            "meta table has {} bytes, expected {}",
            raw.len(),
            META_SERVER_COUNT * 8
        )));
    }

    let servers = raw
        .chunks_exact(8)
        .map(|c| ServerAddr::from_raw(u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])))
        .collect();
    Ok(MetaTable { version, servers })
}

/// Build a meta table answer
pub fn table_response(table: &MetaTable) -> Result<PacketBuilder> {
    let mut raw = BytesMut::with_capacity(table.servers.len() * 8);
    for addr in &table.servers {
        raw.put_u64_le(addr.raw());
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    let mut b = PacketBuilder::new(MessageType::RSP_RT_GET_TABLE);
    b.put_u64(table.version)
        .put_u64(compressed.len() as u64)
        .put_slice(&compressed);
    Ok(b)
}
