//! Data server messages
//!
//! Every request starts with `block_id:u32 | file_id:u64`. Writes, closes
//! and unlinks also carry the full replica list plus the block version and
//! lease id so that the master data server can replicate on its own.
//!
//! Read answers are decoded by [`ReadDecoder`], which accepts the payload in
//! arbitrary chunks. The v2 variant appends a file info trailer after the
//! data which may straddle two socket reads.

use bytes::{Bytes, BytesMut};
use tfsproxy_common::{BlockId, Error, FileId, Result, StatusCode};

use crate::codec::{Frame, MessageType, PacketBuilder, Reader};
use crate::name::BlockInfo;
use crate::status;

/// Size of an encoded [`RawFileInfo`]
pub const RAW_FILE_INFO_SIZE: usize = 36;

/// Size of the v2 read trailer (`file_info_len` plus the file info)
pub const READ_V2_TAIL_SIZE: usize = 4 + RAW_FILE_INFO_SIZE;

/// Mode of a close that commits the file
const CLOSE_FILE_MASTER: i32 = 100;

/// Data length value reported by old servers for a bad argument
const DS_INVALID_ARGUMENT: i32 = -22;

/// Read flags
pub const READ_STAT_NORMAL: u8 = 0;
pub const READ_STAT_FORCE: u8 = 1;

/// Stat modes
pub const STAT_NORMAL: u32 = 0;
pub const STAT_FORCE: u32 = 1;

/// File status flag bits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FileFlag(pub i32);

impl FileFlag {
    pub const NORMAL: Self = Self(0);
    pub const DELETED: Self = Self(1);
    pub const INVALID: Self = Self(2);
    pub const CONCEAL: Self = Self(4);

    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// A file that may still be removed or served
    #[must_use]
    pub const fn is_live(self) -> bool {
        self.0 == Self::NORMAL.0 || self.0 == Self::CONCEAL.0
    }
}

/// On-disk file record returned by stat and v2 reads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawFileInfo {
    pub id: FileId,
    pub offset: i32,
    pub size: i32,
    pub u_size: i32,
    pub modify_time: i32,
    pub create_time: i32,
    pub flag: FileFlag,
    pub crc: u32,
}

impl RawFileInfo {
    pub fn parse(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.u64()?,
            offset: r.i32()?,
            size: r.i32()?,
            u_size: r.i32()?,
            modify_time: r.i32()?,
            create_time: r.i32()?,
            flag: FileFlag(r.i32()?),
            crc: r.u32()?,
        })
    }

    pub fn encode(&self, b: &mut PacketBuilder) {
        b.put_u64(self.id)
            .put_i32(self.offset)
            .put_i32(self.size)
            .put_i32(self.u_size)
            .put_i32(self.modify_time)
            .put_i32(self.create_time)
            .put_i32(self.flag.0)
            .put_u32(self.crc);
    }
}

fn put_file(b: &mut PacketBuilder, block_id: BlockId, file_id: FileId) {
    b.put_u32(block_id).put_u64(file_id);
}

/// Replica list followed by flag, version and lease id
fn put_ds_list(b: &mut PacketBuilder, info: &BlockInfo) {
    #[allow(clippy::cast_possible_truncation)]
    b.put_u32(info.ds_addrs.len() as u32 + 3);
    for addr in &info.ds_addrs {
        b.put_addr(*addr);
    }
    #[allow(clippy::cast_sign_loss)]
    b.put_u64(u64::MAX)
        .put_u64(u64::from(info.version as u32))
        .put_u64(u64::from(info.lease_id as u32));
}

/// Answer to a create-file request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedFile {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub file_number: u64,
}

/// Encode a create-file request; a zero `file_id` asks for a new one
#[must_use]
pub fn encode_create_file(block_id: BlockId, file_id: FileId) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::CREATE_FILENAME);
    put_file(&mut b, block_id, file_id);
    b.finish()
}

pub fn parse_create_file(frame: &Frame) -> Result<CreatedFile> {
    status::check(frame, "create file name (data server)")?;
    frame.expect(MessageType::RESP_CREATE_FILENAME)?;
    let mut r = frame.reader();
    Ok(CreatedFile {
        block_id: r.u32()?,
        file_id: r.u64()?,
        file_number: r.u64()?,
    })
}

#[must_use]
pub fn create_file_response(created: &CreatedFile) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::RESP_CREATE_FILENAME);
    put_file(&mut b, created.block_id, created.file_id);
    b.put_u64(created.file_number);
    b
}

/// One write of `payload` at `offset` inside a created file
#[derive(Clone, Copy, Debug)]
pub struct WriteRequest<'a> {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub file_number: u64,
    pub offset: i32,
    pub payload: &'a [u8],
    pub block: &'a BlockInfo,
}

/// Encode a write. The header CRC runs over the request fields and then
/// the payload.
#[must_use]
pub fn encode_write(req: &WriteRequest<'_>) -> Bytes {
    let mut b = PacketBuilder::with_capacity(
        MessageType::WRITE_DATA,
        64 + req.block.ds_addrs.len() * 8 + req.payload.len(),
    );
    put_file(&mut b, req.block_id, req.file_id);
    #[allow(clippy::cast_possible_truncation)]
    b.put_i32(req.offset)
        .put_u32(req.payload.len() as u32)
        // is_server
        .put_i32(0)
        .put_u64(req.file_number);
    put_ds_list(&mut b, req.block);
    b.put_slice(req.payload);
    b.finish()
}

/// Decoded write request as seen by a data server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub offset: i32,
    pub file_number: u64,
    pub block: BlockInfo,
    pub payload: Bytes,
}

/// Decode a write request
pub fn parse_write_request(frame: &Frame) -> Result<WriteRecord> {
    frame.expect(MessageType::WRITE_DATA)?;
    let mut r = frame.reader();
    let block_id = r.u32()?;
    let file_id = r.u64()?;
    let offset = r.i32()?;
    let length = r.u32()? as usize;
    let _is_server = r.i32()?;
    let file_number = r.u64()?;
    let block = parse_ds_list(&mut r, block_id)?;
    let consumed = frame.body.len() - r.remaining();
    if r.remaining() < length {
        return Err(Error::decode("write payload truncated"));
    }
    Ok(WriteRecord {
        block_id,
        file_id,
        offset,
        file_number,
        block,
        payload: frame.body.slice(consumed..consumed + length),
    })
}

fn parse_ds_list(r: &mut Reader<'_>, block_id: BlockId) -> Result<BlockInfo> {
    let count = r.count(8, "data server")?;
    let addrs = count
        .checked_sub(3)
        .ok_or_else(|| Error::decode("data server list too short"))?;
    let ds_addrs = (0..addrs).map(|_| r.addr()).collect::<Result<Vec<_>>>()?;
    r.u64()?;
    #[allow(clippy::cast_possible_truncation)]
    let version = r.u64()? as u32 as i32;
    #[allow(clippy::cast_possible_truncation)]
    let lease_id = r.u64()? as u32 as i32;
    Ok(BlockInfo {
        block_id,
        ds_addrs,
        version,
        lease_id,
    })
}

pub fn parse_write(frame: &Frame) -> Result<()> {
    status::expect_ok(frame, "write data (data server)").map(|_| ())
}

/// Close request committing a written file
#[derive(Clone, Copy, Debug)]
pub struct CloseRequest<'a> {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub file_number: u64,
    pub crc: u32,
    pub block: &'a BlockInfo,
}

#[must_use]
pub fn encode_close(req: &CloseRequest<'_>) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::CLOSE_FILE);
    put_file(&mut b, req.block_id, req.file_id);
    b.put_i32(CLOSE_FILE_MASTER)
        .put_u32(req.crc)
        .put_u64(req.file_number);
    put_ds_list(&mut b, req.block);
    // block size, file size, option
    b.put_u32(0).put_u32(0).put_u32(0);
    b.finish()
}

/// Decoded close request as seen by a data server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseRecord {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub crc: u32,
    pub file_number: u64,
}

pub fn parse_close_request(frame: &Frame) -> Result<CloseRecord> {
    frame.expect(MessageType::CLOSE_FILE)?;
    let mut r = frame.reader();
    let block_id = r.u32()?;
    let file_id = r.u64()?;
    let _mode = r.i32()?;
    let crc = r.u32()?;
    let file_number = r.u64()?;
    Ok(CloseRecord {
        block_id,
        file_id,
        crc,
        file_number,
    })
}

pub fn parse_close(frame: &Frame) -> Result<()> {
    status::expect_ok(frame, "close file (data server)").map(|_| ())
}

/// Encode an unlink; `server_mode` is the unlink type for the master
#[must_use]
pub fn encode_unlink(
    block_id: BlockId,
    file_id: FileId,
    server_mode: u32,
    block: &BlockInfo,
) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::UNLINK_FILE);
    put_file(&mut b, block_id, file_id);
    b.put_u32(server_mode);
    put_ds_list(&mut b, block);
    // option
    b.put_u32(0);
    b.finish()
}

/// Decode an unlink answer; the status text carries the removed size
pub fn parse_unlink(frame: &Frame) -> Result<u64> {
    let reply = status::expect_ok(frame, "unlink file (data server)")?;
    Ok(reply
        .value()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or_default())
}

#[must_use]
pub fn encode_stat(block_id: BlockId, file_id: FileId, mode: u32) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::FILE_INFO);
    put_file(&mut b, block_id, file_id);
    b.put_u32(mode);
    b.finish()
}

pub fn parse_stat(frame: &Frame) -> Result<RawFileInfo> {
    status::check(frame, "stat file (data server)")?;
    frame.expect(MessageType::RESP_FILE_INFO)?;
    let mut r = frame.reader();
    let data_len = r.i32()?;
    if data_len <= 0 {
        return Err(Error::status(
            StatusCode::GENERAL,
            format!("stat returned data length {data_len}"),
        ));
    }
    RawFileInfo::parse(&mut r)
}

#[must_use]
pub fn stat_response(info: &RawFileInfo) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::RESP_FILE_INFO);
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    b.put_i32(RAW_FILE_INFO_SIZE as i32);
    info.encode(&mut b);
    b
}

/// Read request; `v2` asks for the file info trailer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub offset: i32,
    pub length: u32,
    pub flag: u8,
    pub v2: bool,
}

#[must_use]
pub fn encode_read(req: &ReadRequest) -> Bytes {
    let msg_type = if req.v2 {
        MessageType::READ_DATA_V2
    } else {
        MessageType::READ_DATA
    };
    let mut b = PacketBuilder::new(msg_type);
    put_file(&mut b, req.block_id, req.file_id);
    b.put_i32(req.offset).put_u32(req.length).put_u8(req.flag);
    b.finish()
}

pub fn parse_read_request(frame: &Frame) -> Result<ReadRequest> {
    let v2 = frame.msg_type() == MessageType::READ_DATA_V2;
    if !v2 {
        frame.expect(MessageType::READ_DATA)?;
    }
    let mut r = frame.reader();
    Ok(ReadRequest {
        block_id: r.u32()?,
        file_id: r.u64()?,
        offset: r.i32()?,
        length: r.u32()?,
        flag: r.u8()?,
        v2,
    })
}

/// Build a read answer; `info` selects the v2 layout
#[must_use]
pub fn read_response(data: &[u8], info: Option<&RawFileInfo>) -> PacketBuilder {
    let msg_type = if info.is_some() {
        MessageType::RESP_READ_DATA_V2
    } else {
        MessageType::RESP_READ_DATA
    };
    let mut b = PacketBuilder::with_capacity(msg_type, 4 + data.len() + READ_V2_TAIL_SIZE);
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    b.put_i32(data.len() as i32).put_slice(data);
    if let Some(info) = info {
        #[allow(clippy::cast_possible_truncation)]
        b.put_u32(RAW_FILE_INFO_SIZE as u32);
        info.encode(&mut b);
    }
    b
}

/// Build a read answer that reports an error code in the length slot
#[must_use]
pub fn read_error_response(code: i32) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::RESP_READ_DATA);
    b.put_i32(code);
    b
}

/// Decoded read answer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadReply {
    pub data: Bytes,
    /// Present for v2 reads
    pub file_info: Option<RawFileInfo>,
}

#[derive(Debug)]
enum ReadState {
    Length { buf: [u8; 4], filled: usize },
    Data { left: usize },
    Tail { buf: [u8; READ_V2_TAIL_SIZE], filled: usize },
    Done,
}

/// Incremental read answer decoder.
///
/// Feed the payload in any chunking; the data length prefix and the v2
/// trailer are reassembled byte-exactly across chunk boundaries. The
/// payload length comes from the packet header and caps the data length
/// the prefix may claim.
#[derive(Debug)]
pub struct ReadDecoder {
    v2: bool,
    body_len: usize,
    state: ReadState,
    data: BytesMut,
    file_info: Option<RawFileInfo>,
}

impl ReadDecoder {
    #[must_use]
    pub fn new(v2: bool, body_len: usize) -> Self {
        Self {
            v2,
            body_len,
            state: ReadState::Length {
                buf: [0; 4],
                filled: 0,
            },
            data: BytesMut::new(),
            file_info: None,
        }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }

    /// Consume `chunk`; returns the number of bytes used
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<usize> {
        let total = chunk.len();
        while !chunk.is_empty() {
            match &mut self.state {
                ReadState::Length { buf, filled } => {
                    let n = (4 - *filled).min(chunk.len());
                    buf[*filled..*filled + n].copy_from_slice(&chunk[..n]);
                    *filled += n;
                    chunk = &chunk[n..];
                    if *filled == 4 {
                        let data_len = i32::from_le_bytes(*buf);
                        if data_len < 0 {
                            return Err(read_error(data_len));
                        }
                        let left = data_len as usize;
                        let max = self.max_data_len();
                        if left > max {
                            return Err(Error::decode(format!(
                                "read data length {left} exceeds the {max} payload bytes"
                            )));
                        }
                        self.data.reserve(left);
                        self.state = self.after_length(left);
                    }
                }
                ReadState::Data { left } => {
                    let n = (*left).min(chunk.len());
                    self.data.extend_from_slice(&chunk[..n]);
                    *left -= n;
                    chunk = &chunk[n..];
                    if *left == 0 {
                        self.state = self.after_data();
                    }
                }
                ReadState::Tail { buf, filled } => {
                    let n = (READ_V2_TAIL_SIZE - *filled).min(chunk.len());
                    buf[*filled..*filled + n].copy_from_slice(&chunk[..n]);
                    *filled += n;
                    chunk = &chunk[n..];
                    if *filled == READ_V2_TAIL_SIZE {
                        let mut r = Reader::new(&buf[..]);
                        let info_len = r.u32()? as usize;
                        if info_len != RAW_FILE_INFO_SIZE {
                            return Err(Error::decode(format!(
                                "read v2 file info length {info_len}, expected {RAW_FILE_INFO_SIZE}"
                            )));
                        }
                        self.file_info = Some(RawFileInfo::parse(&mut r)?);
                        self.state = ReadState::Done;
                    }
                }
                ReadState::Done => break,
            }
        }
        Ok(total - chunk.len())
    }

    const fn max_data_len(&self) -> usize {
        let tail = if self.v2 { READ_V2_TAIL_SIZE } else { 0 };
        self.body_len.saturating_sub(4 + tail)
    }

    fn after_length(&self, left: usize) -> ReadState {
        if left > 0 {
            ReadState::Data { left }
        } else {
            self.after_data()
        }
    }

    const fn after_data(&self) -> ReadState {
        if self.v2 {
            ReadState::Tail {
                buf: [0; READ_V2_TAIL_SIZE],
                filled: 0,
            }
        } else {
            ReadState::Done
        }
    }

    /// Finish decoding
    pub fn finish(self) -> Result<ReadReply> {
        if !self.is_complete() {
            return Err(Error::decode("read answer truncated"));
        }
        Ok(ReadReply {
            data: self.data.freeze(),
            file_info: self.file_info,
        })
    }
}

fn read_error(code: i32) -> Error {
    let status = if code == DS_INVALID_ARGUMENT {
        StatusCode::INVALID_ARGUMENT
    } else {
        StatusCode::from_wire(code)
    };
    Error::status(status, format!("read data returned {code}"))
}

/// Decode a complete read answer
pub fn parse_read(frame: &Frame, v2: bool) -> Result<ReadReply> {
    if frame.is_status() {
        // the code sits where the data length would be
        let mut r = frame.reader();
        let code = r.i32()?;
        return Err(read_error(if code == 0 { StatusCode::GENERAL.0 } else { code }));
    }
    // servers answer error codes on the plain type even for v2 reads
    if !(v2 && frame.msg_type() == MessageType::RESP_READ_DATA_V2) {
        frame.expect(MessageType::RESP_READ_DATA)?;
    }
    let mut decoder = ReadDecoder::new(v2, frame.body.len());
    decoder.feed(&frame.body)?;
    decoder.finish()
}
