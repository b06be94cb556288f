//! Meta server messages
//!
//! Named ("custom") files live in a per-user directory tree kept by the
//! meta servers. Every request names the caller by `(app_id, user_id)` and
//! a path, and carries the meta table version it was routed with so that a
//! stale table is detected by the server.

use bytes::Bytes;
use tfsproxy_common::{AppId, BlockId, Error, FileId, Result, StatusCode};

use crate::codec::{Frame, MessageType, PacketBuilder, Reader};
use crate::status;

/// Split flag in the fragment count of a read answer
const FRAG_SPLIT_FLAG: u32 = 1 << 31;

/// Size of an encoded [`FragMeta`]
pub const FRAG_META_SIZE: usize = 24;

/// Size of an encoded [`CustomFileInfo`]
pub const CUSTOM_FILE_INFO_SIZE: usize = 34;

/// Directory tree operations carried by a FILEPATH_ACTION message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaAction {
    CreateDir,
    CreateFile,
    RemoveDir,
    RemoveFile,
    MoveDir,
    MoveFile,
}

impl MetaAction {
    #[must_use]
    pub const fn wire_value(self) -> u8 {
        match self {
            Self::CreateDir => 1,
            Self::CreateFile => 2,
            Self::RemoveDir => 3,
            Self::RemoveFile => 4,
            Self::MoveDir => 5,
            Self::MoveFile => 6,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::CreateDir,
            2 => Self::CreateFile,
            3 => Self::RemoveDir,
            4 => Self::RemoveFile,
            5 => Self::MoveDir,
            6 => Self::MoveFile,
            other => return Err(Error::decode(format!("unknown meta action {other}"))),
        })
    }
}

/// Entry type used by list requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    File,
    Dir,
    PwriteFile,
}

impl FileType {
    #[must_use]
    pub const fn wire_value(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
            Self::PwriteFile => 3,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::PwriteFile,
            other => return Err(Error::decode(format!("unknown file type {other}"))),
        })
    }

    /// Type of a listed entry, read from the high bit of its parent id
    #[must_use]
    pub const fn from_pid(pid: i64) -> Self {
        if pid < 0 { Self::File } else { Self::Dir }
    }
}

/// Caller and path shared by every meta request
#[derive(Clone, Copy, Debug)]
pub struct MetaTarget<'a> {
    pub app_id: AppId,
    pub user_id: u64,
    pub path: &'a str,
    pub table_version: u64,
}

impl MetaTarget<'_> {
    fn encode(&self, b: &mut PacketBuilder) {
        b.put_u64(self.app_id)
            .put_u64(self.user_id)
            .put_cstr(self.path)
            .put_u64(self.table_version);
    }
}

/// One fragment of a named file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragMeta {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub offset: i64,
    pub size: u32,
}

impl FragMeta {
    fn parse(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            block_id: r.u32()?,
            file_id: r.u64()?,
            offset: r.i64()?,
            size: r.u32()?,
        })
    }

    fn encode(&self, b: &mut PacketBuilder) {
        b.put_u32(self.block_id)
            .put_u64(self.file_id)
            .put_i64(self.offset)
            .put_u32(self.size);
    }

    /// Byte offset just past this fragment
    #[must_use]
    pub fn end(&self) -> i64 {
        self.offset + i64::from(self.size)
    }
}

/// Fragment list of a named file inside one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragInfo {
    pub cluster_id: u32,
    /// Server split the answer; more fragments follow
    pub split: bool,
    pub frags: Vec<FragMeta>,
}

impl FragInfo {
    fn parse(r: &mut Reader<'_>) -> Result<Self> {
        let cluster_id = r.u32()?;
        let raw_count = r.u32()?;
        let count = raw_count & !FRAG_SPLIT_FLAG;
        if count as usize * FRAG_META_SIZE > r.remaining() {
            return Err(Error::decode(format!(
                "fragment count {count} exceeds payload"
            )));
        }
        let frags = (0..count)
            .map(|_| FragMeta::parse(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cluster_id,
            split: raw_count & FRAG_SPLIT_FLAG != 0,
            frags,
        })
    }

    fn encode(&self, b: &mut PacketBuilder) {
        #[allow(clippy::cast_possible_truncation)]
        let mut count = self.frags.len() as u32;
        if self.split {
            count |= FRAG_SPLIT_FLAG;
        }
        b.put_u32(self.cluster_id).put_u32(count);
        for frag in &self.frags {
            frag.encode(b);
        }
    }
}

/// Encode a directory tree action; `new_path` is the move destination
#[must_use]
pub fn encode_action(target: &MetaTarget<'_>, new_path: Option<&str>, action: MetaAction) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::FILEPATH_ACTION);
    target.encode(&mut b);
    match new_path {
        Some(path) => b.put_cstr(path),
        None => b.put_u32(0),
    };
    b.put_u8(action.wire_value());
    b.finish()
}

pub fn parse_action(frame: &Frame) -> Result<()> {
    status::expect_ok(frame, "action (meta server)").map(|_| ())
}

/// Size to ask for in one fragment read.
///
/// The answer must fit in `max_frags` fragments of at most `fragment_size`
/// bytes. Larger ranges are requested in pieces and the answer is treated
/// as split.
#[must_use]
pub fn frag_read_size(size: u64, fragment_size: u64, max_frags: u64) -> (u64, bool) {
    let wanted = size / fragment_size.max(1);
    if wanted > max_frags {
        (max_frags.saturating_sub(1) * fragment_size, true)
    } else {
        (size, false)
    }
}

/// Encode a fragment lookup for `[offset, offset + size)`
#[must_use]
pub fn encode_read_frags(target: &MetaTarget<'_>, offset: i64, size: u64) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::READ_FILEPATH);
    target.encode(&mut b);
    b.put_i64(offset).put_u64(size);
    b.finish()
}

/// Decoded fragment lookup answer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadFragsReply {
    pub still_have: bool,
    pub info: FragInfo,
}

pub fn parse_read_frags(frame: &Frame) -> Result<ReadFragsReply> {
    status::check(frame, "read file (meta server)")?;
    frame.expect(MessageType::RESP_READ_FILEPATH)?;
    let mut r = frame.reader();
    let still_have = r.u8()? != 0;
    let info = FragInfo::parse(&mut r)?;
    Ok(ReadFragsReply { still_have, info })
}

#[must_use]
pub fn read_frags_response(reply: &ReadFragsReply) -> PacketBuilder {
    let mut b = PacketBuilder::with_capacity(
        MessageType::RESP_READ_FILEPATH,
        9 + reply.info.frags.len() * FRAG_META_SIZE,
    );
    b.put_u8(u8::from(reply.still_have));
    reply.info.encode(&mut b);
    b
}

/// Encode the fragment list of freshly written data
#[must_use]
pub fn encode_write_frags(target: &MetaTarget<'_>, info: &FragInfo) -> Bytes {
    let mut b = PacketBuilder::with_capacity(
        MessageType::WRITE_FILEPATH,
        64 + target.path.len() + info.frags.len() * FRAG_META_SIZE,
    );
    target.encode(&mut b);
    info.encode(&mut b);
    b.finish()
}

pub fn parse_write_frags(frame: &Frame) -> Result<()> {
    status::expect_ok(frame, "write message (meta server)").map(|_| ())
}

/// Attributes of a listed entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CustomFileInfo {
    pub pid: i64,
    pub id: i64,
    pub create_time: u32,
    pub modify_time: u32,
    pub size: u64,
    pub ver_no: u16,
}

impl CustomFileInfo {
    fn parse(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            pid: r.i64()?,
            id: r.i64()?,
            create_time: r.u32()?,
            modify_time: r.u32()?,
            size: r.u64()?,
            ver_no: r.u16()?,
        })
    }

    fn encode(&self, b: &mut PacketBuilder) {
        b.put_i64(self.pid)
            .put_i64(self.id)
            .put_u32(self.create_time)
            .put_u32(self.modify_time)
            .put_u64(self.size)
            .put_u16(self.ver_no);
    }

    #[must_use]
    pub const fn file_type(&self) -> FileType {
        FileType::from_pid(self.pid)
    }
}

/// One entry of a listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LsEntry {
    pub name: String,
    pub info: CustomFileInfo,
}

/// List request; `pid` and `path` form the pagination cursor
#[derive(Clone, Copy, Debug)]
pub struct LsRequest<'a> {
    pub app_id: AppId,
    pub user_id: u64,
    pub pid: i64,
    pub path: &'a str,
    pub file_type: FileType,
    pub table_version: u64,
}

#[must_use]
pub fn encode_ls(req: &LsRequest<'_>) -> Bytes {
    let mut b = PacketBuilder::new(MessageType::LS_FILEPATH);
    b.put_u64(req.app_id)
        .put_u64(req.user_id)
        .put_i64(req.pid)
        .put_cstr(req.path)
        .put_u8(req.file_type.wire_value())
        .put_u64(req.table_version);
    b.finish()
}

/// Decoded list answer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LsReply {
    pub still_have: bool,
    pub entries: Vec<LsEntry>,
}

impl LsReply {
    /// Where the next page starts: the last entry's name, parent and type
    #[must_use]
    pub fn next_cursor(&self) -> Option<(&str, i64, FileType)> {
        if !self.still_have {
            return None;
        }
        self.entries
            .last()
            .map(|e| (e.name.as_str(), e.info.pid, e.info.file_type()))
    }
}

/// Decode a list answer. An empty answer to a file listing means the file
/// does not exist.
pub fn parse_ls(frame: &Frame, file_type: FileType) -> Result<LsReply> {
    status::check(frame, "ls file (meta server)")?;
    frame.expect(MessageType::RESP_LS_FILEPATH)?;
    let mut r = frame.reader();
    let still_have = r.u8()? != 0;
    // name length, pid, id, times, size and version
    let count = r.count(38, "ls entry")?;
    if count == 0 && file_type != FileType::Dir {
        return Err(Error::status(StatusCode::TARGET_EXIST, "file not exist"));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = r.cstr()?;
        let info = CustomFileInfo::parse(&mut r)?;
        entries.push(LsEntry { name, info });
    }
    Ok(LsReply {
        still_have,
        entries,
    })
}

#[must_use]
pub fn ls_response(reply: &LsReply) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::RESP_LS_FILEPATH);
    #[allow(clippy::cast_possible_truncation)]
    b.put_u8(u8::from(reply.still_have))
        .put_u32(reply.entries.len() as u32);
    for entry in &reply.entries {
        b.put_cstr(&entry.name);
        entry.info.encode(&mut b);
    }
    b
}

/// Body of a decoded meta request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaCall {
    Action {
        new_path: Option<String>,
        action: MetaAction,
    },
    ReadFrags {
        offset: i64,
        size: u64,
    },
    WriteFrags(FragInfo),
    Ls {
        pid: i64,
        file_type: FileType,
    },
}

/// Meta request as seen by a meta server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    pub app_id: AppId,
    pub user_id: u64,
    pub path: String,
    pub table_version: u64,
    pub call: MetaCall,
}

/// Decode any meta request
pub fn parse_meta_request(frame: &Frame) -> Result<MetaRecord> {
    let mut r = frame.reader();
    let app_id = r.u64()?;
    let user_id = r.u64()?;

    if frame.msg_type() == MessageType::LS_FILEPATH {
        let pid = r.i64()?;
        let path = r.cstr()?;
        let file_type = FileType::from_wire(r.u8()?)?;
        let table_version = r.u64()?;
        return Ok(MetaRecord {
            app_id,
            user_id,
            path,
            table_version,
            call: MetaCall::Ls { pid, file_type },
        });
    }

    let path = r.cstr()?;
    let table_version = r.u64()?;
    let call = match frame.msg_type() {
        MessageType::FILEPATH_ACTION => {
            let new_path = r.cstr()?;
            MetaCall::Action {
                new_path: (!new_path.is_empty()).then_some(new_path),
                action: MetaAction::from_wire(r.u8()?)?,
            }
        }
        MessageType::READ_FILEPATH => MetaCall::ReadFrags {
            offset: r.i64()?,
            size: r.u64()?,
        },
        MessageType::WRITE_FILEPATH => MetaCall::WriteFrags(FragInfo::parse(&mut r)?),
        other => {
            return Err(Error::decode(format!("not a meta request: {other:?}")));
        }
    };
    Ok(MetaRecord {
        app_id,
        user_id,
        path,
        table_version,
        call,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoded, HEADER_SIZE};
    use bytes::BytesMut;

    fn target(path: &str) -> MetaTarget<'_> {
        MetaTarget {
            app_id: 7,
            user_id: 100,
            path,
            table_version: 3,
        }
    }

    fn decode(packet: &Bytes) -> Frame {
        let mut buf = BytesMut::from(&packet[..]);
        let Decoded::Complete(frame) = Frame::decode(&mut buf).unwrap() else {
            panic!("complete packet");
        };
        frame
    }

    #[test]
    fn test_action_layout() {
        let packet = encode_action(&target("/a"), None, MetaAction::CreateDir);
        // ids 16, path 4+3, version 8, new path len 4, action 1
        assert_eq!(packet.len(), HEADER_SIZE + 36);

        let record = parse_meta_request(&decode(&packet)).unwrap();
        assert_eq!(record.path, "/a");
        assert_eq!(
            record.call,
            MetaCall::Action {
                new_path: None,
                action: MetaAction::CreateDir
            }
        );

        let packet = encode_action(&target("/a"), Some("/b/c"), MetaAction::MoveDir);
        let record = parse_meta_request(&decode(&packet)).unwrap();
        assert_eq!(
            record.call,
            MetaCall::Action {
                new_path: Some("/b/c".into()),
                action: MetaAction::MoveDir
            }
        );
    }

    #[test]
    fn test_read_frags() {
        let reply = ReadFragsReply {
            still_have: false,
            info: FragInfo {
                cluster_id: 1,
                split: true,
                frags: vec![
                    FragMeta {
                        block_id: 1,
                        file_id: 2,
                        offset: 0,
                        size: 100,
                    },
                    FragMeta {
                        block_id: 3,
                        file_id: 4,
                        offset: 200,
                        size: 50,
                    },
                ],
            },
        };
        let frame = read_frags_response(&reply).into_frame();
        let parsed = parse_read_frags(&frame).unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(parsed.info.frags[1].end(), 250);
    }

    #[test]
    fn test_frag_count_exceeding_payload() {
        let mut b = PacketBuilder::new(MessageType::RESP_READ_FILEPATH);
        b.put_u8(0).put_u32(1).put_u32(1000);
        assert!(parse_read_frags(&b.into_frame()).is_err());
    }

    #[test]
    fn test_frag_read_size() {
        let mb = 1024 * 1024;
        assert_eq!(frag_read_size(10 * mb, 2 * mb, 100), (10 * mb, false));
        assert_eq!(frag_read_size(1000 * mb, 2 * mb, 100), (99 * 2 * mb, true));
    }

    #[test]
    fn test_write_frags_request() {
        let info = FragInfo {
            cluster_id: 2,
            split: false,
            frags: vec![FragMeta {
                block_id: 9,
                file_id: 10,
                offset: 0,
                size: 4096,
            }],
        };
        let packet = encode_write_frags(&target("/f"), &info);
        let record = parse_meta_request(&decode(&packet)).unwrap();
        assert_eq!(record.call, MetaCall::WriteFrags(info));
        assert_eq!(record.table_version, 3);
    }

    #[test]
    fn test_ls_pagination_cursor() {
        let reply = LsReply {
            still_have: true,
            entries: vec![
                LsEntry {
                    name: "dir".into(),
                    info: CustomFileInfo {
                        pid: 1,
                        id: 2,
                        ..Default::default()
                    },
                },
                LsEntry {
                    name: "file".into(),
                    info: CustomFileInfo {
                        pid: 1 | i64::MIN,
                        id: 3,
                        size: 12,
                        ..Default::default()
                    },
                },
            ],
        };
        let frame = ls_response(&reply).into_frame();
        let parsed = parse_ls(&frame, FileType::Dir).unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(
            parsed.next_cursor(),
            Some(("file", 1 | i64::MIN, FileType::File))
        );
    }

    #[test]
    fn test_ls_file_missing() {
        let frame = ls_response(&LsReply::default()).into_frame();
        let err = parse_ls(&frame, FileType::File).unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::TARGET_EXIST));
        assert!(parse_ls(&frame, FileType::Dir).unwrap().entries.is_empty());
    }

    #[test]
    fn test_ls_request() {
        let packet = encode_ls(&LsRequest {
            app_id: 1,
            user_id: 2,
            pid: -1,
            path: "/x",
            file_type: FileType::Dir,
            table_version: 5,
        });
        let record = parse_meta_request(&decode(&packet)).unwrap();
        assert_eq!(
            record.call,
            MetaCall::Ls {
                pid: -1,
                file_type: FileType::Dir
            }
        );
    }
}
