//! In-memory cluster for engine tests
//!
//! [`MockTransport`] answers every role from shared state: name servers
//! hand out blocks, data servers keep files, the meta server keeps a path
//! tree and the root and routing servers serve fixed tables. Faults are
//! injected per role, address, message type and block.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tfsproxy_common::{ActionKind, AppId, BlockId, Error, FileId, ProxyConfig, Result, ServerAddr, StatusCode, tfs_crc};
use tfsproxy_proto::data::{self, CreatedFile, FileFlag, RawFileInfo};
use tfsproxy_proto::meta::{self, CustomFileInfo, FileType, FragInfo, FragMeta, LsEntry, LsReply, MetaAction, MetaCall, ReadFragsReply};
use tfsproxy_proto::name::{self, ClientCmd};
use tfsproxy_proto::rc::{self, AccessType, ClusterGroupInfo, GroupInfo, LogicalCluster, PhysicalCluster};
use tfsproxy_proto::root::{self, META_SERVER_COUNT};
use tfsproxy_proto::{BlockInfo, Decoded, Frame, MessageType, MetaTable, OpenMode, RcInfo, status};

use crate::action::ActionRequest;
use crate::engine::Engine;
use crate::peer::{PeerRole, Transport};

pub(crate) const APP_ID: AppId = 1001;
const SESSION_ID: &str = "1001-5e551011";
const FRAG_PAGE: usize = 4;
const LS_PAGE: usize = 2;

fn addr(ip: [u8; 4], port: u16) -> ServerAddr {
    ServerAddr::new(ip.into(), port)
}

pub(crate) fn rc_addr() -> ServerAddr {
    addr([10, 0, 0, 1], 6100)
}

pub(crate) fn ns_addr() -> ServerAddr {
    addr([10, 0, 1, 1], 8100)
}

pub(crate) fn ns2_addr() -> ServerAddr {
    addr([10, 0, 1, 2], 8100)
}

pub(crate) fn root_addr() -> ServerAddr {
    addr([10, 0, 2, 1], 7100)
}

pub(crate) fn meta_addr() -> ServerAddr {
    addr([10, 0, 3, 1], 7200)
}

pub(crate) fn ds_addrs() -> Vec<ServerAddr> {
    (1..=3).map(|i| addr([10, 0, 4, i], 9100)).collect()
}

pub(crate) fn config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.upstream.rc_servers = vec![rc_addr()];
    config.upstream.app_key = "test-app-key".into();
    config
}

fn physical(id_text: &str, ns: ServerAddr, access_type: AccessType) -> PhysicalCluster {
    PhysicalCluster {
        cluster_stat: 1,
        access_type,
        cluster_id_text: id_text.into(),
        ns_vip_text: ns.to_string(),
        ns_vip: ns,
    }
}

/// Cluster 1 read-write behind `ns_addr`, cluster 2 read-only behind
/// `ns2_addr`
pub(crate) fn rc_info() -> RcInfo {
    RcInfo {
        rc_servers: vec![rc_addr()],
        logical_clusters: vec![LogicalCluster {
            need_duplicate: false,
            dup_server_info: None,
            rw_clusters: vec![
                physical("T1M", ns_addr(), AccessType::ReadWrite),
                physical("T2M", ns2_addr(), AccessType::ReadOnly),
            ],
        }],
        report_interval: 5,
        modify_time: 100,
        meta_root_server: root_addr(),
        remote_block_cache_info: String::new(),
        unlink_clusters: Vec::new(),
        use_remote_block_cache: false,
    }
}

/// Both clusters read-write: cluster 1 behind `ns_addr`, then cluster 2
/// behind `ns2_addr`
pub(crate) fn dual_write_rc_info() -> RcInfo {
    let mut info = rc_info();
    info.logical_clusters[0].rw_clusters[1].access_type = AccessType::ReadWrite;
    info
}

/// Cluster 1 unlinks through two name server groups
pub(crate) fn grouped_rc_info() -> RcInfo {
    let group = |ns: ServerAddr| GroupInfo {
        group_seq: -1,
        ns_vip_text: ns.to_string(),
        ns_vip: ns,
    };
    RcInfo {
        unlink_clusters: vec![ClusterGroupInfo {
            cluster_id: 1,
            group_count: 0,
            groups: vec![group(ns_addr()), group(ns2_addr())],
        }],
        ..rc_info()
    }
}

pub(crate) fn dedup_rc_info() -> RcInfo {
    let mut info = rc_info();
    info.logical_clusters[0].need_duplicate = true;
    info.logical_clusters[0].dup_server_info = Some("10.0.5.1:5198".into());
    info
}

/// Write `data` as a small raw file and return its name
pub(crate) async fn write_small(engine: &Engine, data: &[u8]) -> String {
    let outcome = engine
        .execute(ActionRequest::raw(ActionKind::WriteFile).body(data.to_vec()))
        .await;
    assert_eq!(outcome.status, 200, "write failed: {:?}", outcome.error);
    outcome.file_name.expect("written file has a name")
}

/// Number of operation counters carried by a keepalive request
pub(crate) fn keepalive_stat_count(frame: &Frame) -> usize {
    let mut r = frame.reader();
    r.cstr().unwrap();
    r.cstr().unwrap();
    for _ in 0..3 {
        r.u64().unwrap();
    }
    r.u8().unwrap();
    r.u32().unwrap() as usize
}

/// One request seen by the mock
#[derive(Clone, Debug)]
pub(crate) struct CallRecord {
    pub role: PeerRole,
    pub addr: ServerAddr,
    pub msg_type: MessageType,
    pub frame: Frame,
}

#[derive(Clone, Copy, Debug)]
enum FaultKind {
    Reset,
    Status(StatusCode),
    /// Never answers
    Hang,
    /// Flips a byte of the read payload
    Corrupt,
    /// Answers normally after a pause
    Delay(Duration),
}

/// Scripted failure for matching requests
#[derive(Clone, Debug)]
pub(crate) struct Fault {
    kind: FaultKind,
    role: PeerRole,
    addr: Option<ServerAddr>,
    msg_type: Option<MessageType>,
    block_id: Option<BlockId>,
    times: Option<usize>,
    skip: usize,
    seen: usize,
    fired: usize,
}

impl Fault {
    fn new(kind: FaultKind, role: PeerRole) -> Self {
        Self {
            kind,
            role,
            addr: None,
            msg_type: None,
            block_id: None,
            times: None,
            skip: 0,
            seen: 0,
            fired: 0,
        }
    }

    pub fn reset(role: PeerRole) -> Self {
        Self::new(FaultKind::Reset, role)
    }

    pub fn status(role: PeerRole, code: StatusCode) -> Self {
        Self::new(FaultKind::Status(code), role)
    }

    pub fn hang(role: PeerRole) -> Self {
        Self::new(FaultKind::Hang, role)
    }

    pub fn corrupt(role: PeerRole) -> Self {
        Self::new(FaultKind::Corrupt, role)
    }

    pub fn delay(role: PeerRole, delay: Duration) -> Self {
        Self::new(FaultKind::Delay(delay), role)
    }

    pub fn at(mut self, addr: ServerAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn on(mut self, msg_type: MessageType) -> Self {
        self.msg_type = Some(msg_type);
        self
    }

    /// Only data server requests for `block_id`
    pub fn block(mut self, block_id: BlockId) -> Self {
        self.block_id = Some(block_id);
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    /// Let the first `n` matching requests through
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    fn matches(&self, role: PeerRole, addr: ServerAddr, frame: &Frame) -> bool {
        self.role == role
            && self.addr.is_none_or(|a| a == addr)
            && self.msg_type.is_none_or(|t| t == frame.msg_type())
            && self
                .block_id
                .is_none_or(|id| frame.reader().u32().is_ok_and(|b| b == id))
    }

    /// Count a matching request; true when this one fails
    fn fire(&mut self) -> bool {
        self.seen += 1;
        if self.seen <= self.skip || self.times.is_some_and(|t| self.fired >= t) {
            return false;
        }
        self.fired += 1;
        true
    }
}

#[derive(Debug)]
struct StoredFile {
    data: Vec<u8>,
    info: RawFileInfo,
    closed: bool,
}

#[derive(Debug)]
struct MetaNode {
    id: i64,
    parent: i64,
    is_dir: bool,
    size: u64,
    cluster_id: u32,
    frags: Vec<FragMeta>,
}

impl MetaNode {
    fn new(id: i64, parent: i64, is_dir: bool) -> Self {
        Self {
            id,
            parent,
            is_dir,
            size: 0,
            cluster_id: 0,
            frags: Vec::new(),
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn not_found(path: &str) -> Error {
    Error::status(StatusCode::TARGET_EXIST, format!("{path} does not exist"))
}

/// Path tree of the meta server
#[derive(Debug)]
struct MetaTree {
    nodes: BTreeMap<String, MetaNode>,
    next_id: i64,
}

impl MetaTree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), MetaNode::new(1, 0, true));
        Self { nodes, next_id: 2 }
    }

    fn node(&self, path: &str, is_dir: bool) -> Result<&MetaNode> {
        self.nodes
            .get(path)
            .filter(|n| n.is_dir == is_dir)
            .ok_or_else(|| not_found(path))
    }

    fn dir_id(&self, path: &str) -> Result<i64> {
        self.node(path, true).map(|n| n.id).map_err(|_| {
            Error::status(StatusCode::PARENT_EXIST, format!("parent {path} does not exist"))
        })
    }

    fn create(&mut self, path: &str, is_dir: bool) -> Result<()> {
        if self.nodes.contains_key(path) {
            return Err(Error::status(StatusCode::TARGET_EXIST, format!("{path} exists")));
        }
        let parent = self.dir_id(parent_of(path))?;
        self.nodes
            .insert(path.to_string(), MetaNode::new(self.next_id, parent, is_dir));
        self.next_id += 1;
        Ok(())
    }

    fn apply(&mut self, path: &str, new_path: Option<&str>, action: MetaAction) -> Result<()> {
        match action {
            MetaAction::CreateDir => self.create(path, true),
            MetaAction::CreateFile => self.create(path, false),
            MetaAction::RemoveDir => {
                self.node(path, true)?;
                if self.nodes.keys().any(|k| k != "/" && parent_of(k) == path) {
                    return Err(Error::status(
                        StatusCode::DELETE_DIR_WITH_FILE,
                        format!("{path} is not empty"),
                    ));
                }
                self.nodes.remove(path);
                Ok(())
            }
            MetaAction::RemoveFile => {
                self.node(path, false)?;
                self.nodes.remove(path);
                Ok(())
            }
            MetaAction::MoveDir | MetaAction::MoveFile => {
                let dest = new_path.ok_or_else(|| Error::invalid_argument("move without destination"))?;
                self.node(path, action == MetaAction::MoveDir)?;
                if self.nodes.contains_key(dest) {
                    return Err(Error::status(StatusCode::TARGET_EXIST, format!("{dest} exists")));
                }
                let parent = self.dir_id(parent_of(dest))?;
                let prefix = format!("{path}/");
                let moved: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|k| k.as_str() == path || k.starts_with(&prefix))
                    .cloned()
                    .collect();
                for key in moved {
                    if let Some(mut node) = self.nodes.remove(&key) {
                        if key == path {
                            node.parent = parent;
                        }
                        self.nodes.insert(format!("{dest}{}", &key[path.len()..]), node);
                    }
                }
                Ok(())
            }
        }
    }

    fn read_frags(&self, path: &str, offset: i64, size: u64) -> Result<ReadFragsReply> {
        let node = self.node(path, false)?;
        let end = offset.saturating_add(i64::try_from(size).unwrap_or(i64::MAX));
        let mut frags: Vec<FragMeta> = node
            .frags
            .iter()
            .filter(|f| f.end() > offset && f.offset < end)
            .copied()
            .collect();
        frags.truncate(FRAG_PAGE);
        let still_have = frags
            .last()
            .is_some_and(|last| node.frags.iter().any(|f| f.offset >= last.end()));
        Ok(ReadFragsReply {
            still_have,
            info: FragInfo {
                cluster_id: node.cluster_id,
                split: false,
                frags,
            },
        })
    }

    fn write_frags(&mut self, path: &str, info: FragInfo) -> Result<()> {
        let node = self
            .nodes
            .get_mut(path)
            .filter(|n| !n.is_dir)
            .ok_or_else(|| not_found(path))?;
        let overlaps = info
            .frags
            .iter()
            .any(|new| node.frags.iter().any(|f| f.offset < new.end() && new.offset < f.end()));
        if overlaps {
            return Err(Error::status(
                StatusCode::WRITE_EXIST_POS,
                format!("{path}: range already written"),
            ));
        }
        node.frags.extend(info.frags);
        node.frags.sort_by_key(|f| f.offset);
        if node.cluster_id == 0 {
            node.cluster_id = info.cluster_id;
        }
        node.size = node
            .frags
            .iter()
            .map(|f| u64::try_from(f.end()).unwrap_or_default())
            .max()
            .unwrap_or_default();
        Ok(())
    }

    fn entry(path: &str, node: &MetaNode) -> LsEntry {
        LsEntry {
            name: name_of(path).to_string(),
            info: CustomFileInfo {
                pid: if node.is_dir { node.parent } else { node.parent | i64::MIN },
                id: node.id,
                create_time: 1,
                modify_time: 1,
                size: node.size,
                ver_no: 0,
            },
        }
    }

    /// Children of `dir`, directories first, resuming after `after`
    fn page(&self, dir: &str, after: Option<(&str, bool)>) -> LsReply {
        let mut children: Vec<(&String, &MetaNode)> = self
            .nodes
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && parent_of(k) == dir)
            .collect();
        children.sort_by(|a, b| {
            b.1.is_dir
                .cmp(&a.1.is_dir)
                .then_with(|| name_of(a.0).cmp(name_of(b.0)))
        });
        let start = after.map_or(0, |(name, is_dir)| {
            children
                .iter()
                .position(|(k, n)| n.is_dir == is_dir && name_of(k) == name)
                .map_or(children.len(), |i| i + 1)
        });
        let rest = &children[start..];
        LsReply {
            still_have: rest.len() > LS_PAGE,
            entries: rest
                .iter()
                .take(LS_PAGE)
                .map(|(k, n)| Self::entry(k, n))
                .collect(),
        }
    }

    fn ls(&self, path: &str, pid: i64, file_type: FileType) -> Result<LsReply> {
        if pid == -1 {
            let node = self.nodes.get(path).ok_or_else(|| not_found(path))?;
            if file_type != FileType::Dir {
                let entries = if node.is_dir {
                    Vec::new()
                } else {
                    vec![Self::entry(path, node)]
                };
                return Ok(LsReply {
                    still_have: false,
                    entries,
                });
            }
            if !node.is_dir {
                return Err(not_found(path));
            }
            return Ok(self.page(path, None));
        }
        let dir_id = pid & i64::MAX;
        let dir = self
            .nodes
            .iter()
            .find(|(_, n)| n.is_dir && n.id == dir_id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| not_found(path))?;
        Ok(self.page(&dir, Some((path, file_type == FileType::Dir))))
    }
}

#[derive(Debug)]
struct Cluster {
    rc_info: RcInfo,
    blocks: HashMap<BlockId, Vec<ServerAddr>>,
    next_block: BlockId,
    files: HashMap<(BlockId, FileId), StoredFile>,
    next_file: u32,
    table_version: u64,
    meta: MetaTree,
}

/// Scriptable stand-in for the whole storage cluster
pub(crate) struct MockTransport {
    cluster: Mutex<Cluster>,
    calls: Mutex<Vec<CallRecord>>,
    faults: Mutex<Vec<Fault>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_info(rc_info())
    }

    pub fn with_info(rc_info: RcInfo) -> Arc<Self> {
        Arc::new(Self {
            cluster: Mutex::new(Cluster {
                rc_info,
                blocks: HashMap::new(),
                next_block: 1000,
                files: HashMap::new(),
                next_file: 0,
                table_version: 1,
                meta: MetaTree::new(),
            }),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        })
    }

    pub fn set_rc_info(&self, info: RcInfo) {
        self.cluster.lock().rc_info = info;
    }

    pub fn put_block(&self, block_id: BlockId, addrs: Vec<ServerAddr>) {
        self.cluster.lock().blocks.insert(block_id, addrs);
    }

    pub fn bump_table_version(&self) {
        self.cluster.lock().table_version += 1;
    }

    pub fn fail(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, msg_type: MessageType) -> Vec<CallRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.msg_type == msg_type)
            .cloned()
            .collect()
    }

    pub fn count(&self, msg_type: MessageType) -> usize {
        self.calls.lock().iter().filter(|c| c.msg_type == msg_type).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Block ids of every batch lookup, in call order
    pub fn batch_lookups(&self) -> Vec<Vec<BlockId>> {
        self.calls_of(MessageType::BATCH_GET_BLOCK_INFO)
            .iter()
            .map(|call| {
                let mut r = call.frame.reader();
                r.u32().unwrap();
                let count = r.u32().unwrap();
                (0..count).map(|_| r.u32().unwrap()).collect()
            })
            .collect()
    }

    /// Contents of a committed file
    pub fn file(&self, block_id: BlockId, file_id: FileId) -> Option<Bytes> {
        self.cluster
            .lock()
            .files
            .get(&(block_id, file_id))
            .filter(|f| f.closed)
            .map(|f| Bytes::copy_from_slice(&f.data))
    }

    /// Committed files that are neither deleted nor concealed
    pub fn live_files(&self) -> usize {
        self.cluster
            .lock()
            .files
            .values()
            .filter(|f| f.closed && f.info.flag.is_normal())
            .count()
    }

    fn fault_for(&self, role: PeerRole, addr: ServerAddr, frame: &Frame) -> Option<FaultKind> {
        self.faults
            .lock()
            .iter_mut()
            .filter(|f| f.matches(role, addr, frame))
            .find_map(|f| f.fire().then_some(f.kind))
    }

    fn serve(&self, role: PeerRole, addr: ServerAddr, frame: &Frame) -> Frame {
        let reply = match role {
            PeerRole::RcServer => self.rc_server(frame),
            PeerRole::RootServer => self.root_server(),
            PeerRole::NameServer => self.name_server(addr, frame),
            PeerRole::DataServer => self.data_server(frame),
            PeerRole::MetaServer => self.meta_server(frame),
        };
        reply.unwrap_or_else(|e| {
            status::frame(e.status_code().unwrap_or(StatusCode::GENERAL), &e.to_string())
        })
    }

    fn rc_server(&self, frame: &Frame) -> Result<Frame> {
        let info = self.cluster.lock().rc_info.clone();
        let mut r = frame.reader();
        match frame.msg_type() {
            MessageType::REQ_RC_LOGIN => {
                if r.cstr()?.is_empty() {
                    return Err(Error::status(StatusCode::APP_NOT_EXIST, "no app key"));
                }
                Ok(rc::login_response(SESSION_ID, &info).into_frame())
            }
            MessageType::REQ_RC_KEEPALIVE => {
                r.cstr()?;
                r.cstr()?;
                r.u64()?;
                r.u64()?;
                let modify_time = r.u64()?;
                let update = (modify_time != info.modify_time).then_some(&info);
                Ok(rc::keepalive_response(update).into_frame())
            }
            MessageType::REQ_RC_LOGOUT => Ok(status::frame(StatusCode::OK, "")),
            other => Err(Error::decode(format!("rc server got {other:?}"))),
        }
    }

    fn root_server(&self) -> Result<Frame> {
        let table = MetaTable {
            version: self.cluster.lock().table_version,
            servers: vec![meta_addr(); META_SERVER_COUNT],
        };
        Ok(root::table_response(&table)?.into_frame())
    }

    /// Replica list of `block_id`; a zero id with CREATE gets a new block
    fn block(&self, mode: OpenMode, block_id: BlockId) -> Option<BlockInfo> {
        let mut cluster = self.cluster.lock();
        let block_id = if block_id == 0 && mode.contains(OpenMode::CREATE) {
            cluster.next_block += 1;
            let id = cluster.next_block;
            cluster.blocks.insert(id, ds_addrs());
            id
        } else {
            block_id
        };
        cluster.blocks.get(&block_id).map(|addrs| BlockInfo {
            block_id,
            ds_addrs: addrs.clone(),
            version: 1,
            lease_id: 1,
        })
    }

    fn name_server(&self, addr: ServerAddr, frame: &Frame) -> Result<Frame> {
        let mut r = frame.reader();
        match frame.msg_type() {
            MessageType::GET_BLOCK_INFO => {
                let mode = OpenMode(r.u32()?);
                let block_id = r.u32()?;
                let info = self.block(mode, block_id).ok_or_else(|| {
                    Error::status(StatusCode::BLOCK_NOT_FOUND, format!("block {block_id} not found"))
                })?;
                Ok(name::block_info_response(&info, mode.is_write()).into_frame())
            }
            MessageType::BATCH_GET_BLOCK_INFO => {
                let mode = OpenMode(r.u32()?);
                let count = r.u32()?;
                let ids = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
                let infos: Vec<BlockInfo> = ids.into_iter().filter_map(|id| self.block(mode, id)).collect();
                Ok(name::batch_block_info_response(&infos, mode.is_write()).into_frame())
            }
            MessageType::CLIENT_CMD => {
                r.i32()?;
                r.i64()?;
                let cmd = r.i32()?;
                let value = if cmd == ClientCmd::GetClusterId.wire_value() {
                    i32::from(b'1')
                } else if cmd == ClientCmd::GetGroupCount.wire_value() {
                    2
                } else if cmd == ClientCmd::GetGroupSeq.wire_value() {
                    i32::from(addr != ns_addr())
                } else {
                    return Err(Error::invalid_argument(format!("unknown client command {cmd}")));
                };
                Ok(status::frame(StatusCode::OK, &value.to_string()))
            }
            other => Err(Error::decode(format!("name server got {other:?}"))),
        }
    }

    fn data_server(&self, frame: &Frame) -> Result<Frame> {
        let mut cluster = self.cluster.lock();
        let mut r = frame.reader();
        match frame.msg_type() {
            MessageType::CREATE_FILENAME => {
                let block_id = r.u32()?;
                let hint = r.u64()?;
                cluster.next_file += 1;
                let seq = cluster.next_file;
                let file_id = (hint & !u64::from(u32::MAX)) | u64::from(seq);
                cluster.files.insert(
                    (block_id, file_id),
                    StoredFile {
                        data: Vec::new(),
                        info: RawFileInfo {
                            id: file_id,
                            ..RawFileInfo::default()
                        },
                        closed: false,
                    },
                );
                let created = CreatedFile {
                    block_id,
                    file_id,
                    file_number: u64::from(seq),
                };
                Ok(data::create_file_response(&created).into_frame())
            }
            MessageType::WRITE_DATA => {
                let record = data::parse_write_request(frame)?;
                let file = cluster
                    .files
                    .get_mut(&(record.block_id, record.file_id))
                    .filter(|f| !f.closed)
                    .ok_or_else(|| Error::status(StatusCode::FILE_INFO, "file not open"))?;
                let offset = usize::try_from(record.offset)
                    .map_err(|_| Error::status(StatusCode::INVALID_ARGUMENT, "negative offset"))?;
                let end = offset + record.payload.len();
                if file.data.len() < end {
                    file.data.resize(end, 0);
                }
                file.data[offset..end].copy_from_slice(&record.payload);
                Ok(status::frame(StatusCode::OK, ""))
            }
            MessageType::CLOSE_FILE => {
                let record = data::parse_close_request(frame)?;
                let file = cluster
                    .files
                    .get_mut(&(record.block_id, record.file_id))
                    .filter(|f| !f.closed)
                    .ok_or_else(|| Error::status(StatusCode::FILE_INFO, "file not open"))?;
                let crc = tfs_crc(0, &file.data);
                if crc != record.crc {
                    return Err(Error::status(
                        StatusCode::GENERAL,
                        format!("crc mismatch: got {:#x}, stored {crc:#x}", record.crc),
                    ));
                }
                let size = i32::try_from(file.data.len()).unwrap_or(i32::MAX);
                file.closed = true;
                file.info = RawFileInfo {
                    id: record.file_id,
                    offset: 0,
                    size,
                    u_size: size,
                    modify_time: 1,
                    create_time: 1,
                    flag: FileFlag::NORMAL,
                    crc,
                };
                Ok(status::frame(StatusCode::OK, ""))
            }
            MessageType::READ_DATA | MessageType::READ_DATA_V2 => {
                let req = data::parse_read_request(frame)?;
                let Some(file) = cluster
                    .files
                    .get(&(req.block_id, req.file_id))
                    .filter(|f| f.closed)
                else {
                    return Ok(data::read_error_response(StatusCode::FILE_INFO.0).into_frame());
                };
                if !file.info.flag.is_normal() && req.flag != data::READ_STAT_FORCE {
                    return Ok(data::read_error_response(StatusCode::FILE_STATUS.0).into_frame());
                }
                let offset = usize::try_from(req.offset).unwrap_or(usize::MAX);
                if offset > file.data.len() {
                    return Ok(data::read_error_response(StatusCode::READ_OFFSET.0).into_frame());
                }
                let end = (offset + req.length as usize).min(file.data.len());
                let info = req.v2.then_some(&file.info);
                Ok(data::read_response(&file.data[offset..end], info).into_frame())
            }
            MessageType::FILE_INFO => {
                let key = (r.u32()?, r.u64()?);
                let mode = r.u32()?;
                let file = cluster
                    .files
                    .get(&key)
                    .filter(|f| f.closed)
                    .ok_or_else(|| Error::status(StatusCode::FILE_INFO, "file not found"))?;
                if !file.info.flag.is_normal() && mode != data::STAT_FORCE {
                    return Err(Error::status(StatusCode::FILE_STATUS, "file is deleted"));
                }
                Ok(data::stat_response(&file.info).into_frame())
            }
            MessageType::UNLINK_FILE => {
                let key = (r.u32()?, r.u64()?);
                let mode = r.u32()?;
                let file = cluster
                    .files
                    .get_mut(&key)
                    .ok_or_else(|| Error::status(StatusCode::FILE_INFO, "file not found"))?;
                let flag = file.info.flag;
                let next = match mode {
                    0 => (flag != FileFlag::DELETED).then_some(FileFlag::DELETED),
                    2 => (flag == FileFlag::DELETED).then_some(FileFlag::NORMAL),
                    4 => flag.is_normal().then_some(FileFlag::CONCEAL),
                    6 => (flag == FileFlag::CONCEAL).then_some(FileFlag::NORMAL),
                    _ => None,
                };
                let next = next.ok_or_else(|| {
                    Error::status(StatusCode::FILE_STATUS, format!("unlink mode {mode} on flag {}", flag.0))
                })?;
                file.info.flag = next;
                Ok(status::frame(StatusCode::OK, &file.data.len().to_string()))
            }
            other => Err(Error::decode(format!("data server got {other:?}"))),
        }
    }

    fn meta_server(&self, frame: &Frame) -> Result<Frame> {
        let record = meta::parse_meta_request(frame)?;
        let mut cluster = self.cluster.lock();
        if record.table_version != cluster.table_version {
            return Err(Error::status(
                StatusCode::TABLE_VERSION,
                format!("table version {} is stale", record.table_version),
            ));
        }
        let tree = &mut cluster.meta;
        let path = record.path.as_str();
        match record.call {
            MetaCall::Action { new_path, action } => {
                tree.apply(path, new_path.as_deref(), action)?;
                Ok(status::frame(StatusCode::OK, ""))
            }
            MetaCall::ReadFrags { offset, size } => {
                Ok(meta::read_frags_response(&tree.read_frags(path, offset, size)?).into_frame())
            }
            MetaCall::WriteFrags(info) => {
                tree.write_frags(path, info)?;
                Ok(status::frame(StatusCode::OK, ""))
            }
            MetaCall::Ls { pid, file_type } => {
                Ok(meta::ls_response(&tree.ls(path, pid, file_type)?).into_frame())
            }
        }
    }
}

fn corrupt(reply: Frame) -> Frame {
    // data starts after the i32 length
    if reply.is_status() || reply.body.len() <= 4 {
        return reply;
    }
    let mut body = BytesMut::from(&reply.body[..]);
    body[4] ^= 0xff;
    Frame {
        header: reply.header,
        body: body.freeze(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, role: PeerRole, addr: ServerAddr, packet: Bytes) -> Result<Frame> {
        let mut buf = BytesMut::from(&packet[..]);
        let frame = match Frame::decode(&mut buf)? {
            Decoded::Complete(frame) => frame,
            Decoded::NeedMore(n) => {
                return Err(Error::decode(format!("truncated packet, {n} bytes short")));
            }
        };
        self.calls.lock().push(CallRecord {
            role,
            addr,
            msg_type: frame.msg_type(),
            frame: frame.clone(),
        });

        let fault = self.fault_for(role, addr, &frame);
        match fault {
            Some(FaultKind::Reset) => {
                return Err(Error::ConnectionReset(format!("{role} {addr}")));
            }
            Some(FaultKind::Status(code)) => return Ok(status::frame(code, "injected failure")),
            Some(FaultKind::Hang) => return std::future::pending().await,
            Some(FaultKind::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(FaultKind::Corrupt) | None => {}
        }
        let reply = self.serve(role, addr, &frame);
        Ok(if matches!(fault, Some(FaultKind::Corrupt)) {
            corrupt(reply)
        } else {
            reply
        })
    }
}
