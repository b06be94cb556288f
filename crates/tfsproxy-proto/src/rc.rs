//! Routing (rc) service messages
//!
//! Login returns a session id and the routing info for the application:
//! the logical clusters with their read/write physical clusters, the
//! clusters used for unlink, the meta root server and the remote cache
//! settings. Keepalive refreshes that info when it changed on the server.

use std::net::Ipv4Addr;
use std::str::FromStr;

use tfsproxy_common::{AppId, Error, Result, ServerAddr};

use crate::codec::{Frame, MessageType, PacketBuilder, Reader};
use crate::status;

/// Client version string reported in keepalives
pub const CLIENT_VERSION: &str = "NGINX";

/// Access granted on a physical cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Forbidden,
    ReadOnly,
    ReadWrite,
}

impl AccessType {
    #[must_use]
    pub const fn from_wire(v: u32) -> Self {
        match v {
            1 => Self::ReadOnly,
            2 => Self::ReadWrite,
            _ => Self::Forbidden,
        }
    }

    #[must_use]
    pub const fn wire_value(self) -> u32 {
        match self {
            Self::Forbidden => 0,
            Self::ReadOnly => 1,
            Self::ReadWrite => 2,
        }
    }
}

/// Numeric cluster id from its text form (`"T1..."` style: second char)
#[must_use]
pub fn cluster_id_from_text(text: &str) -> u32 {
    text.as_bytes()
        .get(1)
        .map_or(0, |c| u32::from(c.wrapping_sub(b'0')))
}

/// Parse an `ip:port` name server address
pub fn parse_ns_vip(text: &str) -> Result<ServerAddr> {
    ServerAddr::from_str(text).or_else(|_| {
        // Some deployments publish a bare host without a port
        Ipv4Addr::from_str(text.trim())
            .map(|ip| ServerAddr::new(ip, 0))
            .map_err(|e| Error::decode(format!("invalid name server address {text}: {e}")))
    })
}

/// One physical cluster (name server plus its data servers)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalCluster {
    pub cluster_stat: u32,
    pub access_type: AccessType,
    pub cluster_id_text: String,
    pub ns_vip_text: String,
    pub ns_vip: ServerAddr,
}

impl PhysicalCluster {
    #[must_use]
    pub fn cluster_id(&self) -> u32 {
        cluster_id_from_text(&self.cluster_id_text)
    }
}

/// A set of physical clusters serving the same data
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalCluster {
    pub need_duplicate: bool,
    /// Dedup store address list, as published by the routing service
    pub dup_server_info: Option<String>,
    pub rw_clusters: Vec<PhysicalCluster>,
}

/// One name server group of an unlink cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    /// Learned from the name server; `-1` until then
    pub group_seq: i32,
    pub ns_vip_text: String,
    pub ns_vip: ServerAddr,
}

/// Name server groups of one cluster used for unlink/update
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterGroupInfo {
    pub cluster_id: u32,
    /// Learned from the name server; `0` until then
    pub group_count: i32,
    pub groups: Vec<GroupInfo>,
}

/// Routing info for one application
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RcInfo {
    pub rc_servers: Vec<ServerAddr>,
    pub logical_clusters: Vec<LogicalCluster>,
    pub report_interval: u32,
    pub modify_time: u64,
    pub meta_root_server: ServerAddr,
    pub remote_block_cache_info: String,
    pub unlink_clusters: Vec<ClusterGroupInfo>,
    pub use_remote_block_cache: bool,
}

impl RcInfo {
    /// Decode the routing info body
    pub fn parse(r: &mut Reader<'_>) -> Result<Self> {
        let count = r.count(8, "rc server")?;
        let rc_servers = (0..count).map(|_| r.addr()).collect::<Result<Vec<_>>>()?;

        // need_duplicate and the rw cluster count
        let logical_count = r.count(5, "logical cluster")?;
        let mut logical_clusters = Vec::with_capacity(logical_count as usize);
        for _ in 0..logical_count {
            let need_duplicate = r.u8()? != 0;
            let dup_server_info = if need_duplicate {
                Some(r.cstr()?).filter(|s| !s.is_empty())
            } else {
                None
            };

            let rw_count = r.count(16, "rw cluster")?;
            let mut rw_clusters = Vec::with_capacity(rw_count as usize);
            for _ in 0..rw_count {
                let cluster_stat = r.u32()?;
                let access_type = AccessType::from_wire(r.u32()?);
                let cluster_id_text = required_cstr(r, "cluster id")?;
                let ns_vip_text = required_cstr(r, "name server vip")?;
                let ns_vip = parse_ns_vip(&ns_vip_text)?;
                rw_clusters.push(PhysicalCluster {
                    cluster_stat,
                    access_type,
                    cluster_id_text,
                    ns_vip_text,
                    ns_vip,
                });
            }
            logical_clusters.push(LogicalCluster {
                need_duplicate,
                dup_server_info,
                rw_clusters,
            });
        }

        let report_interval = r.u32()?;
        let modify_time = r.u64()?;
        let meta_root_server = r.addr()?;
        let remote_block_cache_info = r.cstr()?;

        let unlink_count = r.count(16, "unlink cluster")?;
        let mut unlink_clusters: Vec<ClusterGroupInfo> = Vec::new();
        for _ in 0..unlink_count {
            // cluster_stat and access_type are not used for unlink
            r.skip(8)?;
            let cluster_id_text = required_cstr(r, "unlink cluster id")?;
            let cluster_id = cluster_id_from_text(&cluster_id_text);
            let ns_vip_text = required_cstr(r, "unlink name server vip")?;
            let ns_vip = parse_ns_vip(&ns_vip_text)?;
            let group = GroupInfo {
                group_seq: -1,
                ns_vip_text,
                ns_vip,
            };
            match unlink_clusters.iter_mut().find(|c| c.cluster_id == cluster_id) {
                Some(existing) => existing.groups.push(group),
                None => unlink_clusters.push(ClusterGroupInfo {
                    cluster_id,
                    group_count: 0,
                    groups: vec![group],
                }),
            }
        }

        let use_remote_block_cache = r.u32()? != 0;

        Ok(Self {
            rc_servers,
            logical_clusters,
            report_interval,
            modify_time,
            meta_root_server,
            remote_block_cache_info,
            unlink_clusters,
            use_remote_block_cache,
        })
    }

    /// Encode the routing info body
    pub fn encode(&self, b: &mut PacketBuilder) {
        put_len(b, self.rc_servers.len());
        for addr in &self.rc_servers {
            b.put_addr(*addr);
        }

        put_len(b, self.logical_clusters.len());
        for logical in &self.logical_clusters {
            b.put_u8(u8::from(logical.need_duplicate));
            if logical.need_duplicate {
                b.put_opt_cstr(logical.dup_server_info.as_deref().unwrap_or_default());
            }
            put_len(b, logical.rw_clusters.len());
            for cluster in &logical.rw_clusters {
                b.put_u32(cluster.cluster_stat)
                    .put_u32(cluster.access_type.wire_value())
                    .put_cstr(&cluster.cluster_id_text)
                    .put_cstr(&cluster.ns_vip_text);
            }
        }

        b.put_u32(self.report_interval)
            .put_u64(self.modify_time)
            .put_addr(self.meta_root_server)
            .put_opt_cstr(&self.remote_block_cache_info);

        let groups: usize = self.unlink_clusters.iter().map(|c| c.groups.len()).sum();
        put_len(b, groups);
        for cluster in &self.unlink_clusters {
            let id_text = format!("T{}", cluster.cluster_id);
            for group in &cluster.groups {
                b.put_u32(1)
                    .put_u32(AccessType::ReadWrite.wire_value())
                    .put_cstr(&id_text)
                    .put_cstr(&group.ns_vip_text);
            }
        }

        b.put_u32(u32::from(self.use_remote_block_cache));
    }

    /// Whether any logical cluster asks for content dedup
    #[must_use]
    pub fn need_duplicate(&self) -> bool {
        self.logical_clusters.iter().any(|c| c.need_duplicate)
    }
}

fn required_cstr(r: &mut Reader<'_>, what: &str) -> Result<String> {
    let s = r.cstr()?;
    if s.is_empty() {
        return Err(Error::decode(format!("empty {what} in rc info")));
    }
    Ok(s)
}

#[allow(clippy::cast_possible_truncation)]
fn put_len(b: &mut PacketBuilder, len: usize) {
    b.put_u32(len as u32);
}

/// Login answer: session id and routing info
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginResponse {
    pub session_id: String,
    pub app_id: AppId,
    pub info: RcInfo,
}

/// Encode a login request
#[must_use]
pub fn encode_login(app_key: &str, app_ip: Ipv4Addr) -> bytes::Bytes {
    let mut b = PacketBuilder::new(MessageType::REQ_RC_LOGIN);
    b.put_cstr(app_key)
        .put_u64(u64::from(u32::from_le_bytes(app_ip.octets())));
    b.finish()
}

/// Decode a login answer
pub fn parse_login(frame: &Frame) -> Result<LoginResponse> {
    status::check(frame, "login rc")?;
    frame.expect(MessageType::RSP_RC_LOGIN)?;
    let mut r = frame.reader();
    let session_id = r.cstr()?;
    let app_id = app_id_from_session(&session_id)?;
    let info = RcInfo::parse(&mut r)?;
    Ok(LoginResponse {
        session_id,
        app_id,
        info,
    })
}

/// Build a login answer
#[must_use]
pub fn login_response(session_id: &str, info: &RcInfo) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::RSP_RC_LOGIN);
    b.put_cstr(session_id);
    info.encode(&mut b);
    b
}

/// Application id is the decimal prefix of the session id before `-`
pub fn app_id_from_session(session_id: &str) -> Result<AppId> {
    let (prefix, _) = session_id
        .split_once('-')
        .ok_or_else(|| Error::decode(format!("invalid session id: {session_id}")))?;
    prefix
        .parse()
        .map_err(|e| Error::decode(format!("invalid session id {session_id}: {e}")))
}

/// Operation class reported in keepalive statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperType {
    Read = 1,
    Write = 2,
    Unlink = 3,
}

/// Per-operation counters reported in a keepalive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperStat {
    pub oper_type: OperType,
    pub times: u64,
    pub size: u64,
    pub rt: u64,
    pub succ: u64,
}

/// Keepalive (or logout) request
#[derive(Clone, Debug, Default)]
pub struct Keepalive {
    pub session_id: String,
    pub modify_time: u64,
    pub stats: Vec<OperStat>,
    pub last_report_time: u64,
}

impl Keepalive {
    fn encode_as(&self, msg_type: MessageType, is_logout: bool) -> bytes::Bytes {
        let mut b = PacketBuilder::new(msg_type);
        b.put_cstr(&self.session_id)
            .put_cstr(CLIENT_VERSION)
            // cache size, cache time
            .put_u64(0)
            .put_u64(0)
            .put_u64(self.modify_time)
            .put_u8(u8::from(is_logout));
        put_len(&mut b, self.stats.len());
        for stat in &self.stats {
            b.put_u32(stat.oper_type as u32)
                .put_u64(stat.times)
                .put_u64(stat.size)
                .put_u64(stat.rt)
                .put_u64(stat.succ);
        }
        // cache hit ratio
        b.put_u64(0).put_u64(self.last_report_time);
        b.finish()
    }

    #[must_use]
    pub fn encode(&self) -> bytes::Bytes {
        self.encode_as(MessageType::REQ_RC_KEEPALIVE, false)
    }

    #[must_use]
    pub fn encode_logout(&self) -> bytes::Bytes {
        self.encode_as(MessageType::REQ_RC_LOGOUT, true)
    }
}

/// Decode a keepalive answer; `Some` when the routing info changed
pub fn parse_keepalive(frame: &Frame) -> Result<Option<RcInfo>> {
    status::check(frame, "keepalive rc")?;
    frame.expect(MessageType::RSP_RC_KEEPALIVE)?;
    let mut r = frame.reader();
    if r.u8()? == 0 {
        return Ok(None);
    }
    RcInfo::parse(&mut r).map(Some)
}

/// Build a keepalive answer
#[must_use]
pub fn keepalive_response(update: Option<&RcInfo>) -> PacketBuilder {
    let mut b = PacketBuilder::new(MessageType::RSP_RC_KEEPALIVE);
    match update {
        Some(info) => {
            b.put_u8(1);
            info.encode(&mut b);
        }
        None => {
            b.put_u8(0);
        }
    }
    b
}
