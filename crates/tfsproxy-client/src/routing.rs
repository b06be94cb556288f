//! Routing context
//!
//! Everything the engine learns from the routing (rc) service and the root
//! service, shared by all operations: the login session with its cluster
//! list, the meta table, and the name server group layout used by unlinks.
//! Keepalives refresh the cluster list and report per-operation counters.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tfsproxy_common::config::UpstreamConfig;
use tfsproxy_common::{AppId, Error, Result, ServerAddr};
use tfsproxy_proto::name::{self, ClientCmd};
use tfsproxy_proto::rc::{self, AccessType, ClusterGroupInfo, Keepalive, OperStat, OperType};
use tfsproxy_proto::{MetaTable, RcInfo, root, status};
use tracing::{debug, info, warn};

use crate::operation::{Operation, State};
use crate::peer::{PeerRole, Transport};

/// Logged-in session with the routing service
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub app_id: AppId,
    pub info: Arc<RcInfo>,
}

/// What a request is about to do with the cluster it is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
    Remove,
}

impl Intent {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Remove => "remove",
        }
    }
}

/// Name server picked for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRoute {
    pub ns_addr: ServerAddr,
    /// Zero when the routing service did not publish one
    pub cluster_id: u32,
    pub need_duplicate: bool,
}

pub struct RoutingContext {
    upstream: UpstreamConfig,
    transport: Arc<dyn Transport>,
    session: RwLock<Option<Arc<Session>>>,
    /// Held while a first login is in flight
    login_lock: tokio::sync::Mutex<()>,
    next_rc: AtomicUsize,
    meta_table: RwLock<Option<Arc<MetaTable>>>,
    /// Learned from name servers: cluster id -> group count
    group_counts: Mutex<HashMap<u32, i32>>,
    /// Learned from name servers: name server -> group sequence
    group_seqs: Mutex<HashMap<ServerAddr, i32>>,
    /// Learned from name servers when the routing service has no cluster id
    cluster_ids: Mutex<HashMap<ServerAddr, u32>>,
    stats: Mutex<HashMap<OperType, OperStat>>,
    last_report: AtomicU64,
}

impl RoutingContext {
    #[must_use]
    pub fn new(upstream: UpstreamConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            upstream,
            transport,
            session: RwLock::new(None),
            login_lock: tokio::sync::Mutex::new(()),
            next_rc: AtomicUsize::new(0),
            meta_table: RwLock::new(None),
            group_counts: Mutex::new(HashMap::new()),
            group_seqs: Mutex::new(HashMap::new()),
            cluster_ids: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            last_report: AtomicU64::new(0),
        }
    }

    /// A static name server without routing servers skips the rc service
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.upstream.rc_servers.is_empty()
    }

    /// Current session, logging in first if needed. Concurrent callers
    /// share a single login.
    pub async fn session(&self) -> Result<Option<Arc<Session>>> {
        if self.is_static() {
            return Ok(None);
        }
        if let Some(session) = self.session.read().clone() {
            return Ok(Some(session));
        }
        let _login = self.login_lock.lock().await;
        if let Some(session) = self.session.read().clone() {
            return Ok(Some(session));
        }
        self.login().await.map(Some)
    }

    /// Log in, trying the routing servers round-robin from the last one
    /// that worked
    pub async fn login(&self) -> Result<Arc<Session>> {
        let servers = &self.upstream.rc_servers;
        if servers.is_empty() {
            return Err(Error::Configuration("no rc servers configured".into()));
        }
        let start = self.next_rc.load(Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..servers.len() {
            let idx = (start + i) % servers.len();
            let addr = servers[idx];
            let packet = rc::encode_login(&self.upstream.app_key, Ipv4Addr::UNSPECIFIED);
            let reply = match self.transport.call(PeerRole::RcServer, addr, packet).await {
                Ok(frame) => rc::parse_login(&frame),
                Err(e) => Err(e),
            };
            match reply {
                Ok(login) => {
                    info!(
                        "logged in to rc server {} as app {} ({} logical clusters)",
                        addr,
                        login.app_id,
                        login.info.logical_clusters.len()
                    );
                    self.next_rc.store(idx, Ordering::Relaxed);
                    let session = Arc::new(Session {
                        session_id: login.session_id,
                        app_id: login.app_id,
                        info: Arc::new(login.info),
                    });
                    *self.session.write() = Some(session.clone());
                    return Ok(session);
                }
                Err(e) => {
                    warn!("login to rc server {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::internal("rc login tried no server")))
    }

    /// Application id: from the session, else from configuration
    pub async fn app_id(&self) -> Result<AppId> {
        Ok(self
            .session()
            .await?
            .map_or(self.upstream.app_id, |s| s.app_id))
    }

    /// Whether the routing service allows the remote block cache
    pub async fn remote_cache_allowed(&self) -> Result<bool> {
        Ok(self.upstream.enable_remote_block_cache
            && self
                .session()
                .await?
                .is_some_and(|s| s.info.use_remote_block_cache))
    }

    /// Add one finished operation to the next keepalive report
    pub fn record(&self, oper_type: OperType, size: u64, rt: Duration, succeeded: bool) {
        let mut stats = self.stats.lock();
        let stat = stats.entry(oper_type).or_insert(OperStat {
            oper_type,
            times: 0,
            size: 0,
            rt: 0,
            succ: 0,
        });
        stat.times += 1;
        stat.size += size;
        stat.rt += u64::try_from(rt.as_micros()).unwrap_or(u64::MAX);
        if succeeded {
            stat.succ += 1;
        }
    }

    fn drain_stats(&self) -> Vec<OperStat> {
        let mut stats: Vec<OperStat> = self.stats.lock().drain().map(|(_, s)| s).collect();
        stats.sort_by_key(|s| s.oper_type as u32);
        stats
    }

    /// Report counters and pick up a changed cluster list. Returns true
    /// when the routing info was replaced.
    pub async fn keepalive(&self) -> Result<bool> {
        let Some(session) = self.session().await? else {
            return Ok(false);
        };
        let now = unix_now();
        let request = Keepalive {
            session_id: session.session_id.clone(),
            modify_time: session.info.modify_time,
            stats: self.drain_stats(),
            last_report_time: self.last_report.swap(now, Ordering::Relaxed),
        };
        let addr = self.current_rc()?;
        let frame = self
            .transport
            .call(PeerRole::RcServer, addr, request.encode())
            .await
            .inspect_err(|e| {
                warn!("keepalive to rc server {} failed: {}", addr, e);
                self.next_rc.fetch_add(1, Ordering::Relaxed);
            })?;

        match rc::parse_keepalive(&frame)? {
            Some(info) => {
                info!(
                    "rc info updated (modify time {} -> {})",
                    session.info.modify_time, info.modify_time
                );
                let updated = Arc::new(Session {
                    session_id: session.session_id.clone(),
                    app_id: session.app_id,
                    info: Arc::new(info),
                });
                *self.session.write() = Some(updated);
                self.group_counts.lock().clear();
                self.group_seqs.lock().clear();
                Ok(true)
            }
            None => {
                debug!("rc info unchanged");
                Ok(false)
            }
        }
    }

    /// Close the session with the routing service
    pub async fn logout(&self) -> Result<()> {
        let Some(session) = self.session.write().take() else {
            return Ok(());
        };
        let request = Keepalive {
            session_id: session.session_id.clone(),
            modify_time: session.info.modify_time,
            stats: self.drain_stats(),
            last_report_time: self.last_report.load(Ordering::Relaxed),
        };
        let addr = self.current_rc()?;
        let frame = self
            .transport
            .call(PeerRole::RcServer, addr, request.encode_logout())
            .await?;
        status::check(&frame, "logout rc")?;
        info!("logged out of rc server {}", addr);
        Ok(())
    }

    fn current_rc(&self) -> Result<ServerAddr> {
        let servers = &self.upstream.rc_servers;
        if servers.is_empty() {
            return Err(Error::Configuration("no rc servers configured".into()));
        }
        Ok(servers[self.next_rc.load(Ordering::Relaxed) % servers.len()])
    }

    /// Meta table, fetched from the root server on first use or on demand
    pub async fn meta_table(&self, refresh: bool) -> Result<Arc<MetaTable>> {
        if !refresh {
            if let Some(table) = self.meta_table.read().clone() {
                return Ok(table);
            }
        }

        let root = match self.upstream.root_server {
            Some(addr) => addr,
            None => self
                .session()
                .await?
                .map(|s| s.info.meta_root_server)
                .filter(|a| !a.is_unset())
                .ok_or_else(|| Error::Configuration("no root server known".into()))?,
        };
        let frame = self
            .transport
            .call(PeerRole::RootServer, root, root::encode_get_table())
            .await?;
        let table = Arc::new(root::parse_table(&frame)?);
        info!("meta table version {} from root server {}", table.version, root);
        *self.meta_table.write() = Some(table.clone());
        Ok(table)
    }

    /// Pick the name server for `intent`. `cluster_id` restricts the choice
    /// when the file's cluster is known.
    pub async fn route(&self, intent: Intent, cluster_id: u32) -> Result<ClusterRoute> {
        self.route_after(intent, cluster_id, None).await
    }

    /// Like [`route`](Self::route), but picks the cluster listed after the
    /// one behind `failed`, wrapping around to the first
    pub async fn route_after(
        &self,
        intent: Intent,
        cluster_id: u32,
        failed: Option<ServerAddr>,
    ) -> Result<ClusterRoute> {
        let Some(session) = self.session().await? else {
            let ns_addr = self
                .upstream
                .name_server
                .ok_or_else(|| Error::Configuration("no name server configured".into()))?;
            return Ok(ClusterRoute {
                ns_addr,
                cluster_id,
                need_duplicate: false,
            });
        };
        select_cluster(&session.info, intent, cluster_id, failed).ok_or_else(|| {
            Error::NotFound(format!(
                "no {} cluster for cluster id {cluster_id}",
                intent.as_str()
            ))
        })
    }

    /// Name server for an unlink of `block_id`. Clusters split into
    /// several name server groups own the blocks where
    /// `block_id % group_count == group_seq`; count and sequences are
    /// asked from the name servers once and remembered.
    pub async fn route_unlink(
        &self,
        op: &mut Operation,
        cluster_id: u32,
        block_id: u32,
    ) -> Result<ClusterRoute> {
        let groups = match self.session().await? {
            Some(session) => unlink_groups(&session.info, cluster_id),
            None => None,
        };
        let Some(groups) = groups.filter(|g| !g.groups.is_empty()) else {
            return self.route(Intent::Remove, cluster_id).await;
        };
        if groups.groups.len() == 1 {
            return Ok(ClusterRoute {
                ns_addr: groups.groups[0].ns_vip,
                cluster_id: groups.cluster_id,
                need_duplicate: false,
            });
        }

        let cached = self.group_counts.lock().get(&groups.cluster_id).copied();
        let count = match cached {
            Some(count) => count,
            None => {
                op.enter(State::GroupCount);
                let count = self
                    .client_cmd(groups.groups[0].ns_vip, ClientCmd::GetGroupCount)
                    .await?;
                self.group_counts.lock().insert(groups.cluster_id, count);
                count
            }
        };
        let wanted = i64::from(block_id) % i64::from(count.max(1));

        let mut entered = false;
        for group in &groups.groups {
            let cached = self.group_seqs.lock().get(&group.ns_vip).copied();
            let seq = match cached {
                Some(seq) => seq,
                None => {
                    if !entered {
                        op.enter(State::GroupSeq);
                        entered = true;
                    }
                    let seq = self.client_cmd(group.ns_vip, ClientCmd::GetGroupSeq).await?;
                    self.group_seqs.lock().insert(group.ns_vip, seq);
                    seq
                }
            };
            if i64::from(seq) == wanted {
                debug!(
                    "block {} belongs to group {} ({} of {})",
                    block_id, group.ns_vip, seq, count
                );
                return Ok(ClusterRoute {
                    ns_addr: group.ns_vip,
                    cluster_id: groups.cluster_id,
                    need_duplicate: false,
                });
            }
        }
        Err(Error::NotFound(format!(
            "no name server group owns block {block_id} in cluster {}",
            groups.cluster_id
        )))
    }

    /// Numeric cluster id of the cluster behind `ns_addr`, asked from the
    /// name server once
    pub async fn cluster_id_from_name(&self, op: &mut Operation, ns_addr: ServerAddr) -> Result<u32> {
        let cached = self.cluster_ids.lock().get(&ns_addr).copied();
        if let Some(id) = cached {
            return Ok(id);
        }
        op.enter(State::ClusterIdFromName);
        let id = self.client_cmd(ns_addr, ClientCmd::GetClusterId).await?;
        let id = u32::try_from(id)
            .map_err(|_| Error::decode(format!("name server {ns_addr} sent cluster id {id}")))?;
        self.cluster_ids.lock().insert(ns_addr, id);
        Ok(id)
    }

    async fn client_cmd(&self, ns_addr: ServerAddr, cmd: ClientCmd) -> Result<i32> {
        let frame = self
            .transport
            .call(PeerRole::NameServer, ns_addr, name::encode_client_cmd(cmd))
            .await?;
        name::parse_client_cmd(&frame, cmd)
    }
}

/// Clusters serving `intent` whose id matches (any id when zero), in
/// routing service order
pub fn eligible_clusters(
    info: &RcInfo,
    intent: Intent,
    cluster_id: u32,
) -> impl Iterator<Item = ClusterRoute> + '_ {
    info.logical_clusters.iter().flat_map(move |logical| {
        logical
            .rw_clusters
            .iter()
            .filter(move |c| {
                let access_ok = match intent {
                    Intent::Read => c.access_type != AccessType::Forbidden,
                    Intent::Write | Intent::Remove => c.access_type == AccessType::ReadWrite,
                };
                access_ok && (cluster_id == 0 || c.cluster_id() == cluster_id)
            })
            .map(|c| ClusterRoute {
                ns_addr: c.ns_vip,
                cluster_id: c.cluster_id(),
                need_duplicate: logical.need_duplicate,
            })
    })
}

/// First eligible cluster, or the one after the cluster behind `failed`.
/// The choice wraps around, so a single eligible cluster is picked again.
#[must_use]
pub fn select_cluster(
    info: &RcInfo,
    intent: Intent,
    cluster_id: u32,
    failed: Option<ServerAddr>,
) -> Option<ClusterRoute> {
    let eligible: Vec<ClusterRoute> = eligible_clusters(info, intent, cluster_id).collect();
    let next = failed
        .and_then(|ns| eligible.iter().position(|c| c.ns_addr == ns))
        .map_or(0, |i| (i + 1) % eligible.len());
    eligible.get(next).copied()
}

fn unlink_groups(info: &RcInfo, cluster_id: u32) -> Option<ClusterGroupInfo> {
    info.unlink_clusters
        .iter()
        .find(|c| cluster_id == 0 || c.cluster_id == cluster_id)
        .cloned()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
