//! Operation state
//!
//! An [`Operation`] is one client request as it moves through the cluster.
//! Each step it enters is appended to a shared [`StateLog`], which survives
//! an aborted request so its rollback can still be reported.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use tfsproxy_common::{ActionKind, Error, FileId, Result, ServerAddr};
use tfsproxy_proto::BlockInfo;
use tracing::debug;

use crate::routing::{ClusterRoute, Intent};

static OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Steps of the request state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Routing service login/refresh and cluster selection
    RouteResolve,
    /// Block id to replica list
    BlockResolve,
    GetMetaTable,
    GetFragInfo,
    GroupCount,
    GroupSeq,
    ClusterIdFromName,
    ClusterIdFromMeta,
    StatDupFile,
    CreateFile,
    WriteData,
    CloseFile,
    WriteMeta,
    StatFile,
    ReadMetaSegment,
    ReadData,
    DeleteData,
    NotifyMeta,
    MetaProcess,
    Rollback,
    Done,
    Failed,
}

impl State {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RouteResolve => "ROUTE_RESOLVE",
            Self::BlockResolve => "BLOCK_RESOLVE",
            Self::GetMetaTable => "GET_META_TABLE",
            Self::GetFragInfo => "GET_FRAG_INFO",
            Self::GroupCount => "GET_GROUP_COUNT",
            Self::GroupSeq => "GET_GROUP_SEQ",
            Self::ClusterIdFromName => "GET_CLUSTER_ID_NS",
            Self::ClusterIdFromMeta => "GET_CLUSTER_ID_MS",
            Self::StatDupFile => "STAT_DUP_FILE",
            Self::CreateFile => "CREATE_FILE",
            Self::WriteData => "WRITE_DATA",
            Self::CloseFile => "CLOSE_FILE",
            Self::WriteMeta => "WRITE_META",
            Self::StatFile => "STAT_FILE",
            Self::ReadMetaSegment => "READ_META_SEGMENT",
            Self::ReadData => "READ_DATA",
            Self::DeleteData => "DELETE_DATA",
            Self::NotifyMeta => "NOTIFY_META",
            Self::MetaProcess => "META_PROCESS",
            Self::Rollback => "ROLLBACK",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered record of entered states
#[derive(Debug, Clone, Default)]
pub struct StateLog(Arc<Mutex<Vec<State>>>);

impl StateLog {
    fn push(&self, state: State) {
        self.0.lock().push(state);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<State> {
        self.0.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<State> {
        self.0.lock().last().copied()
    }
}

/// Cluster a request is routed to and the choice that picked it. Failover
/// moves to the next cluster matching the same choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCursor {
    pub intent: Intent,
    /// Zero allows any cluster serving `intent`
    pub cluster_id: u32,
    pub current: ClusterRoute,
}

/// One client request
#[derive(Debug)]
pub struct Operation {
    id: u64,
    action: ActionKind,
    log: StateLog,
    retries: u32,
    max_retries: u32,
    route: Option<RouteCursor>,
}

impl Operation {
    #[must_use]
    pub fn new(action: ActionKind, max_retries: u32) -> Self {
        Self {
            id: OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            action,
            log: StateLog::default(),
            retries: 0,
            max_retries,
            route: None,
        }
    }

    /// Sub-operation for one segment. It keeps its own retry budget and
    /// state log; the parent only sees its result. It may only fail over
    /// within a known cluster id, so all segments of a file share one.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut child = Self::new(self.action, self.max_retries);
        child.route = self.route.filter(|r| r.cluster_id != 0);
        child
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn action(&self) -> ActionKind {
        self.action
    }

    #[must_use]
    pub fn log(&self) -> StateLog {
        self.log.clone()
    }

    #[must_use]
    pub fn state(&self) -> Option<State> {
        self.log.last()
    }

    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Cluster the request currently talks to, if it was routed through
    /// the routing service
    #[must_use]
    pub const fn route(&self) -> Option<RouteCursor> {
        self.route
    }

    pub fn set_route(&mut self, route: RouteCursor) {
        self.route = Some(route);
    }

    /// Restrict failover to the current cluster id once data depends on it
    pub fn pin_cluster(&mut self) {
        if let Some(route) = &mut self.route {
            if route.current.cluster_id != 0 {
                route.cluster_id = route.current.cluster_id;
            }
        }
    }

    pub fn enter(&mut self, state: State) {
        debug!("op {} {}: -> {}", self.id, self.action, state);
        self.log.push(state);
    }

    /// Spend one name/routing round trip on a recoverable failure, or give
    /// up with `err` once the ceiling is reached.
    pub fn retry(&mut self, err: Error) -> Result<()> {
        if self.retries >= self.max_retries {
            debug!(
                "op {} {}: retry ceiling {} reached: {}",
                self.id, self.action, self.max_retries, err
            );
            return Err(err);
        }
        self.retries += 1;
        debug!(
            "op {} {}: retry {}/{} after {}",
            self.id, self.action, self.retries, self.max_retries, err
        );
        Ok(())
    }
}

/// Order in which the replicas of a block are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOrder {
    /// Random start, then round-robin (reads and stats)
    Random,
    /// Replica 0 first, then the others in list order (writes)
    InOrder,
    /// Replica 0 only (unlink must reach the master)
    MasterOnly,
}

/// Walks a replica list; each replica is tried at most once
#[derive(Debug, Clone)]
pub struct ReplicaCursor {
    addrs: Vec<ServerAddr>,
    start: usize,
    tried: usize,
    limit: usize,
}

impl ReplicaCursor {
    #[must_use]
    pub fn new(addrs: Vec<ServerAddr>, order: ReplicaOrder) -> Self {
        let start = match order {
            ReplicaOrder::Random if addrs.len() > 1 => rand::thread_rng().gen_range(0..addrs.len()),
            _ => 0,
        };
        let limit = match order {
            ReplicaOrder::MasterOnly => addrs.len().min(1),
            _ => addrs.len(),
        };
        Self {
            addrs,
            start,
            tried: 0,
            limit,
        }
    }

    /// Replica to use now, `None` once the list is exhausted
    #[must_use]
    pub fn current(&self) -> Option<ServerAddr> {
        if self.tried >= self.limit {
            return None;
        }
        Some(self.addrs[(self.start + self.tried) % self.addrs.len()])
    }

    /// Index of the current replica in the list
    #[must_use]
    pub fn index(&self) -> usize {
        (self.start + self.tried) % self.addrs.len().max(1)
    }

    pub fn advance(&mut self) {
        self.tried += 1;
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.tried >= self.limit
    }
}

/// A data file that was fully written and must be deleted if the request
/// as a whole fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub block: BlockInfo,
    pub file_id: FileId,
}

/// Files written so far by a request, shared with its sub-operations
#[derive(Debug, Clone, Default)]
pub struct RollbackLedger(Arc<Mutex<Vec<WrittenFile>>>);

impl RollbackLedger {
    pub fn record(&self, file: WrittenFile) {
        self.0.lock().push(file);
    }

    /// Take every recorded file, leaving the ledger empty
    #[must_use]
    pub fn take(&self) -> Vec<WrittenFile> {
        std::mem::take(&mut *self.0.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
