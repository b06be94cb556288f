//! Protocol engine
//!
//! [`Engine`] turns one [`ActionRequest`] into the conversation it needs
//! with the routing, name, meta and data servers, and answers with exactly
//! one [`ActionOutcome`]. Raw file actions live in `raw`, named file actions
//! in `custom`, segment fan-out in `batch`; this module holds the request
//! lifecycle and the replica handling they share.
//!
//! Recovery follows the failing role:
//! - a data server failure invalidates the cached block and moves to the
//!   next replica;
//! - an exhausted replica list goes back to the name server, spending one
//!   retry unless the list came from the local cache;
//! - a spent retry moves on to the next cluster able to serve the request,
//!   while a free re-resolve of a locally cached list stays where it is;
//! - a meta server failure refreshes the meta table.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::json;
use tfsproxy_common::{ActionKind, BlockId, Error, FileId, FsVersion, ProxyConfig, Result, ServerAddr, StatusCode, UnlinkType};
use tfsproxy_proto::rc::OperType;
use tfsproxy_proto::{BlockInfo, Frame, OpenMode, data, name};
use tracing::{debug, info, warn};

use crate::action::{ActionOutcome, ActionRequest};
use crate::block_cache::{BlockLocationCache, CacheKey, Provenance, RemoteBlockCache};
use crate::dedup::DedupStore;
use crate::operation::{Operation, ReplicaCursor, ReplicaOrder, RollbackLedger, RouteCursor, State};
use crate::peer::{PeerRole, Transport};
use crate::planner::Segment;
use crate::routing::{ClusterRoute, Intent, RoutingContext};

/// Replica list of the block an operation is working on, and where it is
/// in that list
#[derive(Debug)]
pub(crate) struct BlockTarget {
    pub ns_addr: ServerAddr,
    pub mode: OpenMode,
    pub block: BlockInfo,
    pub provenance: Provenance,
    order: ReplicaOrder,
    cursor: ReplicaCursor,
    refreshed: bool,
    invalidated: bool,
    last_error: Option<Error>,
}

impl BlockTarget {
    pub fn new(
        ns_addr: ServerAddr,
        mode: OpenMode,
        block: BlockInfo,
        provenance: Provenance,
        order: ReplicaOrder,
    ) -> Self {
        Self {
            ns_addr,
            mode,
            cursor: ReplicaCursor::new(block.ds_addrs.clone(), order),
            block,
            provenance,
            order,
            refreshed: false,
            invalidated: false,
            last_error: None,
        }
    }

    /// Block id to ask the name server for; new files get a new block
    fn request_id(&self) -> BlockId {
        if self.mode.contains(OpenMode::CREATE) {
            0
        } else {
            self.block.block_id
        }
    }

    fn reset(&mut self, block: BlockInfo) {
        self.cursor = ReplicaCursor::new(block.ds_addrs.clone(), self.order);
        self.block = block;
        self.provenance = Provenance::Network;
        self.invalidated = false;
    }

    fn key(&self) -> CacheKey {
        CacheKey::new(self.ns_addr, self.block.block_id)
    }
}

/// Errors no other replica can fix
fn is_fatal(err: &Error) -> bool {
    match err {
        Error::Status { code, .. } => matches!(
            *code,
            StatusCode::READ_OFFSET
                | StatusCode::INVALID_ARGUMENT
                | StatusCode::PHYSIC_BLOCK_OFFSET
                | StatusCode::FILE_STATUS
                | StatusCode::PERMISSION_DENY
                | StatusCode::APP_NOT_EXIST
        ),
        Error::Corrupted(_) => false,
        other => !other.is_transport(),
    }
}

pub struct Engine {
    pub(crate) config: ProxyConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cache: Arc<BlockLocationCache>,
    pub(crate) routing: Arc<RoutingContext>,
    pub(crate) dedup: Option<Arc<dyn DedupStore>>,
}

impl Engine {
    #[must_use]
    pub fn new(config: ProxyConfig, transport: Arc<dyn Transport>) -> Self {
        let cache = Arc::new(BlockLocationCache::new(&config.block_cache));
        let routing = Arc::new(RoutingContext::new(config.upstream.clone(), transport.clone()));
        Self {
            config,
            transport,
            cache,
            routing,
            dedup: None,
        }
    }

    #[must_use]
    pub fn with_dedup(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(store);
        self
    }

    /// Attach the shared block cache tier; the routing service decides
    /// whether it is used
    #[must_use]
    pub fn with_remote_cache(mut self, remote: Arc<dyn RemoteBlockCache>) -> Self {
        self.cache = Arc::new(BlockLocationCache::new(&self.config.block_cache).with_remote(remote));
        self
    }

    #[must_use]
    pub fn cache(&self) -> &BlockLocationCache {
        &self.cache
    }

    #[must_use]
    pub fn routing(&self) -> &RoutingContext {
        &self.routing
    }

    pub async fn execute(&self, req: ActionRequest) -> ActionOutcome {
        self.execute_with_abort(req, std::future::pending()).await
    }

    /// Run a request that fails with a timeout once `deadline` passes
    pub async fn execute_with_deadline(&self, req: ActionRequest, deadline: Duration) -> ActionOutcome {
        let kind = req.kind;
        self.execute_with_abort(req, async move {
            tokio::time::sleep(deadline).await;
            Error::Timeout(format!("{kind} exceeded {}ms", deadline.as_millis()))
        })
        .await
    }

    /// Run a request until it finishes or `abort` resolves. Files already
    /// written by a failed or aborted request are deleted before the
    /// outcome is returned.
    pub async fn execute_with_abort(
        &self,
        req: ActionRequest,
        abort: impl Future<Output = Error>,
    ) -> ActionOutcome {
        let mut op = Operation::new(req.kind, self.config.retry.max_retry_count);
        let ledger = RollbackLedger::default();
        let started = Instant::now();

        let result = tokio::select! {
            result = self.dispatch(&req, &mut op, &ledger) => result,
            err = abort => Err(err),
        };

        let mut outcome = match result {
            Ok(outcome) => {
                op.enter(State::Done);
                outcome
            }
            Err(err) => {
                if !ledger.is_empty() {
                    self.rollback(&mut op, &ledger).await;
                }
                op.enter(State::Failed);
                if err.is_retryable() || matches!(err, Error::ClientAbort) {
                    info!("op {} {} failed: {}", op.id(), req.kind, err);
                } else {
                    warn!("op {} {} failed: {}", op.id(), req.kind, err);
                }
                ActionOutcome::failure(req.kind, &err)
            }
        };

        let oper_type = match req.kind {
            ActionKind::ReadFile => Some(OperType::Read),
            ActionKind::WriteFile => Some(OperType::Write),
            ActionKind::RemoveFile => Some(OperType::Unlink),
            _ => None,
        };
        if let Some(oper_type) = oper_type {
            let size = match req.kind {
                ActionKind::WriteFile => req.body.len() as u64,
                _ => outcome.byte_count(),
            };
            self.routing
                .record(oper_type, size, started.elapsed(), outcome.is_success());
        }

        outcome.history = op.log().snapshot();
        outcome
    }

    async fn dispatch(
        &self,
        req: &ActionRequest,
        op: &mut Operation,
        ledger: &RollbackLedger,
    ) -> Result<ActionOutcome> {
        match (req.kind, req.version) {
            (ActionKind::GetAppId, _) => {
                op.enter(State::RouteResolve);
                let app_id = self.routing.app_id().await?;
                Ok(ActionOutcome::json(200, &json!({ "APP_ID": app_id })))
            }
            (ActionKind::KeepAlive, _) => {
                op.enter(State::RouteResolve);
                let updated = self.routing.keepalive().await?;
                self.cache
                    .set_remote_enabled(self.routing.remote_cache_allowed().await?);
                Ok(ActionOutcome::json(200, &json!({ "UPDATED": updated })))
            }
            (_, FsVersion::Raw) => self.raw_action(req, op, ledger).await,
            (_, FsVersion::Custom) => self.custom_action(req, op, ledger).await,
        }
    }

    /// Pick the name server for a request
    pub(crate) async fn route_resolve(
        &self,
        op: &mut Operation,
        intent: Intent,
        cluster_id: u32,
    ) -> Result<ClusterRoute> {
        op.enter(State::RouteResolve);
        let route = self.routing.route(intent, cluster_id).await?;
        self.cache
            .set_remote_enabled(self.routing.remote_cache_allowed().await?);
        if !self.routing.is_static() {
            op.set_route(RouteCursor {
                intent,
                cluster_id,
                current: route,
            });
        }
        Ok(route)
    }

    /// Name server to use after a spent retry against `failed`: the next
    /// cluster matching the operation's route. `None` when the operation
    /// has no route to move along.
    pub(crate) async fn fail_over(&self, op: &mut Operation, failed: ServerAddr) -> Result<Option<ServerAddr>> {
        let Some(cursor) = op.route() else {
            return Ok(None);
        };
        op.enter(State::RouteResolve);
        let route = self
            .routing
            .route_after(cursor.intent, cursor.cluster_id, Some(failed))
            .await?;
        if route.ns_addr != failed {
            info!(
                "op {}: name server {} failed, moving to {} (cluster {})",
                op.id(),
                failed,
                route.ns_addr,
                route.cluster_id
            );
        }
        op.set_route(RouteCursor {
            current: route,
            ..cursor
        });
        Ok(Some(route.ns_addr))
    }

    /// Ask the name server for a block, spending retries on recoverable
    /// failures and moving `ns_addr` to the next cluster with each. Read
    /// answers are cached.
    pub(crate) async fn lookup_block(
        &self,
        op: &mut Operation,
        ns_addr: &mut ServerAddr,
        mode: OpenMode,
        block_id: BlockId,
    ) -> Result<BlockInfo> {
        loop {
            let reply = self
                .transport
                .call(
                    PeerRole::NameServer,
                    *ns_addr,
                    name::encode_get_block_info(mode, block_id),
                )
                .await
                .and_then(|frame| name::parse_block_info(&frame, mode));
            match reply {
                Ok(block) => {
                    debug!(
                        "block {} on {} has {} replicas",
                        block.block_id,
                        ns_addr,
                        block.ds_addrs.len()
                    );
                    if mode.is_cacheable() {
                        self.cache
                            .insert(CacheKey::new(*ns_addr, block.block_id), block.ds_addrs.clone())
                            .await;
                    }
                    return Ok(block);
                }
                Err(e) if e.is_retryable() => {
                    op.retry(e)?;
                    if let Some(next) = self.fail_over(op, *ns_addr).await? {
                        *ns_addr = next;
                        op.enter(State::BlockResolve);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replica list for `block_id`, from the cache when possible
    pub(crate) async fn resolve_block(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        mode: OpenMode,
        block_id: BlockId,
        order: ReplicaOrder,
    ) -> Result<BlockTarget> {
        op.enter(State::BlockResolve);
        if mode.is_cacheable() {
            if let Some(hit) = self.cache.lookup(CacheKey::new(ns_addr, block_id)).await {
                let block = BlockInfo {
                    block_id,
                    ds_addrs: hit.addrs,
                    ..BlockInfo::default()
                };
                return Ok(BlockTarget::new(ns_addr, mode, block, hit.provenance, order));
            }
        }
        let mut ns_addr = ns_addr;
        let block = self.lookup_block(op, &mut ns_addr, mode, block_id).await?;
        Ok(BlockTarget::new(ns_addr, mode, block, Provenance::Network, order))
    }

    /// Target for a segment, reusing the replica list its round resolved
    pub(crate) async fn segment_target(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        mode: OpenMode,
        segment: &mut Segment,
        order: ReplicaOrder,
    ) -> Result<BlockTarget> {
        match segment.block.take() {
            Some(block) => Ok(BlockTarget::new(ns_addr, mode, block, segment.provenance, order)),
            None => {
                self.resolve_block(op, ns_addr, mode, segment.info.block_id, order)
                    .await
            }
        }
    }

    /// Replica to talk to next. An exhausted list is resolved again: for
    /// free once on the same name server if it came from the local cache,
    /// otherwise at the cost of one retry on the next cluster.
    pub(crate) async fn replica(&self, op: &mut Operation, target: &mut BlockTarget) -> Result<ServerAddr> {
        loop {
            if let Some(addr) = target.cursor.current() {
                return Ok(addr);
            }
            let err = target.last_error.take().unwrap_or_else(|| {
                Error::status(
                    StatusCode::NO_BLOCK,
                    format!("block {} has no usable replica", target.block.block_id),
                )
            });
            if target.provenance == Provenance::Local && !target.refreshed {
                target.refreshed = true;
                debug!(
                    "op {}: cached replicas of block {} exhausted, asking {}",
                    op.id(),
                    target.block.block_id,
                    target.ns_addr
                );
            } else {
                op.retry(err)?;
                if let Some(next) = self.fail_over(op, target.ns_addr).await? {
                    target.ns_addr = next;
                }
            }
            op.enter(State::BlockResolve);
            let (mode, block_id) = (target.mode, target.request_id());
            let block = self
                .lookup_block(op, &mut target.ns_addr, mode, block_id)
                .await?;
            target.reset(block);
        }
    }

    /// Record a failed replica. Fatal errors are handed back; anything else
    /// invalidates the cached block and moves to the next replica.
    pub(crate) async fn replica_failed(
        &self,
        target: &mut BlockTarget,
        addr: ServerAddr,
        err: Error,
    ) -> Result<()> {
        if is_fatal(&err) {
            return Err(err);
        }
        warn!(
            "block {} replica {} failed: {}",
            target.block.block_id, addr, err
        );
        if target.mode.is_cacheable() && !target.invalidated {
            self.cache.remove(target.key()).await;
            target.invalidated = true;
        }
        target.last_error = Some(err);
        target.cursor.advance();
        Ok(())
    }

    /// Run `step` against the target's replicas until one succeeds,
    /// entering `state` before every attempt
    pub(crate) async fn on_replicas<'a, T>(
        &'a self,
        op: &mut Operation,
        target: &mut BlockTarget,
        state: State,
        mut step: impl FnMut(ServerAddr, BlockInfo) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        loop {
            let addr = self.replica(op, target).await?;
            op.enter(state);
            match step(addr, target.block.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => self.replica_failed(target, addr, e).await?,
            }
        }
    }

    pub(crate) async fn data_call(&self, addr: ServerAddr, packet: Bytes) -> Result<Frame> {
        self.transport.call(PeerRole::DataServer, addr, packet).await
    }

    /// Unlink a file on the block's master replica
    pub(crate) async fn unlink_on_master(
        &self,
        block: &BlockInfo,
        file_id: FileId,
        unlink_type: UnlinkType,
    ) -> Result<u64> {
        let master = block.ds_addrs.first().copied().ok_or_else(|| {
            Error::status(
                StatusCode::NO_BLOCK,
                format!("block {} has no replicas", block.block_id),
            )
        })?;
        let packet = data::encode_unlink(block.block_id, file_id, unlink_type.wire_value(), block);
        let frame = self.data_call(master, packet).await?;
        data::parse_unlink(&frame)
    }

    /// Best-effort delete of every file a failed request wrote
    async fn rollback(&self, op: &mut Operation, ledger: &RollbackLedger) {
        op.enter(State::Rollback);
        for file in ledger.take() {
            op.enter(State::DeleteData);
            match self
                .unlink_on_master(&file.block, file.file_id, UnlinkType::Delete)
                .await
            {
                Ok(_) => debug!(
                    "op {}: rolled back block {} file {}",
                    op.id(),
                    file.block.block_id,
                    file.file_id
                ),
                Err(e) => warn!(
                    "op {}: rollback of block {} file {} failed: {}",
                    op.id(),
                    file.block.block_id,
                    file.file_id,
                    e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::{MemoryRemoteCache, RemoteBlockCache};
    use crate::testing::{self, Fault, MockTransport};
    use std::sync::atomic::Ordering;
    use tfsproxy_proto::{MessageType, RawFsName};

    fn dead_ds() -> ServerAddr {
        "10.0.9.9:9100".parse().unwrap()
    }

    fn block_key(name: &str) -> CacheKey {
        let parsed = RawFsName::parse(name, None).unwrap();
        CacheKey::new(testing::ns_addr(), parsed.block_id)
    }

    #[tokio::test]
    async fn test_get_app_id() {
        let mock = MockTransport::new();
        let engine = Engine::new(testing::config(), mock.clone());
        let outcome = engine.execute(ActionRequest::raw(ActionKind::GetAppId)).await;
        assert_eq!(outcome.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&outcome.body).unwrap();
        assert_eq!(body["APP_ID"], testing::APP_ID);
        assert_eq!(outcome.history, vec![State::RouteResolve, State::Done]);
    }

    #[tokio::test]
    async fn test_keepalive_reports_stats() {
        let mock = MockTransport::new();
        let engine = Engine::new(testing::config(), mock.clone());
        let name = testing::write_small(&engine, b"stats").await;
        let read = engine
            .execute(ActionRequest::raw(ActionKind::ReadFile).file_name(&name))
            .await;
        assert_eq!(read.status, 200);

        let outcome = engine.execute(ActionRequest::raw(ActionKind::KeepAlive)).await;
        assert_eq!(outcome.status, 200);
        let keepalive = mock.calls_of(MessageType::REQ_RC_KEEPALIVE);
        assert_eq!(keepalive.len(), 1);
        // read and write counters
        assert_eq!(testing::keepalive_stat_count(&keepalive[0].frame), 2);
    }

    #[tokio::test]
    async fn test_fatal_status_skips_other_replicas() {
        let mock = MockTransport::new();
        let engine = Engine::new(testing::config(), mock.clone());
        let name = testing::write_small(&engine, b"x").await;
        mock.fail(Fault::status(PeerRole::DataServer, StatusCode::PERMISSION_DENY).on(MessageType::READ_DATA_V2));

        let outcome = engine
            .execute(ActionRequest::raw(ActionKind::ReadFile).file_name(&name))
            .await;
        assert_eq!(outcome.status, 403);
        assert_eq!(mock.count(MessageType::READ_DATA_V2), 1);
        assert_eq!(outcome.history.last(), Some(&State::Failed));
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let mock = MockTransport::new();
        let engine = Engine::new(testing::config(), mock.clone());
        let name = testing::write_small(&engine, b"slow").await;
        mock.fail(Fault::hang(PeerRole::DataServer).on(MessageType::READ_DATA_V2));

        let outcome = engine
            .execute_with_deadline(
                ActionRequest::raw(ActionKind::ReadFile).file_name(&name),
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(outcome.status, 408);
        assert_eq!(outcome.history.last(), Some(&State::Failed));
    }

    #[tokio::test]
    async fn test_name_server_failure_moves_to_next_cluster() {
        let mock = MockTransport::with_info(testing::dual_write_rc_info());
        let engine = Engine::new(testing::config(), mock.clone());
        mock.fail(Fault::reset(PeerRole::NameServer).at(testing::ns_addr()));

        let outcome = engine
            .execute(ActionRequest::raw(ActionKind::WriteFile).body(b"moved".to_vec()))
            .await;
        assert_eq!(outcome.status, 200, "{:?}", outcome.error);
        assert_eq!(
            outcome.history,
            vec![
                State::RouteResolve,
                State::BlockResolve,
                State::RouteResolve,
                State::BlockResolve,
                State::CreateFile,
                State::WriteData,
                State::CloseFile,
                State::Done,
            ]
        );
        let lookups = mock.calls_of(MessageType::GET_BLOCK_INFO);
        let addrs: Vec<_> = lookups.iter().map(|c| c.addr).collect();
        assert_eq!(addrs, vec![testing::ns_addr(), testing::ns2_addr()]);

        // named after the cluster that took the data
        let name = outcome.file_name.unwrap();
        assert!(name.starts_with("T2"), "{name}");
        let read = engine
            .execute(ActionRequest::raw(ActionKind::ReadFile).file_name(&name))
            .await;
        assert_eq!(&read.body[..], b"moved");
    }

    #[tokio::test]
    async fn test_single_cluster_retries_same_name_server() {
        let mock = MockTransport::new();
        let engine = Engine::new(testing::config(), mock.clone());
        mock.fail(
            Fault::reset(PeerRole::NameServer)
                .on(MessageType::GET_BLOCK_INFO)
                .times(1),
        );

        let outcome = engine
            .execute(ActionRequest::raw(ActionKind::WriteFile).body(b"again".to_vec()))
            .await;
        assert_eq!(outcome.status, 200);
        let lookups = mock.calls_of(MessageType::GET_BLOCK_INFO);
        assert!(lookups.iter().all(|c| c.addr == testing::ns_addr()));
        assert_eq!(lookups.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_local_entry_is_refreshed_for_free() {
        let mock = MockTransport::new();
        let mut config = testing::config();
        config.retry.max_retry_count = 0;
        let engine = Engine::new(config, mock.clone());
        let name = testing::write_small(&engine, b"cached").await;
        engine.cache().insert(block_key(&name), vec![dead_ds()]).await;
        mock.fail(Fault::reset(PeerRole::DataServer).at(dead_ds()));

        let outcome = engine
            .execute(ActionRequest::raw(ActionKind::ReadFile).file_name(&name))
            .await;
        assert_eq!(outcome.status, 200, "{:?}", outcome.error);
        assert_eq!(&outcome.body[..], b"cached");
        assert_eq!(
            outcome.history,
            vec![
                State::RouteResolve,
                State::BlockResolve,
                State::ReadData,
                State::BlockResolve,
                State::ReadData,
                State::Done,
            ]
        );
        assert_eq!(engine.cache().stats().invalidations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stale_remote_entry_costs_a_retry() {
        let mut info = testing::rc_info();
        info.use_remote_block_cache = true;
        let mut config = testing::config();
        config.upstream.enable_remote_block_cache = true;

        for (max_retry_count, status) in [(0, 503), (1, 200)] {
            let mock = MockTransport::with_info(info.clone());
            let remote = Arc::new(MemoryRemoteCache::new());
            let mut config = config.clone();
            config.retry.max_retry_count = max_retry_count;
            let engine = Engine::new(config, mock.clone()).with_remote_cache(remote.clone());
            let name = testing::write_small(&engine, b"shared").await;
            remote.insert(block_key(&name), vec![dead_ds()]).await.unwrap();
            mock.fail(Fault::reset(PeerRole::DataServer).at(dead_ds()));

            let outcome = engine
                .execute(ActionRequest::raw(ActionKind::ReadFile).file_name(&name))
                .await;
            assert_eq!(outcome.status, status);
            let expected = if status == 200 {
                vec![
                    State::RouteResolve,
                    State::BlockResolve,
                    State::ReadData,
                    State::RouteResolve,
                    State::BlockResolve,
                    State::ReadData,
                    State::Done,
                ]
            } else {
                vec![
                    State::RouteResolve,
                    State::BlockResolve,
                    State::ReadData,
                    State::Failed,
                ]
            };
            assert_eq!(outcome.history, expected);
        }
    }

    #[test]
    fn test_fatal_classes() {
        assert!(is_fatal(&Error::status(StatusCode::READ_OFFSET, "")));
        assert!(is_fatal(&Error::decode("bad")));
        assert!(!is_fatal(&Error::status(StatusCode::FILE_INFO, "")));
        assert!(!is_fatal(&Error::ConnectionReset("peer".into())));
        assert!(!is_fatal(&Error::Corrupted("crc".into())));
    }
}
