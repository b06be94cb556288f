//! Batch coordinator
//!
//! Segments are processed in rounds of at most `max_batch_count`. A round
//! first resolves every segment's block in one name server call, then runs
//! one sub-operation per segment concurrently. Results are handed on in
//! segment order no matter which sub-operation finishes first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;

use futures::stream::{self, StreamExt};
use tfsproxy_common::{BlockId, Error, Result, ServerAddr};
use tfsproxy_proto::{BlockInfo, OpenMode, name};
use tracing::{debug, warn};

use crate::block_cache::{CacheKey, Provenance};
use crate::engine::Engine;
use crate::operation::{Operation, State};
use crate::peer::PeerRole;
use crate::planner::Segment;

/// Run `tasks` with at most `limit` in flight.
///
/// `emit` sees each successful result in index order, as soon as every
/// lower index has been emitted; nothing past the first failure is
/// emitted. All results are returned in index order.
pub async fn run_ordered<R, Fut>(
    tasks: Vec<Fut>,
    limit: usize,
    mut emit: impl FnMut(usize, &R),
) -> Vec<Result<R>>
where
    Fut: Future<Output = Result<R>>,
{
    let count = tasks.len();
    let mut slots: Vec<Option<Result<R>>> = (0..count).map(|_| None).collect();
    let mut next = 0;
    let mut blocked = false;

    let mut completions = pin!(
        stream::iter(
            tasks
                .into_iter()
                .enumerate()
                .map(|(index, task)| async move { (index, task.await) }),
        )
        .buffer_unordered(limit.max(1))
    );

    while let Some((index, result)) = completions.next().await {
        slots[index] = Some(result);
        while !blocked && next < count {
            match &slots[next] {
                Some(Ok(value)) => {
                    emit(next, value);
                    next += 1;
                }
                Some(Err(_)) => blocked = true,
                None => break,
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(Error::internal("sub-operation never completed"))))
        .collect()
}

impl Engine {
    /// Resolve the blocks of one round. Reads use the cache first and ask
    /// the name server once for everything missing; writes get one new
    /// block per segment. Segments the batch could not resolve are left
    /// for their sub-operation to resolve alone.
    pub(crate) async fn resolve_round(
        &self,
        op: &mut Operation,
        ns_addr: ServerAddr,
        mode: OpenMode,
        segments: &mut [Segment],
    ) -> Result<()> {
        op.enter(State::BlockResolve);
        if mode.contains(OpenMode::CREATE) {
            let zeros = vec![0; segments.len()];
            match self.batch_lookup(ns_addr, mode, &zeros).await {
                Ok(blocks) if blocks.len() == segments.len() => {
                    for (segment, block) in segments.iter_mut().zip(blocks) {
                        segment.block = Some(block);
                        segment.provenance = Provenance::Network;
                    }
                }
                Ok(blocks) => warn!(
                    "name server {} allocated {} of {} blocks",
                    ns_addr,
                    blocks.len(),
                    segments.len()
                ),
                Err(e) => warn!("batch block allocation on {} failed: {}", ns_addr, e),
            }
            return Ok(());
        }

        if mode.is_cacheable() {
            let keys: Vec<CacheKey> = segments
                .iter()
                .map(|s| CacheKey::new(ns_addr, s.info.block_id))
                .collect();
            let hits = self.cache.batch_lookup(&keys).await;
            for (segment, hit) in segments.iter_mut().zip(hits) {
                if let Some(hit) = hit {
                    segment.block = Some(BlockInfo {
                        block_id: segment.info.block_id,
                        ds_addrs: hit.addrs,
                        ..BlockInfo::default()
                    });
                    segment.provenance = hit.provenance;
                }
            }
        }

        let mut missing: Vec<BlockId> = segments
            .iter()
            .filter(|s| s.block.is_none())
            .map(|s| s.info.block_id)
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return Ok(());
        }

        let mut found: HashMap<BlockId, BlockInfo> = match self.batch_lookup(ns_addr, mode, &missing).await {
            Ok(blocks) => blocks.into_iter().map(|b| (b.block_id, b)).collect(),
            Err(e) => {
                warn!("batch block lookup on {} failed: {}", ns_addr, e);
                HashMap::new()
            }
        };
        if mode.is_cacheable() {
            for block in found.values() {
                self.cache
                    .insert(CacheKey::new(ns_addr, block.block_id), block.ds_addrs.clone())
                    .await;
            }
        }

        for segment in segments.iter_mut().filter(|s| s.block.is_none()) {
            let block_id = segment.info.block_id;
            let block = match found.get(&block_id) {
                Some(block) => block.clone(),
                None => {
                    debug!("block {} missing from batch answer", block_id);
                    let mut at = ns_addr;
                    let block = self.lookup_block(op, &mut at, mode, block_id).await?;
                    if at != ns_addr {
                        // answered by another cluster; the segment resolves on its own
                        continue;
                    }
                    found.insert(block_id, block.clone());
                    block
                }
            };
            segment.block = Some(block);
            segment.provenance = Provenance::Network;
        }
        Ok(())
    }

    async fn batch_lookup(
        &self,
        ns_addr: ServerAddr,
        mode: OpenMode,
        block_ids: &[BlockId],
    ) -> Result<Vec<BlockInfo>> {
        let frame = self
            .transport
            .call(
                PeerRole::NameServer,
                ns_addr,
                name::encode_batch_get_block_info(mode, block_ids),
            )
            .await?;
        name::parse_batch_block_info(&frame, mode)
    }
}
