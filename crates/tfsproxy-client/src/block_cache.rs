//! Block location cache
//!
//! Maps `(name server, block id)` to the block's replica list so that hot
//! blocks skip the name server round trip. Two tiers:
//!
//! - a process-local map bounded by entry count, evicting by decayed visit
//!   score among the least recently visited entries;
//! - an optional remote tier shared between processes, reached through the
//!   [`RemoteBlockCache`] collaborator.
//!
//! Every hit carries its [`Provenance`] so a failing data server can tell a
//! locally stale entry (worth one free re-resolve) from a remote one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tfsproxy_common::config::BlockCacheConfig;
use tfsproxy_common::{BlockId, Result, ServerAddr};
use tracing::{debug, info, warn};

/// Cache key: the name server that answered and the block id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub ns_addr: ServerAddr,
    pub block_id: BlockId,
}

impl CacheKey {
    #[must_use]
    pub const fn new(ns_addr: ServerAddr, block_id: BlockId) -> Self {
        Self { ns_addr, block_id }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ns_addr, self.block_id)
    }
}

/// Where a replica list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    Local,
    Remote,
    Network,
}

/// A cache hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    pub addrs: Vec<ServerAddr>,
    pub provenance: Provenance,
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub remote_hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    /// Inserts refused because every eviction candidate was still hot
    pub rejected: AtomicU64,
    /// Entries removed after a data server failure
    pub invalidations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0), remote hits included
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits =
            self.hits.load(Ordering::Relaxed) + self.remote_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

struct LocalEntry {
    addrs: Vec<ServerAddr>,
    score: f64,
    last_visit: Instant,
    /// Position in the recency index
    seq: u64,
}

impl LocalEntry {
    fn decayed_score(&self, now: Instant, decay_rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_visit).as_secs_f64();
        self.score - elapsed * decay_rate
    }
}

#[derive(Default)]
struct LocalInner {
    entries: HashMap<CacheKey, LocalEntry>,
    /// seq -> key, oldest visit first
    recency: BTreeMap<u64, CacheKey>,
    next_seq: u64,
}

impl LocalInner {
    fn bump(&mut self, key: CacheKey) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.recency.insert(seq, key);
        seq
    }
}

/// Process-local tier
pub struct LocalBlockCache {
    inner: Mutex<LocalInner>,
    capacity: usize,
    decay_rate: f64,
    eviction_sample: usize,
}

impl LocalBlockCache {
    #[must_use]
    pub fn new(config: &BlockCacheConfig) -> Self {
        Self {
            inner: Mutex::new(LocalInner::default()),
            capacity: config.capacity.max(1),
            decay_rate: config.decay_rate,
            eviction_sample: config.eviction_sample.max(1),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Vec<ServerAddr>> {
        self.lookup_at(key, Instant::now())
    }

    fn lookup_at(&self, key: &CacheKey, now: Instant) -> Option<Vec<ServerAddr>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner.entries.get_mut(key)?;
        entry.score = entry.decayed_score(now, self.decay_rate).max(0.0) + 1.0;
        entry.last_visit = now;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let old = std::mem::replace(&mut entry.seq, seq);
        inner.recency.remove(&old);
        inner.recency.insert(seq, *key);
        Some(entry.addrs.clone())
    }

    /// Insert or refresh `key`. The insert is rejected when the cache is
    /// full and no candidate among the least recently visited entries has
    /// cooled down; the caller then simply goes without caching.
    pub fn insert(&self, key: CacheKey, addrs: Vec<ServerAddr>) -> InsertResult {
        self.insert_at(key, addrs, Instant::now())
    }

    fn insert_at(&self, key: CacheKey, addrs: Vec<ServerAddr>, now: Instant) -> InsertResult {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.addrs = addrs;
            return InsertResult::Updated;
        }

        let mut evicted = None;
        if inner.entries.len() >= self.capacity {
            let candidate = inner
                .recency
                .values()
                .take(self.eviction_sample)
                .filter_map(|k| {
                    inner
                        .entries
                        .get(k)
                        .map(|e| (*k, e.seq, e.decayed_score(now, self.decay_rate)))
                })
                .min_by(|a, b| a.2.total_cmp(&b.2));
            match candidate {
                Some((victim, seq, score)) if score <= 0.0 => {
                    inner.entries.remove(&victim);
                    inner.recency.remove(&seq);
                    evicted = Some(victim);
                }
                _ => return InsertResult::Rejected,
            }
        }

        let seq = inner.bump(key);
        inner.entries.insert(
            key,
            LocalEntry {
                addrs,
                score: 0.0,
                last_visit: now,
                seq,
            },
        );
        evicted.map_or(InsertResult::Inserted, InsertResult::Evicted)
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.recency.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a local insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Updated,
    /// Inserted after evicting the given key
    Evicted(CacheKey),
    Rejected,
}

/// Remote, cross-process cache tier
#[async_trait]
pub trait RemoteBlockCache: Send + Sync {
    async fn lookup(&self, key: CacheKey) -> Result<Option<Vec<ServerAddr>>>;

    /// Answers are parallel to `keys`
    async fn batch_lookup(&self, keys: &[CacheKey]) -> Result<Vec<Option<Vec<ServerAddr>>>>;

    async fn insert(&self, key: CacheKey, addrs: Vec<ServerAddr>) -> Result<()>;

    async fn remove(&self, key: CacheKey) -> Result<()>;
}

/// In-memory remote tier, for single-host deployments and tests
#[derive(Default)]
pub struct MemoryRemoteCache {
    entries: DashMap<CacheKey, Vec<ServerAddr>>,
}

impl MemoryRemoteCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RemoteBlockCache for MemoryRemoteCache {
    async fn lookup(&self, key: CacheKey) -> Result<Option<Vec<ServerAddr>>> {
        Ok(self.entries.get(&key).map(|e| e.value().clone()))
    }

    async fn batch_lookup(&self, keys: &[CacheKey]) -> Result<Vec<Option<Vec<ServerAddr>>>> {
        Ok(keys
            .iter()
            .map(|k| self.entries.get(k).map(|e| e.value().clone()))
            .collect())
    }

    async fn insert(&self, key: CacheKey, addrs: Vec<ServerAddr>) -> Result<()> {
        self.entries.insert(key, addrs);
        Ok(())
    }

    async fn remove(&self, key: CacheKey) -> Result<()> {
        self.entries.remove(&key);
        Ok(())
    }
}

/// Both tiers behind one handle, shared by every operation
pub struct BlockLocationCache {
    local: Option<LocalBlockCache>,
    remote: Option<Arc<dyn RemoteBlockCache>>,
    remote_enabled: AtomicBool,
    stats: CacheStats,
    lookups: AtomicU64,
    stat_interval: u64,
}

impl BlockLocationCache {
    #[must_use]
    pub fn new(config: &BlockCacheConfig) -> Self {
        Self {
            local: config.enabled.then(|| LocalBlockCache::new(config)),
            remote: None,
            remote_enabled: AtomicBool::new(false),
            stats: CacheStats::default(),
            lookups: AtomicU64::new(0),
            stat_interval: config.stat_interval,
        }
    }

    /// Attach a remote tier; it stays unused until enabled
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteBlockCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Turn the remote tier on or off, as the routing service dictates
    pub fn set_remote_enabled(&self, enabled: bool) {
        let enabled = enabled && self.remote.is_some();
        if self.remote_enabled.swap(enabled, Ordering::Relaxed) != enabled {
            info!("remote block cache {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    fn remote(&self) -> Option<&Arc<dyn RemoteBlockCache>> {
        if self.remote_enabled.load(Ordering::Relaxed) {
            self.remote.as_ref()
        } else {
            None
        }
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub const fn local(&self) -> Option<&LocalBlockCache> {
        self.local.as_ref()
    }

    /// Local tier first, then the remote one. A remote hit is copied into
    /// the local tier; a failing remote tier counts as a miss.
    pub async fn lookup(&self, key: CacheKey) -> Option<CachedBlock> {
        self.count_lookup(1);
        if let Some(addrs) = self.local.as_ref().and_then(|l| l.lookup(&key)) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!("block {} found in local cache", key);
            return Some(CachedBlock {
                addrs,
                provenance: Provenance::Local,
            });
        }

        if let Some(remote) = self.remote() {
            match remote.lookup(key).await {
                Ok(Some(addrs)) if !addrs.is_empty() => {
                    self.stats.remote_hits.fetch_add(1, Ordering::Relaxed);
                    debug!("block {} found in remote cache", key);
                    self.insert_local(key, addrs.clone());
                    return Some(CachedBlock {
                        addrs,
                        provenance: Provenance::Remote,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("remote block cache lookup {} failed: {}", key, e),
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Look up many keys; answers are parallel to `keys`
    pub async fn batch_lookup(&self, keys: &[CacheKey]) -> Vec<Option<CachedBlock>> {
        self.count_lookup(keys.len() as u64);
        let mut found: Vec<Option<CachedBlock>> = keys
            .iter()
            .map(|key| {
                self.local.as_ref().and_then(|l| l.lookup(key)).map(|addrs| CachedBlock {
                    addrs,
                    provenance: Provenance::Local,
                })
            })
            .collect();
        let local_hits = found.iter().filter(|f| f.is_some()).count() as u64;
        self.stats.hits.fetch_add(local_hits, Ordering::Relaxed);

        let missing: Vec<usize> = (0..keys.len()).filter(|i| found[*i].is_none()).collect();
        if let (Some(remote), false) = (self.remote(), missing.is_empty()) {
            let remote_keys: Vec<CacheKey> = missing.iter().map(|i| keys[*i]).collect();
            match remote.batch_lookup(&remote_keys).await {
                Ok(answers) => {
                    for (i, answer) in missing.iter().zip(answers) {
                        if let Some(addrs) = answer.filter(|a| !a.is_empty()) {
                            self.stats.remote_hits.fetch_add(1, Ordering::Relaxed);
                            self.insert_local(keys[*i], addrs.clone());
                            found[*i] = Some(CachedBlock {
                                addrs,
                                provenance: Provenance::Remote,
                            });
                        }
                    }
                }
                Err(e) => warn!("remote block cache batch lookup failed: {}", e),
            }
        }

        let misses = found.iter().filter(|f| f.is_none()).count() as u64;
        self.stats.misses.fetch_add(misses, Ordering::Relaxed);
        found
    }

    /// Record a name server answer in both tiers
    pub async fn insert(&self, key: CacheKey, addrs: Vec<ServerAddr>) {
        if addrs.is_empty() {
            return;
        }
        if let Some(remote) = self.remote() {
            if let Err(e) = remote.insert(key, addrs.clone()).await {
                warn!("remote block cache insert {} failed: {}", key, e);
            }
        }
        self.insert_local(key, addrs);
    }

    /// Drop a stale entry from both tiers
    pub async fn remove(&self, key: CacheKey) {
        let removed = self.local.as_ref().is_some_and(|l| l.remove(&key));
        if removed {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!("block {} removed from local cache", key);
        }
        if let Some(remote) = self.remote() {
            if let Err(e) = remote.remove(key).await {
                warn!("remote block cache remove {} failed: {}", key, e);
            }
        }
    }

    fn insert_local(&self, key: CacheKey, addrs: Vec<ServerAddr>) {
        let Some(local) = &self.local else {
            return;
        };
        match local.insert(key, addrs) {
            InsertResult::Evicted(victim) => {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("block {} evicted for {}", victim, key);
            }
            InsertResult::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("block cache full, {} not cached", key);
            }
            InsertResult::Inserted | InsertResult::Updated => {}
        }
    }

    fn count_lookup(&self, n: u64) {
        if self.stat_interval == 0 || n == 0 {
            return;
        }
        let before = self.lookups.fetch_add(n, Ordering::Relaxed);
        if (before + n) / self.stat_interval != before / self.stat_interval {
            info!(
                "block cache hit ratio {:.2}% ({} local hits, {} remote hits, {} misses)",
                self.stats.hit_ratio() * 100.0,
                self.stats.hits.load(Ordering::Relaxed),
                self.stats.remote_hits.load(Ordering::Relaxed),
                self.stats.misses.load(Ordering::Relaxed),
            );
        }
    }
}
