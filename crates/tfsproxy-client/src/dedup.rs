//! Content dedup store
//!
//! Small raw writes on clusters that ask for dedup are looked up by content
//! digest before anything is stored. The store itself is an external
//! key/value service; [`MemoryDedupStore`] stands in for it in-process.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tfsproxy_common::Result;

/// Content descriptor: MD5 digest plus length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub digest: [u8; 16],
    pub len: u64,
}

impl DedupKey {
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self {
            digest: md5::compute(data).0,
            len: data.len() as u64,
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.digest), self.len)
    }
}

/// Dedup collaborator: content descriptor to stored file name
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn get(&self, key: &DedupKey) -> Result<Option<String>>;

    async fn set(&self, key: &DedupKey, file_name: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryDedupStore {
    entries: DashMap<DedupKey, String>,
}

impl MemoryDedupStore {
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
impl DedupStore for MemoryDedupStore {
    async fn get(&self, key: &DedupKey) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &DedupKey, file_name: &str) -> Result<()> {
        self.entries.insert(*key, file_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_covers_length_and_digest() {
        let a = DedupKey::of(b"hello");
        assert_eq!(a, DedupKey::of(b"hello"));
        assert_ne!(a, DedupKey::of(b"hello!"));
        assert_eq!(a.len, 5);
        assert_eq!(a.to_string(), "5d41402abc4b2a76b9719d911017c592:5");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryDedupStore::new();
        let key = DedupKey::of(b"payload");
        assert!(store.get(&key).await.unwrap().is_none());
        store.set(&key, "T1abc").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("T1abc"));
        assert_eq!(store.len(), 1);
    }
}
