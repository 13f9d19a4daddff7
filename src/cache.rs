use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use moka::sync::Cache;
use rustc_hash::FxHasher;

const CACHE_CAPACITY: u64 = 10_000;
const CACHE_TTL_SECS: u64 = 300;

/// Cached upstream response. The qname is stored alongside the bytes to
/// verify hash collisions on lookup.
#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Bytes,
    qname: Arc<str>,
}

/// Best-effort response cache, keyed by a u64 qname hash so lookups do
/// not allocate. Entries expire on a fixed timer; the response's own TTLs
/// are not inspected.
pub struct ResponseCache {
    inner: Cache<u64, CacheEntry>,
}

fn hash_qname(qname: &str) -> u64 {
    let mut h = FxHasher::default();
    qname.hash(&mut h);
    h.finish()
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(CACHE_TTL_SECS))
                .build(),
        }
    }

    pub fn put(&self, qname: &str, bytes: Bytes) {
        self.inner.insert(
            hash_qname(qname),
            CacheEntry {
                bytes,
                qname: Arc::from(qname),
            },
        );
    }

    pub fn get(&self, qname: &str) -> Option<Bytes> {
        let hit = self.inner.get(&hash_qname(qname))?;
        if hit.qname.as_ref() == qname {
            Some(hit.bytes)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_response_bytes() {
        let cache = ResponseCache::new();
        cache.put("example.com", Bytes::from_static(b"response"));
        assert_eq!(
            cache.get("example.com"),
            Some(Bytes::from_static(b"response"))
        );
    }

    #[test]
    fn miss_on_unknown_qname() {
        let cache = ResponseCache::new();
        cache.put("example.com", Bytes::from_static(b"response"));
        assert!(cache.get("example.org").is_none());
    }

    #[test]
    fn later_put_replaces_earlier() {
        let cache = ResponseCache::new();
        cache.put("example.com", Bytes::from_static(b"first"));
        cache.put("example.com", Bytes::from_static(b"second"));
        assert_eq!(
            cache.get("example.com"),
            Some(Bytes::from_static(b"second"))
        );
    }
}
