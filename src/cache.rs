//! TTL-bounded response cache.
//!
//! Entries expire lazily: an expired entry is dropped the first time it is
//! looked up. The store is bounded by entry count and evicts in insertion
//! order (FIFO) when full.

use crate::fingerprint;
use http::Method;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A cached value with its freshness information.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    /// When the entry was stored.
    pub timestamp: Instant,
    pub ttl: Duration,
    /// The `ETag` the server sent with the response, if any.
    pub etag: Option<String>,
}

impl<T> CacheEntry<T> {
    /// A zero TTL is already expired.
    pub fn is_expired(&self) -> bool {
        self.timestamp.elapsed() >= self.ttl
    }
}

/// Occupancy of a [`RequestCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    // Insertion order, oldest first.
    order: VecDeque<String>,
}

impl<T> CacheInner<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry)
    }

    /// Drops the entry if it has expired and reports whether a live one remains.
    fn live(&mut self, key: &str) -> Option<&CacheEntry<T>> {
        if self.entries.get(key)?.is_expired() {
            self.remove(key);
            return None;
        }
        self.entries.get(key)
    }
}

/// Response cache keyed by request fingerprint.
///
/// ```
/// use palisade::cache::RequestCache;
/// use std::time::Duration;
///
/// let cache = RequestCache::new(2);
/// cache.set("a", 1, Duration::from_secs(60));
/// cache.set("b", 2, Duration::from_secs(60));
/// cache.set("c", 3, Duration::from_secs(60));
///
/// assert_eq!(cache.get("a"), None); // oldest evicted
/// assert_eq!(cache.get("c"), Some(3));
/// ```
pub struct RequestCache<T> {
    max_size: usize,
    inner: Mutex<CacheInner<T>>,
}

impl<T: Clone> RequestCache<T> {
    /// Creates a cache holding at most `max_size` entries (at least one).
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Derives the cache key of a request; independent of param ordering.
    pub fn generate_key(method: &Method, url: &str, params: Option<&Value>) -> String {
        fingerprint::cache_key(method, url, params)
    }

    /// Stores `data` under `key` for `ttl`.
    pub fn set(&self, key: impl Into<String>, data: T, ttl: Duration) {
        self.set_with_etag(key, data, ttl, None);
    }

    /// Stores `data` together with the server's entity tag.
    ///
    /// Overwriting an existing key moves it to the back of the eviction
    /// queue. Inserting a new key into a full cache evicts the oldest entry.
    pub fn set_with_etag(&self, key: impl Into<String>, data: T, ttl: Duration, etag: Option<String>) {
        let key = key.into();
        let mut inner = self.lock();
        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else {
            while inner.entries.len() >= self.max_size {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.entries.remove(&oldest);
                tracing::trace!(key = %oldest, "Evicted oldest cache entry");
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                timestamp: Instant::now(),
                ttl,
                etag,
            },
        );
    }

    /// Returns `true` if a live entry exists. Expired entries are dropped.
    pub fn has(&self, key: &str) -> bool {
        self.lock().live(key).is_some()
    }

    /// Returns a copy of the live value under `key`, or `None` on a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        self.lock().live(key).map(|entry| entry.data.clone())
    }

    /// Like [`get`](Self::get) but returns the whole entry.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lock().live(key).cloned()
    }

    /// Removes one entry; returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Removes every entry whose key starts with `prefix` and returns how many.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        inner.order.retain(|key| !key.starts_with(prefix));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Number of stored entries, including expired ones not yet looked up.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
