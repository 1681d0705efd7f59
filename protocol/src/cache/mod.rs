//! # Cache Boundary
//!
//! Ephemeral key-value storage for route scores and session bookkeeping.
//! Callers must treat every read as "maybe": a cache is allowed to lose
//! anything at any time, and the gateway only ever uses it to warm state
//! that it can rebuild from defaults.

mod memory;

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheBackend;

pub use memory::MemoryCache;

/// get/set/expire over opaque byte values.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `value`. With a `ttl`, the entry disappears after it elapses.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    /// Drop `key` immediately.
    fn expire(&self, key: &str);
}

/// Typed read. Undecodable entries are treated as missing.
pub fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    cache
        .get(key)
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

/// Typed write. Encoding failures are dropped; the cache is best effort.
pub fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Option<Duration>) {
    if let Ok(bytes) = serde_json::to_vec(value) {
        cache.set(key, bytes, ttl);
    }
}

pub fn open_cache(backend: &CacheBackend) -> Arc<dyn Cache> {
    match backend {
        CacheBackend::Memory { capacity } => Arc::new(MemoryCache::with_capacity(*capacity)),
    }
}
