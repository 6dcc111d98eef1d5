//! TTL cache for cross-pool search results.
//!
//! Keys are SHA-256 digests of the normalized query and the result limit, so
//! `"Disk  Full"` and `"disk full"` share an entry while different limits do
//! not.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::sinks::normalize_query;
use crate::task::MemoryItem;

/// Hex-encoded SHA-256 of a normalized query and limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey(String);

impl SearchKey {
    pub fn new(query: &str, limit: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_query(query).as_bytes());
        hasher.update(b"\n");
        hasher.update(limit.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    results: Vec<MemoryItem>,
    stored_at: Instant,
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because they expired.
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if no lookups happened.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Search results keyed by [`SearchKey`], each valid for `ttl`.
pub struct SearchCache {
    entries: RwLock<HashMap<SearchKey, CacheEntry>>,
    stats: RwLock<CacheStats>,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            ttl,
        }
    }

    /// Returns fresh results for `key`, counting a hit or a miss.
    pub fn get(&self, key: &SearchKey) -> Option<Vec<MemoryItem>> {
        let fresh = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .get(key)
                .filter(|entry| entry.stored_at.elapsed() < self.ttl)
                .map(|entry| entry.results.clone())
        };

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        if fresh.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        fresh
    }

    /// Stores results with a fresh timestamp, replacing any previous entry.
    pub fn insert(&self, key: SearchKey, results: Vec<MemoryItem>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        let expired = (before - entries.len()) as u64;

        entries.insert(
            key,
            CacheEntry {
                results,
                stored_at: Instant::now(),
            },
        );
        drop(entries);

        if expired > 0 {
            self.stats
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .expirations += expired;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        stats
    }
}
