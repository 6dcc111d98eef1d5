//! In-process durable sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{normalize_query, DurableSink};
use crate::error::SinkError;
use crate::task::MemoryItem;

/// Keeps items in memory. Used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct InMemoryDurableSink {
    items: Mutex<Vec<MemoryItem>>,
    stores: AtomicU64,
    searches: AtomicU64,
}

impl InMemoryDurableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `store` calls served.
    pub fn store_calls(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Number of `search` calls served.
    pub fn search_calls(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DurableSink for InMemoryDurableSink {
    async fn store(&self, items: &[MemoryItem]) -> Result<(), SinkError> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        let mut stored = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        for item in items {
            match stored.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => *existing = item.clone(),
                None => stored.push(item.clone()),
            }
        }
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryItem>, SinkError> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let needle = normalize_query(query);
        let stored = self.items.lock().unwrap_or_else(PoisonError::into_inner);

        let mut matches: Vec<MemoryItem> = stored
            .iter()
            .filter(|item| item.searchable_text().to_lowercase().contains(&needle))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        matches.truncate(limit);
        Ok(matches)
    }
}
