//! In-process LRU cache of parsed block metadata
//!
//! A bounded LRU keyed by block ID, shareable between fetcher instances.
//! Admission is gated on compaction thresholds so that retention favors
//! blocks that were expensive to produce and will live long.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ulid::Ulid;

use crate::cache::CacheError;
use crate::meta::BlockMeta;

/// Fixed per-entry overhead used by [`MetaLruCache::stats`]: the key plus
/// the cache's own node bookkeeping.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<Ulid>() + 48;

/// Metadata LRU cache configuration
#[derive(Debug, Clone)]
pub struct MetaLruConfig {
    /// Maximum number of cached descriptors; must be positive
    pub max_entries: usize,

    /// Minimum compaction level a descriptor needs to be admitted
    pub min_compaction_level: u32,

    /// Minimum number of source blocks a descriptor needs to be admitted
    pub min_sources: usize,
}

impl Default for MetaLruConfig {
    fn default() -> Self {
        Self {
            max_entries: 5000,
            min_compaction_level: 1,
            min_sources: 1,
        }
    }
}

/// Point-in-time cache statistics
///
/// `hits` and `misses` are monotonically increasing; `items` and
/// `approx_bytes` describe the current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaLruStats {
    /// Number of cached descriptors
    pub items: usize,
    /// Approximate memory footprint of the cached descriptors plus keys
    pub approx_bytes: usize,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
}

/// Bounded LRU of parsed `meta.json` descriptors.
///
/// Safe under arbitrary concurrency: the LRU list is the only lock-holder
/// and the hit/miss counters are atomics.
pub struct MetaLruCache {
    entries: Mutex<lru::LruCache<Ulid, Arc<BlockMeta>>>,
    min_compaction_level: u32,
    min_sources: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetaLruCache {
    /// Creates a cache from `config`.
    ///
    /// Fails with [`CacheError::ZeroCapacity`] when `max_entries` is zero;
    /// a disabled cache is expressed by not constructing one.
    pub fn new(config: MetaLruConfig) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(config.max_entries).ok_or(CacheError::ZeroCapacity)?;
        Ok(Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            min_compaction_level: config.min_compaction_level,
            min_sources: config.min_sources,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Inserts every admissible descriptor, evicting least-recently used
    /// entries when over capacity. No-op on empty input.
    pub fn put(&self, metas: &[Arc<BlockMeta>]) {
        if metas.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        for meta in metas {
            if !self.admits(meta) {
                continue;
            }
            entries.put(meta.ulid, Arc::clone(meta));
        }
    }

    /// Returns the cached descriptor for `id`, refreshing its recency.
    pub fn get(&self, id: Ulid) -> Option<Arc<BlockMeta>> {
        let found = self.entries.lock().get(&id).cloned();
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Computes current statistics by walking the cached entries.
    pub fn stats(&self) -> MetaLruStats {
        let entries = self.entries.lock();
        let approx_bytes = entries
            .iter()
            .map(|(_, meta)| ENTRY_OVERHEAD + meta.approx_size())
            .sum();
        MetaLruStats {
            items: entries.len(),
            approx_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn admits(&self, meta: &BlockMeta) -> bool {
        meta.compaction.level >= self.min_compaction_level
            && meta.compaction.sources.len() >= self.min_sources
    }
}
