//! Fetch orchestration
//!
//! This module provides:
//! - The [`MetaFetcher`] answering "what blocks exist right now?" on demand
//! - Bounded concurrent metadata loading with per-block classification
//! - Single-flight coalescing of concurrent callers
//! - Lookback pruning and deletion-mark exclusion before any load happens
//! - The complete-fetch cache swap and disk cache pruning

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use prometheus::Registry;
use thiserror::Error;
use ulid::Ulid;

use crate::cache::{CacheError, DiskMetaCache, MetaLruCache};
use crate::filter::{FilterError, MetaFilter};
use crate::meta::{block_dir_id, deletion_marker_id, min_id_at, BlockMeta, MARKERS_PREFIX};
use crate::metrics::{states, FetcherMetrics};
use crate::store::{ObjectStore, StoreError};

mod single_flight;

pub mod loader;

pub use loader::LoadError;

use loader::MetaLoader;
use single_flight::SingleFlight;

/// Fetcher configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Worker concurrency of zero can never make progress
    #[error("concurrency must be positive")]
    ZeroConcurrency,

    /// A zero lookback window would exclude every block; disable it with
    /// `None` instead
    #[error("max lookback must be positive when set")]
    ZeroLookback,

    /// Cache construction failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Metric registration failed
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

/// Fatal fetch error types
///
/// Any of these aborts the pass without returning maps. Per-block
/// conditions never show up here; they land in [`FetchedBlocks`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Listing the bucket's block directories failed
    #[error("listing block directories failed: {0}")]
    List(StoreError),

    /// Listing the global deletion-mark index failed
    #[error("listing deletion markers failed: {0}")]
    MarkerIndex(StoreError),

    /// A post-fetch filter failed
    #[error("filter {name} failed: {source}")]
    Filter {
        /// Name of the failing filter
        name: &'static str,
        /// Underlying filter error
        #[source]
        source: FilterError,
    },
}

/// Fetcher configuration
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Number of concurrent metadata loads per fetch pass; must be positive
    pub concurrency: usize,

    /// Root directory for the disk meta cache; `None` disables it
    pub cache_dir: Option<PathBuf>,

    /// Blocks older than this window are excluded without loading;
    /// `None` disables time-based pruning
    pub max_lookback: Option<Duration>,

    /// Additional classification states pre-registered for caller-supplied
    /// filters
    pub extra_synced_states: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            cache_dir: None,
            max_lookback: None,
            extra_synced_states: Vec::new(),
        }
    }
}

/// The immutable product of one fetch pass.
///
/// The maps are owned by the caller; every caller of a coalesced fetch
/// receives its own copy (sharing the parsed descriptors by `Arc`).
#[derive(Debug, Clone, Default)]
pub struct FetchedBlocks {
    /// Successfully loaded blocks
    pub metas: HashMap<Ulid, Arc<BlockMeta>>,

    /// Blocks discovered in the bucket whose metadata is missing or corrupt
    pub partial: HashMap<Ulid, LoadError>,

    /// Non-classification per-block failures; non-empty means the view is
    /// incomplete and the fetcher's internal cache was left untouched
    pub errors: Vec<LoadError>,
}

impl FetchedBlocks {
    /// Whether every discovered block was either loaded or classified.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Default)]
struct LoadAccumulator {
    metas: HashMap<Ulid, Arc<BlockMeta>>,
    partial: HashMap<Ulid, LoadError>,
    errors: Vec<LoadError>,
    no_meta: usize,
    corrupted: usize,
}

/// Reconciles the in-memory view of block metadata with the object store.
///
/// At most one pass runs at a time; concurrent callers share the in-flight
/// pass's outcome. The internal view of the last complete fetch is private
/// and only ever replaced wholesale.
pub struct MetaFetcher {
    store: Arc<dyn ObjectStore>,
    loader: MetaLoader,
    filters: Vec<Arc<dyn MetaFilter>>,
    disk: Option<Arc<DiskMetaCache>>,
    concurrency: usize,
    max_lookback: Option<Duration>,
    cached: Mutex<Arc<HashMap<Ulid, Arc<BlockMeta>>>>,
    metrics: FetcherMetrics,
    flight: SingleFlight<Result<Arc<FetchedBlocks>, FetchError>>,
}

impl MetaFetcher {
    /// Creates a fetcher.
    ///
    /// `filters` run in order after every pass; `lru` is an optional cache
    /// shared with other fetcher instances; metrics register against
    /// `registry`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: FetcherConfig,
        filters: Vec<Arc<dyn MetaFilter>>,
        lru: Option<Arc<MetaLruCache>>,
        registry: &Registry,
    ) -> Result<Self, ConfigError> {
        if config.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if config.max_lookback == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroLookback);
        }

        let disk = config
            .cache_dir
            .map(DiskMetaCache::open)
            .transpose()?
            .map(Arc::new);

        let extra: Vec<&str> = config
            .extra_synced_states
            .iter()
            .map(String::as_str)
            .collect();
        let metrics = FetcherMetrics::new(registry, &extra)?;

        Ok(Self {
            loader: MetaLoader::new(Arc::clone(&store), lru, disk.clone()),
            store,
            filters,
            disk,
            concurrency: config.concurrency,
            max_lookback: config.max_lookback,
            cached: Mutex::new(Arc::new(HashMap::new())),
            metrics,
            flight: SingleFlight::new(),
        })
    }

    /// Fetches the current block metadata view.
    pub async fn fetch(&self) -> Result<FetchedBlocks, FetchError> {
        self.fetch_shared(false).await
    }

    /// Fetches the current view, skipping deletion-marked blocks without
    /// loading them.
    pub async fn fetch_excluding_marked(&self) -> Result<FetchedBlocks, FetchError> {
        self.fetch_shared(true).await
    }

    /// The fetcher's metric family.
    pub fn metrics(&self) -> &FetcherMetrics {
        &self.metrics
    }

    /// Copy of the internal view left by the last complete fetch.
    pub fn cached_blocks(&self) -> HashMap<Ulid, Arc<BlockMeta>> {
        (**self.cached.lock()).clone()
    }

    async fn fetch_shared(&self, exclude_marked: bool) -> Result<FetchedBlocks, FetchError> {
        let outcome = self.flight.run(|| self.fetch_once(exclude_marked)).await;
        outcome.map(|shared| (*shared).clone())
    }

    async fn fetch_once(&self, exclude_marked: bool) -> Result<Arc<FetchedBlocks>, FetchError> {
        let start = Instant::now();
        self.metrics.syncs_total().inc();
        self.metrics.synced().reset();

        let result = self.fetch_pass(exclude_marked).await;

        self.metrics
            .sync_duration()
            .observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(outcome) if outcome.is_complete() => {}
            _ => self.metrics.sync_failures_total().inc(),
        }
        result
    }

    async fn fetch_pass(&self, exclude_marked: bool) -> Result<Arc<FetchedBlocks>, FetchError> {
        let min_id = self.max_lookback.map(|lookback| {
            let now_ms = Utc::now().timestamp_millis().max(0) as u64;
            min_id_at(now_ms.saturating_sub(lookback.as_millis() as u64))
        });

        let marked = if exclude_marked {
            Some(self.list_deletion_marked().await?)
        } else {
            None
        };

        let names = self
            .store
            .list("")
            .await
            .map_err(FetchError::List)?;

        let mut lookback_excluded = 0;
        let mut marked_excluded = 0;
        let mut ids = Vec::with_capacity(names.len());
        for name in &names {
            let Some(id) = block_dir_id(name) else {
                continue;
            };
            if let Some(min_id) = min_id {
                if id < min_id {
                    lookback_excluded += 1;
                    continue;
                }
            }
            if let Some(marked) = &marked {
                if marked.contains(&id) {
                    marked_excluded += 1;
                    continue;
                }
            }
            ids.push(id);
        }

        // Snapshot of the previous complete view, taken once per pass so
        // workers resolve against it without touching the fetcher's lock.
        let snapshot = Arc::clone(&self.cached.lock());
        let accumulator = Mutex::new(LoadAccumulator::default());

        futures::stream::iter(ids)
            .for_each_concurrent(self.concurrency, |id| {
                let accumulator = &accumulator;
                let snapshot = &snapshot;
                async move {
                    match self.loader.load(snapshot, id).await {
                        Ok(meta) => {
                            accumulator.lock().metas.insert(id, meta);
                        }
                        Err(err @ LoadError::MetaNotFound(_)) => {
                            let mut acc = accumulator.lock();
                            acc.no_meta += 1;
                            acc.partial.insert(id, err);
                        }
                        Err(err @ LoadError::MetaCorrupted { .. }) => {
                            let mut acc = accumulator.lock();
                            acc.corrupted += 1;
                            acc.partial.insert(id, err);
                        }
                        Err(err) => {
                            accumulator.lock().errors.push(err);
                        }
                    }
                }
            })
            .await;

        let LoadAccumulator {
            mut metas,
            partial,
            errors,
            no_meta,
            corrupted,
        } = accumulator.into_inner();

        if !errors.is_empty() {
            log::warn!(
                "block metadata view is incomplete: {} blocks failed to load",
                errors.len()
            );
        }

        let synced = self.metrics.synced();
        synced.add(states::NO_META_JSON, no_meta);
        synced.add(states::CORRUPTED_META_JSON, corrupted);
        synced.add(states::FAILED, errors.len());
        synced.add(states::LOOKBACK_EXCLUDED, lookback_excluded);
        synced.add(states::MARKED_FOR_DELETION, marked_excluded);

        for filter in &self.filters {
            filter
                .filter(&mut metas, synced)
                .await
                .map_err(|source| FetchError::Filter {
                    name: filter.name(),
                    source,
                })?;
        }

        if errors.is_empty() {
            // Complete pass: publish the filtered view and drop disk
            // entries for blocks absent from it.
            *self.cached.lock() = Arc::new(metas.clone());
            if let Some(disk) = &self.disk {
                let live: HashSet<Ulid> = metas.keys().copied().collect();
                disk.prune(&live);
            }
        }

        synced.add(states::LOADED, metas.len());
        synced.commit();

        Ok(Arc::new(FetchedBlocks {
            metas,
            partial,
            errors,
        }))
    }

    async fn list_deletion_marked(&self) -> Result<HashSet<Ulid>, FetchError> {
        let names = self
            .store
            .list(MARKERS_PREFIX)
            .await
            .map_err(FetchError::MarkerIndex)?;
        Ok(names
            .iter()
            .filter_map(|name| deletion_marker_id(name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn zero_concurrency_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = FetcherConfig {
            concurrency: 0,
            ..Default::default()
        };
        let result = MetaFetcher::new(store, config, Vec::new(), None, &Registry::new());
        assert!(matches!(result, Err(ConfigError::ZeroConcurrency)));
    }

    #[test]
    fn zero_lookback_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = FetcherConfig {
            max_lookback: Some(Duration::ZERO),
            ..Default::default()
        };
        let result = MetaFetcher::new(store, config, Vec::new(), None, &Registry::new());
        assert!(matches!(result, Err(ConfigError::ZeroLookback)));
    }
}
