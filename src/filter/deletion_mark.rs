//! Deletion-mark filter
//!
//! For every block in the fetched view, reads the `deletion-mark.json`
//! sidecar with bounded concurrency, remembers every parsed mark, and
//! evicts blocks whose mark is older than the configured delay. Consumers
//! poll [`DeletionMarkFilter::deletion_mark_blocks`] to learn which blocks
//! are scheduled to disappear.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use ulid::Ulid;

use crate::fetch::ConfigError;
use crate::filter::{FilterError, MetaFilter};
use crate::meta::{deletion_mark_path, BlockMeta, DeletionMark};
use crate::metrics::{states, SyncedStates};
use crate::store::{ObjectStore, StoreError};

#[derive(Default)]
struct ScanState {
    marks: HashMap<Ulid, DeletionMark>,
    expired: Vec<Ulid>,
    last_err: Option<StoreError>,
}

/// Filter evicting blocks whose deletion mark has outlived `delay`.
pub struct DeletionMarkFilter {
    store: Arc<dyn ObjectStore>,
    delay: Duration,
    concurrency: usize,
    marks: Mutex<Arc<HashMap<Ulid, DeletionMark>>>,
}

impl DeletionMarkFilter {
    /// Creates the filter.
    ///
    /// `delay` is how long a marked block stays visible after its
    /// `deletionTime`; `concurrency` bounds the sidecar reads per pass.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        delay: Duration,
        concurrency: usize,
    ) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self {
            store,
            delay,
            concurrency,
            marks: Mutex::new(Arc::new(HashMap::new())),
        })
    }

    /// All deletion marks observed by the most recent successful pass,
    /// including marks younger than the delay. Returns a defensive copy.
    pub fn deletion_mark_blocks(&self) -> HashMap<Ulid, DeletionMark> {
        (**self.marks.lock()).clone()
    }
}

#[async_trait]
impl MetaFilter for DeletionMarkFilter {
    fn name(&self) -> &'static str {
        "deletion-mark"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
        synced: &SyncedStates,
    ) -> Result<(), FilterError> {
        // Copied up front so dispatch is independent of map mutation.
        let ids: Vec<Ulid> = metas.keys().copied().collect();
        let now = Utc::now().timestamp();
        let delay = self.delay.as_secs() as i64;
        let scan = Mutex::new(ScanState::default());

        futures::stream::iter(ids)
            .for_each_concurrent(self.concurrency, |id| {
                let scan = &scan;
                async move {
                    match self.store.get(&deletion_mark_path(id)).await {
                        // No mark is the common case.
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            scan.lock().last_err = Some(err);
                        }
                        Ok(raw) => match DeletionMark::decode(&raw) {
                            Err(err) => {
                                log::warn!(
                                    "skipping unparseable deletion mark for block {id}: {err}"
                                );
                            }
                            Ok(mark) => {
                                let mut state = scan.lock();
                                if now - mark.deletion_time > delay {
                                    state.expired.push(id);
                                }
                                state.marks.insert(id, mark);
                            }
                        },
                    }
                }
            })
            .await;

        let ScanState {
            marks,
            expired,
            last_err,
        } = scan.into_inner();
        if let Some(err) = last_err {
            return Err(err.into());
        }

        let mut removed = 0;
        for id in expired {
            if metas.remove(&id).is_some() {
                removed += 1;
            }
        }
        synced.add(states::MARKED_FOR_DELETION, removed);

        *self.marks.lock() = Arc::new(marks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BlockCompaction, META_VERSION};
    use crate::metrics::FetcherMetrics;
    use crate::store::MemoryStore;
    use prometheus::Registry;

    fn sample_meta(id: Ulid) -> Arc<BlockMeta> {
        Arc::new(BlockMeta {
            ulid: id,
            min_time: 0,
            max_time: 1000,
            version: META_VERSION,
            compaction: BlockCompaction::default(),
            extra: serde_json::Map::new(),
        })
    }

    fn mark_json(deletion_time: i64) -> Vec<u8> {
        serde_json::to_vec(&DeletionMark { deletion_time }).unwrap()
    }

    fn synced() -> (Registry, FetcherMetrics) {
        let registry = Registry::new();
        let metrics = FetcherMetrics::new(&registry, &[]).unwrap();
        (registry, metrics)
    }

    #[tokio::test]
    async fn evicts_only_marks_older_than_delay() {
        let store = Arc::new(MemoryStore::new());
        let old = Ulid::new();
        let fresh = Ulid::new();
        let unmarked = Ulid::new();

        let now = Utc::now().timestamp();
        store.insert(deletion_mark_path(old), mark_json(now - 3 * 3600));
        store.insert(deletion_mark_path(fresh), mark_json(now - 3600));

        let filter = DeletionMarkFilter::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Duration::from_secs(2 * 3600),
            4,
        )
        .unwrap();
        let mut metas: HashMap<_, _> = [old, fresh, unmarked]
            .into_iter()
            .map(|id| (id, sample_meta(id)))
            .collect();

        let (_registry, metrics) = synced();
        filter.filter(&mut metas, metrics.synced()).await.unwrap();
        metrics.synced().commit();

        assert!(!metas.contains_key(&old));
        assert!(metas.contains_key(&fresh));
        assert!(metas.contains_key(&unmarked));
        assert_eq!(metrics.synced().get(states::MARKED_FOR_DELETION), 1);

        let marks = filter.deletion_mark_blocks();
        assert_eq!(marks.len(), 2);
        assert!(marks.contains_key(&old));
        assert!(marks.contains_key(&fresh));
    }

    #[tokio::test]
    async fn unparseable_mark_keeps_the_block() {
        let store = Arc::new(MemoryStore::new());
        let id = Ulid::new();
        store.insert(deletion_mark_path(id), b"not json".to_vec());

        let filter = DeletionMarkFilter::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Duration::from_secs(0),
            2,
        )
        .unwrap();
        let mut metas: HashMap<_, _> = [(id, sample_meta(id))].into_iter().collect();

        let (_registry, metrics) = synced();
        filter.filter(&mut metas, metrics.synced()).await.unwrap();

        assert!(metas.contains_key(&id));
        assert!(filter.deletion_mark_blocks().is_empty());
    }

    #[tokio::test]
    async fn transport_error_is_returned_after_draining() {
        let store = Arc::new(MemoryStore::new());
        let broken = Ulid::new();
        let healthy = Ulid::new();
        store.insert(deletion_mark_path(broken), mark_json(0));
        store.fail_path(deletion_mark_path(broken));

        let filter = DeletionMarkFilter::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Duration::from_secs(60),
            2,
        )
        .unwrap();
        let mut metas: HashMap<_, _> = [broken, healthy]
            .into_iter()
            .map(|id| (id, sample_meta(id)))
            .collect();

        let (_registry, metrics) = synced();
        let err = filter.filter(&mut metas, metrics.synced()).await.unwrap_err();
        assert!(matches!(err, FilterError::Store(_)));
        assert_eq!(store.get_calls(), 2);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result = DeletionMarkFilter::new(store, Duration::from_secs(1), 0);
        assert!(result.is_err());
    }
}
