//! No-compact-mark filter
//!
//! Tracks blocks carrying a `no-compact-mark.json` sidecar. Every marked
//! block is accounted for under `marked-for-no-compact`; in excluding mode
//! the marked blocks are also removed from the fetched view, which is what
//! a compactor wants while queriers keep seeing them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use ulid::Ulid;

use crate::fetch::ConfigError;
use crate::filter::{FilterError, MetaFilter};
use crate::meta::{no_compact_mark_path, BlockMeta, NoCompactMark};
use crate::metrics::{states, SyncedStates};
use crate::store::{ObjectStore, StoreError};

#[derive(Default)]
struct ScanState {
    marks: HashMap<Ulid, NoCompactMark>,
    last_err: Option<StoreError>,
}

/// Filter tracking blocks marked as ineligible for compaction.
pub struct NoCompactMarkFilter {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
    exclude_marked: bool,
    marks: Mutex<Arc<HashMap<Ulid, NoCompactMark>>>,
}

impl NoCompactMarkFilter {
    /// Creates the filter.
    ///
    /// With `exclude_marked`, marked blocks are removed from the view in
    /// addition to being counted.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        concurrency: usize,
        exclude_marked: bool,
    ) -> Result<Self, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self {
            store,
            concurrency,
            exclude_marked,
            marks: Mutex::new(Arc::new(HashMap::new())),
        })
    }

    /// All no-compact marks observed by the most recent successful pass.
    /// Returns a defensive copy.
    pub fn no_compact_marked_blocks(&self) -> HashMap<Ulid, NoCompactMark> {
        (**self.marks.lock()).clone()
    }
}

#[async_trait]
impl MetaFilter for NoCompactMarkFilter {
    fn name(&self) -> &'static str {
        "no-compact-mark"
    }

    async fn filter(
        &self,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
        synced: &SyncedStates,
    ) -> Result<(), FilterError> {
        let ids: Vec<Ulid> = metas.keys().copied().collect();
        let scan = Mutex::new(ScanState::default());

        futures::stream::iter(ids)
            .for_each_concurrent(self.concurrency, |id| {
                let scan = &scan;
                async move {
                    match self.store.get(&no_compact_mark_path(id)).await {
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            scan.lock().last_err = Some(err);
                        }
                        Ok(raw) => match NoCompactMark::decode(&raw) {
                            Err(err) => {
                                log::warn!(
                                    "skipping unparseable no-compact mark for block {id}: {err}"
                                );
                            }
                            Ok(mark) => {
                                scan.lock().marks.insert(id, mark);
                            }
                        },
                    }
                }
            })
            .await;

        let ScanState { marks, last_err } = scan.into_inner();
        if let Some(err) = last_err {
            return Err(err.into());
        }

        synced.add(states::MARKED_FOR_NO_COMPACT, marks.len());
        if self.exclude_marked {
            for id in marks.keys() {
                metas.remove(id);
            }
        }

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

    fn mark_json(reason: &str) -> Vec<u8> {
        serde_json::to_vec(&NoCompactMark {
            no_compact_time: 12345,
            reason: reason.to_string(),
        })
        .unwrap()
    }

    async fn run_filter(exclude: bool) -> (HashMap<Ulid, Arc<BlockMeta>>, i64, usize) {
        let store = Arc::new(MemoryStore::new());
        let marked = Ulid::new();
        let plain = Ulid::new();
        store.insert(no_compact_mark_path(marked), mark_json("manual"));

        let filter =
            NoCompactMarkFilter::new(Arc::clone(&store) as Arc<dyn ObjectStore>, 2, exclude)
                .unwrap();
        let mut metas: HashMap<_, _> = [marked, plain]
            .into_iter()
            .map(|id| (id, sample_meta(id)))
            .collect();

        let registry = Registry::new();
        let metrics = FetcherMetrics::new(&registry, &[]).unwrap();
        filter.filter(&mut metas, metrics.synced()).await.unwrap();
        metrics.synced().commit();

        let tracked = filter.no_compact_marked_blocks().len();
        (
            metas,
            metrics.synced().get(states::MARKED_FOR_NO_COMPACT),
            tracked,
        )
    }

    #[tokio::test]
    async fn tracking_mode_counts_without_removing() {
        let (metas, counted, tracked) = run_filter(false).await;
        assert_eq!(metas.len(), 2);
        assert_eq!(counted, 1);
        assert_eq!(tracked, 1);
    }

    #[tokio::test]
    async fn excluding_mode_removes_marked_blocks() {
        let (metas, counted, tracked) = run_filter(true).await;
        assert_eq!(metas.len(), 1);
        assert_eq!(counted, 1);
        assert_eq!(tracked, 1);
    }
}
