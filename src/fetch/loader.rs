//! Single-block metadata resolution
//!
//! Resolves one block ID to its parsed descriptor by walking the tiers in
//! order of cost: the previous complete fetch's in-memory view, the shared
//! LRU, the local disk cache, and finally the object store. Hits in slower
//! tiers are promoted into faster ones; errors never touch any tier.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use ulid::Ulid;

use crate::cache::{DiskMetaCache, MetaLruCache};
use crate::meta::{meta_path, BlockMeta, MetaDecodeError};
use crate::store::{ObjectStore, StoreError};

/// Metadata load error types
///
/// `MetaNotFound` and `MetaCorrupted` are expected classification outcomes
/// (the block stays visible as a partial block); everything else renders
/// the fetch incomplete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The block directory exists but has no `meta.json`
    #[error("meta.json not found for block {0}")]
    MetaNotFound(Ulid),

    /// The block's `meta.json` exists but failed to parse
    #[error("corrupted meta.json for block {id}: {reason}")]
    MetaCorrupted {
        /// Affected block
        id: Ulid,
        /// Parser diagnostic
        reason: String,
    },

    /// The block's `meta.json` declares an unsupported format version
    #[error("unexpected meta.json version {version} for block {id}")]
    UnexpectedVersion {
        /// Affected block
        id: Ulid,
        /// Version the descriptor declared
        version: u32,
    },

    /// Transport or backend failure talking to the object store
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Walks the cache tiers to resolve one block's metadata.
pub(crate) struct MetaLoader {
    store: Arc<dyn ObjectStore>,
    lru: Option<Arc<MetaLruCache>>,
    disk: Option<Arc<DiskMetaCache>>,
}

impl MetaLoader {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        lru: Option<Arc<MetaLruCache>>,
        disk: Option<Arc<DiskMetaCache>>,
    ) -> Self {
        Self { store, lru, disk }
    }

    /// Resolves `id` against `cached` (the previous complete fetch's view),
    /// then the LRU, the disk cache, and the object store.
    pub(crate) async fn load(
        &self,
        cached: &HashMap<Ulid, Arc<BlockMeta>>,
        id: Ulid,
    ) -> Result<Arc<BlockMeta>, LoadError> {
        if let Some(meta) = cached.get(&id) {
            return Ok(Arc::clone(meta));
        }

        if let Some(lru) = &self.lru {
            if let Some(meta) = lru.get(id) {
                return Ok(meta);
            }
        }

        if let Some(disk) = &self.disk {
            if let Some(raw) = disk.read(id) {
                match BlockMeta::decode(&raw) {
                    Ok(meta) => {
                        let meta = Arc::new(meta);
                        if let Some(lru) = &self.lru {
                            lru.put(&[Arc::clone(&meta)]);
                        }
                        return Ok(meta);
                    }
                    Err(err) => {
                        // The remote copy is authoritative and immutable, so a
                        // local copy that no longer parses is just damage.
                        log::warn!("discarding unreadable disk cache entry for block {id}: {err}");
                        disk.remove(id);
                    }
                }
            }
        }

        let raw = match self.store.get(&meta_path(id)).await {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() => return Err(LoadError::MetaNotFound(id)),
            Err(err) => return Err(LoadError::Store(err)),
        };

        let meta = match BlockMeta::decode(&raw) {
            Ok(meta) => Arc::new(meta),
            Err(MetaDecodeError::UnexpectedVersion(version)) => {
                return Err(LoadError::UnexpectedVersion { id, version })
            }
            Err(MetaDecodeError::Malformed(reason)) => {
                return Err(LoadError::MetaCorrupted { id, reason })
            }
        };

        if let Some(disk) = &self.disk {
            disk.write(id, &raw);
        }
        if let Some(lru) = &self.lru {
            lru.put(&[Arc::clone(&meta)]);
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetaLruConfig;
    use crate::meta::{BlockCompaction, META_VERSION};
    use crate::store::MemoryStore;

    fn sample_meta(id: Ulid) -> BlockMeta {
        BlockMeta {
            ulid: id,
            min_time: 0,
            max_time: 1000,
            version: META_VERSION,
            compaction: BlockCompaction {
                level: 2,
                sources: vec![id],
                parents: Vec::new(),
                hints: Vec::new(),
            },
            extra: serde_json::Map::new(),
        }
    }

    fn loader_with(
        store: Arc<MemoryStore>,
        lru: Option<Arc<MetaLruCache>>,
        disk: Option<Arc<DiskMetaCache>>,
    ) -> MetaLoader {
        MetaLoader::new(store, lru, disk)
    }

    #[tokio::test]
    async fn snapshot_hit_skips_every_other_tier() {
        let store = Arc::new(MemoryStore::new());
        let id = Ulid::new();
        let meta = Arc::new(sample_meta(id));
        let cached: HashMap<_, _> = [(id, Arc::clone(&meta))].into_iter().collect();

        let loader = loader_with(Arc::clone(&store), None, None);
        let loaded = loader.load(&cached, id).await.unwrap();

        assert_eq!(*loaded, *meta);
        assert_eq!(store.get_calls(), 0);
    }

    #[tokio::test]
    async fn store_hit_populates_disk_and_lru() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let lru = Arc::new(MetaLruCache::new(MetaLruConfig::default()).unwrap());
        let disk = Arc::new(DiskMetaCache::open(dir.path()).unwrap());

        let id = Ulid::new();
        let raw = sample_meta(id).encode();
        store.insert(meta_path(id), raw.clone());

        let loader = loader_with(Arc::clone(&store), Some(Arc::clone(&lru)), Some(Arc::clone(&disk)));
        let loaded = loader.load(&HashMap::new(), id).await.unwrap();
        assert_eq!(loaded.ulid, id);

        // Write-back is byte-identical on disk and parsed in the LRU.
        assert_eq!(disk.read(id), Some(raw));
        assert!(lru.get(id).is_some());

        // The next resolution is served without touching the store.
        let again = loader.load(&HashMap::new(), id).await.unwrap();
        assert_eq!(*again, *loaded);
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn disk_hit_is_admitted_to_lru() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let lru = Arc::new(MetaLruCache::new(MetaLruConfig::default()).unwrap());
        let disk = Arc::new(DiskMetaCache::open(dir.path()).unwrap());

        let id = Ulid::new();
        disk.write(id, &sample_meta(id).encode());

        let loader = loader_with(Arc::clone(&store), Some(Arc::clone(&lru)), Some(disk));
        let loaded = loader.load(&HashMap::new(), id).await.unwrap();
        assert_eq!(loaded.ulid, id);
        assert!(lru.get(id).is_some());
        assert_eq!(store.get_calls(), 0);
    }

    #[tokio::test]
    async fn corrupt_disk_entry_falls_through_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let disk = Arc::new(DiskMetaCache::open(dir.path()).unwrap());

        let id = Ulid::new();
        disk.write(id, b"{not json");
        store.insert(meta_path(id), sample_meta(id).encode());

        let loader = loader_with(Arc::clone(&store), None, Some(Arc::clone(&disk)));
        let loaded = loader.load(&HashMap::new(), id).await.unwrap();
        assert_eq!(loaded.ulid, id);

        // The damaged entry was replaced by the authoritative copy.
        assert_eq!(disk.read(id), Some(sample_meta(id).encode()));
    }

    #[tokio::test]
    async fn missing_meta_classifies_as_not_found() {
        let store = Arc::new(MemoryStore::new());
        let id = Ulid::new();
        let loader = loader_with(store, None, None);

        let err = loader.load(&HashMap::new(), id).await.unwrap_err();
        assert_eq!(err, LoadError::MetaNotFound(id));
    }

    #[tokio::test]
    async fn corrupt_remote_meta_does_not_poison_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let lru = Arc::new(MetaLruCache::new(MetaLruConfig::default()).unwrap());
        let disk = Arc::new(DiskMetaCache::open(dir.path()).unwrap());

        let id = Ulid::new();
        store.insert(meta_path(id), b"{\"version\":1,broken".to_vec());

        let loader = loader_with(store, Some(Arc::clone(&lru)), Some(Arc::clone(&disk)));
        let err = loader.load(&HashMap::new(), id).await.unwrap_err();
        assert!(matches!(err, LoadError::MetaCorrupted { .. }));
        assert!(lru.get(id).is_none());
        assert!(disk.read(id).is_none());
    }

    #[tokio::test]
    async fn unexpected_version_is_not_a_classification_error() {
        let store = Arc::new(MemoryStore::new());
        let id = Ulid::new();
        let mut meta = sample_meta(id);
        meta.version = 9;
        // Encode bypasses decode-side validation.
        store.insert(meta_path(id), serde_json::to_vec(&meta).unwrap());

        let loader = loader_with(store, None, None);
        let err = loader.load(&HashMap::new(), id).await.unwrap_err();
        assert_eq!(err, LoadError::UnexpectedVersion { id, version: 9 });
    }
}
