//! Disk cache of verbatim `meta.json` copies
//!
//! A per-instance filesystem directory that lets a restarted process warm
//! up without re-reading every descriptor from the object store. All
//! operations besides construction are best-effort: a failure is logged and
//! the cache behaves as if it had no entry. Concurrent processes sharing
//! one directory are not supported.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ulid::Ulid;

use crate::cache::CacheError;
use crate::meta::META_FILENAME;

/// Name of the cache directory created under the configured root.
const CACHE_DIR: &str = "meta-syncer";

/// Filesystem cache holding `<root>/meta-syncer/<block-id>/meta.json`.
///
/// Entries are byte-identical copies of the remote descriptor, which is
/// immutable, so a present entry never needs revalidation.
pub struct DiskMetaCache {
    root: PathBuf,
}

impl DiskMetaCache {
    /// Opens the cache under `user_dir`, creating the directory tree.
    pub fn open(user_dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = user_dir.as_ref().join(CACHE_DIR);
        fs::create_dir_all(&root).map_err(|source| CacheError::DiskInit {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the cached `meta.json` bytes for `id`.
    ///
    /// A read failure on an existing entry removes that entry so the next
    /// attempt starts clean.
    pub fn read(&self, id: Ulid) -> Option<Vec<u8>> {
        let path = self.meta_file(id);
        match fs::read(&path) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                log::warn!(
                    "failed to read cached meta.json for block {id} at {}: {err}",
                    path.display()
                );
                self.remove(id);
                None
            }
        }
    }

    /// Writes the `meta.json` bytes for `id`, best-effort.
    pub fn write(&self, id: Ulid, raw: &[u8]) {
        let dir = self.root.join(id.to_string());
        if let Err(err) = fs::create_dir_all(&dir) {
            log::warn!("failed to create disk cache entry for block {id}: {err}");
            return;
        }
        if let Err(err) = fs::write(dir.join(META_FILENAME), raw) {
            log::warn!("failed to write cached meta.json for block {id}: {err}");
        }
    }

    /// Removes the cache entry for `id`, best-effort.
    pub fn remove(&self, id: Ulid) {
        let dir = self.root.join(id.to_string());
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("failed to remove disk cache entry for block {id}: {err}");
            }
        }
    }

    /// Removes every entry whose ID is absent from `live`.
    ///
    /// Only ULID-named directories are touched; foreign files under the
    /// cache root are left alone.
    pub fn prune(&self, live: &HashSet<Ulid>) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("failed to scan disk cache at {}: {err}", self.root.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<Ulid>().ok()) else {
                continue;
            };
            if !live.contains(&id) {
                self.remove(id);
            }
        }
    }

    fn meta_file(&self, id: Ulid) -> PathBuf {
        self.root.join(id.to_string()).join(META_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskMetaCache::open(dir.path()).unwrap();

        let id = Ulid::new();
        assert!(cache.read(id).is_none());

        let raw = br#"{"version":1,"custom":true}"#;
        cache.write(id, raw);
        assert_eq!(cache.read(id).as_deref(), Some(raw.as_slice()));
    }

    #[test]
    fn prune_removes_only_dead_ulid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskMetaCache::open(dir.path()).unwrap();

        let live = Ulid::new();
        let dead = Ulid::new();
        cache.write(live, b"live");
        cache.write(dead, b"dead");
        fs::create_dir_all(cache.root().join("not-a-ulid")).unwrap();

        let keep: HashSet<Ulid> = [live].into_iter().collect();
        cache.prune(&keep);

        assert!(cache.read(live).is_some());
        assert!(cache.read(dead).is_none());
        assert!(cache.root().join("not-a-ulid").exists());
    }

    #[test]
    fn remove_tolerates_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskMetaCache::open(dir.path()).unwrap();
        cache.remove(Ulid::new());
    }
}
