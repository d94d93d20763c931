//! In-memory object store backend
//!
//! A `BTreeMap`-backed [`ObjectStore`] used by this crate's test suite and
//! by downstream consumers that need a hermetic bucket. Instrumented with
//! an invocation counter and per-path failure injection so tests can assert
//! request deduplication and fatal-error propagation.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ObjectStore, Result, StoreError};

/// In-memory [`ObjectStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_paths: RwLock<HashSet<String>>,
    fail_listing: AtomicBool,
    latency: RwLock<Option<Duration>>,
    list_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object.
    pub fn insert(&self, path: impl Into<String>, raw: impl Into<Vec<u8>>) {
        self.objects.write().insert(path.into(), raw.into());
    }

    /// Removes an object if present.
    pub fn remove(&self, path: &str) {
        self.objects.write().remove(path);
    }

    /// Makes subsequent `get` calls for `path` fail with a backend error.
    pub fn fail_path(&self, path: impl Into<String>) {
        self.failing_paths.write().insert(path.into());
    }

    /// Makes subsequent `list` calls fail with a backend error.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Delays every operation by `latency`, simulating a remote bucket.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Number of `list` invocations served so far, including failed ones.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `get` invocations served so far, including failed ones.
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::backend("injected listing failure"));
        }

        let objects = self.objects.read();
        let mut names = BTreeSet::new();
        for key in objects.keys() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                // Nested object: report the directory entry once.
                Some(idx) => {
                    names.insert(format!("{prefix}{}", &rest[..=idx]));
                }
                None => {
                    names.insert(key.clone());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.failing_paths.read().contains(path) {
            return Err(StoreError::backend(format!("injected failure for {path}")));
        }
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_reports_directories_with_trailing_slash() {
        let store = MemoryStore::new();
        store.insert("01BX5ZZKBKACTAV9WEVGEMMVRZ/meta.json", b"{}".to_vec());
        store.insert("01BX5ZZKBKACTAV9WEVGEMMVRZ/chunks/000001", b"x".to_vec());
        store.insert("markers/01BX5ZZKBKACTAV9WEVGEMMVRZ-deletion-mark.json", b"{}".to_vec());

        let top = store.list("").await.unwrap();
        assert_eq!(
            top,
            vec![
                "01BX5ZZKBKACTAV9WEVGEMMVRZ/".to_string(),
                "markers/".to_string()
            ]
        );

        let markers = store.list("markers/").await.unwrap();
        assert_eq!(
            markers,
            vec!["markers/01BX5ZZKBKACTAV9WEVGEMMVRZ-deletion-mark.json".to_string()]
        );
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test]
    async fn get_classifies_missing_objects() {
        let store = MemoryStore::new();
        let err = store.get("nope/meta.json").await.unwrap_err();
        assert!(err.is_not_found());

        store.insert("a/meta.json", b"{}".to_vec());
        store.fail_path("a/meta.json");
        let err = store.get("a/meta.json").await.unwrap_err();
        assert!(!err.is_not_found());
    }
}
