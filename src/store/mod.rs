//! Object store boundary
//!
//! This module provides:
//! - The [`ObjectStore`] trait the synchronizer consumes
//! - Error classification for not-found versus transport failures
//! - An in-memory backend for tests and examples

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Object store error types
///
/// Errors are `Clone` (with stringified sources) because one fetch outcome
/// may be fanned out to many concurrent callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Any other transport or backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Wraps an arbitrary backend failure.
    pub fn backend(err: impl ToString) -> Self {
        Self::Backend(err.to_string())
    }

    /// Classification hook: whether this error means the object is absent.
    ///
    /// Absence of `meta.json` or mark sidecars is an expected condition and
    /// must not be treated like a transport failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for object store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Read access to a bucket of immutable block data.
///
/// Implementations wrap whatever client the deployment uses (S3, GCS, a
/// local filesystem). The synchronizer only ever lists names and reads
/// whole objects; it never writes to the bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists the names directly under `prefix`.
    ///
    /// Directory-like entries are reported with a trailing slash and with
    /// the prefix retained, e.g. listing `""` yields `01ARZ…FAV/` for each
    /// block directory, and listing [`crate::meta::MARKERS_PREFIX`] yields
    /// the marker object names.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reads a whole object.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
}
