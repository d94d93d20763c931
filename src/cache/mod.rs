//! Metadata caching tiers
//!
//! This module provides the two cache tiers consulted between the
//! orchestrator's in-memory view and the object store:
//! - An in-process LRU of parsed metadata, shareable across fetchers
//! - A per-instance disk cache of verbatim `meta.json` copies

use std::path::PathBuf;

use thiserror::Error;

pub mod disk;
pub mod lru;

pub use disk::DiskMetaCache;
pub use lru::{MetaLruCache, MetaLruConfig, MetaLruStats};

/// Cache construction error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// LRU capacity of zero is a configuration error, not a disabled cache
    #[error("metadata LRU capacity must be positive")]
    ZeroCapacity,

    /// The disk cache directory could not be created
    #[error("failed to initialize disk cache at {path}: {source}")]
    DiskInit {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}
