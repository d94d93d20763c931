//! # Metasync - Block Metadata Synchronizer
//!
//! Reconciles an in-memory view of time-series block metadata with the
//! authoritative state in a remote object store. A block is an immutable,
//! ULID-identified directory holding a `meta.json` descriptor plus data
//! files; [`MetaFetcher::fetch`] answers "what blocks exist right now, with
//! what metadata, and which are unreadable?" on demand.
//!
//! ## Architecture
//!
//! - `meta`: metadata model, mark sidecars, and object-store path layout
//! - `store`: the object-store trait boundary plus an in-memory backend
//! - `cache`: the shared metadata LRU and the per-instance disk cache
//! - `fetch`: the fetch orchestrator, tiered loader, and single-flight
//!   coalescing of concurrent callers
//! - `filter`: post-fetch filters (deletion-mark, no-compact-mark)
//! - `metrics`: Prometheus counters, histogram, and the transactionally
//!   committed classification gauges

#![warn(missing_docs)]
#![warn(clippy::all)]

// Metadata model and wire formats
pub mod meta;

// Object store boundary
pub mod store;

// Cache tiers between the fetcher and the store
pub mod cache;

// Fetch orchestration
pub mod fetch;

// Post-fetch filters
pub mod filter;

// Prometheus metric family
pub mod metrics;

// Re-export commonly used types
pub use cache::{DiskMetaCache, MetaLruCache, MetaLruConfig, MetaLruStats};
pub use fetch::{
    ConfigError, FetchError, FetchedBlocks, FetcherConfig, LoadError, MetaFetcher,
};
pub use filter::{DeletionMarkFilter, FilterError, MetaFilter, NoCompactMarkFilter};
pub use meta::{BlockCompaction, BlockDesc, BlockMeta, DeletionMark, NoCompactMark};
pub use metrics::FetcherMetrics;
pub use store::{MemoryStore, ObjectStore, StoreError};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
