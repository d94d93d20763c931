//! Post-fetch metadata filters
//!
//! This module provides:
//! - The [`MetaFilter`] trait run in order after every fetch pass
//! - The deletion-mark filter, which evicts blocks whose deletion mark has
//!   outlived the configured delay
//! - The no-compact-mark filter, which tracks (and optionally excludes)
//!   blocks marked as ineligible for compaction
//!
//! Filters may remove entries from the fetched view; when they do, they
//! account for the removals on the transactional `state` gauges. A filter
//! error aborts the fetch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::meta::BlockMeta;
use crate::metrics::SyncedStates;
use crate::store::StoreError;

pub mod deletion_mark;
pub mod no_compact;

pub use deletion_mark::DeletionMarkFilter;
pub use no_compact::NoCompactMarkFilter;

/// Filter error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// A sidecar read failed with a non-classification error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure specific to a caller-supplied filter
    #[error("{0}")]
    Other(String),
}

/// A post-fetch filter over the loaded metadata view.
///
/// Filters run sequentially in registration order and may delete entries
/// from `metas`, staging the removals under their classification state on
/// `synced`.
#[async_trait]
pub trait MetaFilter: Send + Sync {
    /// Short name used in error reports and logs.
    fn name(&self) -> &'static str;

    /// Applies the filter to the fetched view.
    async fn filter(
        &self,
        metas: &mut HashMap<Ulid, Arc<BlockMeta>>,
        synced: &SyncedStates,
    ) -> Result<(), FilterError>;
}
