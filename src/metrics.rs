//! Prometheus metrics for block metadata synchronization
//!
//! Provides the fetcher's metric family:
//! - **Counters**: sync attempts and sync failures
//! - **Histogram**: per-fetch wall time, with buckets extending to six hours
//! - **Gauge vec**: per-state classification counts, committed transactionally
//!
//! The classification gauges are staged while a fetch runs and swapped into
//! the exported values in one step, so a scraper never observes a
//! half-updated snapshot.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry};

/// Classification states reported under the `state` label of
/// `blocks_meta_synced`.
pub mod states {
    /// Block with a `meta.json` that failed to parse
    pub const CORRUPTED_META_JSON: &str = "corrupted-meta-json";
    /// Block directory without a `meta.json`
    pub const NO_META_JSON: &str = "no-meta-json";
    /// Block loaded successfully
    pub const LOADED: &str = "loaded";
    /// Block whose load failed with a non-classification error
    pub const FAILED: &str = "failed";
    /// Block excluded by a label sharding filter
    pub const LABEL_EXCLUDED: &str = "label-excluded";
    /// Block excluded by a time partition filter
    pub const TIME_EXCLUDED: &str = "time-excluded";
    /// Block shadowed by a compacted duplicate
    pub const DUPLICATE: &str = "duplicate";
    /// Block excluded because its deletion mark exceeded the delay
    pub const MARKED_FOR_DELETION: &str = "marked-for-deletion";
    /// Block carrying a no-compact mark
    pub const MARKED_FOR_NO_COMPACT: &str = "marked-for-no-compact";
    /// Block older than the configured lookback window
    pub const LOOKBACK_EXCLUDED: &str = "lookback-excluded";

    pub(crate) const ALL: &[&str] = &[
        CORRUPTED_META_JSON,
        NO_META_JSON,
        LOADED,
        FAILED,
        LABEL_EXCLUDED,
        TIME_EXCLUDED,
        DUPLICATE,
        MARKED_FOR_DELETION,
        MARKED_FOR_NO_COMPACT,
        LOOKBACK_EXCLUDED,
    ];
}

/// Transactionally committed `blocks_meta_synced{state=...}` gauge vec.
///
/// Counts accumulate in a staging map during a fetch; [`commit`] swaps the
/// staged values into the exported gauges in one critical section, zeroing
/// every known state that was not staged this pass.
///
/// [`commit`]: SyncedStates::commit
pub struct SyncedStates {
    live: IntGaugeVec,
    staged: Mutex<BTreeMap<String, i64>>,
    known: Mutex<BTreeSet<String>>,
}

impl SyncedStates {
    fn new(live: IntGaugeVec, extra_states: &[&str]) -> Self {
        let known = states::ALL
            .iter()
            .chain(extra_states)
            .map(|s| s.to_string())
            .collect();
        Self {
            live,
            staged: Mutex::new(BTreeMap::new()),
            known: Mutex::new(known),
        }
    }

    /// Adds `count` blocks to the staged tally for `state`.
    ///
    /// Filters call this when they remove entries from the fetched view.
    pub fn add(&self, state: &str, count: usize) {
        *self.staged.lock().entry(state.to_string()).or_insert(0) += count as i64;
    }

    /// Discards any staged values; called when a fetch pass begins.
    pub(crate) fn reset(&self) {
        self.staged.lock().clear();
    }

    /// Publishes the staged values, zeroing states not staged this pass.
    pub(crate) fn commit(&self) {
        let mut staged = self.staged.lock();
        let mut known = self.known.lock();
        for state in staged.keys() {
            known.insert(state.clone());
        }
        for state in known.iter() {
            let value = staged.get(state).copied().unwrap_or(0);
            self.live.with_label_values(&[state.as_str()]).set(value);
        }
        staged.clear();
    }

    /// Current exported value for `state`.
    pub fn get(&self, state: &str) -> i64 {
        self.live.with_label_values(&[state]).get()
    }
}

/// Metrics emitted by one fetcher, registered against a shared registry.
pub struct FetcherMetrics {
    syncs_total: IntCounter,
    sync_failures_total: IntCounter,
    sync_duration: Histogram,
    synced: SyncedStates,
}

impl FetcherMetrics {
    /// Creates and registers the fetcher metric family.
    ///
    /// `extra_states` pre-registers additional classification labels used
    /// by caller-supplied filters.
    pub fn new(registry: &Registry, extra_states: &[&str]) -> Result<Self, prometheus::Error> {
        let syncs_total = IntCounter::with_opts(Opts::new(
            "blocks_meta_syncs_total",
            "Total number of block metadata synchronization attempts",
        ))?;

        let sync_failures_total = IntCounter::with_opts(Opts::new(
            "blocks_meta_sync_failures_total",
            "Total number of block metadata synchronization attempts that failed",
        ))?;

        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "blocks_meta_sync_duration_seconds",
                "Duration of one block metadata synchronization pass",
            )
            .buckets(vec![0.01, 1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 21600.0]),
        )?;

        let synced_vec = IntGaugeVec::new(
            Opts::new(
                "blocks_meta_synced",
                "Number of blocks per classification state in the last completed fetch",
            ),
            &["state"],
        )?;

        registry.register(Box::new(syncs_total.clone()))?;
        registry.register(Box::new(sync_failures_total.clone()))?;
        registry.register(Box::new(sync_duration.clone()))?;
        registry.register(Box::new(synced_vec.clone()))?;

        Ok(Self {
            syncs_total,
            sync_failures_total,
            sync_duration,
            synced: SyncedStates::new(synced_vec, extra_states),
        })
    }

    /// Fetch attempts counter
    pub fn syncs_total(&self) -> &IntCounter {
        &self.syncs_total
    }

    /// Failed fetch attempts counter
    pub fn sync_failures_total(&self) -> &IntCounter {
        &self.sync_failures_total
    }

    /// Per-fetch wall-time histogram
    pub fn sync_duration(&self) -> &Histogram {
        &self.sync_duration
    }

    /// Transactional classification gauges
    pub fn synced(&self) -> &SyncedStates {
        &self.synced
    }
}
