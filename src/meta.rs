//! Block metadata model and on-wire JSON formats
//!
//! This module provides:
//! - The parsed `meta.json` descriptor (`BlockMeta`) and its compaction record
//! - Deletion and no-compact mark sidecars
//! - Object-store path layout for block directories and marker objects
//! - ULID helpers for time-based pruning

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// The only supported `meta.json` format version.
pub const META_VERSION: u32 = 1;

/// File name of the per-block metadata descriptor.
pub const META_FILENAME: &str = "meta.json";

/// File name of the per-block deletion mark sidecar.
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

/// File name of the per-block no-compact mark sidecar.
pub const NO_COMPACT_MARK_FILENAME: &str = "no-compact-mark.json";

/// Prefix under which the global deletion-mark index lives.
pub const MARKERS_PREFIX: &str = "markers/";

/// Errors decoding a `meta.json` payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaDecodeError {
    /// The payload is not valid JSON or misses required fields
    #[error("malformed meta.json: {0}")]
    Malformed(String),

    /// The payload parsed but declares an unsupported format version
    #[error("unexpected meta.json version {0}")]
    UnexpectedVersion(u32),
}

/// Descriptor of one block referenced from another block's compaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    /// Block ID
    pub ulid: Ulid,

    /// Minimum sample timestamp covered by the block, in milliseconds
    #[serde(rename = "minTime")]
    pub min_time: i64,

    /// Maximum sample timestamp covered by the block, in milliseconds
    #[serde(rename = "maxTime")]
    pub max_time: i64,
}

/// Compaction record of a block.
///
/// Tracks how a block came to be: its compaction level, the root source
/// blocks it was derived from, and the immediate parents merged into it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockCompaction {
    /// Compaction level; level 1 blocks come straight from a head cut
    pub level: u32,

    /// IDs of all root blocks this block was compacted from
    #[serde(default)]
    pub sources: Vec<Ulid>,

    /// Immediate parent blocks merged to produce this block
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockDesc>,

    /// Optional compactor hints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// Parsed, immutable `meta.json` descriptor of one block.
///
/// Once a descriptor has been uploaded under `<id>/meta.json` its content
/// never changes, which is what allows metadata to be shared by reference
/// across cache tiers. Fields this crate does not interpret are preserved
/// verbatim so a round-trip does not lose information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block ID; also the name of the block directory in the object store
    pub ulid: Ulid,

    /// Minimum sample timestamp covered by the block, in milliseconds
    #[serde(rename = "minTime")]
    pub min_time: i64,

    /// Maximum sample timestamp covered by the block, in milliseconds
    #[serde(rename = "maxTime")]
    pub max_time: i64,

    /// Format version; must equal [`META_VERSION`]
    pub version: u32,

    /// Compaction record
    #[serde(default)]
    pub compaction: BlockCompaction,

    /// Descriptive fields this crate does not interpret, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BlockMeta {
    /// Decodes a `meta.json` payload and validates its format version.
    pub fn decode(raw: &[u8]) -> Result<Self, MetaDecodeError> {
        let meta: Self = serde_json::from_slice(raw)
            .map_err(|e| MetaDecodeError::Malformed(e.to_string()))?;
        if meta.version != META_VERSION {
            return Err(MetaDecodeError::UnexpectedVersion(meta.version));
        }
        Ok(meta)
    }

    /// Encodes the descriptor back to JSON bytes.
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of a value that deserialized cleanly cannot fail.
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    /// Approximate in-memory size of this descriptor, in bytes.
    ///
    /// Used for cache statistics only; not an allocator-accurate figure.
    pub fn approx_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        size += self.compaction.sources.len() * std::mem::size_of::<Ulid>();
        size += self.compaction.parents.len() * std::mem::size_of::<BlockDesc>();
        size += self
            .compaction
            .hints
            .iter()
            .map(|h| h.capacity())
            .sum::<usize>();
        for (key, value) in &self.extra {
            size += key.len() + approx_json_size(value);
        }
        size
    }
}

fn approx_json_size(value: &serde_json::Value) -> usize {
    use serde_json::Value;
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(approx_json_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() + approx_json_size(v))
            .sum(),
    }
}

/// Deletion mark sidecar: a promise to delete the block some delay after
/// `deletion_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// Unix timestamp in seconds at which the block was marked for deletion
    #[serde(rename = "deletionTime")]
    pub deletion_time: i64,
}

impl DeletionMark {
    /// Decodes a `deletion-mark.json` payload.
    pub fn decode(raw: &[u8]) -> Result<Self, MetaDecodeError> {
        serde_json::from_slice(raw).map_err(|e| MetaDecodeError::Malformed(e.to_string()))
    }
}

/// No-compact mark sidecar: the block must be skipped by compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoCompactMark {
    /// Unix timestamp in seconds at which the block was marked
    #[serde(rename = "noCompactTime")]
    pub no_compact_time: i64,

    /// Free-form reason recorded by whoever placed the mark
    #[serde(default)]
    pub reason: String,
}

impl NoCompactMark {
    /// Decodes a `no-compact-mark.json` payload.
    pub fn decode(raw: &[u8]) -> Result<Self, MetaDecodeError> {
        serde_json::from_slice(raw).map_err(|e| MetaDecodeError::Malformed(e.to_string()))
    }
}

/// Object-store path of a block's `meta.json`.
pub fn meta_path(id: Ulid) -> String {
    format!("{id}/{META_FILENAME}")
}

/// Object-store path of a block's deletion mark sidecar.
pub fn deletion_mark_path(id: Ulid) -> String {
    format!("{id}/{DELETION_MARK_FILENAME}")
}

/// Object-store path of a block's no-compact mark sidecar.
pub fn no_compact_mark_path(id: Ulid) -> String {
    format!("{id}/{NO_COMPACT_MARK_FILENAME}")
}

/// Parses a top-level listing entry as a block directory.
///
/// A name qualifies iff it is a trailing-slashed directory whose base
/// component parses as a ULID. Anything else (loose objects, foreign
/// directories such as `markers/`) yields `None`.
pub fn block_dir_id(name: &str) -> Option<Ulid> {
    let base = name.strip_suffix('/')?;
    base.parse().ok()
}

/// Parses a `markers/` listing entry as a deletion-marked block ID.
///
/// Marker objects are named `<ulid>-deletion-mark.json`; unrecognized
/// entries are skipped by returning `None`.
pub fn deletion_marker_id(name: &str) -> Option<Ulid> {
    let base = name.strip_prefix(MARKERS_PREFIX).unwrap_or(name);
    let base = base.strip_suffix(&format!("-{DELETION_MARK_FILENAME}"))?;
    base.parse().ok()
}

/// Smallest ULID whose embedded timestamp is `timestamp_ms`.
///
/// Every ULID minted at or after `timestamp_ms` compares greater than or
/// equal to this value, so it serves as the inclusive lower bound for
/// time-based pruning.
pub fn min_id_at(timestamp_ms: u64) -> Ulid {
    Ulid::from_parts(timestamp_ms, 0)
}
