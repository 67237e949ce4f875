//! Cache key types.
//!
//! A [`CacheKey`] identifies one logical remote-backed file: the shard it
//! belongs to, the snapshot it was captured in, and the file name inside the
//! snapshot. A [`RegionKey`] narrows that down to one fixed-size region of
//! the file. Both are plain value types whose equality and hash drive the
//! engine's lookups; the cache never mutates them.

use core::fmt;

/// Identity of a snapshot: human-readable name plus generated UUID.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SnapshotId {
    /// Snapshot name as given at creation time.
    pub name: String,
    /// Unique identifier distinguishing snapshots with recycled names.
    pub uuid: String,
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

/// Identity of one shard of an index.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ShardId {
    /// Name of the owning index.
    pub index_name: String,
    /// Shard number within the index.
    pub id: u32,
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_name, self.id)
    }
}

/// Identity of a logical remote-backed file.
///
/// Owned by callers; the cache only reads it for equality and hashing.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    /// Shard the file belongs to.
    pub shard: ShardId,
    /// Snapshot the file was captured in.
    pub snapshot: SnapshotId,
    /// File name within the snapshot.
    pub file_name: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.shard, self.snapshot, self.file_name)
    }
}

/// Identity of one region of a logical file: the [`CacheKey`] plus the
/// region index. Maps to at most one cache entry at a time.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RegionKey {
    /// The logical file this region belongs to.
    pub cache_key: CacheKey,
    /// Zero-based region index within the file.
    pub region: u32,
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cache_key, self.region)
    }
}
