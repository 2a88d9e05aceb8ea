//! Durable per-room message cache.
//!
//! [`LocalCacheStore`] gives a room instant, offline-tolerant first paint by
//! persisting its most recent messages through a [`KeyValueStore`]. Each
//! room owns two records:
//!
//! - `messages_snap_<room>`: `{messages, timestamp, version}`
//! - `messages_meta_<room>`: `{oldestTimestamp, hasMore, lastUpdated}`
//!
//! The two record kinds have distinct prefixes of equal length, so no room's
//! snapshot key can equal another room's metadata key.
//!
//! # Failure handling
//!
//! Cache problems never reach the caller. Read, write and decode failures
//! are logged and degrade to a cache miss; entries that are stale, carry an
//! unknown version, or are too damaged to repair are deleted so the next
//! room open refetches from the remote store.

pub mod store;

use std::time::Duration;

use chatsync_proto::codec::{self, CACHE_VERSION, CodecError, MetadataRecord, SnapshotRecord};
use chatsync_proto::message::{Message, RoomId, Timestamp};

use store::{KeyValueStore, StoreError};

pub use chatsync_proto::codec::MetadataRecord as CacheMetadata;

/// Key prefix shared by every record this module writes.
const KEY_PREFIX: &str = "messages_";

const SNAPSHOT_PREFIX: &str = "messages_snap_";

const METADATA_PREFIX: &str = "messages_meta_";

/// Internal error type; never surfaced past this module.
#[derive(Debug, thiserror::Error)]
enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Tuning for the local cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Most recent messages kept per room.
    pub max_messages: usize,
    /// Entries older than this are treated as absent.
    pub ttl: Duration,
    /// An entry with more than this percentage of invalid messages is
    /// deleted rather than repaired.
    pub max_invalid_percent: u8,
    /// Page size used by pagination; a cached window holding at least one
    /// page is assumed to have older history upstream.
    pub page_size: usize,
    /// Source of "now" for write stamps and expiry.
    pub clock: fn() -> Timestamp,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            ttl: Duration::from_secs(24 * 60 * 60),
            max_invalid_percent: 20,
            page_size: 20,
            clock: Timestamp::now,
        }
    }
}

/// A cache hit: the stored messages plus their metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Messages ascending by `created_at`.
    pub messages: Vec<Message>,
    pub metadata: CacheMetadata,
    /// When the entry was written.
    pub written_at: Timestamp,
}

/// Per-room message cache over a [`KeyValueStore`].
pub struct LocalCacheStore<K: KeyValueStore> {
    kv: K,
    config: CacheConfig,
}

impl<K: KeyValueStore> LocalCacheStore<K> {
    /// Create a cache over the given key-value store.
    #[must_use]
    pub const fn new(kv: K, config: CacheConfig) -> Self {
        Self { kv, config }
    }

    /// Returns a reference to the underlying key-value store.
    pub const fn kv(&self) -> &K {
        &self.kv
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key of a room's message snapshot record.
    #[must_use]
    pub fn snapshot_key(room: &RoomId) -> String {
        format!("{SNAPSHOT_PREFIX}{room}")
    }

    /// Key of a room's metadata record.
    #[must_use]
    pub fn metadata_key(room: &RoomId) -> String {
        format!("{METADATA_PREFIX}{room}")
    }

    /// Persist the most recent messages of a room.
    ///
    /// Messages are sorted ascending by `created_at` and truncated to the
    /// newest [`CacheConfig::max_messages`]. Without a known pagination
    /// state, a window holding at least one page is assumed to have older
    /// history. Returns whether the write succeeded; failures are logged.
    pub async fn save(&self, room: &RoomId, messages: &[Message]) -> bool {
        let has_more = messages.len() >= self.config.page_size;
        self.save_with_has_more(room, messages, has_more).await
    }

    /// Like [`save`](Self::save), recording the room's own `has_more`.
    ///
    /// A window that had to be truncated is always stored with `hasMore`
    /// set, since the dropped messages are older history.
    pub async fn save_with_has_more(
        &self,
        room: &RoomId,
        messages: &[Message],
        has_more: bool,
    ) -> bool {
        let mut kept = messages.to_vec();
        kept.sort_by_key(|m| m.created_at);
        let truncated = kept.len() > self.config.max_messages;
        if truncated {
            kept.drain(..kept.len() - self.config.max_messages);
        }
        let has_more = truncated || has_more;
        let now = (self.config.clock)();

        match self.write_records(room, kept, now, has_more).await {
            Ok(count) => {
                tracing::trace!(room_id = %room, count, "cache entry written");
                true
            }
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "cache write failed");
                false
            }
        }
    }

    /// Load a room's cache entry.
    ///
    /// Returns `None` when there is no entry, or when the entry is stale,
    /// has an unknown version, or cannot be decoded; in those cases the
    /// entry is deleted as a side effect. Entries that fail per-message
    /// checks are skipped here; [`validate_and_repair`](Self::validate_and_repair)
    /// is what rewrites them.
    pub async fn load(&self, room: &RoomId) -> Option<CacheEntry> {
        let raw = self.read_raw(room).await?;
        let decoded = match codec::decode_snapshot(&raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "undecodable cache entry, deleting");
                self.clear_room(room).await;
                return None;
            }
        };
        if !self.is_current(room, &decoded.version, decoded.timestamp) {
            self.clear_room(room).await;
            return None;
        }

        let written_at = decoded.timestamp;
        let mut messages = decoded.into_valid();
        messages.sort_by_key(|m| m.created_at);

        let metadata = match self.read_metadata(room).await {
            Some(meta) => meta,
            None => CacheMetadata {
                oldest_timestamp: messages.first().map(|m| m.created_at),
                has_more: messages.len() >= self.config.page_size,
                last_updated: written_at,
            },
        };

        Some(CacheEntry {
            messages,
            metadata,
            written_at,
        })
    }

    /// Check a room's entry and repair it in place when possible.
    ///
    /// Messages that fail to decode or have an empty `id`/`senderId` are
    /// invalid. When more than [`CacheConfig::max_invalid_percent`] of the
    /// entries are invalid the whole entry is deleted. Otherwise invalid
    /// messages are dropped, the rest re-sorted by `created_at` if needed,
    /// and the entry re-saved under its original write time.
    ///
    /// Returns `true` when a non-empty, usable entry remains.
    pub async fn validate_and_repair(&self, room: &RoomId) -> bool {
        let Some(raw) = self.read_raw(room).await else {
            return false;
        };
        let decoded = match codec::decode_snapshot(&raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "corrupt cache entry, deleting");
                self.clear_room(room).await;
                return false;
            }
        };
        if !self.is_current(room, &decoded.version, decoded.timestamp) {
            self.clear_room(room).await;
            return false;
        }

        let total = decoded.entries.len();
        if total == 0 {
            return false;
        }
        let invalid = total - decoded.valid_count();
        if invalid * 100 > total * usize::from(self.config.max_invalid_percent) {
            tracing::warn!(
                room_id = %room,
                invalid,
                total,
                "cache entry too damaged to repair, deleting"
            );
            self.clear_room(room).await;
            return false;
        }

        let written_at = decoded.timestamp;
        let mut messages = decoded.into_valid();
        let out_of_order = !messages.is_sorted_by_key(|m| m.created_at);
        if out_of_order {
            messages.sort_by_key(|m| m.created_at);
        }

        if invalid > 0 || out_of_order {
            let has_more = messages.len() >= self.config.page_size;
            match self
                .write_records(room, messages, written_at, has_more)
                .await
            {
                Ok(kept) => {
                    tracing::info!(
                        room_id = %room,
                        dropped = invalid,
                        resorted = out_of_order,
                        kept,
                        "cache entry repaired"
                    );
                    return kept > 0;
                }
                Err(err) => {
                    tracing::warn!(room_id = %room, error = %err, "cache repair write failed");
                    return false;
                }
            }
        }

        !messages.is_empty()
    }

    /// Delete a room's snapshot and metadata records.
    pub async fn clear_room(&self, room: &RoomId) {
        for key in [Self::snapshot_key(room), Self::metadata_key(room)] {
            if let Err(err) = self.kv.remove(&key).await {
                tracing::warn!(key, error = %err, "cache delete failed");
            }
        }
    }

    /// Delete every cache record this store has written.
    pub async fn clear_all(&self) {
        let keys = match self.kv.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "cannot list cache keys");
                return;
            }
        };
        let mut removed = 0usize;
        for key in keys.iter().filter(|k| k.starts_with(KEY_PREFIX)) {
            match self.kv.remove(key).await {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(key, error = %err, "cache delete failed"),
            }
        }
        tracing::debug!(removed, "cache cleared");
    }

    fn is_current(&self, room: &RoomId, version: &str, written_at: Timestamp) -> bool {
        if version != CACHE_VERSION {
            tracing::debug!(room_id = %room, version, "cache entry version mismatch");
            return false;
        }
        let age_ms = (self.config.clock)()
            .as_millis()
            .saturating_sub(written_at.as_millis());
        let ttl_ms = u64::try_from(self.config.ttl.as_millis()).unwrap_or(u64::MAX);
        if age_ms > ttl_ms {
            tracing::debug!(room_id = %room, age_ms, "cache entry expired");
            return false;
        }
        true
    }

    async fn read_raw(&self, room: &RoomId) -> Option<String> {
        match self.kv.get(&Self::snapshot_key(room)).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "cache read failed");
                None
            }
        }
    }

    async fn read_metadata(&self, room: &RoomId) -> Option<CacheMetadata> {
        let raw = self.kv.get(&Self::metadata_key(room)).await.ok()??;
        match codec::decode_metadata(&raw) {
            Ok(meta) => Some(meta),
            Err(err) => {
                tracing::debug!(room_id = %room, error = %err, "ignoring bad cache metadata");
                None
            }
        }
    }

    /// Write both records; returns the number of messages stored.
    async fn write_records(
        &self,
        room: &RoomId,
        messages: Vec<Message>,
        written_at: Timestamp,
        has_more: bool,
    ) -> Result<usize, CacheError> {
        let metadata = MetadataRecord {
            oldest_timestamp: messages.first().map(|m| m.created_at),
            has_more,
            last_updated: (self.config.clock)(),
        };
        let record = SnapshotRecord {
            messages,
            timestamp: written_at,
            version: CACHE_VERSION.to_string(),
        };
        let count = record.messages.len();
        self.kv
            .set(
                &Self::snapshot_key(room),
                codec::encode_snapshot(&record)?,
            )
            .await?;
        self.kv
            .set(
                &Self::metadata_key(room),
                codec::encode_metadata(&metadata)?,
            )
            .await?;
        Ok(count)
    }
}
