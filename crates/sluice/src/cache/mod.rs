//! In-memory object cache for relayed playlists and segments.
//!
//! Entries carry their own class and expire by class TTL. Expiry is lazy on `get` and eager in the
//! background sweeper started with [`ObjectCache::spawn_sweeper`].

mod coalesce;

pub use coalesce::Coalescer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classify::MediaKind;
use crate::config::CacheConfig;

/// Lifetime class of a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    Segment,
    Playlist,
}

impl CacheClass {
    pub fn for_kind(kind: MediaKind) -> Self {
        if kind.is_playlist() {
            Self::Playlist
        } else {
            Self::Segment
        }
    }
}

/// Payload plus the classification it is served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    pub payload: Bytes,
    pub kind: MediaKind,
    pub class: CacheClass,
}

impl CachedObject {
    pub fn new(payload: Bytes, kind: MediaKind) -> Self {
        Self {
            payload,
            kind,
            class: CacheClass::for_kind(kind),
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.kind.content_type()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    object: CachedObject,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub segments: usize,
    pub playlists: usize,
    pub in_flight: usize,
    pub bytes: usize,
}

/// Thread-safe TTL cache keyed by absolute upstream URL.
#[derive(Clone)]
pub struct ObjectCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    segment_ttl: Duration,
    playlist_ttl: Duration,
}

impl ObjectCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttls(config.segment_ttl, config.playlist_ttl)
    }

    pub fn with_ttls(segment_ttl: Duration, playlist_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            segment_ttl,
            playlist_ttl,
        }
    }

    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        match class {
            CacheClass::Segment => self.segment_ttl,
            CacheClass::Playlist => self.playlist_ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) >= self.ttl_for(entry.object.class)
    }

    /// Fresh object for `key`. Expired entries are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<CachedObject> {
        let entry = self.entries.get(key)?;

        if self.is_expired(&entry, Instant::now()) {
            drop(entry); // Release the shard lock before removing
            self.entries
                .remove_if(key, |_, e| self.is_expired(e, Instant::now()));
            return None;
        }

        Some(entry.object.clone())
    }

    /// Store `object` under `key`, replacing whatever was there.
    pub fn set(&self, key: impl Into<String>, object: CachedObject) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                object,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove every entry older than its class TTL. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| !self.is_expired(entry, now));
        before.saturating_sub(self.len())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.iter() {
            match entry.object.class {
                CacheClass::Segment => stats.segments += 1,
                CacheClass::Playlist => stats.playlists += 1,
            }
            stats.bytes += entry.object.payload.len();
        }
        stats
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `period` until `cancel` fires.
    pub fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            info!(removed, remaining = cache.len(), "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}
