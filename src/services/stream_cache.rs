//! Resolved stream cache
//!
//! Wraps channel resolution with three guarantees:
//! - at most one resolution per channel id is in flight; concurrent callers
//!   await the same outcome, success or failure
//! - an entry is never served after `min(ttl, upstream expiry)`
//! - once `capacity` is reached the least recently used entry is evicted
//!
//! Failures are never cached.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::{ResolveError, ResolveResult};
use crate::models::StreamDescriptor;

#[derive(Debug, Clone)]
struct CacheEntry {
    descriptor: StreamDescriptor,
    inserted_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counters exposed on the health surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub resolutions: u64,
}

pub struct StreamCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    flights: async_singleflight::Group<String, StreamDescriptor, ResolveError>,
    ttl: Duration,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
    resolutions: AtomicU64,
}

impl StreamCache {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            flights: async_singleflight::Group::new(),
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            resolutions: AtomicU64::new(0),
        }
    }

    /// Cached descriptor for the channel, or the outcome of `resolve`.
    ///
    /// Concurrent calls for the same channel share one invocation of a single
    /// caller's `resolve`; every caller observes the same result.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        channel_id: &str,
        resolve: F,
    ) -> ResolveResult<StreamDescriptor>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ResolveResult<StreamDescriptor>> + Send,
    {
        if let Some(descriptor) = self.get(channel_id).await {
            return Ok(descriptor);
        }

        let key = channel_id.to_string();
        let flight = async {
            // A flight that finished while we were queued may have filled the entry
            if let Some(descriptor) = self.lookup(channel_id, false).await {
                return Ok(descriptor);
            }
            self.resolutions.fetch_add(1, Ordering::Relaxed);
            let descriptor = resolve().await?;
            self.insert(descriptor.clone()).await;
            Ok(descriptor)
        };

        self.flights
            .work(&key, flight)
            .await
            .map_err(|e| {
                e.unwrap_or_else(|| ResolveError::Abandoned {
                    channel_id: channel_id.to_string(),
                })
            })
    }

    /// Fresh entry for the channel; expired entries are dropped on read
    pub async fn get(&self, channel_id: &str) -> Option<StreamDescriptor> {
        self.lookup(channel_id, true).await
    }

    async fn lookup(&self, channel_id: &str, count: bool) -> Option<StreamDescriptor> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let fresh = match entries.get(channel_id) {
            Some(entry) if entry.is_fresh(now) => Some(entry.descriptor.clone()),
            Some(entry) => {
                debug!(
                    "Cache entry for channel {} expired after {:?}",
                    channel_id,
                    now.duration_since(entry.inserted_at)
                );
                entries.pop(channel_id);
                self.expired.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };

        if count {
            let counter = if fresh.is_some() {
                &self.hits
            } else {
                &self.misses
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Store a descriptor. Returns false when upstream expiry has already
    /// passed, in which case nothing is stored.
    pub async fn insert(&self, descriptor: StreamDescriptor) -> bool {
        let lifetime = match descriptor.expires_at {
            Some(expires_at) => match (expires_at - Utc::now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining.min(self.ttl),
                _ => {
                    debug!(
                        "Not caching channel {}: upstream URL already expired",
                        descriptor.channel_id
                    );
                    return false;
                }
            },
            None => self.ttl,
        };

        let now = Instant::now();
        let key = descriptor.channel_id.clone();
        let entry = CacheEntry {
            descriptor,
            inserted_at: now,
            expires_at: now + lifetime,
        };

        let mut entries = self.entries.lock().await;
        match entries.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted least recently used channel {}", evicted);
            }
            _ => {}
        }
        true
    }

    pub async fn invalidate(&self, channel_id: &str) -> bool {
        let removed = self.entries.lock().await.pop(channel_id).is_some();
        if removed {
            info!("Invalidated cached stream for channel {}", channel_id);
        }
        removed
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        info!("Cleared {} cached streams", count);
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len().await,
            capacity: self.capacity.get(),
            ttl_seconds: self.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
        }
    }
}
