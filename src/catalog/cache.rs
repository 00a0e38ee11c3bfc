//! Catalog lookup cache
//!
//! Only catalog records are cached, never documents. The cache is owned by
//! one [`MetadataService`](super::MetadataService) and invalidated
//! synchronously on every catalog mutation it performs. There is no
//! cross-process coherence: a mutation made by another process stays
//! invisible here for at most the configured TTL.
//!
//! Engines that let readers see uncommitted writes can hand a lookup a
//! record whose transaction later aborts. Such an entry lives until the
//! aborting operation invalidates it, which it does right after the abort.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::CatalogRecord;
use crate::storage::DocumentId;

/// Cache abstraction injected into the metadata service.
pub trait CatalogCache: Send + Sync {
    fn get(&self, id: &DocumentId) -> Option<CatalogRecord>;

    /// Id of a database known to exist under `name`. Absence is never cached.
    fn id_for_name(&self, name: &str) -> Option<DocumentId>;

    fn put(&self, record: &CatalogRecord);

    fn invalidate(&self, id: &DocumentId, name: &str);

    fn clear(&self);

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}

/// Disabled cache: every lookup misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CatalogCache for NoCache {
    fn get(&self, _id: &DocumentId) -> Option<CatalogRecord> {
        None
    }

    fn id_for_name(&self, _name: &str) -> Option<DocumentId> {
        None
    }

    fn put(&self, _record: &CatalogRecord) {}

    fn invalidate(&self, _id: &DocumentId, _name: &str) {}

    fn clear(&self) {}
}

struct Entries {
    by_id: LruCache<DocumentId, (CatalogRecord, Instant)>,
    by_name: LruCache<String, (DocumentId, Instant)>,
}

/// Bounded LRU cache with a time-to-live per entry.
pub struct LruCatalogCache {
    entries: Mutex<Entries>,
    ttl: Duration,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl LruCatalogCache {
    /// A capacity of zero is treated as one; use [`NoCache`] to disable caching.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(Entries {
                by_id: LruCache::new(capacity),
                by_name: LruCache::new(capacity),
            }),
            ttl,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    fn fresh(&self, stored_at: Instant) -> bool {
        stored_at.elapsed() < self.ttl
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.hit_count } else { &self.miss_count };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for LruCatalogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCatalogCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CatalogCache for LruCatalogCache {
    fn get(&self, id: &DocumentId) -> Option<CatalogRecord> {
        let mut entries = self.entries.lock();
        let found = match entries.by_id.get(id) {
            Some((record, stored_at)) if self.fresh(*stored_at) => Some(record.clone()),
            Some(_) => {
                entries.by_id.pop(id);
                None
            }
            None => None,
        };
        self.record_lookup(found.is_some());
        found
    }

    fn id_for_name(&self, name: &str) -> Option<DocumentId> {
        let mut entries = self.entries.lock();
        let found = match entries.by_name.get(name) {
            Some((id, stored_at)) if self.fresh(*stored_at) => Some(*id),
            Some(_) => {
                entries.by_name.pop(name);
                None
            }
            None => None,
        };
        self.record_lookup(found.is_some());
        found
    }

    fn put(&self, record: &CatalogRecord) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.by_id.put(record.id, (record.clone(), now));
        entries
            .by_name
            .put(record.database_name.clone(), (record.id, now));
    }

    fn invalidate(&self, id: &DocumentId, name: &str) {
        let mut entries = self.entries.lock();
        entries.by_id.pop(id);
        entries.by_name.pop(name);
    }

    fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.by_id.clear();
        entries.by_name.clear();
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        let entries = self.entries.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: entries.by_id.len(),
            capacity: entries.by_id.cap().get(),
        }
    }
}
