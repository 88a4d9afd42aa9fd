//! Record handle cache
//!
//! Reads resolve an id to its file and length through this cache before
//! touching the layout, so hot items skip the path mapping and `stat`.
//! The capacity is a fixed entry count; eviction is least recently used,
//! tracked with a logical clock.

use filestore_common::{DataType, FsId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a committed item lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub path: PathBuf,
    pub len: u64,
}

type CacheKey = (DataType, FsId);

struct CacheEntry {
    handle: RecordHandle,
    /// Last access time for LRU eviction
    last_access: AtomicU64,
}

impl CacheEntry {
    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Fixed-size LRU cache of record handles
pub struct RecordCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl RecordCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity.min(1 << 16))),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, data_type: DataType, id: &FsId) -> Option<RecordHandle> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&(data_type, id.clone())) {
            entry.touch(self.tick());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.handle.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn insert(&self, data_type: DataType, id: FsId, handle: RecordHandle) {
        let clock = self.tick();
        let key = (data_type, id);
        let mut entries = self.entries.write();
        if !entries.contains_key(&key) {
            while entries.len() >= self.capacity {
                let Some(victim) = Self::find_lru_entry(&entries) else {
                    break;
                };
                entries.remove(&victim);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                handle,
                last_access: AtomicU64::new(clock),
            },
        );
    }

    pub fn invalidate(&self, data_type: DataType, id: &FsId) -> Option<RecordHandle> {
        self.entries
            .write()
            .remove(&(data_type, id.clone()))
            .map(|entry| entry.handle)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn find_lru_entry(entries: &HashMap<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone())
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
