//! Bounded caches in front of the SSTable layer: decompressed data blocks,
//! block indexes, and open file handles. Sizes come from `StoreConfig`.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use super::memtable::Value;
use super::sstable::SSTable;

/// LRU of decompressed, deserialized SSTable blocks, keyed by (file path,
/// block index) — shared across every open `SSTable` so a hot block read
/// once by one reader skips decompression for every later reader. Sized
/// in entries rather than bytes for simplicity — callers pick a count
/// proportional to `StoreConfig::block_cache_size`.
pub struct BlockCache {
    cache: Mutex<LruCache<(PathBuf, usize), Arc<Vec<(Vec<u8>, Value)>>>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }

    pub fn get(&self, key: &(PathBuf, usize)) -> Option<Arc<Vec<(Vec<u8>, Value)>>> {
        self.cache.lock().get(key).cloned()
    }

    pub fn put(&self, key: (PathBuf, usize), value: Arc<Vec<(Vec<u8>, Value)>>) {
        self.cache.lock().put(key, value);
    }
}

/// LRU of open SSTable handles (parsed footer/index/bloom), avoiding a
/// reopen-and-reparse on every lookup. Every `SSTable` it opens shares one
/// `BlockCache`, so the effective cache survives eviction-and-reopen of
/// the handle itself.
pub struct SSTableCache {
    cache: Mutex<LruCache<PathBuf, Arc<SSTable>>>,
    block_cache: Arc<BlockCache>,
}

impl SSTableCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_block_cache_capacity(capacity, capacity * 16)
    }

    pub fn with_block_cache_capacity(capacity: usize, block_cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
            block_cache: Arc::new(BlockCache::new(block_cache_capacity)),
        }
    }

    pub fn get_or_open(&self, path: &PathBuf) -> crate::error::Result<Arc<SSTable>> {
        let mut cache = self.cache.lock();
        if let Some(sst) = cache.get(path) {
            return Ok(sst.clone());
        }
        let sst = Arc::new(SSTable::open(path, self.block_cache.clone())?);
        cache.put(path.clone(), sst.clone());
        Ok(sst)
    }

    pub fn invalidate(&self, path: &PathBuf) {
        self.cache.lock().pop(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_cache_evicts_lru() {
        let cache = BlockCache::new(1);
        let k1 = (PathBuf::from("a"), 0);
        let k2 = (PathBuf::from("b"), 0);
        cache.put(k1.clone(), Arc::new(vec![]));
        cache.put(k2.clone(), Arc::new(vec![]));
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
    }
}
