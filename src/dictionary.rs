//! String↔uint64 interner. `Dictionary` is the single-instance form;
//! `ShardedDictionary` routes the hot forward-lookup path across N
//! independent LRU shards to cut contention during concurrent ingestion
//! while still handing out ids from one shared `IdAllocator`, so
//! bijectivity holds process-wide regardless of how many shards are
//! configured.

use crate::allocator::IdAllocator;
use crate::error::Result;
use crate::keycodec::{encode_dict_fwd_key, encode_dict_rev_key};
use crate::kv::{KvEngine, WriteOp};
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;

fn decode_id(bytes: &[u8]) -> Option<u64> {
    if bytes.len() != 8 {
        return None;
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(bytes);
    Some(u64::from_be_bytes(b))
}

fn cache_of(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size.max(1)).unwrap()
}

/// A single-instance bidirectional string↔id dictionary.
pub struct Dictionary {
    engine: Arc<KvEngine>,
    allocator: Arc<IdAllocator>,
    fwd: RwLock<LruCache<String, u64>>,
    rev: RwLock<LruCache<u64, String>>,
}

impl Dictionary {
    pub fn new(engine: Arc<KvEngine>, allocator: Arc<IdAllocator>, cache_size: usize) -> Self {
        Self {
            engine,
            allocator,
            fwd: RwLock::new(LruCache::new(cache_of(cache_size))),
            rev: RwLock::new(LruCache::new(cache_of(cache_size))),
        }
    }

    /// Resolve an existing id without creating one. `Ok(None)` is the
    /// ordinary "not found" outcome, not an error.
    pub fn get_id(&self, s: &str) -> Result<Option<u64>> {
        if let Some(id) = self.fwd.write().get(s).copied() {
            return Ok(Some(id));
        }
        match self.engine.get(&encode_dict_fwd_key(s))? {
            Some(bytes) => {
                let id = decode_id(&bytes).unwrap_or(0);
                self.fwd.write().put(s.to_string(), id);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn get_or_create_id(&self, s: &str) -> Result<u64> {
        if let Some(id) = self.get_id(s)? {
            return Ok(id);
        }
        let id = self.allocator.allocate_one()?;
        self.persist_pair(s, id)?;
        Ok(id)
    }

    pub fn get_string(&self, id: u64) -> Result<Option<String>> {
        if let Some(s) = self.rev.write().get(&id).cloned() {
            return Ok(Some(s));
        }
        match self.engine.get(&encode_dict_rev_key(id))? {
            Some(bytes) => {
                let s = String::from_utf8_lossy(&bytes).into_owned();
                self.rev.write().put(id, s.clone());
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    /// Batch resolve-or-create, the primary fast path during ingestion:
    /// cache hits resolve immediately, misses are looked up in the KV
    /// engine, and anything still missing is allocated contiguously in
    /// one batch and persisted in one write.
    pub fn get_ids(&self, strings: &[String]) -> Result<Vec<u64>> {
        let mut resolved = vec![0u64; strings.len()];
        let mut missing = Vec::new();

        for (i, s) in strings.iter().enumerate() {
            if let Some(id) = self.get_id(s)? {
                resolved[i] = id;
            } else {
                missing.push(i);
            }
        }

        if !missing.is_empty() {
            let start = self.allocator.allocate_batch(missing.len() as u64)?;
            let mut ops = Vec::with_capacity(missing.len() * 2);
            for (k, &i) in missing.iter().enumerate() {
                let id = start + k as u64;
                resolved[i] = id;
                ops.push(WriteOp::Put {
                    key: encode_dict_fwd_key(&strings[i]),
                    value: id.to_be_bytes().to_vec(),
                });
                ops.push(WriteOp::Put {
                    key: encode_dict_rev_key(id),
                    value: strings[i].clone().into_bytes(),
                });
            }
            self.engine.write_batch(ops)?;
            for &i in &missing {
                let id = resolved[i];
                self.fwd.write().put(strings[i].clone(), id);
                self.rev.write().put(id, strings[i].clone());
            }
        }

        Ok(resolved)
    }

    fn persist_pair(&self, s: &str, id: u64) -> Result<()> {
        self.engine.write_batch(vec![
            WriteOp::Put {
                key: encode_dict_fwd_key(s),
                value: id.to_be_bytes().to_vec(),
            },
            WriteOp::Put {
                key: encode_dict_rev_key(id),
                value: s.as_bytes().to_vec(),
            },
        ])?;
        self.fwd.write().put(s.to_string(), id);
        self.rev.write().put(id, s.to_string());
        Ok(())
    }
}

/// Fowler–Noll–Vo 1a, used only for shard routing (never for persisted
/// data) — distinct from the `ahash` used for in-process maps elsewhere.
fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Contention-optimized dictionary: forward lookups are routed across N
/// independent LRU shards by `fnv1a(key) mod N`; every shard shares one
/// `IdAllocator` so the overall mapping stays bijective regardless of
/// shard count. Reverse lookups and on-disk layout are identical to the
/// single-instance `Dictionary` — sharding only changes which in-memory
/// cache a forward lookup contends on.
pub struct ShardedDictionary {
    engine: Arc<KvEngine>,
    allocator: Arc<IdAllocator>,
    fwd_shards: Vec<RwLock<LruCache<String, u64>>>,
    rev: RwLock<LruCache<u64, String>>,
    num_shards: usize,
}

impl ShardedDictionary {
    pub fn new(
        engine: Arc<KvEngine>,
        allocator: Arc<IdAllocator>,
        num_shards: usize,
        cache_size: usize,
    ) -> Self {
        assert!(num_shards.is_power_of_two() && num_shards > 0);
        let per_shard_cache = (cache_size / num_shards).max(1);
        let fwd_shards = (0..num_shards)
            .map(|_| RwLock::new(LruCache::new(cache_of(per_shard_cache))))
            .collect();
        Self {
            engine,
            allocator,
            fwd_shards,
            rev: RwLock::new(LruCache::new(cache_of(cache_size))),
            num_shards,
        }
    }

    fn shard_for(&self, s: &str) -> usize {
        (fnv1a(s) as usize) & (self.num_shards - 1)
    }

    pub fn get_id(&self, s: &str) -> Result<Option<u64>> {
        let shard = &self.fwd_shards[self.shard_for(s)];
        if let Some(id) = shard.write().get(s).copied() {
            return Ok(Some(id));
        }
        match self.engine.get(&encode_dict_fwd_key(s))? {
            Some(bytes) => {
                let id = decode_id(&bytes).unwrap_or(0);
                shard.write().put(s.to_string(), id);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn get_or_create_id(&self, s: &str) -> Result<u64> {
        if let Some(id) = self.get_id(s)? {
            return Ok(id);
        }
        let id = self.allocator.allocate_one()?;
        self.engine.write_batch(vec![
            WriteOp::Put {
                key: encode_dict_fwd_key(s),
                value: id.to_be_bytes().to_vec(),
            },
            WriteOp::Put {
                key: encode_dict_rev_key(id),
                value: s.as_bytes().to_vec(),
            },
        ])?;
        self.fwd_shards[self.shard_for(s)]
            .write()
            .put(s.to_string(), id);
        self.rev.write().put(id, s.to_string());
        Ok(id)
    }

    pub fn get_string(&self, id: u64) -> Result<Option<String>> {
        if let Some(s) = self.rev.write().get(&id).cloned() {
            return Ok(Some(s));
        }
        match self.engine.get(&encode_dict_rev_key(id))? {
            Some(bytes) => {
                let s = String::from_utf8_lossy(&bytes).into_owned();
                self.rev.write().put(id, s.clone());
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    pub fn get_ids(&self, strings: &[String]) -> Result<Vec<u64>> {
        let mut resolved = vec![0u64; strings.len()];
        let mut missing = Vec::new();
        for (i, s) in strings.iter().enumerate() {
            if let Some(id) = self.get_id(s)? {
                resolved[i] = id;
            } else {
                missing.push(i);
            }
        }
        if !missing.is_empty() {
            let start = self.allocator.allocate_batch(missing.len() as u64)?;
            let mut ops = Vec::with_capacity(missing.len() * 2);
            for (k, &i) in missing.iter().enumerate() {
                let id = start + k as u64;
                resolved[i] = id;
                ops.push(WriteOp::Put {
                    key: encode_dict_fwd_key(&strings[i]),
                    value: id.to_be_bytes().to_vec(),
                });
                ops.push(WriteOp::Put {
                    key: encode_dict_rev_key(id),
                    value: strings[i].clone().into_bytes(),
                });
            }
            self.engine.write_batch(ops)?;
            for &i in &missing {
                let id = resolved[i];
                self.fwd_shards[self.shard_for(&strings[i])]
                    .write()
                    .put(strings[i].clone(), id);
                self.rev.write().put(id, strings[i].clone());
            }
        }
        Ok(resolved)
    }
}

/// Dispatches to either dictionary flavor behind one set of method names,
/// so the store, content, and vector registry modules don't need to be
/// generic over which one backs a given `Store` — they hold an
/// `Arc<AnyDictionary>` and call through it exactly as they would a plain
/// `Dictionary`. Which variant a `Store` picks is driven entirely by
/// `StoreConfig::num_dict_shards`.
pub enum AnyDictionary {
    Single(Dictionary),
    Sharded(ShardedDictionary),
}

impl AnyDictionary {
    pub fn get_id(&self, s: &str) -> Result<Option<u64>> {
        match self {
            AnyDictionary::Single(d) => d.get_id(s),
            AnyDictionary::Sharded(d) => d.get_id(s),
        }
    }

    pub fn get_or_create_id(&self, s: &str) -> Result<u64> {
        match self {
            AnyDictionary::Single(d) => d.get_or_create_id(s),
            AnyDictionary::Sharded(d) => d.get_or_create_id(s),
        }
    }

    pub fn get_string(&self, id: u64) -> Result<Option<String>> {
        match self {
            AnyDictionary::Single(d) => d.get_string(id),
            AnyDictionary::Sharded(d) => d.get_string(id),
        }
    }

    pub fn get_ids(&self, strings: &[String]) -> Result<Vec<u64>> {
        match self {
            AnyDictionary::Single(d) => d.get_ids(strings),
            AnyDictionary::Sharded(d) => d.get_ids(strings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn new_engine() -> Arc<KvEngine> {
        Arc::new(KvEngine::open(None, &StoreConfig::default()).unwrap())
    }

    #[test]
    fn bijection_holds_for_single_instance() {
        let engine = new_engine();
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 100).unwrap());
        let dict = Dictionary::new(engine, alloc, 100);
        let id = dict.get_or_create_id("a.go:F").unwrap();
        assert_eq!(dict.get_string(id).unwrap().as_deref(), Some("a.go:F"));
        assert_eq!(dict.get_or_create_id("a.go:F").unwrap(), id);
    }

    #[test]
    fn unknown_string_is_not_found_not_error() {
        let engine = new_engine();
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 100).unwrap());
        let dict = Dictionary::new(engine, alloc, 100);
        assert_eq!(dict.get_id("nonexistent-string").unwrap(), None);
    }

    #[test]
    fn get_ids_batch_allocates_contiguously_for_new_strings() {
        let engine = new_engine();
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 100).unwrap());
        let dict = Dictionary::new(engine, alloc, 100);
        let strings = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let ids = dict.get_ids(&strings).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids, vec![ids[0], ids[0] + 1, ids[0] + 2], "contiguous range");
        for (s, id) in strings.iter().zip(ids.iter()) {
            assert_eq!(dict.get_string(*id).unwrap().as_deref(), Some(s.as_str()));
        }
    }

    #[test]
    fn sharded_dictionary_preserves_bijection() {
        let engine = new_engine();
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 100).unwrap());
        let dict = ShardedDictionary::new(engine, alloc, 4, 100);
        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(dict.get_or_create_id(&format!("sym-{i}")).unwrap());
        }
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(
                dict.get_string(*id).unwrap().as_deref(),
                Some(format!("sym-{i}").as_str())
            );
        }
    }

    #[test]
    fn any_dictionary_dispatches_to_either_variant() {
        let engine = new_engine();
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 100).unwrap());
        let single = AnyDictionary::Single(Dictionary::new(engine.clone(), alloc.clone(), 100));
        let id = single.get_or_create_id("x").unwrap();
        assert_eq!(single.get_string(id).unwrap().as_deref(), Some("x"));

        let sharded = AnyDictionary::Sharded(ShardedDictionary::new(engine, alloc, 4, 100));
        let id2 = sharded.get_or_create_id("y").unwrap();
        assert_eq!(sharded.get_string(id2).unwrap().as_deref(), Some("y"));
        assert_ne!(id, id2);
    }
}
