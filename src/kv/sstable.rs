//! SSTable: an immutable, sorted, Snappy-compressed key-value file.
//!
//! ```text
//! [data block 0] [data block 1] ... [data block N-1] [block index] [bloom filter] [footer]
//! ```
//!
//! Each data block holds up to `ENTRIES_PER_BLOCK` sorted entries,
//! bincode-serialized then Snappy-compressed. The block index records each
//! block's first key, file offset, and compressed size so a lookup can
//! binary-search straight to the right block; the Bloom filter gives a
//! cheap negative answer before touching disk at all.

use super::bloom::BloomFilter;
use super::cache::BlockCache;
use super::memtable::Value;
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAGIC: u32 = 0x5153_4254; // "QSBT"
const VERSION: u32 = 1;
const ENTRIES_PER_BLOCK: usize = 1024;
/// Fixed footer size: magic(4) + version(4) + index_offset(8) + index_size(4)
/// + bloom_offset(8) + bloom_size(4) + num_entries(8).
const FOOTER_SIZE: u64 = 4 + 4 + 8 + 4 + 8 + 4 + 8;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: Vec<u8>,
    data: Vec<u8>,
    deleted: bool,
}

#[derive(Clone)]
struct BlockIndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    size: u32,
}

struct Footer {
    index_offset: u64,
    index_size: u32,
    bloom_offset: u64,
    bloom_size: u32,
    num_entries: u64,
}

/// Builds a new SSTable file from a sorted, deduplicated sequence of
/// entries (tombstones included — they must survive into the file so a
/// later read sees the delete rather than resurrecting an older value from
/// a lower level).
pub struct SSTableBuilder;

impl SSTableBuilder {
    pub fn build(path: &Path, entries: &[(Vec<u8>, Value)]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut index = Vec::new();
        let mut bloom = BloomFilter::new(entries.len().max(1), 10);
        let mut offset = 0u64;

        for chunk in entries.chunks(ENTRIES_PER_BLOCK) {
            let stored: Vec<StoredEntry> = chunk
                .iter()
                .map(|(k, v)| {
                    bloom.insert(k);
                    StoredEntry {
                        key: k.clone(),
                        data: v.data.clone(),
                        deleted: v.deleted,
                    }
                })
                .collect();
            let serialized = bincode::serialize(&stored)?;
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&serialized)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            file.write_all(&compressed)?;
            index.push(BlockIndexEntry {
                first_key: chunk[0].0.clone(),
                offset,
                size: compressed.len() as u32,
            });
            offset += compressed.len() as u64;
        }

        let index_offset = offset;
        let index_bytes = serialize_index(&index)?;
        file.write_all(&index_bytes)?;

        let bloom_offset = index_offset + index_bytes.len() as u64;
        let bloom_bytes = bloom.to_bytes();
        file.write_all(&bloom_bytes)?;

        let footer = Footer {
            index_offset,
            index_size: index_bytes.len() as u32,
            bloom_offset,
            bloom_size: bloom_bytes.len() as u32,
            num_entries: entries.len() as u64,
        };
        write_footer(&mut file, &footer)?;
        file.sync_all()?;
        Ok(())
    }
}

fn serialize_index(index: &[BlockIndexEntry]) -> Result<Vec<u8>> {
    let tuples: Vec<(Vec<u8>, u64, u32)> = index
        .iter()
        .map(|e| (e.first_key.clone(), e.offset, e.size))
        .collect();
    Ok(bincode::serialize(&tuples)?)
}

fn deserialize_index(bytes: &[u8]) -> Result<Vec<BlockIndexEntry>> {
    let tuples: Vec<(Vec<u8>, u64, u32)> = bincode::deserialize(bytes)?;
    Ok(tuples
        .into_iter()
        .map(|(first_key, offset, size)| BlockIndexEntry {
            first_key,
            offset,
            size,
        })
        .collect())
}

fn write_footer(file: &mut File, footer: &Footer) -> Result<()> {
    let mut buf = Vec::with_capacity(FOOTER_SIZE as usize);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&footer.index_offset.to_le_bytes());
    buf.extend_from_slice(&footer.index_size.to_le_bytes());
    buf.extend_from_slice(&footer.bloom_offset.to_le_bytes());
    buf.extend_from_slice(&footer.bloom_size.to_le_bytes());
    buf.extend_from_slice(&footer.num_entries.to_le_bytes());
    file.write_all(&buf)?;
    Ok(())
}

fn read_footer(file: &mut File) -> Result<Footer> {
    let len = file.metadata()?.len();
    if len < FOOTER_SIZE {
        return Err(StoreError::Corruption("sstable smaller than footer".into()));
    }
    file.seek(SeekFrom::Start(len - FOOTER_SIZE))?;
    let mut buf = [0u8; FOOTER_SIZE as usize];
    file.read_exact(&mut buf)?;

    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(StoreError::Corruption("bad sstable magic".into()));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported sstable version {version}"
        )));
    }
    Ok(Footer {
        index_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        index_size: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        bloom_offset: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        bloom_size: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        num_entries: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
    })
}

/// A read-only, already-flushed SSTable.
pub struct SSTable {
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<BlockIndexEntry>,
    bloom: BloomFilter,
    num_entries: u64,
    block_cache: Arc<BlockCache>,
}

impl SSTable {
    pub fn open(path: &Path, block_cache: Arc<BlockCache>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let footer = read_footer(&mut file)?;

        file.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index_buf = vec![0u8; footer.index_size as usize];
        file.read_exact(&mut index_buf)?;
        let index = deserialize_index(&index_buf)?;

        file.seek(SeekFrom::Start(footer.bloom_offset))?;
        let mut bloom_buf = vec![0u8; footer.bloom_size as usize];
        file.read_exact(&mut bloom_buf)?;
        let bloom = BloomFilter::from_bytes(&bloom_buf)
            .ok_or_else(|| StoreError::Corruption("invalid bloom filter".into()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            bloom,
            num_entries: footer.num_entries,
            block_cache,
        })
    }

    pub fn len(&self) -> u64 {
        self.num_entries
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let Some(block) = self.find_block(key) else {
            return Ok(None);
        };
        let entries = self.read_block(block)?;
        Ok(entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.clone()))
    }

    /// All non-tombstone entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .scan_prefix_raw(prefix)?
            .into_iter()
            .filter(|(_, v)| !v.deleted)
            .map(|(k, v)| (k, v.data))
            .collect())
    }

    /// Every entry (tombstones included) whose key starts with `prefix`.
    /// Used when merging across levels, where a tombstone must be able to
    /// shadow a value written to an older SSTable. Starts at the
    /// binary-searched floor block instead of block 0 — see
    /// `floor_block_index` — so a prefix that sorts late in the keyspace
    /// doesn't pay for decompressing every block ahead of it.
    pub fn scan_prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Value)>> {
        let mut out = Vec::new();
        let start = self.floor_block_index(prefix).unwrap_or(0);
        for block_idx in start..self.index.len() {
            // A block can be skipped only if its key range cannot overlap
            // the prefix; since we don't track each block's *last* key
            // cheaply, we conservatively stop once we've passed blocks
            // whose first key already exceeds the prefix's upper bound.
            if self.index[block_idx].first_key.as_slice() > prefix
                && !self.index[block_idx].first_key.starts_with(prefix)
            {
                break;
            }
            let entries = self.read_block(block_idx)?;
            for (k, v) in entries.iter() {
                if k.starts_with(prefix) {
                    out.push((k.clone(), v.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Every entry in the file, tombstones included, in key order. Used by
    /// compaction to merge a run of SSTables into one.
    pub fn all_entries(&self) -> Result<Vec<(Vec<u8>, Value)>> {
        self.scan_prefix_raw(&[])
    }

    /// Lazily iterate every entry (tombstones included) whose key starts
    /// with `prefix`, decompressing one block at a time as the iterator is
    /// driven instead of materializing every matching entry up front like
    /// `scan_prefix_raw` does. Takes `Arc<Self>` rather than `&self` so the
    /// iterator doesn't borrow from (and outlive) a lock guard over the
    /// sstable list — callers hold the `Arc` handed out by `SSTableCache`.
    /// Tombstones are kept (not filtered) because a caller merging this
    /// sstable against older layers needs them to shadow stale values.
    pub fn prefix_iter_raw(self: Arc<Self>, prefix: &[u8]) -> SSTablePrefixIter {
        let next_block = self.floor_block_index(prefix).unwrap_or(0);
        SSTablePrefixIter {
            sst: self,
            prefix: prefix.to_vec(),
            next_block,
            current_block: None,
            cursor: 0,
            done: false,
        }
    }

    /// Lazily iterate non-tombstone entries whose key starts with `prefix`,
    /// the single-table counterpart to `scan_prefix`.
    pub fn prefix_iter(
        self: Arc<Self>,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {
        self.prefix_iter_raw(prefix).filter_map(|item| match item {
            Ok((_, v)) if v.deleted => None,
            Ok((k, v)) => Some(Ok((k, v.data))),
            Err(e) => Some(Err(e)),
        })
    }

    /// Index of the last block whose `first_key` is `<= key`, i.e. the
    /// only block a point lookup for `key` could live in, or the first
    /// block a scan starting at `key`/`prefix` needs to consider. `None`
    /// when `key` sorts before every block's `first_key` — for a point
    /// lookup that means "not present"; for a prefix scan the caller
    /// should fall back to block 0, since an empty or very small prefix
    /// can still match entries in the first block.
    fn floor_block_index(&self, key: &[u8]) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        match self
            .index
            .binary_search_by(|e| e.first_key.as_slice().cmp(key))
        {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    fn find_block(&self, key: &[u8]) -> Option<usize> {
        self.floor_block_index(key)
    }

    /// Decompress and deserialize block `idx`, consulting the shared
    /// `BlockCache` first so a block hot across many SSTable handles (or
    /// repeated scans of the same table) pays the Snappy-decompress and
    /// bincode-deserialize cost once.
    fn read_block(&self, idx: usize) -> Result<Arc<Vec<(Vec<u8>, Value)>>> {
        let cache_key = (self.path.clone(), idx);
        if let Some(cached) = self.block_cache.get(&cache_key) {
            return Ok(cached);
        }

        let entry = &self.index[idx];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut compressed = vec![0u8; entry.size as usize];
        file.read_exact(&mut compressed)?;
        drop(file);

        let serialized = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|e| StoreError::Corruption(format!("sstable block decompress: {e}")))?;
        let stored: Vec<StoredEntry> = bincode::deserialize(&serialized)?;
        let entries: Arc<Vec<(Vec<u8>, Value)>> = Arc::new(
            stored
                .into_iter()
                .map(|e| {
                    (
                        e.key,
                        Value {
                            data: e.data,
                            deleted: e.deleted,
                        },
                    )
                })
                .collect(),
        );
        self.block_cache.put(cache_key, entries.clone());
        Ok(entries)
    }
}

/// Lazy iterator over a single SSTable's entries (tombstones included) for
/// a given prefix, produced by `SSTable::prefix_iter_raw`. Holds one
/// decompressed block at a time; `read_block`'s cache absorbs the cost of
/// touching the same block again if a caller rebuilds the iterator.
pub struct SSTablePrefixIter {
    sst: Arc<SSTable>,
    prefix: Vec<u8>,
    next_block: usize,
    current_block: Option<Arc<Vec<(Vec<u8>, Value)>>>,
    cursor: usize,
    done: bool,
}

impl Iterator for SSTablePrefixIter {
    type Item = Result<(Vec<u8>, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            match &self.current_block {
                Some(block) => {
                    while self.cursor < block.len() {
                        let (k, v) = &block[self.cursor];
                        self.cursor += 1;
                        if !k.starts_with(&self.prefix) {
                            continue;
                        }
                        return Some(Ok((k.clone(), v.clone())));
                    }
                    self.current_block = None;
                }
                None => {
                    if self.next_block >= self.sst.index.len() {
                        self.done = true;
                        return None;
                    }
                    let idx = self.next_block;
                    if self.sst.index[idx].first_key.as_slice() > self.prefix.as_slice()
                        && !self.sst.index[idx].first_key.starts_with(&self.prefix)
                    {
                        self.done = true;
                        return None;
                    }
                    self.next_block += 1;
                    match self.sst.read_block(idx) {
                        Ok(block) => {
                            self.current_block = Some(block);
                            self.cursor = 0;
                        }
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
