//! In-memory write buffer (ordered byte-key map with tombstones).

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A stored value, or a tombstone recording a delete.
#[derive(Debug, Clone)]
pub struct Value {
    pub data: Vec<u8>,
    pub deleted: bool,
}

impl Value {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            deleted: false,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            data: Vec::new(),
            deleted: true,
        }
    }
}

/// Sorted write buffer. Holds everything written since the last flush.
pub struct MemTable {
    data: RwLock<BTreeMap<Vec<u8>, Value>>,
    size: AtomicUsize,
    max_size: usize,
}

impl MemTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            max_size,
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Value) {
        let entry_size = key.len() + value.data.len();
        let mut data = self.data.write();
        if let Some(old) = data.get(&key) {
            let old_size = key.len() + old.data.len();
            self.size.fetch_sub(old_size, Ordering::Relaxed);
        }
        data.insert(key, value);
        self.size.fetch_add(entry_size, Ordering::Relaxed);
    }

    pub fn delete(&self, key: Vec<u8>) {
        self.put(key, Value::tombstone());
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn should_flush(&self) -> bool {
        self.size.load(Ordering::Relaxed) >= self.max_size
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every entry in key order, tombstones included — callers
    /// that need to drop tombstones (ordinary scans) filter them out;
    /// flush needs to see them so deletes survive into the SSTable.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Value)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Entries whose key starts with `prefix`, tombstones excluded.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.scan_prefix_raw(prefix)
            .into_iter()
            .filter(|(_, v)| !v.deleted)
            .map(|(k, v)| (k, v.data))
            .collect()
    }

    /// Entries whose key starts with `prefix`, tombstones included — needed
    /// when merging this memtable's view against older layers, where a
    /// tombstone here must shadow a value in an SSTable underneath.
    pub fn scan_prefix_raw(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Value)> {
        let data = self.data.read();
        let end = prefix_upper_bound(prefix);
        let range = match &end {
            Some(end) => {
                data.range((Bound::Included(prefix.to_vec()), Bound::Excluded(end.clone())))
            }
            None => data.range(prefix.to_vec()..),
        };
        range.map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Smallest byte string greater than every string with the given prefix,
/// or `None` if the prefix is all-0xFF (in which case the range is
/// unbounded above).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] != 0xFF {
            end[i] += 1;
            end.truncate(i + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let mt = MemTable::new(1024);
        mt.put(b"a".to_vec(), Value::new(b"1".to_vec()));
        assert_eq!(mt.get(b"a").unwrap().data, b"1");
    }

    #[test]
    fn delete_sets_tombstone() {
        let mt = MemTable::new(1024);
        mt.put(b"a".to_vec(), Value::new(b"1".to_vec()));
        mt.delete(b"a".to_vec());
        assert!(mt.get(b"a").unwrap().deleted);
    }

    #[test]
    fn should_flush_past_threshold() {
        let mt = MemTable::new(10);
        assert!(!mt.should_flush());
        mt.put(b"aaaaaaaaaaaaaaaaaaaa".to_vec(), Value::new(vec![0; 10]));
        assert!(mt.should_flush());
    }

    #[test]
    fn scan_prefix_excludes_tombstones_and_other_prefixes() {
        let mt = MemTable::new(1024);
        mt.put(vec![1, 0, 0], Value::new(b"a".to_vec()));
        mt.put(vec![1, 0, 1], Value::new(b"b".to_vec()));
        mt.put(vec![1, 0, 2], Value::new(b"c".to_vec()));
        mt.delete(vec![1, 0, 1]);
        mt.put(vec![2, 0, 0], Value::new(b"d".to_vec()));

        let results = mt.scan_prefix(&[1, 0]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, vec![1, 0, 0]);
        assert_eq!(results[1].0, vec![1, 0, 2]);
    }

    #[test]
    fn prefix_upper_bound_handles_ff_suffix() {
        assert_eq!(prefix_upper_bound(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
    }
}
