//! Triple/quad store: fact ingestion, SPO/OPS/PSO index maintenance, the
//! scan planner, deletion by subject, and the persisted fact counter.
//!
//! This module maintains all three indices unconditionally on every write
//! — the distilled design's Open Question (a) about whether OPS/PSO are
//! always kept in lockstep with SPO is resolved in favor of "yes, always";
//! see DESIGN.md. SPOG/POSG/GSPO layouts exist in the key codec but are not
//! index-accelerated here: a bound graph component is applied as a filter
//! over the SPO/PSO/OPS scan result, documented as a deliberately deferred
//! quad index rather than a missing feature.

use crate::cancel::CancellationToken;
use crate::dictionary::AnyDictionary;
use crate::error::{Result, StoreError};
use crate::keycodec::{
    decode_fact_metadata, decode_ops, decode_pso, decode_spo, encode_fact_count_key,
    encode_fact_metadata, encode_ops, encode_ops_prefix, encode_pso, encode_pso_prefix,
    encode_spo, encode_spo_prefix, TRIPLE_KEY_SIZE,
};
use crate::kv::{KvEngine, PrefixScan, WriteOp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_GRAPH: &str = "default";
pub const METADATA_GRAPH: &str = "metadata";
pub const VIRTUAL_GRAPH: &str = "virtual";

/// A literal object value, canonicalized to its string form before
/// interning. The tag is kept alongside so callers that need the original
/// type back don't have to re-parse it.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    Id(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ObjectValue {
    /// Canonical string form interned by the dictionary: integers as
    /// decimal ASCII, floats via `f64::to_string`, booleans as
    /// `"true"`/`"false"`.
    pub fn canonical(&self) -> String {
        match self {
            ObjectValue::Id(s) => s.clone(),
            ObjectValue::Int(i) => i.to_string(),
            ObjectValue::Float(f) => f.to_string(),
            ObjectValue::Bool(b) => b.to_string(),
        }
    }
}

/// Optional per-fact metadata: `weight` defaults to 1.0, `source` to "".
#[derive(Debug, Clone, PartialEq)]
pub struct FactMetadata {
    pub weight: f64,
    pub source: String,
}

impl Default for FactMetadata {
    fn default() -> Self {
        Self {
            weight: 1.0,
            source: String::new(),
        }
    }
}

/// One `⟨Subject, Predicate, Object, Graph⟩` fact to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub subject: String,
    pub predicate: String,
    pub object: ObjectValue,
    pub graph: String,
    pub metadata: Option<FactMetadata>,
}

impl Fact {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: ObjectValue) -> Self {
        Self::with_graph(subject, predicate, object, "")
    }

    pub fn with_graph(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: ObjectValue,
        graph: impl Into<String>,
    ) -> Self {
        let graph = graph.into();
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
            graph: if graph.is_empty() {
                DEFAULT_GRAPH.to_string()
            } else {
                graph
            },
            metadata: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(StoreError::InvalidArgument("fact subject is empty".into()));
        }
        if self.predicate.is_empty() {
            return Err(StoreError::InvalidArgument("fact predicate is empty".into()));
        }
        Ok(())
    }
}

/// A decoded fact as yielded by a scan. Graph is always the caller's
/// bound graph filter when one was given, else `"default"` — the store
/// has no index over the graph component (see module docs), so this is a
/// best-effort label on facts read back through the SPO/OPS/PSO scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFact {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub graph: String,
}

/// One item of a lazy scan: a decoded fact or cooperative cancellation.
/// Yielded as `Result<ScanItem>` so an underlying engine error surfaces to
/// the caller instead of silently truncating the scan; a malformed or
/// foreign key within the bound prefix is skipped internally rather than
/// treated as an error, since other writers may share the keyspace.
pub enum ScanItem {
    Fact(ScannedFact),
    Cancelled,
}

/// Lazy scan cursor returned by `TripleStore::scan`. Wraps the underlying
/// `PrefixScan` k-way merge: each `next()` call decodes and filters at most
/// one key, so a caller that stops early (`.next()` once, `.take(n)`,
/// breaking out of a `for` loop) skips the rest of the bound-prefix walk
/// instead of paying for it up front. Owns its `Arc<AnyDictionary>` and
/// `CancellationToken` clones rather than borrowing `&TripleStore`, the
/// same ownership shape `SSTablePrefixIter` uses to avoid outliving a lock
/// guard.
pub struct ScanIter {
    inner: PrefixScan,
    dict: Arc<AnyDictionary>,
    s: Option<u64>,
    p: Option<u64>,
    o: Option<u64>,
    graph: String,
    cancel: CancellationToken,
    stopped: bool,
}

impl Iterator for ScanIter {
    type Item = Result<ScanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stopped {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.stopped = true;
                return Some(Ok(ScanItem::Cancelled));
            }
            let (key, _value) = match self.inner.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(Err(e)),
            };
            if key.len() != TRIPLE_KEY_SIZE {
                continue; // corrupt/foreign entry, skip and keep scanning
            }
            let Some(ids) = decode_triple_any(&key) else {
                continue;
            };
            if let Some(s) = self.s {
                if ids.s != s {
                    continue;
                }
            }
            if let Some(p) = self.p {
                if ids.p != p {
                    continue;
                }
            }
            if let Some(o) = self.o {
                if ids.o != o {
                    continue;
                }
            }
            let subj = match self.dict.get_string(ids.s) {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            let pred = match self.dict.get_string(ids.p) {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            let obj = match self.dict.get_string(ids.o) {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            return Some(Ok(ScanItem::Fact(ScannedFact {
                subject: subj,
                predicate: pred,
                object: obj,
                graph: self.graph.clone(),
            })));
        }
    }
}

pub struct TripleStore {
    engine: Arc<KvEngine>,
    dict: Arc<AnyDictionary>,
    count: AtomicU64,
}

impl TripleStore {
    pub fn open(engine: Arc<KvEngine>, dict: Arc<AnyDictionary>) -> Result<Self> {
        let count = match engine.get(&encode_fact_count_key())? {
            Some(bytes) if bytes.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes);
                u64::from_be_bytes(b)
            }
            _ => 0,
        };
        Ok(Self {
            engine,
            dict,
            count: AtomicU64::new(count),
        })
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn add_fact(&self, fact: Fact) -> Result<()> {
        self.add_fact_batch(vec![fact])
    }

    /// Combine all dictionary lookups into one `get_ids` call and all
    /// index writes into one atomic KV batch. On success the in-memory
    /// counter advances by the number of facts written; on failure no
    /// in-memory state changes.
    pub fn add_fact_batch(&self, facts: Vec<Fact>) -> Result<()> {
        if facts.is_empty() {
            return Ok(());
        }
        for f in &facts {
            f.validate()?;
        }

        let mut strings = Vec::with_capacity(facts.len() * 3);
        for f in &facts {
            strings.push(f.subject.clone());
            strings.push(f.predicate.clone());
            strings.push(f.object.canonical());
        }
        let ids = self.dict.get_ids(&strings)?;

        let mut ops = Vec::with_capacity(facts.len() * 3);
        for (i, f) in facts.iter().enumerate() {
            let s = ids[i * 3];
            let p = ids[i * 3 + 1];
            let o = ids[i * 3 + 2];
            let value = match &f.metadata {
                Some(m) => encode_fact_metadata(m.weight, &m.source),
                None => Vec::new(),
            };
            ops.push(WriteOp::Put {
                key: encode_spo(s, p, o),
                value: value.clone(),
            });
            ops.push(WriteOp::Put {
                key: encode_ops(o, p, s),
                value: value.clone(),
            });
            ops.push(WriteOp::Put {
                key: encode_pso(p, s, o),
                value,
            });
        }
        self.engine.write_batch(ops)?;
        self.count.fetch_add(facts.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Delete every fact with the given subject from all three indices.
    /// A subject that was never interned, or owns no facts, is not an
    /// error.
    pub fn delete_facts_by_subject(&self, subject: &str) -> Result<u64> {
        let Some(s) = self.dict.get_id(subject)? else {
            return Ok(0);
        };
        let prefix = encode_spo_prefix(Some(s), None);
        let matches = self
            .engine
            .scan_prefix(&prefix)?
            .collect::<Result<Vec<_>>>()?;
        if matches.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(matches.len() * 3);
        for (key, _) in &matches {
            let Some(ids) = decode_spo(key) else { continue };
            ops.push(WriteOp::Delete {
                key: encode_spo(ids.s, ids.p, ids.o),
            });
            ops.push(WriteOp::Delete {
                key: encode_ops(ids.o, ids.p, ids.s),
            });
            ops.push(WriteOp::Delete {
                key: encode_pso(ids.p, ids.s, ids.o),
            });
        }
        let deleted = matches.len() as u64;
        self.engine.write_batch(ops)?;
        self.count.fetch_sub(deleted, Ordering::AcqRel);
        Ok(deleted)
    }

    /// Recompute the fact counter from a cold key-only scan of the SPO
    /// prefix, counting only entries with the expected key length. Used
    /// after a simulated crash, or on demand.
    pub fn recalculate_stats(&self) -> Result<u64> {
        let mut n = 0u64;
        for entry in self.engine.scan_prefix(&encode_spo_prefix(None, None))? {
            let (key, _) = entry?;
            if key.len() == TRIPLE_KEY_SIZE {
                n += 1;
            }
        }
        self.count.store(n, Ordering::Release);
        Ok(n)
    }

    /// Persist the in-memory counter. Called on clean close and whenever
    /// `recalculate_stats` runs.
    pub fn save_stats(&self) -> Result<()> {
        self.engine.put(
            encode_fact_count_key(),
            self.count.load(Ordering::Acquire).to_be_bytes().to_vec(),
        )
    }

    /// Scan planner: resolves bound strings to ids, picks the narrowest
    /// available index for the bound subset of (s, p, o), and returns a
    /// lazy cursor over every matching fact. Empty string means
    /// "wildcard". A bound value that was never interned yields an
    /// immediately-exhausted cursor, not an error — the requested fact
    /// cannot exist. The cursor itself does no I/O until `next()` is
    /// called, so a caller that only wants the first match (or none at
    /// all) never pays for more of the bound-prefix walk than it asked for.
    pub fn scan(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        graph: &str,
        cancel: &CancellationToken,
    ) -> Result<ScanIter> {
        let graph = if graph.is_empty() {
            DEFAULT_GRAPH.to_string()
        } else {
            graph.to_string()
        };

        let s = resolve_optional(&self.dict, subject)?;
        let p = resolve_optional(&self.dict, predicate)?;
        let o = resolve_optional(&self.dict, object)?;
        if unresolved(subject, s) || unresolved(predicate, p) || unresolved(object, o) {
            return Ok(ScanIter {
                inner: PrefixScan::new(Vec::new()),
                dict: self.dict.clone(),
                s,
                p,
                o,
                graph,
                cancel: cancel.clone(),
                stopped: false,
            });
        }

        let inner: PrefixScan = if let Some(s) = s {
            self.engine.scan_prefix(&encode_spo_prefix(Some(s), p))?
        } else if let Some(o) = o {
            self.engine.scan_prefix(&encode_ops_prefix(Some(o), p))?
        } else if let Some(p) = p {
            self.engine.scan_prefix(&encode_pso_prefix(Some(p)))?
        } else {
            self.engine.scan_prefix(&encode_spo_prefix(None, None))?
        };

        Ok(ScanIter {
            inner,
            dict: self.dict.clone(),
            s,
            p,
            o,
            graph,
            cancel: cancel.clone(),
            stopped: false,
        })
    }

    pub fn reset(&self) -> Result<()> {
        let mut ops = Vec::new();
        for entry in self.engine.scan_prefix(&encode_spo_prefix(None, None))? {
            let (key, _) = entry?;
            let Some(ids) = decode_spo(&key) else { continue };
            ops.push(WriteOp::Delete { key: encode_spo(ids.s, ids.p, ids.o) });
            ops.push(WriteOp::Delete { key: encode_ops(ids.o, ids.p, ids.s) });
            ops.push(WriteOp::Delete { key: encode_pso(ids.p, ids.s, ids.o) });
        }
        self.engine.write_batch(ops)?;
        self.count.store(0, Ordering::Release);
        Ok(())
    }

    /// Decode a fact's stored metadata value, if it carries one.
    pub fn fact_metadata(&self, s: u64, p: u64, o: u64) -> Result<Option<FactMetadata>> {
        let Some(bytes) = self.engine.get(&encode_spo(s, p, o))? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(decode_fact_metadata(&bytes).map(|(weight, source)| FactMetadata { weight, source }))
    }
}

fn resolve_optional(dict: &AnyDictionary, s: &str) -> Result<Option<u64>> {
    if s.is_empty() {
        Ok(None)
    } else {
        dict.get_id(s)
    }
}

fn unresolved(bound: &str, resolved: Option<u64>) -> bool {
    !bound.is_empty() && resolved.is_none()
}

struct AnyTripleIds {
    s: u64,
    p: u64,
    o: u64,
}

fn decode_triple_any(key: &[u8]) -> Option<AnyTripleIds> {
    decode_spo(key)
        .or_else(|| decode_ops(key))
        .or_else(|| decode_pso(key))
        .map(|t| AnyTripleIds { s: t.s, p: t.p, o: t.o })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::IdAllocator;
    use crate::config::StoreConfig;
    use crate::dictionary::Dictionary;

    fn store() -> TripleStore {
        let engine = Arc::new(KvEngine::open(None, &StoreConfig::default()).unwrap());
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 1000).unwrap());
        let dict = Arc::new(AnyDictionary::Single(Dictionary::new(engine.clone(), alloc, 1000)));
        TripleStore::open(engine, dict).unwrap()
    }

    fn facts(s: &str) -> (Fact, Fact) {
        (
            Fact::new(s, "defines", ObjectValue::Id(format!("{s}:F"))),
            Fact::new(s, "defines", ObjectValue::Id(format!("{s}:G"))),
        )
    }

    #[test]
    fn s1_scan_by_subject_predicate() {
        let st = store();
        let (f1, f2) = facts("a.go");
        st.add_fact_batch(vec![f1, f2]).unwrap();
        let cancel = CancellationToken::new();
        let items: Vec<ScanItem> = st
            .scan("a.go", "defines", "", "", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let objs: Vec<String> = items
            .into_iter()
            .map(|i| match i {
                ScanItem::Fact(f) => f.object,
                ScanItem::Cancelled => panic!("unexpected cancel"),
            })
            .collect();
        assert_eq!(objs.len(), 2);
        assert!(objs.contains(&"a.go:F".to_string()));
        assert!(objs.contains(&"a.go:G".to_string()));
    }

    #[test]
    fn s2_scan_by_object_yields_subject() {
        let st = store();
        let (f1, _) = facts("a.go");
        st.add_fact_batch(vec![f1]).unwrap();
        let cancel = CancellationToken::new();
        let items: Vec<ScanItem> = st
            .scan("", "defines", "a.go:F", "", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(items.len(), 1);
        match &items[0] {
            ScanItem::Fact(f) => assert_eq!(f.subject, "a.go"),
            _ => panic!("expected fact"),
        }
    }

    #[test]
    fn s3_scan_unknown_string_is_empty_not_error() {
        let st = store();
        let cancel = CancellationToken::new();
        let items: Vec<ScanItem> = st
            .scan("", "", "nonexistent-string", "", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn scan_stops_early_without_draining_the_whole_prefix() {
        let st = store();
        let mut batch = Vec::new();
        for i in 0..50 {
            batch.push(Fact::new(format!("s{i}"), "p", ObjectValue::Int(i)));
        }
        st.add_fact_batch(batch).unwrap();
        let cancel = CancellationToken::new();
        let first_two: Vec<ScanItem> = st
            .scan("", "p", "", "", &cancel)
            .unwrap()
            .take(2)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(first_two.len(), 2);
    }

    #[test]
    fn s5_delete_by_subject_and_recalculate() {
        let st = store();
        let mut batch = Vec::new();
        for i in 0..100 {
            let subj = if i < 10 { "owned".to_string() } else { format!("s{i}") };
            batch.push(Fact::new(subj, "p", ObjectValue::Int(i)));
        }
        st.add_fact_batch(batch).unwrap();
        assert_eq!(st.count(), 100);
        let deleted = st.delete_facts_by_subject("owned").unwrap();
        assert_eq!(deleted, 10);
        assert_eq!(st.count(), 90);
        let recomputed = st.recalculate_stats().unwrap();
        assert_eq!(recomputed, 90);
    }

    #[test]
    fn index_agreement_after_add_and_delete() {
        let st = store();
        let (f1, f2) = facts("x");
        st.add_fact_batch(vec![f1, f2]).unwrap();
        let cancel = CancellationToken::new();
        let by_s: Vec<ScanItem> = st
            .scan("x", "", "", "", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let by_p: Vec<ScanItem> = st
            .scan("", "defines", "", "", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(by_s.len(), 2);
        assert_eq!(by_p.len(), 2);
    }

    #[test]
    fn deleting_unknown_subject_is_not_an_error() {
        let st = store();
        assert_eq!(st.delete_facts_by_subject("never-seen").unwrap(), 0);
    }
}
