//! Content store: compressed blob storage keyed by dictionary id, plus the
//! composite `AddDocument`/`GetDocument` operations that tie content,
//! vector, and metadata facts together as one logical document.

use crate::dictionary::AnyDictionary;
use crate::error::Result;
use crate::keycodec::encode_content_key;
use crate::kv::KvEngine;
use crate::store::{Fact, ObjectValue, ScanItem, TripleStore, METADATA_GRAPH};
use crate::vector::VectorRegistry;
use crate::cancel::CancellationToken;
use std::collections::HashMap;
use std::sync::Arc;

/// A metadata value: the closed tagged set every fact object supports.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl MetaValue {
    fn into_object(self) -> ObjectValue {
        match self {
            MetaValue::String(s) => ObjectValue::Id(s),
            MetaValue::Int(i) => ObjectValue::Int(i),
            MetaValue::Float(f) => ObjectValue::Float(f),
            MetaValue::Bool(b) => ObjectValue::Bool(b),
        }
    }
}

/// A hydrated document: content, full vector, and metadata are each
/// optional depending on what was persisted for this key.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub content: Option<Vec<u8>>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: HashMap<String, String>,
}

pub struct ContentStore {
    engine: Arc<KvEngine>,
    dict: Arc<AnyDictionary>,
}

impl ContentStore {
    pub fn new(engine: Arc<KvEngine>, dict: Arc<AnyDictionary>) -> Self {
        Self { engine, dict }
    }

    /// Compress with a fast block codec (Snappy) and write one KV entry
    /// at the content prefix.
    pub fn set_content(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let did = self.dict.get_or_create_id(id)?;
        let compressed = snap::raw::Encoder::new().compress_vec(bytes).map_err(|e| {
            crate::error::StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        self.engine.put(encode_content_key(did), compressed)
    }

    /// `None` with no error when the key is missing — content is optional.
    pub fn get_content(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(did) = self.dict.get_id(id)? else {
            return Ok(None);
        };
        let Some(compressed) = self.engine.get(&encode_content_key(did))? else {
            return Ok(None);
        };
        let bytes = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|e| crate::error::StoreError::Corruption(format!("content blob: {e}")))?;
        Ok(Some(bytes))
    }
}

/// Composite document write: interns the key, writes compressed content,
/// inserts the vector into the registry, and appends each metadata entry
/// as a fact in the `"metadata"` graph. The vector registry insert runs
/// first (it lives in its own lock domain, not the KV engine's batch) so
/// a failure partway through still leaves the KV-engine side atomic; a
/// vector insert without a matching committed batch is self-correcting on
/// the next re-ingest, since registry inserts are idempotent by id.
pub fn add_document(
    content_store: &ContentStore,
    triples: &TripleStore,
    vectors: &VectorRegistry,
    key: &str,
    content: Option<&[u8]>,
    embedding: Option<&[f32]>,
    metadata: HashMap<String, MetaValue>,
) -> Result<()> {
    let did = content_store.dict.get_or_create_id(key)?;

    if let Some(vec) = embedding {
        vectors.add_with_string_id(did, Some(key.to_string()), vec)?;
    }

    if let Some(bytes) = content {
        content_store.set_content(key, bytes)?;
    }

    if !metadata.is_empty() {
        let facts: Vec<Fact> = metadata
            .into_iter()
            .map(|(k, v)| Fact::with_graph(key, k, v.into_object(), METADATA_GRAPH))
            .collect();
        triples.add_fact_batch(facts)?;
    }

    Ok(())
}

/// Hydrate content, the full vector (if persisted), and every metadata
/// fact for `key`.
pub fn get_document(
    content_store: &ContentStore,
    triples: &TripleStore,
    vectors: &VectorRegistry,
    key: &str,
) -> Result<Document> {
    let content = content_store.get_content(key)?;
    let embedding = vectors.get_full_vector(key)?;
    let metadata = get_document_metadata(triples, key)?;
    Ok(Document {
        id: key.to_string(),
        content,
        embedding,
        metadata,
    })
}

/// Every fact whose subject equals `key` and whose graph is `"metadata"`,
/// as a flat `predicate -> object` map.
pub fn get_document_metadata(triples: &TripleStore, key: &str) -> Result<HashMap<String, String>> {
    let cancel = CancellationToken::new();
    let mut out = HashMap::new();
    for item in triples.scan(key, "", "", METADATA_GRAPH, &cancel)? {
        if let ScanItem::Fact(f) = item? {
            out.insert(f.predicate, f.object);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::IdAllocator;
    use crate::config::StoreConfig;
    use crate::dictionary::Dictionary;
    use crate::vector::VectorRegistry;

    fn harness() -> (ContentStore, TripleStore, VectorRegistry) {
        let engine = Arc::new(KvEngine::open(None, &StoreConfig::default()).unwrap());
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 1000).unwrap());
        let dict = Arc::new(AnyDictionary::Single(Dictionary::new(engine.clone(), alloc, 1000)));
        let content = ContentStore::new(engine.clone(), dict.clone());
        let triples = TripleStore::open(engine.clone(), dict.clone()).unwrap();
        let vectors = VectorRegistry::new(engine, dict, None).unwrap();
        (content, triples, vectors)
    }

    #[test]
    fn content_round_trips() {
        let (content, _, _) = harness();
        content.set_content("k", b"hello").unwrap();
        assert_eq!(content.get_content("k").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn missing_content_is_none_not_error() {
        let (content, _, _) = harness();
        assert_eq!(content.get_content("missing").unwrap(), None);
    }

    #[test]
    fn s4_add_document_end_to_end() {
        let (content, triples, vectors) = harness();
        let mut vec = vec![0.0f32; 768];
        vec[767] = 1.0;
        let mut meta = HashMap::new();
        meta.insert("lang".to_string(), MetaValue::String("go".to_string()));

        add_document(&content, &triples, &vectors, "k", Some(b"hello"), Some(&vec), meta).unwrap();

        assert_eq!(content.get_content("k").unwrap(), Some(b"hello".to_vec()));

        let results = vectors.search(&vec, 1).unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 1.0).abs() < 1e-3);

        let cancel = CancellationToken::new();
        let facts: Vec<_> = triples
            .scan("k", "lang", "", "metadata", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(facts.len(), 1);
    }
}
