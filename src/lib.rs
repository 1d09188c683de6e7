//! Dictionary-encoded quad store paired with a compressed Matryoshka
//! vector registry: the storage and query engine for a semantic code
//! knowledge base.
//!
//! This crate is the core collaborators only — language parsing and
//! symbol extraction, the Datalog executor, HTTP/CLI/REPL surfaces,
//! embedding-provider clients, and LLM orchestration all live outside it
//! and are modeled here, where they touch the store at all, as plain
//! trait/struct boundaries (see [`collab`]).
//!
//! [`Store`] is the façade: one open data directory, one dictionary
//! (single or sharded per [`StoreConfig::num_dict_shards`]), one triple
//! store, one content store, one vector registry, sharing one
//! [`kv::KvEngine`] handle. [`store_manager::StoreManager`] keeps a
//! process-wide pool of these, keyed by project id, for hosts that serve
//! more than one project out of one process.

pub mod allocator;
pub mod cancel;
pub mod config;
pub mod content;
pub mod dictionary;
pub mod error;
pub mod keycodec;
pub mod kv;
pub mod query;
pub mod store;
pub mod store_manager;
pub mod vector;

pub use allocator::IdAllocator;
pub use cancel::CancellationToken;
pub use config::{Profile, StoreConfig};
pub use content::{add_document, get_document, get_document_metadata, ContentStore, Document, MetaValue};
pub use dictionary::{AnyDictionary, Dictionary, ShardedDictionary};
pub use error::{Result, StoreError};
pub use kv::KvEngine;
pub use query::{Query, QueryResult};
pub use store::{Fact, FactMetadata, ObjectValue, ScanItem, ScanIter, ScannedFact, TripleStore};
pub use store_manager::StoreManager;
pub use vector::{SearchHit, VectorRegistry, FULL_DIM, MRL_DIM};

use std::sync::Arc;

/// Trait/struct boundaries for the collaborators this crate treats as
/// external: an extractor that turns source files into facts and
/// documents, an embedding provider that turns text into vectors, and a
/// Datalog executor that runs conjunctive queries over `Store::scan`. The
/// core never implements these — it only defines the shapes a caller on
/// the other side of the boundary is expected to produce or consume.
pub mod collab {
    use crate::error::Result;
    use crate::store::{Fact, ScanIter};
    use crate::CancellationToken;

    /// One document plus the facts derived from it, as yielded by an
    /// out-of-process extractor for a single source file or unit.
    pub struct ExtractedBundle {
        pub documents: Vec<ExtractedDocument>,
        pub facts: Vec<Fact>,
    }

    pub struct ExtractedDocument {
        pub id: String,
        pub content: Option<Vec<u8>>,
        pub metadata: std::collections::HashMap<String, String>,
    }

    /// Turns text into a `FULL_DIM`-wide embedding. The core does not
    /// model the provider's transport (HTTP, local model, batching) — only
    /// this synchronous shape, since vector ingest blocks on its caller
    /// having already produced the embedding.
    pub trait EmbeddingProvider {
        fn embed(&self, text: &str) -> Result<Vec<f32>>;
    }

    /// Consumes the store's `scan(s, p, o, g)` iterator and the dictionary
    /// to answer conjunctive queries with variables. The store provides no
    /// join logic of its own; this trait is the seam a Datalog executor
    /// plugs into.
    pub trait DatalogExecutor {
        fn scan(
            &self,
            subject: &str,
            predicate: &str,
            object: &str,
            graph: &str,
            cancel: &CancellationToken,
        ) -> Result<ScanIter>;
    }
}

/// One open project's worth of storage: a shared [`kv::KvEngine`], a
/// dictionary, the triple store, content store, and vector registry built
/// on top of it.
///
/// `Store` owns the wiring described in the component design: every
/// dictionary lookup funnels through one [`AnyDictionary`] handle so the
/// sharded and single-instance variants are interchangeable at this
/// level, and every subsystem shares the one `KvEngine` so writes across
/// them observe the same underlying log.
pub struct Store {
    engine: Arc<KvEngine>,
    dict: Arc<AnyDictionary>,
    triples: TripleStore,
    content: ContentStore,
    vectors: VectorRegistry,
}

impl Store {
    /// Open (or create) a store rooted at `config.data_dir`, or an
    /// ephemeral in-memory store when `config.in_memory` is set.
    /// `num_dict_shards` selects the sharded dictionary variant; 0 uses
    /// the single-instance `Dictionary`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(KvEngine::open(config.data_dir.as_deref(), config)?);
        let allocator = Arc::new(IdAllocator::new(engine.clone(), allocator::DEFAULT_BLOCK_SIZE)?);

        let dict = Arc::new(if config.num_dict_shards == 0 {
            AnyDictionary::Single(Dictionary::new(engine.clone(), allocator, config.lru_cache_size))
        } else {
            AnyDictionary::Sharded(ShardedDictionary::new(
                engine.clone(),
                allocator,
                config.num_dict_shards,
                config.lru_cache_size,
            ))
        });

        let triples = TripleStore::open(engine.clone(), dict.clone())?;
        let content = ContentStore::new(engine.clone(), dict.clone());
        let vector_dir = if config.in_memory {
            None
        } else {
            config.data_dir.as_ref().map(|d| d.join("vectors"))
        };
        let vectors = VectorRegistry::new(engine.clone(), dict.clone(), vector_dir)?;

        Ok(Self {
            engine,
            dict,
            triples,
            content,
            vectors,
        })
    }

    pub fn triples(&self) -> &TripleStore {
        &self.triples
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn vectors(&self) -> &VectorRegistry {
        &self.vectors
    }

    pub fn dictionary(&self) -> &AnyDictionary {
        &self.dict
    }

    pub fn add_fact(&self, fact: Fact) -> Result<()> {
        self.triples.add_fact(fact)
    }

    pub fn add_fact_batch(&self, facts: Vec<Fact>) -> Result<()> {
        self.triples.add_fact_batch(facts)
    }

    pub fn delete_facts_by_subject(&self, subject: &str) -> Result<u64> {
        self.triples.delete_facts_by_subject(subject)
    }

    pub fn scan(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        graph: &str,
        cancel: &CancellationToken,
    ) -> Result<ScanIter> {
        self.triples.scan(subject, predicate, object, graph, cancel)
    }

    pub fn count(&self) -> u64 {
        self.triples.count()
    }

    pub fn recalculate_stats(&self) -> Result<u64> {
        self.triples.recalculate_stats()
    }

    pub fn set_content(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.content.set_content(id, bytes)
    }

    pub fn get_content(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.content.get_content(id)
    }

    /// Composite write: content, vector, and metadata facts for one
    /// document key. See [`content::add_document`] for atomicity notes.
    pub fn add_document(
        &self,
        key: &str,
        content: Option<&[u8]>,
        embedding: Option<&[f32]>,
        metadata: std::collections::HashMap<String, MetaValue>,
    ) -> Result<()> {
        content::add_document(
            &self.content,
            &self.triples,
            &self.vectors,
            key,
            content,
            embedding,
            metadata,
        )
    }

    pub fn get_document(&self, key: &str) -> Result<Document> {
        content::get_document(&self.content, &self.triples, &self.vectors, key)
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.vectors.search(query, k)
    }

    /// Start a fluent neuro-symbolic query against this store's vector
    /// registry and triple store, hydrating content best-effort.
    pub fn query(&self) -> Query<'_> {
        Query::new(&self.vectors, &self.triples, &self.dict).with_content_store(&self.content)
    }

    /// Flush the fact counter, drain and snapshot the vector registry, and
    /// close the underlying KV engine. Reports the first fatal error but
    /// always attempts every subsystem, matching the close-reports-first
    /// error policy in the error handling design.
    pub fn close(&mut self) -> Result<()> {
        let stats_result = self.triples.save_stats();
        let vector_result = self.vectors.snapshot();
        let engine_result = self.engine.close();
        stats_result.and(vector_result).and(engine_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn open_in_memory_store_round_trips_facts() {
        let store = Store::open(&StoreConfig::default()).unwrap();
        store
            .add_fact(Fact::new("a.go", "defines", ObjectValue::Id("a.go:F".into())))
            .unwrap();
        let cancel = CancellationToken::new();
        let hits: Vec<_> = store
            .scan("a.go", "defines", "", "", &cancel)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn open_with_sharded_dictionary() {
        let cfg = StoreConfig {
            num_dict_shards: 4,
            ..StoreConfig::default()
        };
        let store = Store::open(&cfg).unwrap();
        store
            .add_fact(Fact::new("x", "p", ObjectValue::Int(1)))
            .unwrap();
        assert_eq!(store.count(), 1);
        assert!(matches!(store.dictionary(), AnyDictionary::Sharded(_)));
    }

    #[test]
    fn s4_add_document_through_store_facade() {
        let store = Store::open(&StoreConfig::default()).unwrap();
        let mut vec = vec![0.0f32; FULL_DIM];
        vec[767] = 1.0;
        let mut meta = HashMap::new();
        meta.insert("lang".to_string(), MetaValue::String("go".to_string()));

        store
            .add_document("k", Some(b"hello"), Some(&vec), meta)
            .unwrap();

        assert_eq!(store.get_content("k").unwrap(), Some(b"hello".to_vec()));
        let hits = store.search(&vec, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-3);

        let doc = store.get_document("k").unwrap();
        assert_eq!(doc.metadata.get("lang").map(String::as_str), Some("go"));
    }

    #[test]
    fn query_builder_is_reachable_from_store() {
        let store = Store::open(&StoreConfig::default()).unwrap();
        let mut v = vec![0.0f32; FULL_DIM];
        v[0] = 1.0;
        let id = store.dictionary().get_or_create_id("doc-1").unwrap();
        store.vectors().add(id, &v).unwrap();
        let results = store.query().similar_to(&v).limit(5).execute().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
    }

    #[test]
    fn close_is_idempotent_with_in_memory_store() {
        let mut store = Store::open(&StoreConfig::default()).unwrap();
        store
            .add_fact(Fact::new("a", "b", ObjectValue::Bool(true)))
            .unwrap();
        store.close().unwrap();
    }
}
