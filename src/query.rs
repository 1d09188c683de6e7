//! Neuro-symbolic query builder: a fluent vector-similarity search with
//! symbolic post-filters evaluated against the triple store.

use crate::cancel::CancellationToken;
use crate::content::ContentStore;
use crate::dictionary::AnyDictionary;
use crate::error::{Result, StoreError};
use crate::store::{ScanItem, TripleStore};
use crate::vector::VectorRegistry;

const MIN_CANDIDATE_K: usize = 100;
const DEFAULT_CANDIDATE_MULTIPLIER: usize = 10;
const DEFAULT_LIMIT: usize = 10;

struct Filter {
    graph: String,
    predicate: String,
    object: String,
}

/// A hydrated query result: the candidate's dictionary key, similarity
/// score, and best-effort content (`None` if nothing was stored for it).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub id: u64,
    pub score: f32,
    pub content: Option<Vec<u8>>,
}

/// Builds and executes a similarity-then-symbolic-filter query. Every
/// setter takes `self` by value and returns it, so calls chain:
/// `Query::new(...).similar_to(&v).where_("lang", "go").limit(5).execute()`.
pub struct Query<'a> {
    vectors: &'a VectorRegistry,
    triples: &'a TripleStore,
    dict: &'a AnyDictionary,
    content: Option<&'a ContentStore>,
    query_vec: Option<Vec<f32>>,
    threshold: f32,
    filters: Vec<Filter>,
    default_graph: String,
    limit: usize,
    multiplier: usize,
}

impl<'a> Query<'a> {
    pub fn new(vectors: &'a VectorRegistry, triples: &'a TripleStore, dict: &'a AnyDictionary) -> Self {
        Self {
            vectors,
            triples,
            dict,
            content: None,
            query_vec: None,
            threshold: f32::NEG_INFINITY,
            filters: Vec::new(),
            default_graph: crate::store::DEFAULT_GRAPH.to_string(),
            limit: DEFAULT_LIMIT,
            multiplier: DEFAULT_CANDIDATE_MULTIPLIER,
        }
    }

    pub fn with_content_store(mut self, content: &'a ContentStore) -> Self {
        self.content = Some(content);
        self
    }

    pub fn similar_to(mut self, vec: &[f32]) -> Self {
        self.query_vec = Some(vec.to_vec());
        self
    }

    pub fn similar_to_with_threshold(mut self, vec: &[f32], threshold: f32) -> Self {
        self.query_vec = Some(vec.to_vec());
        self.threshold = threshold;
        self
    }

    /// Filter on the default graph: keep candidates with at least one
    /// `(candidate, predicate, object)` fact.
    pub fn where_(mut self, predicate: impl Into<String>, object: impl Into<String>) -> Self {
        let graph = self.default_graph.clone();
        self.filters.push(Filter {
            graph,
            predicate: predicate.into(),
            object: object.into(),
        });
        self
    }

    pub fn where_in(
        mut self,
        graph: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        self.filters.push(Filter {
            graph: graph.into(),
            predicate: predicate.into(),
            object: object.into(),
        });
        self
    }

    pub fn graph(mut self, g: impl Into<String>) -> Self {
        self.default_graph = g.into();
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = n.max(1);
        self
    }

    pub fn candidate_multiplier(mut self, m: usize) -> Self {
        self.multiplier = m.max(1);
        self
    }

    /// Run the query: require `similar_to`, fetch `candidateK = max(limit
    /// * multiplier, 100)` nearest candidates, apply the score threshold,
    /// then every symbolic filter in order (a candidate survives only if
    /// all filters pass), stopping as soon as `limit` survivors are found.
    /// Content hydration is best-effort: a missing blob leaves `content`
    /// as `None` rather than failing the query.
    pub fn execute(self) -> Result<Vec<QueryResult>> {
        let Some(query_vec) = self.query_vec else {
            return Err(StoreError::InvalidArgument(
                "query requires similar_to() to be set".into(),
            ));
        };

        let candidate_k = (self.limit * self.multiplier).max(MIN_CANDIDATE_K);
        let candidates = self.vectors.search(&query_vec, candidate_k)?;

        let cancel = CancellationToken::new();
        let mut out = Vec::with_capacity(self.limit);
        for hit in candidates {
            if out.len() >= self.limit {
                break;
            }
            if hit.score < self.threshold {
                continue;
            }

            // The registry keys candidates by dictionary id, but facts and
            // content blobs are keyed by the original string key — resolve
            // it back through the dictionary before filtering or hydrating.
            // An id the dictionary no longer recognizes is a corrupt/stale
            // entry: skip it rather than failing the whole query.
            let Some(subject) = self.dict.get_string(hit.id)? else {
                continue;
            };

            let mut passes_all = true;
            for filter in &self.filters {
                let mut any_fact = false;
                for item in self.triples.scan(
                    &subject,
                    &filter.predicate,
                    &filter.object,
                    &filter.graph,
                    &cancel,
                )? {
                    if let ScanItem::Fact(_) = item? {
                        any_fact = true;
                        break;
                    }
                }
                if !any_fact {
                    passes_all = false;
                    break;
                }
            }
            if !passes_all {
                continue;
            }

            let content = self
                .content
                .and_then(|cs| cs.get_content(&subject).ok().flatten());

            out.push(QueryResult {
                id: hit.id,
                score: hit.score,
                content,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::IdAllocator;
    use crate::config::StoreConfig;
    use crate::dictionary::{AnyDictionary, Dictionary};
    use crate::kv::KvEngine;
    use crate::store::{Fact, ObjectValue};
    use std::sync::Arc;

    fn harness() -> (Arc<KvEngine>, Arc<AnyDictionary>, TripleStore, VectorRegistry) {
        let engine = Arc::new(KvEngine::open(None, &StoreConfig::default()).unwrap());
        let alloc = Arc::new(IdAllocator::new(engine.clone(), 1000).unwrap());
        let dict = Arc::new(AnyDictionary::Single(Dictionary::new(engine.clone(), alloc, 1000)));
        let triples = TripleStore::open(engine.clone(), dict.clone()).unwrap();
        let vectors = VectorRegistry::new(engine.clone(), dict.clone(), None).unwrap();
        (engine, dict, triples, vectors)
    }

    #[test]
    fn execute_without_similar_to_errors() {
        let (_e, dict, triples, vectors) = harness();
        let res = Query::new(&vectors, &triples, &dict).limit(5).execute();
        assert!(res.is_err());
    }

    #[test]
    fn similarity_then_symbolic_filter() {
        let (_e, dict, triples, vectors) = harness();
        let mut v1 = vec![0.0f32; 768];
        v1[0] = 1.0;
        let id1 = dict.get_or_create_id("doc-1").unwrap();
        vectors.add(id1, &v1).unwrap();
        triples
            .add_fact(Fact::new("doc-1", "lang", ObjectValue::Id("rust".into())))
            .unwrap();

        let mut v2 = vec![0.0f32; 768];
        v2[0] = 0.99;
        let id2 = dict.get_or_create_id("doc-2").unwrap();
        vectors.add(id2, &v2).unwrap();
        triples
            .add_fact(Fact::new("doc-2", "lang", ObjectValue::Id("go".into())))
            .unwrap();

        let results = Query::new(&vectors, &triples, &dict)
            .similar_to(&v1)
            .where_("lang", "rust")
            .limit(5)
            .execute()
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id1);
    }

    #[test]
    fn threshold_drops_dissimilar_candidates() {
        let (_e, dict, triples, vectors) = harness();
        let mut v1 = vec![0.0f32; 768];
        v1[0] = 1.0;
        let id1 = dict.get_or_create_id("doc-1").unwrap();
        vectors.add(id1, &v1).unwrap();

        let mut v2 = vec![0.0f32; 768];
        v2[1] = 1.0; // orthogonal to v1
        let id2 = dict.get_or_create_id("doc-2").unwrap();
        vectors.add(id2, &v2).unwrap();

        let results = Query::new(&vectors, &triples, &dict)
            .similar_to_with_threshold(&v1, 0.9)
            .limit(5)
            .execute()
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id1);
    }
}
