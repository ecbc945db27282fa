//! In-memory [`SearchBackend`] over JSON fixtures.
//!
//! A fixture is a set of named indices, each with a mapping and a list of
//! documents:
//!
//! ```json
//! {"indices": {"main": {"mapping": {"primary_key": "id", "fields": {...}},
//!                       "documents": [{"id": 1, ...}]}}}
//! ```

use super::eval::{value_text, Evaluator};
use super::{analyzer, SearchBackend};
use crate::error::{CompileError, Result};
use crate::metadata::{IndexMetadata, Mapping};
use ahash::AHashMap;
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use tracing::info;

/// Serialized fixture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub indices: IndexMap<String, FixtureIndex>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureIndex {
    pub mapping: Mapping,
    pub documents: Vec<Value>,
}

struct MemoryIndex {
    metadata: IndexMetadata,
    documents: Vec<Value>,
}

/// Backend that evaluates query documents over in-memory JSON documents
pub struct MemoryBackend {
    indices: AHashMap<String, MemoryIndex>,
    /// Log of count and terms requests, for inspection in tests
    calls: RefCell<Vec<String>>,
}

impl MemoryBackend {
    pub fn new(fixture: Fixture) -> Self {
        let indices = fixture
            .indices
            .into_iter()
            .map(|(name, index)| {
                let metadata = IndexMetadata::new(name.clone(), index.mapping);
                (
                    name,
                    MemoryIndex {
                        metadata,
                        documents: index.documents,
                    },
                )
            })
            .collect();
        Self {
            indices,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn from_json(value: Value) -> anyhow::Result<Self> {
        let fixture: Fixture = serde_json::from_value(value).context("Invalid fixture")?;
        Ok(Self::new(fixture))
    }

    /// Load a fixture file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))?;
        Ok(Self::new(fixture))
    }

    fn index(&self, name: &str) -> Result<&MemoryIndex> {
        self.indices
            .get(name)
            .ok_or_else(|| CompileError::UnknownIndex(name.to_string()))
    }

    /// Documents of `index` matching `query`, in storage order
    pub fn search(&self, index: &str, query: &Value) -> Result<Vec<&Value>> {
        let idx = self.index(index)?;
        let evaluator = Evaluator::new(&idx.metadata);
        let mut hits = Vec::new();
        for doc in &idx.documents {
            if evaluator.matches(doc, query)? {
                hits.push(doc);
            }
        }
        Ok(hits)
    }

    /// Primary keys of the documents matching `query`
    pub fn primary_keys(&self, index: &str, query: &Value) -> Result<Vec<String>> {
        let idx = self.index(index)?;
        let evaluator = Evaluator::new(&idx.metadata);
        let pk = idx.metadata.primary_key();
        Ok(self
            .search(index, query)?
            .into_iter()
            .flat_map(|doc| evaluator.field_values(doc, pk))
            .map(value_text)
            .collect())
    }

    /// Requests made so far, as `count <index>` / `terms <index>.<field>`
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl SearchBackend for MemoryBackend {
    fn get_mapping(&self, index: &str) -> Result<Mapping> {
        Ok(self.index(index)?.metadata.mapping().clone())
    }

    fn execute_count(&self, index: &str, query: &Value) -> Result<u64> {
        self.calls.borrow_mut().push(format!("count {}", index));
        let count = self.search(index, query)?.len() as u64;
        info!(index, count, "count");
        Ok(count)
    }

    fn execute_terms_aggregation(
        &self,
        index: &str,
        query: &Value,
        field: &str,
        size: Option<usize>,
    ) -> Result<Vec<String>> {
        self.calls.borrow_mut().push(format!("terms {}.{}", index, field));
        let idx = self.index(index)?;
        let evaluator = Evaluator::new(&idx.metadata);

        let mut counts: AHashMap<String, u64> = AHashMap::new();
        for doc in self.search(index, query)? {
            for value in evaluator.field_values(doc, field) {
                if !value.is_null() {
                    *counts.entry(value_text(value)).or_default() += 1;
                }
            }
        }

        let mut terms: Vec<(String, u64)> = counts.into_iter().collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(size) = size {
            terms.truncate(size);
        }
        info!(index, field, terms = terms.len(), "terms aggregation");
        Ok(terms.into_iter().map(|(term, _)| term).collect())
    }

    fn analyze(&self, index: &str, field: &str, text: &str) -> Result<Vec<String>> {
        let idx = self.index(index)?;
        Ok(analyzer::analyze(idx.metadata.search_analyzer(field), text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> MemoryBackend {
        MemoryBackend::from_json(json!({
            "indices": {
                "books": {
                    "mapping": {"fields": {
                        "id": {"type": "long"},
                        "author_id": {"type": "long"},
                        "title": {"type": "text", "analyzer": "english"}
                    }},
                    "documents": [
                        {"id": 1, "author_id": 10, "title": "Dogs and cats"},
                        {"id": 2, "author_id": 10, "title": "More dogs"},
                        {"id": 3, "author_id": 20, "title": "Birds"}
                    ]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_count_and_primary_keys() {
        let backend = backend();
        let query = json!({"term": {"title": "dog"}});
        assert_eq!(backend.execute_count("books", &query).unwrap(), 2);
        assert_eq!(backend.primary_keys("books", &query).unwrap(), vec!["1", "2"]);
        assert_eq!(backend.calls(), vec!["count books"]);
    }

    #[test]
    fn test_terms_aggregation_orders_by_frequency() {
        let backend = backend();
        let all = json!({"match_all": {}});
        let terms = backend
            .execute_terms_aggregation("books", &all, "author_id", None)
            .unwrap();
        assert_eq!(terms, vec!["10", "20"]);
        let bounded = backend
            .execute_terms_aggregation("books", &all, "author_id", Some(1))
            .unwrap();
        assert_eq!(bounded, vec!["10"]);
    }

    #[test]
    fn test_analyze_uses_field_analyzer() {
        let backend = backend();
        assert_eq!(backend.analyze("books", "title", "The Dogs").unwrap(), vec!["dog"]);
        assert_eq!(backend.analyze("books", "id", "ABC").unwrap(), vec!["abc"]);
    }

    #[test]
    fn test_unknown_index() {
        let backend = backend();
        assert!(matches!(
            backend.get_mapping("nope"),
            Err(CompileError::UnknownIndex(_))
        ));
    }
}
