//! Index mappings and field ownership lookup.
//!
//! Mappings are fetched from the [`SearchBackend`] at most once per index per
//! compilation and shared as `Rc<IndexMetadata>`. Analyzer output is memoized
//! in a bounded LRU because term analysis asks for the same field/text pairs
//! on every fixed-point iteration.

use crate::ast::{LinkId, LinkTable};
use crate::backend::SearchBackend;
use crate::error::Result;
use ahash::AHashMap;
use indexmap::IndexMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::rc::Rc;
use tracing::{trace, warn};

/// Analyzers that keep the whole value as one token
const VERBATIM_ANALYZERS: &[&str] = &["exact", "keyword"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Keyword,
    Long,
    Integer,
    Double,
    Float,
    Boolean,
    Date,
    Nested,
    Object,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldType::Long | FieldType::Integer | FieldType::Double | FieldType::Float
        )
    }
}

/// Mapping of a single field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub analyzer: Option<String>,
    /// Field keeps in-memory values usable by terms aggregations
    pub fielddata: bool,
    /// Field participates in the catch-all pseudo-field
    pub include_in_all: bool,
}

/// Mapping of an index as returned by the backend.
///
/// Sub-fields of nested or object fields are listed under their full dotted
/// names next to their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mapping {
    pub primary_key: String,
    /// Index has no visibility/transaction columns, so exclusions don't apply
    pub no_transaction_metadata: bool,
    pub fields: IndexMap<String, FieldMapping>,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            primary_key: "id".to_string(),
            no_transaction_metadata: false,
            fields: IndexMap::new(),
        }
    }
}

/// Read-only view of one index's mapping
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    name: String,
    mapping: Mapping,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, mapping: Mapping) -> Self {
        Self {
            name: name.into(),
            mapping,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn primary_key(&self) -> &str {
        &self.mapping.primary_key
    }

    pub fn no_transaction_metadata(&self) -> bool {
        self.mapping.no_transaction_metadata
    }

    pub fn field(&self, fieldname: &str) -> Option<&FieldMapping> {
        self.mapping.fields.get(fieldname)
    }

    pub fn has_field(&self, fieldname: &str) -> bool {
        self.mapping.fields.contains_key(fieldname)
    }

    pub fn field_type(&self, fieldname: &str) -> Option<FieldType> {
        self.field(fieldname).map(|f| f.field_type)
    }

    /// Analyzer applied at search time: the declared one, else by field type
    pub fn search_analyzer(&self, fieldname: &str) -> &str {
        match self.field(fieldname) {
            Some(FieldMapping {
                analyzer: Some(a), ..
            }) => a,
            Some(FieldMapping {
                field_type: FieldType::Text,
                ..
            }) => "standard",
            _ => "exact",
        }
    }

    /// Field is tokenized (text with a non-verbatim analyzer)
    pub fn is_full_text(&self, fieldname: &str) -> bool {
        self.field_type(fieldname) == Some(FieldType::Text)
            && !VERBATIM_ANALYZERS.contains(&self.search_analyzer(fieldname))
    }

    /// Innermost nested-typed prefix of a dotted fieldname
    pub fn nested_path_for(&self, fieldname: &str) -> Option<String> {
        let mut found = None;
        for (i, ch) in fieldname.char_indices() {
            if ch == '.' {
                let prefix = &fieldname[..i];
                if self.field_type(prefix) == Some(FieldType::Nested) {
                    found = Some(prefix.to_string());
                }
            }
        }
        found
    }

    pub fn is_nested(&self, fieldname: &str) -> bool {
        self.field_type(fieldname) == Some(FieldType::Nested)
    }

    /// Fields searched by the catch-all pseudo-field
    pub fn catch_all_fields(&self) -> Vec<String> {
        self.mapping
            .fields
            .iter()
            .filter(|(_, f)| !matches!(f.field_type, FieldType::Nested | FieldType::Object))
            .filter(|(_, f)| f.include_in_all || f.analyzer.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The date-typed field backing `fieldname`, which is either the field
    /// itself or its `.date` shadow
    pub fn date_field_for(&self, fieldname: &str) -> Option<String> {
        if self.field_type(fieldname) == Some(FieldType::Date) {
            return Some(fieldname.to_string());
        }
        let shadow = format!("{}.date", fieldname);
        (self.field_type(&shadow) == Some(FieldType::Date)).then_some(shadow)
    }
}

/// Resolved owner of a field reference
#[derive(Debug, Clone)]
pub struct FieldOwner {
    pub link: LinkId,
    pub metadata: Rc<IndexMetadata>,
    /// Fieldname with any link qualifier removed
    pub field: String,
}

/// Per-compilation metadata cache in front of a [`SearchBackend`]
pub struct MetadataProvider<'b> {
    backend: &'b dyn SearchBackend,
    indices: AHashMap<String, Rc<IndexMetadata>>,
    analysis: LruCache<(String, String, String), Vec<String>>,
}

impl<'b> MetadataProvider<'b> {
    pub fn new(backend: &'b dyn SearchBackend, analysis_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(analysis_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            indices: AHashMap::new(),
            analysis: LruCache::new(capacity),
        }
    }

    pub fn backend(&self) -> &'b dyn SearchBackend {
        self.backend
    }

    /// Fetch (once) the metadata of an index
    pub fn metadata_for_index(&mut self, index: &str) -> Result<Rc<IndexMetadata>> {
        if let Some(md) = self.indices.get(index) {
            return Ok(Rc::clone(md));
        }
        trace!(index, "fetching mapping");
        let mapping = self.backend.get_mapping(index)?;
        let md = Rc::new(IndexMetadata::new(index, mapping));
        self.indices.insert(index.to_string(), Rc::clone(&md));
        Ok(md)
    }

    /// Find the link whose index owns `fieldname`.
    ///
    /// A leading segment naming a link wins; otherwise the first index in
    /// search order whose mapping has the field; otherwise the query's own
    /// index.
    pub fn metadata_for_field(&mut self, links: &LinkTable, fieldname: &str) -> Result<FieldOwner> {
        if let Some((prefix, rest)) = fieldname.split_once('.') {
            if let Some(link) = links.by_name(prefix) {
                let index = links.get(link).index_name.clone();
                if !links.get(link).is_this_index() {
                    let metadata = self.metadata_for_index(&index)?;
                    return Ok(FieldOwner {
                        link,
                        metadata,
                        field: rest.to_string(),
                    });
                }
            }
        }

        for link in links.search_order() {
            if links.get(link).is_this_index() {
                continue;
            }
            let index = links.get(link).index_name.clone();
            let metadata = self.metadata_for_index(&index)?;
            if metadata.has_field(fieldname) {
                return Ok(FieldOwner {
                    link,
                    metadata,
                    field: fieldname.to_string(),
                });
            }
        }

        let own = links.own();
        let index = links.get(own).index_name.clone();
        warn!(field = fieldname, index = %index, "field not found in any linked index, using own index");
        Ok(FieldOwner {
            link: own,
            metadata: self.metadata_for_index(&index)?,
            field: fieldname.to_string(),
        })
    }

    /// Tokens the field's search analyzer produces for `text`
    pub fn analyze(&mut self, index: &str, field: &str, text: &str) -> Result<Vec<String>> {
        let key = (index.to_string(), field.to_string(), text.to_string());
        if let Some(tokens) = self.analysis.get(&key) {
            return Ok(tokens.clone());
        }
        let tokens = self.backend.analyze(index, field, text)?;
        self.analysis.put(key, tokens.clone());
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::IndexLink;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn backend() -> MemoryBackend {
        MemoryBackend::from_json(json!({
            "indices": {
                "main": {
                    "mapping": {
                        "primary_key": "id",
                        "fields": {
                            "id": {"type": "long"},
                            "title": {"type": "text", "analyzer": "english"},
                            "created": {"type": "keyword"},
                            "created.date": {"type": "date"},
                            "comments": {"type": "nested"},
                            "comments.author": {"type": "keyword", "include_in_all": true},
                            "comments.replies": {"type": "nested"},
                            "comments.replies.text": {"type": "text"}
                        }
                    }
                },
                "books": {
                    "mapping": {
                        "fields": {
                            "id": {"type": "long"},
                            "isbn": {"type": "keyword"}
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_mapping_helpers() {
        let backend = backend();
        let mut provider = MetadataProvider::new(&backend, 8);
        let md = provider.metadata_for_index("main").unwrap();
        assert!(md.is_full_text("title"));
        assert!(!md.is_full_text("created"));
        assert_eq!(md.search_analyzer("comments.replies.text"), "standard");
        assert_eq!(md.nested_path_for("comments.replies.text").as_deref(), Some("comments.replies"));
        assert_eq!(md.nested_path_for("title"), None);
        assert_eq!(md.date_field_for("created").as_deref(), Some("created.date"));
        assert_eq!(md.catch_all_fields(), vec!["title", "comments.author"]);
    }

    #[test]
    fn test_metadata_is_cached() {
        let backend = backend();
        let mut provider = MetadataProvider::new(&backend, 8);
        let a = provider.metadata_for_index("main").unwrap();
        let b = provider.metadata_for_index("main").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(provider.metadata_for_index("missing").is_err());
    }

    #[test]
    fn test_field_ownership_order() {
        let backend = backend();
        let mut provider = MetadataProvider::new(&backend, 8);
        let mut links = LinkTable::new();
        let books = links.declare(IndexLink::new(Some("book".into()), "book_id", "books", "id"));
        let own = links.set_own("main", "id");

        // present in both: own index wins
        assert_eq!(provider.metadata_for_field(&links, "id").unwrap().link, own);
        // only in books
        assert_eq!(provider.metadata_for_field(&links, "isbn").unwrap().link, books);
        // alias qualifier
        let owner = provider.metadata_for_field(&links, "book.id").unwrap();
        assert_eq!(owner.link, books);
        assert_eq!(owner.field, "id");
        // unknown falls back to own
        assert_eq!(provider.metadata_for_field(&links, "nope").unwrap().link, own);
    }
}
