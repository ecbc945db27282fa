//! Search backend seam.
//!
//! The compiler needs four things from a search cluster: index mappings,
//! hit counts, distinct field values, and analyzer output. [`SearchBackend`]
//! is that surface; [`MemoryBackend`] implements it over JSON fixtures.

pub mod analyzer;
pub mod eval;
pub mod memory;

pub use memory::MemoryBackend;

use crate::error::Result;
use crate::metadata::Mapping;
use serde_json::Value;

/// Calls the compiler makes against the search cluster.
///
/// Every call is synchronous; any error aborts the compilation.
pub trait SearchBackend {
    /// Mapping of `index`; unknown indices are [`CompileError::UnknownIndex`](crate::CompileError::UnknownIndex)
    fn get_mapping(&self, index: &str) -> Result<Mapping>;

    /// Number of documents in `index` matching `query`
    fn execute_count(&self, index: &str, query: &Value) -> Result<u64>;

    /// Distinct values of `field` over documents matching `query`, most
    /// frequent first, at most `size` of them when bounded
    fn execute_terms_aggregation(
        &self,
        index: &str,
        query: &Value,
        field: &str,
        size: Option<usize>,
    ) -> Result<Vec<String>>;

    /// Tokens the search analyzer of `field` produces for `text`
    fn analyze(&self, index: &str, field: &str, text: &str) -> Result<Vec<String>>;
}
