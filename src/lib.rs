//! # linkql - Cross-Index Query Compiler
//!
//! linkql turns a compact text query language into backend query documents
//! for a document-oriented search engine. A single query may reference
//! fields from several indices; declared links between indices are turned
//! into joins that run as sub-queries against the backend, so the final
//! document only touches the index the query is issued against.
//!
//! ## Architecture
//!
//! - [`query`] - Query text to AST
//! - [`ast`] - Arena AST, index links and directives
//! - [`optimizer`] - Structural passes (ownership, expansion injection, merging)
//! - [`resolver`] - Join execution through the [`backend`]
//! - [`emit`] - Query, aggregation and suggestion documents
//! - [`backend`] - The [`SearchBackend`] seam and an in-memory implementation
//! - [`compiler`] - The pipeline tying it together
//!
//! ## Quick Start
//!
//! ```ignore
//! use linkql::{MemoryBackend, QueryCompiler};
//! use std::path::Path;
//!
//! let backend = MemoryBackend::load(Path::new("fixture.json")).unwrap();
//! let compiler = QueryCompiler::new(&backend);
//! let compiled = compiler
//!     .compile("#options(book:(book_id=<books>id)) title:rust and tag:red", "main")
//!     .unwrap();
//!
//! println!("{}", compiled.query);
//! ```
//!
//! ## Joins
//!
//! A link `book:(book_id=<books>id)` says that `main.book_id` holds values of
//! `books.id`. Terms on `books` fields are grouped under one Expansion, the
//! Expansion body runs against `books`, and the distinct `id` values come
//! back as a `terms` filter on `book_id`. Links can chain through aliases
//! (`author:(book.author_id=<authors>id)`); multi-hop joins follow the
//! shortest path through the relationship graph.

pub mod ast;
pub mod backend;
pub mod compiler;
pub mod config;
pub mod emit;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod optimizer;
pub mod output;
pub mod query;
pub mod resolver;

pub use backend::{MemoryBackend, SearchBackend};
pub use compiler::{CompiledQuery, QueryCompiler};
pub use config::CompileOptions;
pub use error::{CompileError, Result};
pub use query::parse_query;
