//! Shared fixture for integration tests: three linked indices.
//!
//! `main.book_id` references `books.id`, `books.author_id` references
//! `authors.id`.

#![allow(dead_code)]

use linkql::{CompileOptions, CompiledQuery, MemoryBackend, QueryCompiler};
use serde_json::{json, Value};

pub const LINKS: &str = "#options(book:(book_id=<books>id), author:(book.author_id=<authors>id))";

pub fn library_json() -> Value {
    json!({
        "indices": {
            "main": {
                "mapping": {"primary_key": "id", "fields": {
                    "id": {"type": "long"},
                    "book_id": {"type": "long"},
                    "name": {"type": "text", "analyzer": "standard"},
                    "body": {"type": "text", "analyzer": "english"},
                    "tag": {"type": "keyword"},
                    "comments": {"type": "nested"},
                    "comments.author": {"type": "keyword"},
                    "comments.text": {"type": "text"},
                    "outside": {"type": "object"},
                    "outside.inside": {"type": "keyword"}
                }},
                "documents": [
                    {"id": 1, "book_id": 10, "name": "Ann Smith", "body": "The dogs bark", "tag": "red",
                     "comments": [{"author": "bob", "text": "great read"}]},
                    {"id": 2, "book_id": 20, "name": "Bob Jones", "body": "Cats sleep", "tag": "blue",
                     "comments": [{"author": "ann", "text": "dull"}, {"author": "bob", "text": "dull too"}]},
                    {"id": 3, "book_id": 10, "name": "Cy Young", "body": "A c-note found", "tag": "red"},
                    {"id": 4, "book_id": 30, "name": "Di Prince", "body": "Nothing here", "tag": "green"}
                ]
            },
            "books": {
                "mapping": {"primary_key": "id", "fields": {
                    "id": {"type": "long"},
                    "author_id": {"type": "long"},
                    "title": {"type": "text", "analyzer": "english"},
                    "isbn": {"type": "keyword"}
                }},
                "documents": [
                    {"id": 10, "author_id": 100, "title": "Rust in Action", "isbn": "A1"},
                    {"id": 20, "author_id": 200, "title": "Dogs of War", "isbn": "B2"},
                    {"id": 30, "author_id": 200, "title": "The Day of the Jackal", "isbn": "C3"}
                ]
            },
            "authors": {
                "mapping": {"primary_key": "id", "fields": {
                    "id": {"type": "long"},
                    "author_name": {"type": "text"}
                }},
                "documents": [
                    {"id": 100, "author_name": "Tim McNamara"},
                    {"id": 200, "author_name": "Frederick Forsyth"}
                ]
            }
        }
    })
}

pub fn library() -> MemoryBackend {
    MemoryBackend::from_json(library_json()).expect("fixture is valid")
}

pub fn compile(query: &str) -> linkql::Result<CompiledQuery> {
    let backend = library();
    QueryCompiler::new(&backend).compile(query, "main")
}

pub fn compile_with(query: &str, options: CompileOptions) -> linkql::Result<CompiledQuery> {
    let backend = library();
    QueryCompiler::with_options(&backend, options).compile(query, "main")
}

/// Primary keys of the search-index documents the compiled query matches
pub fn matching(query: &str) -> Vec<String> {
    let backend = library();
    let compiled = QueryCompiler::new(&backend)
        .compile(query, "main")
        .expect("query compiles");
    backend
        .primary_keys(&compiled.search_index, &compiled.query)
        .expect("query evaluates")
}
