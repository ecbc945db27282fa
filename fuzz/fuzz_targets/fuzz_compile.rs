#![no_main]

use libfuzzer_sys::fuzz_target;
use linkql::{MemoryBackend, QueryCompiler};
use serde_json::json;

thread_local! {
    static BACKEND: MemoryBackend = fixture();
}

fn fixture() -> MemoryBackend {
    MemoryBackend::from_json(json!({
        "indices": {
            "main": {"mapping": {"primary_key": "id", "fields": {
                "id": {"type": "long"},
                "book_id": {"type": "long"},
                "name": {"type": "text"},
                "tag": {"type": "keyword"},
                "comments": {"type": "nested"},
                "comments.author": {"type": "keyword"}
            }}, "documents": [{"id": 1, "book_id": 10, "name": "Ann", "tag": "red"}]},
            "books": {"mapping": {"primary_key": "id", "fields": {
                "id": {"type": "long"},
                "title": {"type": "text", "analyzer": "english"}
            }}, "documents": [{"id": 10, "title": "Rust"}]}
        }
    }))
    .expect("fuzz fixture is valid")
}

fuzz_target!(|data: &str| {
    // The full pipeline either compiles or returns a typed error
    let query = format!("#options(book:(book_id=<books>id)) {}", data);
    BACKEND.with(|backend| {
        let _ = QueryCompiler::new(backend).compile(&query, "main");
    });
});
