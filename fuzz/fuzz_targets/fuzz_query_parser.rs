#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Arbitrary text must parse or fail with an error, never panic
    if let Ok(ast) = linkql::query::parse_query(data) {
        let _ = ast.dump();
    }
});
