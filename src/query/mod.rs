//! Query text to AST.

pub mod parser;

pub use parser::{parse_query, CATCH_ALL_FIELD};
