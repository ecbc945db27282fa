use crate::ast::Operator;
use thiserror::Error;

/// Every user-triggerable way a compilation can fail.
///
/// A compilation either succeeds completely or returns one of these; there is
/// no partially compiled output.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Invalid directive #{directive}: {message}")]
    InvalidDirective { directive: String, message: String },

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("No relationship path from index '{from}' to index '{to}'")]
    NoRelationshipPath { from: String, to: String },

    #[error("Cannot determine field equivalency along path {path}")]
    FieldEquivalencyUndetermined { path: String },

    #[error("Proximity chain mixes fieldnames: {}", fieldnames.join(", "))]
    MixedFieldnamesInProximity { fieldnames: Vec<String> },

    #[error("Inconsistent nested path: expected '{expected}', found '{found}'")]
    InconsistentNestedPath { expected: String, found: String },

    #[error("Operator {operator} is not supported for {node}")]
    UnsupportedOperator { operator: Operator, node: String },

    #[error("Backend unavailable for index '{index}': {message}")]
    BackendUnavailable { index: String, message: String },
}

impl CompileError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        CompileError::Parse {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn directive(directive: &str, message: impl Into<String>) -> Self {
        CompileError::InvalidDirective {
            directive: directive.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn backend(index: &str, message: impl Into<String>) -> Self {
        CompileError::BackendUnavailable {
            index: index.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
