//! Side tables attached to a query: aggregations, suggestions and paging hints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bucket ordering for tally aggregations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TallyOrder {
    Term,
    #[default]
    Count,
    ReverseTerm,
    ReverseCount,
}

impl TallyOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "term" => Some(TallyOrder::Term),
            "count" => Some(TallyOrder::Count),
            "reverse_term" => Some(TallyOrder::ReverseTerm),
            "reverse_count" => Some(TallyOrder::ReverseCount),
            _ => None,
        }
    }
}

/// Aggregation kind requested by a directive
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateKind {
    /// `#tally(field, stem, max_terms, order)`; a date interval as stem
    /// produces a date histogram on date fields
    Tally {
        stem: Option<String>,
        size: u32,
        order: TallyOrder,
    },
    /// `#range(field, '[{"to": 10}, {"from": 10}]')`
    Range { ranges: Value },
    /// `#significant_terms(field, stem, max_terms)`
    SignificantTerms { stem: Option<String>, size: u32 },
    /// `#extended_stats(field)`
    ExtendedStats,
}

/// An aggregation request, optionally with a nested sub-aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub kind: AggregateKind,
    pub fieldname: String,
    pub sub: Option<Box<Aggregate>>,
}

impl Aggregate {
    pub fn name(&self) -> &'static str {
        match self.kind {
            AggregateKind::Tally { .. } => "tally",
            AggregateKind::Range { .. } => "range",
            AggregateKind::SignificantTerms { .. } => "significant_terms",
            AggregateKind::ExtendedStats => "extended_stats",
        }
    }
}

/// `#suggest(field, 'text', size)` term suggestion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggest {
    pub fieldname: String,
    pub text: String,
    pub size: u32,
}

/// `#limit(field asc, offset, size)` sort and paging hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub sort_field: Option<String>,
    pub ascending: bool,
    pub offset: u64,
    pub size: u64,
}
