//! Aggregation documents for `#tally`, `#range`, `#significant_terms` and
//! `#extended_stats`.
//!
//! An aggregate on a nested field is wrapped as
//! `nested(path) -> filter(query restricted to path) -> {field, missing}` so
//! buckets only count nested documents that satisfy the query.

use super::{EmitCtx, Emitter};
use crate::ast::{Aggregate, AggregateKind, TallyOrder};
use crate::error::Result;
use crate::metadata::IndexMetadata;
use serde_json::{json, Value};

/// Terms size used when the query asks for every bucket
const UNBOUNDED_SIZE: u32 = i32::MAX as u32;

const DATE_INTERVALS: &[&str] = &[
    "year", "quarter", "month", "week", "day", "hour", "minute", "second",
];

impl Emitter<'_, '_> {
    pub(super) fn emit_aggregate(&mut self, aggregate: &Aggregate) -> Result<(Value, bool)> {
        let owner = self
            .session
            .metadata
            .metadata_for_field(&self.ast.links, &aggregate.fieldname)?;
        let field = owner.field.clone();
        let body = self.aggregate_body(aggregate, &owner.metadata, &field)?;

        let Some(path) = owner.metadata.nested_path_for(&field) else {
            return Ok((json!({ field: body }), false));
        };

        let ctx = EmitCtx {
            nested: Some(path.clone()),
            aggregation: true,
        };
        let filter = self.emit(self.ast.root(), &ctx)?;
        let wrapped = json!({ field.as_str(): {
            "nested": {"path": path},
            "aggs": {
                "filter": {
                    "filter": filter,
                    "aggs": {
                        field.as_str(): body,
                        "missing": {"missing": {"field": field.as_str()}},
                    }
                }
            }
        }});
        Ok((wrapped, true))
    }

    fn aggregate_body(&mut self, aggregate: &Aggregate, metadata: &IndexMetadata, field: &str) -> Result<Value> {
        let mut body = match &aggregate.kind {
            AggregateKind::Tally { stem, size, order } => {
                let date_field = stem
                    .as_deref()
                    .filter(|s| is_date_interval(s))
                    .and(metadata.date_field_for(field));
                match (date_field, stem) {
                    (Some(date_field), Some(interval)) => json!({"date_histogram": {
                        "field": date_field,
                        "interval": interval,
                        "order": order_spec(*order),
                    }}),
                    _ => {
                        let mut terms = json!({
                            "field": field,
                            "size": bucket_size(*size),
                            "order": order_spec(*order),
                        });
                        if let Some(include) = include_pattern(stem.as_deref()) {
                            terms["include"] = json!(include);
                        }
                        json!({ "terms": terms })
                    }
                }
            }
            AggregateKind::Range { ranges } => match metadata.date_field_for(field) {
                Some(date_field) => json!({"date_range": {"field": date_field, "ranges": ranges}}),
                None => json!({"range": {"field": field, "ranges": ranges}}),
            },
            AggregateKind::SignificantTerms { stem, size } => {
                let mut terms = json!({"field": field, "size": bucket_size(*size)});
                if let Some(include) = include_pattern(stem.as_deref()) {
                    terms["include"] = json!(include);
                }
                json!({ "significant_terms": terms })
            }
            AggregateKind::ExtendedStats => json!({"extended_stats": {"field": field}}),
        };

        if let Some(sub) = &aggregate.sub {
            let owner = self
                .session
                .metadata
                .metadata_for_field(&self.ast.links, &sub.fieldname)?;
            let sub_body = self.aggregate_body(sub, &owner.metadata, &owner.field)?;
            body["aggs"] = json!({ owner.field: sub_body });
        }
        Ok(body)
    }
}

fn bucket_size(size: u32) -> u32 {
    if size == 0 {
        UNBOUNDED_SIZE
    } else {
        size
    }
}

fn order_spec(order: TallyOrder) -> Value {
    match order {
        TallyOrder::Term => json!({"_key": "asc"}),
        TallyOrder::ReverseTerm => json!({"_key": "desc"}),
        TallyOrder::Count => json!({"_count": "desc"}),
        TallyOrder::ReverseCount => json!({"_count": "asc"}),
    }
}

/// Bucket filter from a tally stem; `^.*` keeps every bucket
fn include_pattern(stem: Option<&str>) -> Option<&str> {
    match stem {
        None | Some("^.*") => None,
        Some(stem) => Some(stem.strip_prefix('^').unwrap_or(stem)),
    }
}

/// `month`, `week`, or a fixed interval such as `30m` / `1d`
fn is_date_interval(stem: &str) -> bool {
    if DATE_INTERVALS.contains(&stem) {
        return true;
    }
    let digits = stem.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && matches!(&stem[digits..], "ms" | "s" | "m" | "h" | "d" | "w" | "M" | "q" | "y")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::CompileOptions;
    use crate::emit::emit_aggregate;
    use crate::optimizer::links::expand_all_and_assign_links;
    use crate::optimizer::Session;
    use crate::query::parse_query;

    fn backend() -> MemoryBackend {
        MemoryBackend::from_json(json!({
            "indices": {"main": {"mapping": {"fields": {
                "id": {"type": "long"},
                "tag": {"type": "keyword"},
                "created": {"type": "date"},
                "price": {"type": "double"},
                "comments": {"type": "nested"},
                "comments.author": {"type": "keyword"}
            }}}}
        }))
        .unwrap()
    }

    fn aggregate(query: &str) -> (Value, bool) {
        let backend = backend();
        let options = CompileOptions::default();
        let mut session = Session::new(&backend, &options);
        let mut ast = parse_query(query).unwrap();
        ast.links.set_own("main", "id");
        let ast = expand_all_and_assign_links(ast, &mut session).unwrap();
        let agg = ast.aggregate.clone().unwrap();
        emit_aggregate(&ast, &agg, &mut session).unwrap()
    }

    #[test]
    fn test_tally_terms() {
        let (agg, nested) = aggregate("#tally(tag, '^r.*', 0, term) id:1");
        assert!(!nested);
        assert_eq!(
            agg,
            json!({"tag": {"terms": {
                "field": "tag",
                "size": 2147483647,
                "order": {"_key": "asc"},
                "include": "r.*"
            }}})
        );
        let (agg, _) = aggregate("#tally(tag, '^.*', 5, reverse_count) id:1");
        assert_eq!(
            agg,
            json!({"tag": {"terms": {"field": "tag", "size": 5, "order": {"_count": "asc"}}}})
        );
    }

    #[test]
    fn test_tally_date_histogram() {
        let (agg, _) = aggregate("#tally(created, month, 0, term) id:1");
        assert_eq!(
            agg,
            json!({"created": {"date_histogram": {
                "field": "created",
                "interval": "month",
                "order": {"_key": "asc"}
            }}})
        );
    }

    #[test]
    fn test_range_and_stats() {
        let (agg, _) = aggregate(r#"#range(price, '[{"to": 10}, {"from": 10}]') id:1"#);
        assert_eq!(
            agg,
            json!({"price": {"range": {"field": "price", "ranges": [{"to": 10}, {"from": 10}]}}})
        );
        let (agg, _) = aggregate("#extended_stats(price) id:1");
        assert_eq!(agg, json!({"price": {"extended_stats": {"field": "price"}}}));
    }

    #[test]
    fn test_nested_aggregate_filters_and_counts_missing() {
        let (agg, nested) = aggregate("#tally(comments.author, '^.*', 10, count) comments.author:bob and tag:red");
        assert!(nested);
        assert_eq!(
            agg,
            json!({"comments.author": {
                "nested": {"path": "comments"},
                "aggs": {"filter": {
                    "filter": {"bool": {"must": [
                        {"term": {"comments.author": "bob"}},
                        {"match_all": {}}
                    ]}},
                    "aggs": {
                        "comments.author": {"terms": {
                            "field": "comments.author",
                            "size": 10,
                            "order": {"_count": "desc"}
                        }},
                        "missing": {"missing": {"field": "comments.author"}}
                    }
                }}
            }})
        );
    }

    #[test]
    fn test_date_interval_detection() {
        assert!(is_date_interval("week"));
        assert!(is_date_interval("30m"));
        assert!(!is_date_interval("^a.*"));
        assert!(!is_date_interval("m"));
    }
}
