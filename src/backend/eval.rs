//! Evaluates emitted query documents against JSON documents.
//!
//! Supports the query types the emitter produces plus `match` and
//! `match_none`. Text fields are compared token-wise using the field's search
//! analyzer, so `term` queries behave like they do against an inverted index.

use super::analyzer;
use crate::error::{CompileError, Result};
use crate::metadata::IndexMetadata;
use regex::Regex;
use serde_json::{Map, Value};

/// A matched token range inside one value of a multi-valued field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Span {
    value: usize,
    start: usize,
    end: usize,
}

/// Single-token matcher shared by term-level and span queries
enum TermPattern {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
    Fuzzy { value: String, distance: usize },
}

impl TermPattern {
    fn matches(&self, token: &str) -> bool {
        match self {
            TermPattern::Exact(v) => token == v || numeric_eq(token, v),
            TermPattern::Prefix(p) => token.starts_with(p.as_str()),
            TermPattern::Pattern(re) => re.is_match(token),
            TermPattern::Fuzzy { value, distance } => levenshtein(token, value) <= *distance,
        }
    }
}

/// Where field lookups start: the document, or the current nested element
#[derive(Clone)]
struct Scope<'d> {
    doc: &'d Value,
    nested: Option<(String, &'d Value)>,
}

/// Query evaluator bound to one index
pub struct Evaluator<'a> {
    metadata: &'a IndexMetadata,
}

impl<'a> Evaluator<'a> {
    pub fn new(metadata: &'a IndexMetadata) -> Self {
        Self { metadata }
    }

    /// Does `doc` match `query`?
    pub fn matches(&self, doc: &Value, query: &Value) -> Result<bool> {
        let scope = Scope { doc, nested: None };
        self.eval(&scope, query)
    }

    /// Raw values of a (possibly dotted) field in `doc`
    pub fn field_values<'d>(&self, doc: &'d Value, field: &str) -> Vec<&'d Value> {
        let scope = Scope { doc, nested: None };
        self.values(&scope, field)
    }

    fn eval(&self, scope: &Scope<'_>, query: &Value) -> Result<bool> {
        let (kind, body) = self.single_entry(query)?;

        match kind {
            "match_all" => Ok(true),
            "match_none" => Ok(false),
            "bool" => self.eval_bool(scope, body),
            "constant_score" => {
                let filter = body
                    .get("filter")
                    .ok_or_else(|| self.malformed("constant_score without filter"))?;
                self.eval(scope, filter)
            }
            "nested" => self.eval_nested(scope, body),
            "exists" => {
                let field = body
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.malformed("exists without field"))?;
                Ok(self
                    .values(scope, field)
                    .iter()
                    .any(|v| !v.is_null() && v.as_str() != Some("")))
            }
            "term" | "prefix" | "wildcard" | "regexp" | "fuzzy" => {
                let (field, pattern) = self.term_pattern(kind, body)?;
                Ok(self.any_token(scope, &field, |t| pattern.matches(t)))
            }
            "terms" => {
                let (field, values) = self.field_entry(body)?;
                let values = values
                    .as_array()
                    .ok_or_else(|| self.malformed("terms expects an array"))?;
                let patterns: Vec<TermPattern> = values
                    .iter()
                    .map(|v| TermPattern::Exact(value_text(v)))
                    .collect();
                Ok(self.any_token(scope, field, |t| patterns.iter().any(|p| p.matches(t))))
            }
            "range" => self.eval_range(scope, body),
            "match" => {
                let (field, spec) = self.field_entry(body)?;
                let text = spec.get("query").unwrap_or(spec);
                let wanted = self.analyze(field, &value_text(text));
                Ok(self.any_token(scope, field, |t| wanted.iter().any(|w| w == t)))
            }
            "match_phrase" => {
                let (field, spec) = self.field_entry(body)?;
                let text = spec.get("query").unwrap_or(spec);
                let wanted = self.analyze(field, &value_text(text));
                if wanted.is_empty() {
                    return Ok(false);
                }
                Ok(self
                    .token_streams(scope, field)
                    .iter()
                    .any(|tokens| tokens.windows(wanted.len()).any(|w| w == wanted.as_slice())))
            }
            "more_like_this" | "fuzzy_like_this" => self.eval_like_this(scope, kind, body),
            "span_near" | "span_term" | "span_or" | "span_multi" => {
                Ok(!self.spans(scope, query)?.is_empty())
            }
            "script" => Err(self.malformed("script queries cannot be evaluated in memory")),
            other => Err(self.malformed(format!("unsupported query type '{}'", other))),
        }
    }

    fn eval_bool(&self, scope: &Scope<'_>, body: &Value) -> Result<bool> {
        let must = clauses(body.get("must"));
        let filter = clauses(body.get("filter"));
        let should = clauses(body.get("should"));
        let must_not = clauses(body.get("must_not"));

        for q in must.iter().chain(filter.iter()) {
            if !self.eval(scope, q)? {
                return Ok(false);
            }
        }
        for q in &must_not {
            if self.eval(scope, q)? {
                return Ok(false);
            }
        }

        let required = match body.get("minimum_should_match") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(1) as usize,
            Some(Value::String(s)) => s.parse().unwrap_or(1),
            _ if must.is_empty() && filter.is_empty() && !should.is_empty() => 1,
            _ => 0,
        };
        if required == 0 {
            return Ok(true);
        }

        let mut matched = 0;
        for q in &should {
            if self.eval(scope, q)? {
                matched += 1;
                if matched >= required {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn eval_nested(&self, scope: &Scope<'_>, body: &Value) -> Result<bool> {
        let path = body
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| self.malformed("nested without path"))?;
        let query = body
            .get("query")
            .ok_or_else(|| self.malformed("nested without query"))?;

        for element in self.values(scope, path) {
            let inner = Scope {
                doc: scope.doc,
                nested: Some((path.to_string(), element)),
            };
            if self.eval(&inner, query)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn eval_range(&self, scope: &Scope<'_>, body: &Value) -> Result<bool> {
        let (field, bounds) = self.field_entry(body)?;
        let bounds = bounds
            .as_object()
            .ok_or_else(|| self.malformed("range expects an object"))?;

        Ok(self.values(scope, field).into_iter().any(|v| {
            let value = value_text(v);
            bounds.iter().all(|(op, bound)| {
                let ordering = compare(&value, &value_text(bound));
                match op.as_str() {
                    "gt" => ordering.is_gt(),
                    "gte" => ordering.is_ge(),
                    "lt" => ordering.is_lt(),
                    "lte" => ordering.is_le(),
                    _ => true,
                }
            })
        }))
    }

    fn eval_like_this(&self, scope: &Scope<'_>, kind: &str, body: &Value) -> Result<bool> {
        let like = body
            .get("like")
            .or_else(|| body.get("like_text"))
            .map(value_text)
            .ok_or_else(|| self.malformed(format!("{} without like text", kind)))?;
        let stop_words: Vec<String> = body
            .get("stop_words")
            .and_then(Value::as_array)
            .map(|a| a.iter().map(value_text).collect())
            .unwrap_or_default();
        let fields: Vec<String> = body
            .get("fields")
            .and_then(Value::as_array)
            .map(|a| a.iter().map(value_text).collect())
            .unwrap_or_default();

        for field in &fields {
            let wanted: Vec<String> = self
                .analyze(field, &like)
                .into_iter()
                .filter(|t| !stop_words.contains(t))
                .collect();
            let hit = self.any_token(scope, field, |t| {
                wanted.iter().any(|w| {
                    if kind == "fuzzy_like_this" {
                        levenshtein(t, w) <= auto_fuzziness(w)
                    } else {
                        t == w
                    }
                })
            });
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Matching spans of a span query
    fn spans(&self, scope: &Scope<'_>, query: &Value) -> Result<Vec<Span>> {
        let (kind, body) = self.single_entry(query)?;

        match kind {
            "span_term" => {
                let (field, pattern) = self.term_pattern("term", body)?;
                Ok(self.token_spans(scope, &field, &pattern))
            }
            "span_multi" => {
                let inner = body
                    .get("match")
                    .ok_or_else(|| self.malformed("span_multi without match"))?;
                let (kind, body) = self.single_entry(inner)?;
                let (field, pattern) = self.term_pattern(kind, body)?;
                Ok(self.token_spans(scope, &field, &pattern))
            }
            "span_or" => {
                let mut out = Vec::new();
                for clause in clauses(body.get("clauses")) {
                    out.extend(self.spans(scope, clause)?);
                }
                out.sort();
                out.dedup();
                Ok(out)
            }
            "span_near" => {
                let slop = body.get("slop").and_then(Value::as_u64).unwrap_or(0) as usize;
                let in_order = body.get("in_order").and_then(Value::as_bool).unwrap_or(false);
                let mut per_clause = Vec::new();
                for clause in clauses(body.get("clauses")) {
                    per_clause.push(self.spans(scope, clause)?);
                }
                let mut out = Vec::new();
                near(&per_clause, slop, in_order, &mut Vec::new(), &mut out);
                out.sort();
                out.dedup();
                Ok(out)
            }
            other => Err(self.malformed(format!("'{}' is not a span query", other))),
        }
    }

    fn token_spans(&self, scope: &Scope<'_>, field: &str, pattern: &TermPattern) -> Vec<Span> {
        let mut out = Vec::new();
        for (value, tokens) in self.token_streams(scope, field).iter().enumerate() {
            for (pos, token) in tokens.iter().enumerate() {
                if pattern.matches(token) {
                    out.push(Span {
                        value,
                        start: pos,
                        end: pos + 1,
                    });
                }
            }
        }
        out
    }

    fn term_pattern(&self, kind: &str, body: &Value) -> Result<(String, TermPattern)> {
        let (field, spec) = self.field_entry(body)?;
        let value = value_text(spec.get("value").unwrap_or(spec));

        let pattern = match kind {
            "term" => TermPattern::Exact(value),
            "prefix" => TermPattern::Prefix(value),
            "wildcard" => {
                let mut re = String::from("^");
                for ch in value.chars() {
                    match ch {
                        '*' => re.push_str(".*"),
                        '?' => re.push('.'),
                        c => re.push_str(&regex::escape(&c.to_string())),
                    }
                }
                re.push('$');
                TermPattern::Pattern(self.regex(&re)?)
            }
            "regexp" => TermPattern::Pattern(self.regex(&format!("^(?:{})$", value))?),
            "fuzzy" => {
                let distance = match spec.get("fuzziness") {
                    Some(Value::Number(n)) => n.as_u64().unwrap_or(2) as usize,
                    Some(Value::String(s)) => s.parse().unwrap_or_else(|_| auto_fuzziness(&value)),
                    _ => auto_fuzziness(&value),
                };
                TermPattern::Fuzzy { value, distance }
            }
            other => return Err(self.malformed(format!("'{}' is not a term query", other))),
        };
        Ok((field.to_string(), pattern))
    }

    fn regex(&self, pattern: &str) -> Result<Regex> {
        Regex::new(pattern).map_err(|e| self.malformed(format!("invalid regex: {}", e)))
    }

    fn any_token(&self, scope: &Scope<'_>, field: &str, pred: impl Fn(&str) -> bool) -> bool {
        self.token_streams(scope, field)
            .iter()
            .any(|tokens| tokens.iter().any(|t| pred(t)))
    }

    /// Analyzed tokens of each value of `field`
    fn token_streams(&self, scope: &Scope<'_>, field: &str) -> Vec<Vec<String>> {
        self.values(scope, field)
            .into_iter()
            .map(|v| match v {
                Value::String(s) => self.analyze(field, s),
                Value::Null => Vec::new(),
                other => vec![value_text(other)],
            })
            .collect()
    }

    fn analyze(&self, field: &str, text: &str) -> Vec<String> {
        analyzer::analyze(self.metadata.search_analyzer(field), text)
    }

    fn values<'d>(&self, scope: &Scope<'d>, field: &str) -> Vec<&'d Value> {
        let mut out = Vec::new();
        if let Some((path, element)) = &scope.nested {
            if let Some(rest) = field.strip_prefix(path.as_str()).and_then(|r| r.strip_prefix('.')) {
                lookup(*element, rest, &mut out);
                return out;
            }
        }
        lookup(scope.doc, field, &mut out);
        if out.is_empty() {
            // `field.date` shadows are indexed from the base field
            if let Some(base) = field.strip_suffix(".date") {
                lookup(scope.doc, base, &mut out);
            }
        }
        out
    }

    /// Split `{"kind": body}`
    fn single_entry<'q>(&self, query: &'q Value) -> Result<(&'q str, &'q Value)> {
        query
            .as_object()
            .and_then(|m| m.iter().next())
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| self.malformed(format!("expected a query object, got {}", query)))
    }

    /// Split `{"field": spec}`, ignoring `boost`
    fn field_entry<'q>(&self, body: &'q Value) -> Result<(&'q str, &'q Value)> {
        body.as_object()
            .and_then(|m| m.iter().find(|(k, _)| k.as_str() != "boost"))
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| self.malformed(format!("expected a field object, got {}", body)))
    }

    fn malformed(&self, message: impl Into<String>) -> CompileError {
        CompileError::backend(self.metadata.name(), message)
    }
}

/// Collect span combinations satisfying a span_near
fn near(per_clause: &[Vec<Span>], slop: usize, in_order: bool, chosen: &mut Vec<Span>, out: &mut Vec<Span>) {
    if chosen.len() == per_clause.len() {
        if chosen.is_empty() {
            return;
        }
        let mut sorted = chosen.clone();
        sorted.sort();
        let start = sorted[0].start;
        let end = sorted.iter().map(|s| s.end).max().unwrap_or(start);
        let covered: usize = sorted.iter().map(|s| s.end - s.start).sum();
        let overlapping = sorted.windows(2).any(|w| w[1].start < w[0].end);
        if !overlapping && end - start <= covered + slop {
            out.push(Span {
                value: sorted[0].value,
                start,
                end,
            });
        }
        return;
    }

    for span in &per_clause[chosen.len()] {
        if let Some(prev) = chosen.last() {
            if span.value != prev.value || (in_order && span.start < prev.end) {
                continue;
            }
        }
        chosen.push(*span);
        near(per_clause, slop, in_order, chosen, out);
        chosen.pop();
    }
}

fn lookup<'d>(value: &'d Value, path: &str, out: &mut Vec<&'d Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                lookup(item, path, out);
            }
        }
        Value::Object(map) => lookup_object(map, path, out),
        _ => {}
    }
}

fn lookup_object<'d>(map: &'d Map<String, Value>, path: &str, out: &mut Vec<&'d Value>) {
    if let Some(v) = map.get(path) {
        push_flat(v, out);
        return;
    }
    if let Some((head, rest)) = path.split_once('.') {
        if let Some(v) = map.get(head) {
            lookup(v, rest, out);
        }
    }
}

fn push_flat<'d>(value: &'d Value, out: &mut Vec<&'d Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| push_flat(v, out)),
        v => out.push(v),
    }
}

fn clauses(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(v @ Value::Object(_)) => vec![v],
        _ => Vec::new(),
    }
}

/// Plain string form of a scalar
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn numeric_eq(a: &str, b: &str) -> bool {
    matches!((a.parse::<f64>(), b.parse::<f64>()), (Ok(x), Ok(y)) if x == y)
}

/// Numeric comparison when both sides are numbers, else lexicographic
fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

fn auto_fuzziness(term: &str) -> usize {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { prev } else { prev + 1 };
            prev = row[j + 1];
            row[j + 1] = cost.min(row[j] + 1).min(prev + 1);
        }
    }
    row[b.len()]
}
