use crate::ast::{
    Aggregate, AggregateKind, Ast, Expansion, IndexLink, Limit, Node, NodeId, NodeKind, Operator,
    Suggest, TallyOrder,
};
use crate::error::{CompileError, Result};
use serde_json::Value;

/// Pseudo-field meaning "every content-bearing field"
pub const CATCH_ALL_FIELD: &str = "_all";

/// Comparison operators, longest spelling first so prefixes don't shadow them
const OPERATORS: &[(&str, Operator)] = &[
    (":@~", Operator::FuzzyConcept),
    (":@", Operator::Concept),
    (":~", Operator::Regex),
    ("<>", Operator::Ne),
    ("!=", Operator::Ne),
    ("<=", Operator::Lte),
    (">=", Operator::Gte),
    (":", Operator::Contains),
    ("=", Operator::Eq),
    ("<", Operator::Lt),
    (">", Operator::Gt),
];

/// Parse a query string into an [`Ast`]
pub fn parse_query(input: &str) -> Result<Ast> {
    let mut parser = QueryParser::new(input);
    parser.parse()
}

/// Directive argument
#[derive(Debug)]
enum Arg {
    Bare(String),
    Quoted(String),
    Aggregate(Aggregate),
}

impl Arg {
    fn text(&self) -> Option<&str> {
        match self {
            Arg::Bare(s) | Arg::Quoted(s) => Some(s),
            Arg::Aggregate(_) => None,
        }
    }
}

/// Query parser
struct QueryParser<'a> {
    input: &'a str,
    pos: usize,
    ast: Ast,
    /// Field and operator inherited by unqualified leaves, innermost last
    scopes: Vec<(String, Operator)>,
    /// Leaves written with their own fieldname
    explicit: Vec<NodeId>,
}

impl<'a> QueryParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            ast: Ast::new(),
            scopes: Vec::new(),
            explicit: Vec::new(),
        }
    }

    fn parse(&mut self) -> Result<Ast> {
        let root = self.parse_or()?;
        self.skip_whitespace();
        if !self.is_eof() {
            return Err(self.error(format!(
                "unexpected '{}'",
                self.peek_char().unwrap_or_default()
            )));
        }
        if let Some(root) = root {
            self.ast.set_root(root);
        }
        Ok(std::mem::take(&mut self.ast))
    }

    fn parse_or(&mut self) -> Result<Option<NodeId>> {
        let mut nodes = Vec::new();
        nodes.extend(self.parse_and()?);

        loop {
            self.skip_whitespace();
            if self.consume_keyword("or") || self.consume_char('|') || self.consume_char(',') {
                nodes.extend(self.parse_and()?);
            } else {
                break;
            }
        }

        Ok(self.combine(NodeKind::Or, nodes))
    }

    fn parse_and(&mut self) -> Result<Option<NodeId>> {
        let mut nodes = Vec::new();

        loop {
            self.skip_whitespace();

            if self.is_eof()
                || matches!(self.peek_char(), Some(')' | ']' | '|' | ','))
                || self.at_keyword("or")
                || self.remaining().starts_with("#filter")
            {
                break;
            }

            if self.consume_keyword("and") || self.consume_char('&') {
                continue;
            }

            nodes.extend(self.parse_not()?);
        }

        Ok(self.combine(NodeKind::And, nodes))
    }

    fn parse_not(&mut self) -> Result<Option<NodeId>> {
        self.skip_whitespace();
        if self.consume_keyword("not") || self.consume_char('!') {
            let start = self.pos;
            let inner = self
                .parse_not()?
                .ok_or_else(|| CompileError::parse(start, "expected a query after 'not'"))?;
            let not = self.ast.new_node(NodeKind::Not);
            self.ast.add_child(not, inner);
            return Ok(Some(not));
        }
        self.parse_with()
    }

    fn parse_with(&mut self) -> Result<Option<NodeId>> {
        let mut nodes = Vec::new();
        nodes.extend(self.parse_proximity()?);

        loop {
            self.skip_whitespace();
            if !self.consume_keyword("with") {
                break;
            }
            let start = self.pos;
            let next = self
                .parse_proximity()?
                .ok_or_else(|| CompileError::parse(start, "expected a query after 'with'"))?;
            nodes.push(next);
        }

        Ok(self.combine(NodeKind::With, nodes))
    }

    fn parse_proximity(&mut self) -> Result<Option<NodeId>> {
        let Some(first) = self.parse_primary()? else {
            return Ok(None);
        };

        let mut current = first;
        let mut current_op: Option<(u32, bool)> = None;

        loop {
            self.skip_whitespace();
            let Some((distance, ordered)) = self.consume_proximity_operator() else {
                break;
            };
            let start = self.pos;
            let next = self
                .parse_primary()?
                .ok_or_else(|| CompileError::parse(start, "expected a term after proximity operator"))?;

            if current_op == Some((distance, ordered)) {
                self.ast.add_child(current, next);
            } else {
                let prox = self
                    .ast
                    .new_node(NodeKind::Proximity { distance, ordered });
                self.ast.add_child(prox, current);
                self.ast.add_child(prox, next);
                current = prox;
                current_op = Some((distance, ordered));
            }
        }

        Ok(Some(current))
    }

    fn parse_primary(&mut self) -> Result<Option<NodeId>> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.advance();
                let node = self.parse_or()?;
                self.expect_char(')')?;
                if let Some(node) = node {
                    self.parse_boost(node)?;
                }
                Ok(node)
            }
            Some('#') => self.parse_directive(),
            Some('{') => self.parse_json().map(Some),
            Some('$') if self.remaining().starts_with("$$") => self.parse_script().map(Some),
            Some(_) => self.parse_term(),
            None => Ok(None),
        }
    }

    fn parse_term(&mut self) -> Result<Option<NodeId>> {
        match self.try_field_operator() {
            Some((field, op)) => self.parse_value(Some(field), op),
            None => self.parse_value(None, Operator::Contains),
        }
    }

    /// Consume `field<op>` if the cursor is at one
    fn try_field_operator(&mut self) -> Option<(String, Operator)> {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        let end = self.pos;
        if end > start {
            self.skip_whitespace();
            for (symbol, op) in OPERATORS {
                if self.remaining().starts_with(symbol) {
                    self.pos += symbol.len();
                    return Some((self.input[start..end].to_string(), *op));
                }
            }
        }
        self.pos = start;
        None
    }

    fn parse_value(&mut self, field: Option<String>, op: Operator) -> Result<Option<NodeId>> {
        self.skip_whitespace();

        let explicit = field.is_some();
        let (fieldname, op) = match field {
            Some(f) => (f, op),
            None => self
                .scopes
                .last()
                .cloned()
                .unwrap_or_else(|| (CATCH_ALL_FIELD.to_string(), Operator::Contains)),
        };

        let node = match self.peek_char() {
            Some('(') if explicit => return self.parse_field_group(fieldname, op),
            Some('[') if self.remaining().starts_with("[[") => {
                self.parse_external_array(&fieldname, op, false)?
            }
            Some('&') if self.remaining().starts_with("&[[") => {
                self.advance();
                self.parse_external_array(&fieldname, op, true)?
            }
            Some('&') if self.remaining().starts_with("&[") => {
                self.advance();
                self.parse_array(&fieldname, op, true)?
            }
            Some('[') => self.parse_array(&fieldname, op, false)?,
            Some('"') | Some('\'') => {
                let text = self.parse_quoted()?;
                self.alloc_leaf(NodeKind::Phrase(text), &fieldname, op)
            }
            _ => {
                let (kind, op) = self.parse_bare_value(op)?;
                self.alloc_leaf(kind, &fieldname, op)
            }
        };

        if explicit {
            self.explicit.push(node);
        }
        self.parse_boost(node)?;
        Ok(Some(node))
    }

    /// `field:( ... )`: unqualified leaves inherit `field`; qualified ones
    /// become `field.sub` paths inside a NestedGroup
    fn parse_field_group(&mut self, fieldname: String, op: Operator) -> Result<Option<NodeId>> {
        self.expect_char('(')?;
        self.scopes.push((fieldname.clone(), op));
        let mark = self.explicit.len();
        let inner = self.parse_or();
        self.scopes.pop();
        let inner = inner?;
        self.expect_char(')')?;

        let nested: Vec<NodeId> = self.explicit.drain(mark..).collect();
        let Some(mut inner) = inner else {
            return Ok(None);
        };

        if !nested.is_empty() {
            for id in nested {
                for n in self.ast.descendants(id) {
                    let node = self.ast.node_mut(n);
                    if let Some(sub) = &node.fieldname {
                        node.fieldname = Some(format!("{}.{}", fieldname, sub));
                    }
                }
            }
            let group = self.ast.new_node(NodeKind::NestedGroup {
                path: fieldname.clone(),
            });
            self.ast.add_child(group, inner);
            inner = group;
        }

        let leaves = self.ast.leaves(inner);
        self.explicit.extend(leaves);
        self.parse_boost(inner)?;
        Ok(Some(inner))
    }

    fn parse_array(&mut self, fieldname: &str, op: Operator, and: bool) -> Result<NodeId> {
        self.expect_char('[')?;
        let array = self.ast.alloc(
            Node::new(NodeKind::Array {
                and,
                external: None,
            })
            .with_field(fieldname, op),
        );

        loop {
            self.skip_whitespace();
            if self.consume_char(']') {
                break;
            }
            if self.consume_char(',') {
                continue;
            }
            if self.is_eof() {
                return Err(self.error("unterminated array"));
            }
            let child = if matches!(self.peek_char(), Some('"' | '\'')) {
                let text = self.parse_quoted()?;
                self.alloc_leaf(NodeKind::Phrase(text), fieldname, op)
            } else {
                let (kind, child_op) = self.parse_bare_value(op)?;
                self.alloc_leaf(kind, fieldname, child_op)
            };
            self.ast.add_child(array, child);
        }

        Ok(array)
    }

    fn parse_external_array(&mut self, fieldname: &str, op: Operator, and: bool) -> Result<NodeId> {
        let start = self.pos;
        self.pos += 2;
        let end = self.remaining().find("]]").ok_or_else(|| {
            CompileError::parse(start, "unterminated external array")
        })?;
        let body = &self.remaining()[..end];
        let values: Vec<String> = body
            .split(',')
            .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|v| !v.is_empty())
            .collect();
        self.pos += end + 2;

        Ok(self.ast.alloc(
            Node::new(NodeKind::Array {
                and,
                external: Some(values),
            })
            .with_field(fieldname, op),
        ))
    }

    /// Read an unquoted value and classify it
    fn parse_bare_value(&mut self, op: Operator) -> Result<(NodeKind, Operator)> {
        let start = self.pos;
        let mut value = String::new();
        let mut wildcards = Vec::new();

        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | '[' | ']' | ',' | '"' | '^') {
                break;
            }
            self.advance();
            if ch == '\\' {
                if let Some(escaped) = self.peek_char() {
                    self.advance();
                    value.push(escaped);
                }
                continue;
            }
            if ch == '*' || ch == '?' {
                wildcards.push(value.len());
            }
            value.push(ch);
        }

        if value.is_empty() {
            return Err(CompileError::parse(start, "expected a value"));
        }
        if op.skips_analysis() {
            return Ok((NodeKind::Word(value), op));
        }

        // Fuzzy suffix: foo~ or foo~2
        if let Some(tilde) = value.rfind('~') {
            let digits = &value[tilde + 1..];
            if tilde > 0 && digits.chars().all(|c| c.is_ascii_digit()) {
                let distance = digits.parse().unwrap_or(2);
                return Ok((
                    NodeKind::Fuzzy {
                        value: value[..tilde].to_string(),
                        distance,
                    },
                    op,
                ));
            }
        }

        let kind = if value.eq_ignore_ascii_case("null") {
            return Ok(if op == Operator::Ne {
                (NodeKind::NotNull, Operator::Eq)
            } else {
                (NodeKind::Null, Operator::Eq)
            });
        } else if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
            NodeKind::Boolean(value.eq_ignore_ascii_case("true"))
        } else if is_number(&value) {
            NodeKind::Number(value)
        } else if wildcards.len() == 1 && wildcards[0] == value.len() - 1 && value.ends_with('*') && value.len() > 1 {
            value.pop();
            NodeKind::Prefix(value)
        } else if !wildcards.is_empty() {
            NodeKind::Wildcard(value)
        } else {
            NodeKind::Word(value)
        };

        Ok((kind, op))
    }

    fn parse_quoted(&mut self) -> Result<String> {
        let start = self.pos;
        let quote = self.peek_char().unwrap_or('"');
        self.advance();
        let mut text = String::new();

        loop {
            match self.peek_char() {
                None => return Err(CompileError::parse(start, "unterminated quoted string")),
                Some(ch) if ch == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    if let Some(escaped) = self.peek_char() {
                        self.advance();
                        text.push(escaped);
                    }
                }
                Some(ch) => {
                    self.advance();
                    text.push(ch);
                }
            }
        }

        Ok(text)
    }

    fn parse_boost(&mut self, node: NodeId) -> Result<()> {
        if !self.consume_char('^') {
            return Ok(());
        }
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        let boost = self.input[start..self.pos]
            .parse::<f32>()
            .map_err(|_| CompileError::parse(start, "invalid boost"))?;
        self.ast.node_mut(node).boost = Some(boost);
        Ok(())
    }

    fn parse_json(&mut self) -> Result<NodeId> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        while let Some(ch) = self.peek_char() {
            self.advance();
            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }

        if depth != 0 {
            return Err(CompileError::parse(start, "unterminated query document"));
        }
        let value: Value = serde_json::from_str(&self.input[start..self.pos])
            .map_err(|e| CompileError::parse(start, format!("invalid query document: {}", e)))?;
        Ok(self.ast.new_node(NodeKind::Json(value)))
    }

    fn parse_script(&mut self) -> Result<NodeId> {
        let start = self.pos;
        self.pos += 2;
        let end = self
            .remaining()
            .find("$$")
            .ok_or_else(|| CompileError::parse(start, "unterminated script"))?;
        let script = self.remaining()[..end].trim().to_string();
        self.pos += end + 2;
        Ok(self.ast.new_node(NodeKind::Script(script)))
    }

    fn parse_directive(&mut self) -> Result<Option<NodeId>> {
        let start = self.pos;
        self.expect_char('#')?;
        let name = self.read_identifier().to_lowercase();

        match name.as_str() {
            "options" => {
                self.parse_options()?;
                Ok(None)
            }
            "field_lists" => {
                self.parse_field_lists()?;
                Ok(None)
            }
            "expand" => self.parse_expand().map(Some),
            "bool" => self.parse_bool(),
            "tally" | "range" | "significant_terms" | "extended_stats" => {
                let agg = self.parse_aggregate(&name)?;
                if self.ast.aggregate.is_some() {
                    return Err(CompileError::directive(&name, "only one aggregation per query"));
                }
                self.ast.aggregate = Some(agg);
                Ok(None)
            }
            "suggest" => {
                let args = self.parse_args()?;
                let field = arg_text(&args, 0, "suggest")?;
                let text = arg_text(&args, 1, "suggest")?;
                let size = arg_number(&args, 2, "suggest")?.unwrap_or(5);
                self.ast.suggest = Some(Suggest {
                    fieldname: field.to_string(),
                    text: text.to_string(),
                    size,
                });
                Ok(None)
            }
            "limit" => {
                let args = self.parse_args()?;
                let sort = arg_text(&args, 0, "limit")?;
                let mut words = sort.split_whitespace();
                let sort_field = words.next().map(str::to_string);
                let ascending = !matches!(words.next(), Some(d) if d.eq_ignore_ascii_case("desc"));
                let offset = arg_number(&args, 1, "limit")?.unwrap_or(0);
                let size = arg_number(&args, 2, "limit")?.unwrap_or(10);
                self.ast.limit = Some(Limit {
                    sort_field,
                    ascending,
                    offset: offset as u64,
                    size: size as u64,
                });
                Ok(None)
            }
            "" => Err(CompileError::parse(start, "expected directive name after '#'")),
            other => Err(CompileError::directive(other, "unknown directive")),
        }
    }

    /// `#options(alias:(left=<index>right), (left=<index>right))`
    fn parse_options(&mut self) -> Result<()> {
        self.expect_char('(')?;
        loop {
            self.skip_whitespace();
            if self.consume_char(')') {
                return Ok(());
            }
            if self.consume_char(',') {
                continue;
            }
            if self.is_eof() {
                return Err(self.error("unterminated #options"));
            }

            let alias = if self.peek_char() == Some('(') {
                None
            } else {
                let alias = self.read_identifier();
                if alias.is_empty() {
                    return Err(self.error("expected link alias"));
                }
                self.skip_whitespace();
                self.expect_char(':')?;
                self.skip_whitespace();
                Some(alias)
            };

            self.expect_char('(')?;
            let link = self.parse_link_spec(alias, ')')?;
            self.ast.links.declare(link);
        }
    }

    /// `left=<index>right` followed by `close`
    fn parse_link_spec(&mut self, alias: Option<String>, close: char) -> Result<IndexLink> {
        self.skip_whitespace();
        let left = self.read_until('=')?;
        self.expect_char('=')?;
        self.skip_whitespace();
        self.expect_char('<')?;
        let index = self.read_until('>')?;
        self.expect_char('>')?;
        let right = self.read_until(close)?;
        self.expect_char(close)?;

        if left.is_empty() || index.is_empty() || right.is_empty() {
            return Err(self.error("index link must look like left=<index>right"));
        }
        Ok(IndexLink::new(alias, left, index, right))
    }

    /// `#expand<left=<index>right>(query [#filter(query)])`
    fn parse_expand(&mut self) -> Result<NodeId> {
        self.expect_char('<')?;
        let link = self.parse_link_spec(None, '>')?;
        let link = self.ast.links.add(link);

        self.skip_whitespace();
        self.expect_char('(')?;
        let saved_scopes = std::mem::take(&mut self.scopes);
        let body = self.parse_or();
        let filter = match &body {
            Ok(_) => self.parse_filter(),
            Err(_) => Ok(None),
        };
        self.scopes = saved_scopes;
        let body = body?.ok_or_else(|| self.error("#expand needs a query"))?;
        let filter = filter?;
        self.skip_whitespace();
        self.expect_char(')')?;

        let expansion = self
            .ast
            .new_node(NodeKind::Expansion(Expansion::new(link, false)));
        self.ast.add_child(expansion, body);
        if let Some(filter) = filter {
            self.ast.set_filter(expansion, filter);
        }
        Ok(expansion)
    }

    fn parse_filter(&mut self) -> Result<Option<NodeId>> {
        self.skip_whitespace();
        if !self.remaining().starts_with("#filter") {
            return Ok(None);
        }
        self.pos += "#filter".len();
        self.skip_whitespace();
        self.expect_char('(')?;
        let filter = self.parse_or()?;
        self.expect_char(')')?;
        Ok(filter)
    }

    /// `#field_lists(name=[a, b], other=[c])`
    fn parse_field_lists(&mut self) -> Result<()> {
        self.expect_char('(')?;
        loop {
            self.skip_whitespace();
            if self.consume_char(')') {
                return Ok(());
            }
            if self.consume_char(',') {
                continue;
            }
            let name = self.read_identifier();
            if name.is_empty() {
                return Err(self.error("expected field list name"));
            }
            self.skip_whitespace();
            self.expect_char('=')?;
            self.skip_whitespace();
            self.expect_char('[')?;
            let fields = self.read_until(']')?;
            self.expect_char(']')?;
            let fields: Vec<String> = fields
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            if fields.is_empty() {
                return Err(CompileError::directive("field_lists", format!("list '{}' is empty", name)));
            }
            self.ast.field_lists.insert(name, fields);
        }
    }

    /// `#bool(#must(..) #should(..) #must_not(..))`
    fn parse_bool(&mut self) -> Result<Option<NodeId>> {
        self.expect_char('(')?;
        let mut must = Vec::new();
        let mut should = Vec::new();
        let mut must_not = Vec::new();

        loop {
            self.skip_whitespace();
            if self.consume_char(')') {
                break;
            }
            self.expect_char('#')?;
            let clause = self.read_identifier().to_lowercase();
            self.expect_char('(')?;
            let body = self.parse_or()?;
            self.expect_char(')')?;
            let Some(body) = body else {
                continue;
            };
            // clauses listed side by side are alternatives, not a conjunction
            let parts = if clause == "should" && self.ast.kind(body) == &NodeKind::And {
                let parts = self.ast.child_ids(body);
                for &p in &parts {
                    self.ast.detach(p);
                }
                parts
            } else {
                vec![body]
            };
            match clause.as_str() {
                "must" => must.extend(parts),
                "should" => should.extend(parts),
                "must_not" => must_not.extend(parts),
                other => {
                    return Err(CompileError::directive(
                        "bool",
                        format!("unknown clause #{}", other),
                    ))
                }
            }
        }

        let mut parts = must;
        if let Some(or) = self.combine(NodeKind::Or, should) {
            parts.push(or);
        }
        if let Some(excluded) = self.combine(NodeKind::Or, must_not) {
            let not = self.ast.new_node(NodeKind::Not);
            self.ast.add_child(not, excluded);
            parts.push(not);
        }
        Ok(self.combine(NodeKind::And, parts))
    }

    fn parse_aggregate(&mut self, name: &str) -> Result<Aggregate> {
        let args = self.parse_args()?;
        let fieldname = arg_text(&args, 0, name)?.to_string();
        let sub = args.iter().find_map(|a| match a {
            Arg::Aggregate(agg) => Some(Box::new(agg.clone())),
            _ => None,
        });

        let kind = match name {
            "tally" => AggregateKind::Tally {
                stem: args.get(1).and_then(Arg::text).map(str::to_string),
                size: arg_number(&args, 2, name)?.unwrap_or(5000),
                order: match args.get(3).and_then(Arg::text) {
                    Some(order) => TallyOrder::parse(order).ok_or_else(|| {
                        CompileError::directive(name, format!("unknown sort order '{}'", order))
                    })?,
                    None => TallyOrder::default(),
                },
            },
            "range" => {
                let ranges = arg_text(&args, 1, name)?;
                let ranges: Value = serde_json::from_str(ranges).map_err(|e| {
                    CompileError::directive(name, format!("invalid ranges: {}", e))
                })?;
                if !ranges.is_array() {
                    return Err(CompileError::directive(name, "ranges must be a JSON array"));
                }
                AggregateKind::Range { ranges }
            }
            "significant_terms" => AggregateKind::SignificantTerms {
                stem: args.get(1).and_then(Arg::text).map(str::to_string),
                size: arg_number(&args, 2, name)?.unwrap_or(5000),
            },
            _ => AggregateKind::ExtendedStats,
        };

        Ok(Aggregate {
            kind,
            fieldname,
            sub,
        })
    }

    /// Comma separated directive arguments up to the closing parenthesis
    fn parse_args(&mut self) -> Result<Vec<Arg>> {
        self.expect_char('(')?;
        let mut args = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek_char() {
                None => return Err(self.error("unterminated directive arguments")),
                Some(')') => {
                    self.advance();
                    return Ok(args);
                }
                Some(',') => {
                    self.advance();
                }
                Some('"') | Some('\'') => args.push(Arg::Quoted(self.parse_quoted()?)),
                Some('#') => {
                    self.advance();
                    let name = self.read_identifier().to_lowercase();
                    match name.as_str() {
                        "tally" | "range" | "significant_terms" | "extended_stats" => {
                            args.push(Arg::Aggregate(self.parse_aggregate(&name)?))
                        }
                        other => {
                            return Err(CompileError::directive(
                                other,
                                "only aggregations may be nested in directive arguments",
                            ))
                        }
                    }
                }
                Some(_) => {
                    let start = self.pos;
                    while let Some(ch) = self.peek_char() {
                        if ch == ',' || ch == ')' {
                            break;
                        }
                        self.advance();
                    }
                    args.push(Arg::Bare(self.input[start..self.pos].trim().to_string()));
                }
            }
        }
    }

    fn alloc_leaf(&mut self, kind: NodeKind, fieldname: &str, op: Operator) -> NodeId {
        self.ast.alloc(Node::new(kind).with_field(fieldname, op))
    }

    /// Build an n-ary node, or pass a single node through
    fn combine(&mut self, kind: NodeKind, mut nodes: Vec<NodeId>) -> Option<NodeId> {
        match nodes.len() {
            0 => None,
            1 => nodes.pop(),
            _ => {
                let parent = self.ast.new_node(kind);
                for n in nodes {
                    self.ast.add_child(parent, n);
                }
                Some(parent)
            }
        }
    }

    fn consume_proximity_operator(&mut self) -> Option<(u32, bool)> {
        let rest = self.remaining();
        let lower = rest.get(..3).unwrap_or(rest).to_lowercase();
        let (ordered, skip) = if lower.starts_with("wo/") {
            (true, 3)
        } else if lower.starts_with("w/") {
            (false, 2)
        } else {
            return None;
        };
        let digits: String = rest[skip..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        self.pos += skip + digits.len();
        Some((digits.parse().unwrap_or(0), ordered))
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn read_until(&mut self, end: char) -> Result<String> {
        let start = self.pos;
        match self.remaining().find(end) {
            Some(offset) => {
                self.pos += offset;
                Ok(self.input[start..self.pos].trim().to_string())
            }
            None => Err(CompileError::parse(start, format!("expected '{}'", end))),
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        let rest = self.remaining();
        rest.len() >= keyword.len()
            && rest.is_char_boundary(keyword.len())
            && rest[..keyword.len()].eq_ignore_ascii_case(keyword)
            && rest[keyword.len()..]
                .chars()
                .next()
                .map(|c| c.is_whitespace() || c == '(')
                .unwrap_or(true)
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        if self.consume_char(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", expected)))
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(self.pos, message)
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.peek_char().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.advance();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn remaining(&self) -> &str {
        &self.input[self.pos..]
    }
}

fn is_number(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    !digits.is_empty()
        && digits.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.matches('.').count() <= 1
        && !digits.ends_with('.')
}

fn arg_text<'x>(args: &'x [Arg], index: usize, directive: &str) -> Result<&'x str> {
    args.get(index)
        .and_then(Arg::text)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CompileError::directive(directive, format!("missing argument {}", index + 1)))
}

fn arg_number(args: &[Arg], index: usize, directive: &str) -> Result<Option<u32>> {
    match args.get(index).and_then(Arg::text) {
        None => Ok(None),
        Some(s) => s.trim().parse().map(Some).map_err(|_| {
            CompileError::directive(directive, format!("argument {} must be a number", index + 1))
        }),
    }
}
