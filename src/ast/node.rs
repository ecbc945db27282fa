use super::link::LinkId;
use serde_json::Value;
use std::fmt;

/// Index of a node inside its [`Ast`](super::Ast) arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(super) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Comparison operator attached to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    #[default]
    Contains,
    Regex,
    Concept,
    FuzzyConcept,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Contains => ":",
            Operator::Regex => ":~",
            Operator::Concept => ":@",
            Operator::FuzzyConcept => ":@~",
        }
    }

    pub fn is_range(self) -> bool {
        matches!(self, Operator::Lt | Operator::Gt | Operator::Lte | Operator::Gte)
    }

    /// Operators whose values must reach the backend untouched by analyzers
    pub fn skips_analysis(self) -> bool {
        matches!(
            self,
            Operator::Regex | Operator::Concept | Operator::FuzzyConcept
        )
    }

    /// Operators that mean plain equality
    pub fn is_equality(self) -> bool {
        matches!(self, Operator::Eq | Operator::Contains)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Eq => "EQ",
            Operator::Ne => "NE",
            Operator::Lt => "LT",
            Operator::Gt => "GT",
            Operator::Lte => "LTE",
            Operator::Gte => "GTE",
            Operator::Contains => "CONTAINS",
            Operator::Regex => "REGEX",
            Operator::Concept => "CONCEPT",
            Operator::FuzzyConcept => "FUZZY_CONCEPT",
        };
        f.write_str(name)
    }
}

/// Join boundary: the wrapped body is evaluated against the link's index
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub link: LinkId,
    /// Extra filter applied on the target index, owned by the expansion
    pub filter: Option<NodeId>,
    /// Injected by the optimizer rather than written with `#expand`
    pub generated: bool,
    /// Cached hit-count estimate of the body on the target index
    pub hit_count: Option<u64>,
    /// Already paired with an own-index Or fallback
    pub paired: bool,
}

impl Expansion {
    pub fn new(link: LinkId, generated: bool) -> Self {
        Self {
            link,
            filter: None,
            generated,
            hit_count: None,
            paired: false,
        }
    }
}

/// Query AST node kind
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Boolean AND (all must match)
    And,
    /// Boolean OR (any can match)
    Or,
    /// Boolean NOT (exclude matches)
    Not,
    /// AND whose children must match inside the same nested document
    With,
    /// `path:(field:a and other:b)` grouping
    NestedGroup { path: String },
    Word(String),
    Number(String),
    Boolean(bool),
    /// Field has no value
    Null,
    /// Field has any value
    NotNull,
    Phrase(String),
    Prefix(String),
    Wildcard(String),
    Fuzzy { value: String, distance: u8 },
    /// Literal children, or an externally supplied value list
    Array { and: bool, external: Option<Vec<String>> },
    /// Children must appear within `distance` positions of each other
    Proximity { distance: u32, ordered: bool },
    Expansion(Expansion),
    /// Raw query document passed through untouched
    Json(Value),
    /// Script query source passed through untouched
    Script(String),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::And => "And",
            NodeKind::Or => "Or",
            NodeKind::Not => "Not",
            NodeKind::With => "With",
            NodeKind::NestedGroup { .. } => "NestedGroup",
            NodeKind::Word(_) => "Word",
            NodeKind::Number(_) => "Number",
            NodeKind::Boolean(_) => "Boolean",
            NodeKind::Null => "Null",
            NodeKind::NotNull => "NotNull",
            NodeKind::Phrase(_) => "Phrase",
            NodeKind::Prefix(_) => "Prefix",
            NodeKind::Wildcard(_) => "Wildcard",
            NodeKind::Fuzzy { .. } => "Fuzzy",
            NodeKind::Array { .. } => "Array",
            NodeKind::Proximity { .. } => "Proximity",
            NodeKind::Expansion(_) => "Expansion",
            NodeKind::Json(_) => "Json",
            NodeKind::Script(_) => "Script",
        }
    }

    /// Word, Number, Boolean, Null and NotNull
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            NodeKind::Word(_)
                | NodeKind::Number(_)
                | NodeKind::Boolean(_)
                | NodeKind::Null
                | NodeKind::NotNull
        )
    }

    /// Phrase, Prefix, Wildcard and Fuzzy
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            NodeKind::Phrase(_) | NodeKind::Prefix(_) | NodeKind::Wildcard(_) | NodeKind::Fuzzy { .. }
        )
    }

    /// Nodes that carry a field value and are matched against one field
    pub fn is_field_leaf(&self) -> bool {
        self.is_literal() || self.is_pattern() || matches!(self, NodeKind::Array { .. })
    }

    pub fn is_leaf(&self) -> bool {
        self.is_field_leaf() || matches!(self, NodeKind::Json(_) | NodeKind::Script(_))
    }

    /// And-like containers
    pub fn is_conjunction(&self) -> bool {
        matches!(self, NodeKind::And | NodeKind::With | NodeKind::NestedGroup { .. })
    }

    /// Containers whose children are combined by a boolean operator
    pub fn is_boolean(&self) -> bool {
        matches!(self, NodeKind::And | NodeKind::Or | NodeKind::Not)
    }

    pub fn is_expansion(&self) -> bool {
        matches!(self, NodeKind::Expansion(_))
    }

    /// String value of a literal or pattern leaf
    pub fn text(&self) -> Option<&str> {
        match self {
            NodeKind::Word(s)
            | NodeKind::Number(s)
            | NodeKind::Phrase(s)
            | NodeKind::Prefix(s)
            | NodeKind::Wildcard(s) => Some(s),
            NodeKind::Fuzzy { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// A single AST node stored in the arena
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub fieldname: Option<String>,
    pub operator: Operator,
    pub boost: Option<f32>,
    /// Index link that owns this node, resolved by the optimizer
    pub owning_index: Option<LinkId>,
    pub(super) parent: Option<NodeId>,
    pub(super) children: Vec<NodeId>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            fieldname: None,
            operator: Operator::default(),
            boost: None,
            owning_index: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn with_field(mut self, fieldname: impl Into<String>, operator: Operator) -> Self {
        self.fieldname = Some(fieldname.into());
        self.operator = operator;
        self
    }

    pub fn with_boost(mut self, boost: Option<f32>) -> Self {
        self.boost = boost;
        self
    }

    pub fn with_owner(mut self, owner: Option<LinkId>) -> Self {
        self.owning_index = owner;
        self
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn expansion(&self) -> Option<&Expansion> {
        match &self.kind {
            NodeKind::Expansion(e) => Some(e),
            _ => None,
        }
    }

    pub fn expansion_mut(&mut self) -> Option<&mut Expansion> {
        match &mut self.kind {
            NodeKind::Expansion(e) => Some(e),
            _ => None,
        }
    }

    pub fn field(&self) -> &str {
        self.fieldname.as_deref().unwrap_or("")
    }
}
