/// Backend-independent query AST.
///
/// Nodes are plain data. They are built through the methods in
/// `builder.rs`, checked by `analyzer.rs` and lowered by `compiler.rs`
/// (SQL) or `document.rs` (document filters).
use std::fmt;

use crate::model::{ModelSchema, Value};

/// A (model, field) pair. Two references are equal iff both names match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    model: &'static str,
    field: &'static str,
}

impl FieldRef {
    pub const fn new(model: &'static str, field: &'static str) -> Self {
        Self { model, field }
    }

    pub fn model(&self) -> &'static str {
        self.model
    }

    pub fn name(&self) -> &'static str {
        self.field
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.model, self.field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Reference(FieldRef),
    Literal(Value),
    Comparison(Comparison),
    Group(Group),
}

/// `left <op> right`. The left side is always a field reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: FieldRef,
    pub op: Operator,
    pub right: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reference(FieldRef),
    Literal(Value),
    /// Finite sequence for `In` / `NotIn`. May be empty.
    Collection(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    /// Never matches a null value, on any backend. Compare with a null
    /// literal to test for "is not null".
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    /// Like `Ne`, never matches a null value.
    NotIn,
    Contains,
}

impl Operator {
    /// The operator that keeps meaning when the operands swap sides.
    pub fn flipped(self) -> Option<Operator> {
        match self {
            Operator::Eq => Some(Operator::Eq),
            Operator::Ne => Some(Operator::Ne),
            Operator::Gt => Some(Operator::Lt),
            Operator::Gte => Some(Operator::Lte),
            Operator::Lt => Some(Operator::Gt),
            Operator::Lte => Some(Operator::Gte),
            Operator::In | Operator::NotIn | Operator::Contains => None,
        }
    }

    pub fn takes_collection(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Contains => "contains",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Logical {
    And,
    Or,
    /// Negation of the conjunction of its children.
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub op: Logical,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeDirective {
    OrderBy {
        field: FieldRef,
        direction: Direction,
    },
    /// `count` rows of 1-based page `page`.
    Limit { count: u64, page: Option<u64> },
    /// Raw row window relative to the window shaped so far.
    Window { offset: u64, limit: Option<u64> },
}

/// Effective row range of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Window {
    /// Narrow this window by a window expressed relative to it.
    pub fn narrow(self, offset: u64, limit: Option<u64>) -> Window {
        let remaining = self.limit.map(|l| l.saturating_sub(offset));
        let limit = match (remaining, limit) {
            (Some(r), Some(l)) => Some(r.min(l)),
            (Some(r), None) => Some(r),
            (None, l) => l,
        };
        Window {
            offset: self.offset.saturating_add(offset),
            limit,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }
}

/// A predicate bound to the model it runs against, plus shaping.
#[derive(Debug, Clone)]
pub struct Query {
    pub model: &'static ModelSchema,
    pub filter: Option<Node>,
    pub shape: Vec<ShapeDirective>,
}

impl Query {
    pub fn new(model: &'static ModelSchema) -> Self {
        Self {
            model,
            filter: None,
            shape: Vec::new(),
        }
    }

    pub fn ordering(&self) -> Vec<(FieldRef, Direction)> {
        self.shape
            .iter()
            .filter_map(|d| match d {
                ShapeDirective::OrderBy { field, direction } => Some((*field, *direction)),
                _ => None,
            })
            .collect()
    }

    /// Fold the limit and window directives in order.
    ///
    /// A `Limit` resets the window to `offset = (page - 1) * count`;
    /// a `Window` narrows whatever came before it.
    pub fn window(&self) -> Window {
        self.shape.iter().fold(Window::default(), |window, d| match d {
            ShapeDirective::Limit { count, page } => {
                let page = page.unwrap_or(1).max(1);
                Window {
                    offset: (page - 1).saturating_mul(*count),
                    limit: Some(*count),
                }
            }
            ShapeDirective::Window { offset, limit } => window.narrow(*offset, *limit),
            ShapeDirective::OrderBy { .. } => window,
        })
    }
}
