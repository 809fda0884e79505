/// Construction API for the query AST.
///
/// The named methods (`eq`, `and`, `negate`, ...) are the canonical surface.
/// `&`, `|` and `!` on [`Node`] delegate to them.
use std::ops::{BitAnd, BitOr, Not};

use super::types::*;
use crate::error::{Error, Result};
use crate::model::{ModelSchema, Value};

impl FieldRef {
    /// General comparison against a literal or another reference.
    pub fn compare(&self, op: Operator, value: impl Into<Node>) -> Result<Node> {
        Comparison::new(Node::Reference(*self), op, value.into()).map(Node::Comparison)
    }

    pub fn eq(&self, value: impl Into<Value>) -> Node {
        self.literal(Operator::Eq, value.into())
    }

    pub fn ne(&self, value: impl Into<Value>) -> Node {
        self.literal(Operator::Ne, value.into())
    }

    pub fn gt(&self, value: impl Into<Value>) -> Node {
        self.literal(Operator::Gt, value.into())
    }

    pub fn gte(&self, value: impl Into<Value>) -> Node {
        self.literal(Operator::Gte, value.into())
    }

    pub fn lt(&self, value: impl Into<Value>) -> Node {
        self.literal(Operator::Lt, value.into())
    }

    pub fn lte(&self, value: impl Into<Value>) -> Node {
        self.literal(Operator::Lte, value.into())
    }

    /// Substring match on a text field.
    pub fn contains(&self, needle: impl Into<String>) -> Node {
        self.literal(Operator::Contains, Value::Text(needle.into()))
    }

    pub fn is_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Node {
        self.collection(Operator::In, values)
    }

    pub fn not_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Node {
        self.collection(Operator::NotIn, values)
    }

    /// Compare against another field of the same model.
    pub fn eq_field(&self, other: FieldRef) -> Node {
        Node::Comparison(Comparison {
            left: *self,
            op: Operator::Eq,
            right: Operand::Reference(other),
        })
    }

    fn literal(&self, op: Operator, value: Value) -> Node {
        Node::Comparison(Comparison {
            left: *self,
            op,
            right: Operand::Literal(value),
        })
    }

    fn collection<V: Into<Value>>(&self, op: Operator, values: impl IntoIterator<Item = V>) -> Node {
        Node::Comparison(Comparison {
            left: *self,
            op,
            right: Operand::Collection(values.into_iter().map(Into::into).collect()),
        })
    }
}

impl Comparison {
    /// Build a comparison from two arbitrary operands.
    ///
    /// A literal on the left is swapped to the right with the operator
    /// flipped. Two literals, or a non-operand on either side, is an
    /// `InvalidQuery` error.
    pub fn new(left: Node, op: Operator, right: Node) -> Result<Comparison> {
        match (left, right) {
            (Node::Reference(l), Node::Reference(r)) => {
                if op.takes_collection() || op == Operator::Contains {
                    return Err(Error::invalid_query(format!(
                        "'{}' cannot compare two fields ({} and {})",
                        op, l, r
                    )));
                }
                Ok(Comparison {
                    left: l,
                    op,
                    right: Operand::Reference(r),
                })
            }
            (Node::Reference(l), Node::Literal(v)) => Self::with_literal(l, op, v),
            (Node::Literal(v), Node::Reference(r)) => {
                let flipped = op.flipped().ok_or_else(|| {
                    Error::invalid_query(format!(
                        "'{}' needs the field on the left of {}",
                        op, r
                    ))
                })?;
                Self::with_literal(r, flipped, v)
            }
            (Node::Literal(a), Node::Literal(b)) => Err(Error::invalid_query(format!(
                "comparison between two literals ({} {} {}) has no field reference",
                a, op, b
            ))),
            _ => Err(Error::invalid_query(
                "comparison operands must be field references or literals",
            )),
        }
    }

    fn with_literal(left: FieldRef, op: Operator, value: Value) -> Result<Comparison> {
        if op.takes_collection() {
            return Err(Error::invalid_query(format!(
                "'{}' on {} needs a collection, use is_in/not_in",
                op, left
            )));
        }
        Ok(Comparison {
            left,
            op,
            right: Operand::Literal(value),
        })
    }
}

impl Node {
    pub fn and(self, other: impl Into<Node>) -> Node {
        self.combine(Logical::And, other.into())
    }

    pub fn or(self, other: impl Into<Node>) -> Node {
        self.combine(Logical::Or, other.into())
    }

    pub fn negate(self) -> Node {
        Node::Group(Group {
            op: Logical::Not,
            children: vec![self],
        })
    }

    /// All of `nodes`. An empty conjunction matches everything.
    pub fn all(nodes: impl IntoIterator<Item = Node>) -> Node {
        nodes
            .into_iter()
            .fold(Node::Group(Group::new(Logical::And)), |acc, n| acc.and(n))
    }

    /// Any of `nodes`. An empty disjunction matches nothing.
    pub fn any(nodes: impl IntoIterator<Item = Node>) -> Node {
        nodes
            .into_iter()
            .fold(Node::Group(Group::new(Logical::Or)), |acc, n| acc.or(n))
    }

    // Only a group with the same operator absorbs; anything else nests.
    fn combine(self, op: Logical, other: Node) -> Node {
        let mut group = match self {
            Node::Group(g) if g.op == op => g,
            node => Group {
                op,
                children: vec![node],
            },
        };
        match other {
            Node::Group(g) if g.op == op => group.children.extend(g.children),
            node => group.children.push(node),
        }
        Node::Group(group)
    }
}

impl Group {
    pub fn new(op: Logical) -> Self {
        Self {
            op,
            children: Vec::new(),
        }
    }
}

impl From<FieldRef> for Node {
    fn from(r: FieldRef) -> Self {
        Node::Reference(r)
    }
}

impl From<Value> for Node {
    fn from(v: Value) -> Self {
        Node::Literal(v)
    }
}

impl From<Comparison> for Node {
    fn from(c: Comparison) -> Self {
        Node::Comparison(c)
    }
}

impl From<Group> for Node {
    fn from(g: Group) -> Self {
        Node::Group(g)
    }
}

impl BitAnd for Node {
    type Output = Node;

    fn bitand(self, rhs: Node) -> Node {
        self.and(rhs)
    }
}

impl BitOr for Node {
    type Output = Node;

    fn bitor(self, rhs: Node) -> Node {
        self.or(rhs)
    }
}

impl Not for Node {
    type Output = Node;

    fn not(self) -> Node {
        self.negate()
    }
}

impl Query {
    /// Bind `nodes` (ANDed) to `model`, rejecting references to other models.
    pub fn build(
        model: &'static ModelSchema,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Result<Query> {
        let mut nodes: Vec<Node> = nodes.into_iter().collect();
        let filter = match nodes.len() {
            0 => None,
            1 => nodes.pop(),
            _ => Some(Node::all(nodes)),
        };
        let query = Query {
            model,
            filter,
            shape: Vec::new(),
        };
        super::analyzer::validate(&query)?;
        Ok(query)
    }

    pub fn filter(mut self, node: Node) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(node),
            None => node,
        });
        self
    }

    pub fn order_by(mut self, field: FieldRef, direction: Direction) -> Self {
        self.shape.push(ShapeDirective::OrderBy { field, direction });
        self
    }

    /// `count` rows of the 1-based `page`.
    pub fn limit(mut self, count: u64, page: Option<u64>) -> Self {
        self.shape.push(ShapeDirective::Limit { count, page });
        self
    }

    /// Batch `index` of `size` rows inside the current window.
    pub fn batch(&self, index: u64, size: u64) -> Query {
        let mut query = self.clone();
        query.shape.push(ShapeDirective::Window {
            offset: index.saturating_mul(size),
            limit: Some(size),
        });
        query
    }
}
