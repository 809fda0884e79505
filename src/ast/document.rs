/// AST → document-store filter compiler.
///
/// Emits Mongo-style JSON filter documents (`$and`, `$or`, `$eq`, `$in`, ...)
/// keyed by stored column names, plus the sort/skip/limit of the query.
use serde_json::{json, Map, Value as Json};

use super::types::*;
use crate::error::{Error, Result};
use crate::model::{ModelSchema, Value};

/// A translated find operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FindDocument {
    pub collection: String,
    pub filter: Json,
    /// `(column, 1 | -1)` in priority order.
    pub sort: Vec<(String, i32)>,
    pub skip: u64,
    pub limit: Option<u64>,
}

pub fn compile_find(query: &Query) -> Result<FindDocument> {
    let sort = query
        .ordering()
        .iter()
        .map(|(field, direction)| {
            let order = match direction {
                Direction::Ascending => 1,
                Direction::Descending => -1,
            };
            column(query.model, field).map(|c| (c.to_string(), order))
        })
        .collect::<Result<Vec<_>>>()?;

    let window = query.window();
    Ok(FindDocument {
        collection: query.model.table().to_string(),
        filter: compile_filter(query)?,
        sort,
        skip: window.offset,
        limit: window.limit,
    })
}

/// The filter document alone. No filter matches every document.
pub fn compile_filter(query: &Query) -> Result<Json> {
    match &query.filter {
        Some(node) => compile_node(query.model, node),
        None => Ok(json!({})),
    }
}

fn column<'a>(schema: &'a ModelSchema, field: &FieldRef) -> Result<&'a str> {
    if field.model() != schema.name() {
        return Err(Error::cross_model(schema.name(), field.model()));
    }
    schema
        .field(field.name())
        .map(|f| f.column())
        .ok_or_else(|| {
            Error::invalid_query(format!("{} has no field '{}'", schema.name(), field.name()))
        })
}

fn compile_node(schema: &ModelSchema, node: &Node) -> Result<Json> {
    match node {
        Node::Comparison(c) => compile_comparison(schema, c),
        Node::Group(g) => {
            let children = g
                .children
                .iter()
                .map(|child| compile_node(schema, child))
                .collect::<Result<Vec<Json>>>()?;
            Ok(match (g.op, children.len()) {
                (Logical::And, 0) => json!({}),
                (Logical::Or, 0) => match_nothing(),
                (Logical::Not, 0) => return Err(Error::invalid_query("negation of nothing")),
                (Logical::And, _) => json!({ "$and": children }),
                (Logical::Or, _) => json!({ "$or": children }),
                (Logical::Not, _) => json!({ "$nor": [{ "$and": children }] }),
            })
        }
        Node::Literal(Value::Bool(true)) => Ok(json!({})),
        Node::Literal(Value::Bool(false)) => Ok(match_nothing()),
        Node::Literal(v) => Err(Error::invalid_query(format!(
            "literal {} is not a predicate",
            v
        ))),
        Node::Reference(r) => Err(Error::invalid_query(format!(
            "field {} is not a predicate on its own",
            r
        ))),
    }
}

fn match_nothing() -> Json {
    json!({ "$nor": [{}] })
}

fn compile_comparison(schema: &ModelSchema, c: &Comparison) -> Result<Json> {
    let left = column(schema, &c.left)?;

    let condition = match &c.right {
        Operand::Literal(value) => match c.op {
            Operator::Contains => {
                let Value::Text(needle) = value else {
                    return Err(Error::invalid_query(format!(
                        "contains on {} needs text, got {}",
                        c.left,
                        value.type_name()
                    )));
                };
                json!({ "$regex": regex::escape(needle) })
            }
            Operator::In | Operator::NotIn => {
                return Err(Error::invalid_query(format!(
                    "'{}' on {} needs a collection",
                    c.op, c.left
                )))
            }
            op if value.is_null() && !matches!(op, Operator::Eq | Operator::Ne) => {
                return Err(Error::invalid_query(format!(
                    "cannot apply '{}' to NULL on {}",
                    op, c.left
                )))
            }
            op => {
                let mut condition = Map::new();
                condition.insert(document_operator(op).to_string(), value.to_json());
                Json::Object(condition)
            }
        },
        Operand::Collection(values) => {
            let items: Vec<Json> = values.iter().map(Value::to_json).collect();
            match c.op {
                Operator::In => json!({ "$in": items }),
                Operator::NotIn => json!({ "$nin": items }),
                op => {
                    return Err(Error::invalid_query(format!(
                        "'{}' on {} does not take a collection",
                        op, c.left
                    )))
                }
            }
        }
        Operand::Reference(other) => {
            let right = column(schema, other)?;
            if matches!(c.op, Operator::In | Operator::NotIn | Operator::Contains) {
                return Err(Error::invalid_query(format!(
                    "'{}' cannot compare two fields",
                    c.op
                )));
            }
            let mut expr = Map::new();
            expr.insert(
                document_operator(c.op).to_string(),
                json!([format!("${}", left), format!("${}", right)]),
            );
            return Ok(json!({ "$expr": Json::Object(expr) }));
        }
    };

    let mut filter = Map::new();
    filter.insert(left.to_string(), condition);
    Ok(Json::Object(filter))
}

fn document_operator(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "$eq",
        Operator::Ne => "$ne",
        Operator::Gt => "$gt",
        Operator::Gte => "$gte",
        Operator::Lt => "$lt",
        Operator::Lte => "$lte",
        Operator::In => "$in",
        Operator::NotIn => "$nin",
        Operator::Contains => "$regex",
    }
}
