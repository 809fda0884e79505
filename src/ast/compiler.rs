/// AST → SQL compiler.
///
/// Produces statement text plus bound parameters for SQLite or PostgreSQL.
/// Every identifier is quoted, NULL comparisons become `IS [NOT] NULL`, and
/// nested multi-child groups are parenthesized so backend precedence can
/// never regroup them.
use super::types::*;
use crate::error::{Error, Result};
use crate::model::{Field, FieldType, ModelSchema, Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn column_type(self, ty: FieldType) -> &'static str {
        match (self, ty) {
            (Dialect::Sqlite, FieldType::Int) => "INTEGER",
            (Dialect::Sqlite, FieldType::Float) => "REAL",
            (Dialect::Sqlite, FieldType::Text) => "TEXT",
            (Dialect::Sqlite, FieldType::Bool) => "INTEGER",
            (Dialect::Sqlite, FieldType::Bytes) => "BLOB",
            (Dialect::Sqlite, FieldType::Timestamp) => "TEXT",
            (Dialect::Postgres, FieldType::Int) => "BIGINT",
            (Dialect::Postgres, FieldType::Float) => "DOUBLE PRECISION",
            (Dialect::Postgres, FieldType::Text) => "TEXT",
            (Dialect::Postgres, FieldType::Bool) => "BOOLEAN",
            (Dialect::Postgres, FieldType::Bytes) => "BYTEA",
            (Dialect::Postgres, FieldType::Timestamp) => "TIMESTAMPTZ",
        }
    }

    fn auto_key(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }
}

/// Statement text with its parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Quote an identifier unconditionally.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

struct Compiler<'a> {
    dialect: Dialect,
    schema: &'a ModelSchema,
    params: Vec<Value>,
}

impl<'a> Compiler<'a> {
    fn new(dialect: Dialect, schema: &'a ModelSchema) -> Self {
        Self {
            dialect,
            schema,
            params: Vec::new(),
        }
    }

    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", self.params.len()),
        }
    }

    fn column(&self, field: &FieldRef) -> Result<String> {
        if field.model() != self.schema.name() {
            return Err(Error::cross_model(self.schema.name(), field.model()));
        }
        self.schema
            .field(field.name())
            .map(|f| quote_ident(f.column()))
            .ok_or_else(|| {
                Error::invalid_query(format!(
                    "{} has no field '{}'",
                    self.schema.name(),
                    field.name()
                ))
            })
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
        }
    }

    fn where_clause(&mut self, filter: &Option<Node>) -> Result<Option<String>> {
        match filter {
            Some(node) => self.predicate(node, false).map(|p| Some(format!("WHERE {}", p))),
            None => Ok(None),
        }
    }

    fn predicate(&mut self, node: &Node, nested: bool) -> Result<String> {
        match node {
            Node::Comparison(c) => self.comparison(c),
            Node::Group(g) => self.group(g, nested),
            Node::Literal(Value::Bool(true)) => Ok("1 = 1".to_string()),
            Node::Literal(Value::Bool(false)) => Ok("1 = 0".to_string()),
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

    fn group(&mut self, group: &Group, nested: bool) -> Result<String> {
        let joiner = match group.op {
            Logical::And | Logical::Not => " AND ",
            Logical::Or => " OR ",
        };

        // A lone child is not joined with anything, so it only needs the
        // parentheses its parent would need. NOT supplies its own.
        let child_nested = match group.children.len() {
            1 => nested && group.op != Logical::Not,
            _ => true,
        };
        let parts = group
            .children
            .iter()
            .map(|child| self.predicate(child, child_nested))
            .collect::<Result<Vec<String>>>()?;

        let joined = match (group.op, parts.len()) {
            (Logical::Not, 0) => return Err(Error::invalid_query("negation of nothing")),
            (Logical::And, 0) => "1 = 1".to_string(),
            (Logical::Or, 0) => "1 = 0".to_string(),
            _ => parts.join(joiner),
        };

        Ok(match group.op {
            Logical::Not => format!("NOT ({})", joined),
            _ if nested && parts.len() > 1 => format!("({})", joined),
            _ => joined,
        })
    }

    fn comparison(&mut self, c: &Comparison) -> Result<String> {
        let column = self.column(&c.left)?;
        match &c.right {
            Operand::Literal(Value::Null) => match c.op {
                Operator::Eq => Ok(format!("{} IS NULL", column)),
                Operator::Ne => Ok(format!("{} IS NOT NULL", column)),
                other => Err(Error::invalid_query(format!(
                    "cannot apply '{}' to NULL on {}",
                    other, c.left
                ))),
            },
            Operand::Literal(value) => match c.op {
                Operator::Contains => {
                    let Value::Text(needle) = value else {
                        return Err(Error::invalid_query(format!(
                            "contains on {} needs text, got {}",
                            c.left,
                            value.type_name()
                        )));
                    };
                    let pattern = format!("%{}%", escape_like(needle));
                    Ok(format!(
                        "{} LIKE {} ESCAPE '\\'",
                        column,
                        self.param(Value::Text(pattern))
                    ))
                }
                Operator::In | Operator::NotIn => Err(Error::invalid_query(format!(
                    "'{}' on {} needs a collection",
                    c.op, c.left
                ))),
                op => Ok(format!(
                    "{} {} {}",
                    column,
                    sql_operator(op),
                    self.param(value.clone())
                )),
            },
            Operand::Reference(other) => {
                let other_column = self.column(other)?;
                match c.op {
                    Operator::In | Operator::NotIn | Operator::Contains => {
                        Err(Error::invalid_query(format!(
                            "'{}' cannot compare two fields",
                            c.op
                        )))
                    }
                    op => Ok(format!("{} {} {}", column, sql_operator(op), other_column)),
                }
            }
            Operand::Collection(values) => match (c.op, values.is_empty()) {
                (Operator::In, true) => Ok("1 = 0".to_string()),
                (Operator::NotIn, true) => Ok("1 = 1".to_string()),
                (Operator::In | Operator::NotIn, false) => {
                    let placeholders: Vec<String> =
                        values.iter().map(|v| self.param(v.clone())).collect();
                    let keyword = if c.op == Operator::In { "IN" } else { "NOT IN" };
                    Ok(format!("{} {} ({})", column, keyword, placeholders.join(", ")))
                }
                (op, _) => Err(Error::invalid_query(format!(
                    "'{}' on {} does not take a collection",
                    op, c.left
                ))),
            },
        }
    }

    fn order_by(&self, query: &Query) -> Result<Option<String>> {
        let ordering = query.ordering();
        if ordering.is_empty() {
            return Ok(None);
        }
        let items = ordering
            .iter()
            .map(|(field, direction)| {
                let dir = match direction {
                    Direction::Ascending => "ASC",
                    Direction::Descending => "DESC",
                };
                self.column(field).map(|c| format!("{} {}", c, dir))
            })
            .collect::<Result<Vec<String>>>()?;
        Ok(Some(format!("ORDER BY {}", items.join(", "))))
    }
}

fn sql_operator(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Lt => "<",
        Operator::Lte => "<=",
        Operator::In => "IN",
        Operator::NotIn => "NOT IN",
        Operator::Contains => "LIKE",
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn column_list(schema: &ModelSchema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| quote_ident(f.column()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT` every column of the model, in schema field order.
pub fn compile_select(query: &Query, dialect: Dialect) -> Result<SqlStatement> {
    let mut compiler = Compiler::new(dialect, query.model);
    let mut parts = vec![format!(
        "SELECT {} FROM {}",
        column_list(query.model),
        quote_ident(query.model.table())
    )];

    if let Some(clause) = compiler.where_clause(&query.filter)? {
        parts.push(clause);
    }
    if let Some(clause) = compiler.order_by(query)? {
        parts.push(clause);
    }

    let window = query.window();
    match (window.limit, dialect) {
        (Some(limit), _) => parts.push(format!("LIMIT {}", limit)),
        // SQLite only accepts OFFSET after a LIMIT
        (None, Dialect::Sqlite) if window.offset > 0 => parts.push("LIMIT -1".to_string()),
        (None, _) => {}
    }
    if window.offset > 0 {
        parts.push(format!("OFFSET {}", window.offset));
    }

    Ok(compiler.finish(parts.join(" ")))
}

/// `COUNT(*)` over the filter. Shaping directives are ignored.
pub fn compile_count(query: &Query, dialect: Dialect) -> Result<SqlStatement> {
    let mut compiler = Compiler::new(dialect, query.model);
    let mut parts = vec![format!(
        "SELECT COUNT(*) FROM {}",
        quote_ident(query.model.table())
    )];
    if let Some(clause) = compiler.where_clause(&query.filter)? {
        parts.push(clause);
    }
    Ok(compiler.finish(parts.join(" ")))
}

pub fn compile_update(query: &Query, values: &Record, dialect: Dialect) -> Result<SqlStatement> {
    if values.is_empty() {
        return Err(Error::invalid_query("update without any field values"));
    }
    let mut compiler = Compiler::new(dialect, query.model);

    let mut assignments = Vec::with_capacity(values.len());
    for (name, value) in values.iter() {
        let field = query.model.field(name).ok_or_else(|| {
            Error::invalid_query(format!("{} has no field '{}'", query.model.name(), name))
        })?;
        let placeholder = compiler.param(value.clone());
        assignments.push(format!("{} = {}", quote_ident(field.column()), placeholder));
    }

    let mut parts = vec![format!(
        "UPDATE {} SET {}",
        quote_ident(query.model.table()),
        assignments.join(", ")
    )];
    if let Some(clause) = compiler.where_clause(&query.filter)? {
        parts.push(clause);
    }
    Ok(compiler.finish(parts.join(" ")))
}

pub fn compile_delete(query: &Query, dialect: Dialect) -> Result<SqlStatement> {
    let mut compiler = Compiler::new(dialect, query.model);
    let mut parts = vec![format!("DELETE FROM {}", quote_ident(query.model.table()))];
    if let Some(clause) = compiler.where_clause(&query.filter)? {
        parts.push(clause);
    }
    Ok(compiler.finish(parts.join(" ")))
}

/// `INSERT ... RETURNING` every column, so generated keys come back.
///
/// Auto fields holding `NULL` are left to the backend.
pub fn compile_insert(schema: &ModelSchema, record: &Record, dialect: Dialect) -> Result<SqlStatement> {
    let mut compiler = Compiler::new(dialect, schema);
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();

    for field in schema.fields() {
        let value = record.get(field.name()).cloned().unwrap_or(Value::Null);
        if field.is_auto() && value.is_null() {
            continue;
        }
        columns.push(quote_ident(field.column()));
        placeholders.push(compiler.param(value));
    }

    let table = quote_ident(schema.table());
    let sql = if columns.is_empty() {
        format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}",
            table,
            column_list(schema)
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            columns.join(", "),
            placeholders.join(", "),
            column_list(schema)
        )
    };
    Ok(compiler.finish(sql))
}

pub fn compile_create_table(schema: &ModelSchema, dialect: Dialect) -> String {
    let keys = schema.key_fields();
    let single_auto_key = keys.len() == 1 && keys[0].is_auto();

    let mut definitions: Vec<String> = schema
        .fields()
        .iter()
        .map(|field| column_definition(field, dialect, single_auto_key))
        .collect();

    if !keys.is_empty() && !single_auto_key {
        let key_columns: Vec<String> = keys.iter().map(|f| quote_ident(f.column())).collect();
        definitions.push(format!("PRIMARY KEY ({})", key_columns.join(", ")));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(schema.table()),
        definitions.join(", ")
    )
}

fn column_definition(field: &Field, dialect: Dialect, single_auto_key: bool) -> String {
    let column = quote_ident(field.column());
    if single_auto_key && field.is_key() {
        return format!("{} {}", column, dialect.auto_key());
    }
    let null = if field.is_optional() { "" } else { " NOT NULL" };
    format!("{} {}{}", column, dialect.column_type(field.ty()), null)
}

pub fn compile_drop_table(schema: &ModelSchema) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(schema.table()))
}
