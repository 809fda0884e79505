/// Static checks over a query before it reaches a driver.
use std::collections::BTreeSet;

use super::types::*;
use crate::error::{Error, Result};

/// Facts collected by walking a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryAnalysis {
    pub models: BTreeSet<&'static str>,
    pub fields: BTreeSet<FieldRef>,
    pub comparison_count: usize,
    pub group_depth: usize,
    pub has_null_checks: bool,
    pub has_collections: bool,
    pub has_ordering: bool,
    pub has_limit: bool,
}

pub fn analyze_query(query: &Query) -> QueryAnalysis {
    let mut analysis = QueryAnalysis::default();
    if let Some(filter) = &query.filter {
        analyze_node(filter, 1, &mut analysis);
    }
    for directive in &query.shape {
        match directive {
            ShapeDirective::OrderBy { field, .. } => {
                analysis.has_ordering = true;
                record_field(field, &mut analysis);
            }
            ShapeDirective::Limit { .. } | ShapeDirective::Window { .. } => {
                analysis.has_limit = true;
            }
        }
    }
    analysis
}

fn analyze_node(node: &Node, depth: usize, analysis: &mut QueryAnalysis) {
    match node {
        Node::Reference(r) => record_field(r, analysis),
        Node::Literal(_) => {}
        Node::Comparison(c) => {
            analysis.comparison_count += 1;
            record_field(&c.left, analysis);
            match &c.right {
                Operand::Reference(r) => record_field(r, analysis),
                Operand::Literal(v) => {
                    if v.is_null() {
                        analysis.has_null_checks = true;
                    }
                }
                Operand::Collection(_) => analysis.has_collections = true,
            }
        }
        Node::Group(g) => {
            analysis.group_depth = analysis.group_depth.max(depth);
            for child in &g.children {
                analyze_node(child, depth + 1, analysis);
            }
        }
    }
}

fn record_field(field: &FieldRef, analysis: &mut QueryAnalysis) {
    analysis.models.insert(field.model());
    analysis.fields.insert(*field);
}

/// Reject queries that touch other models, unknown fields, or empty negations.
pub fn validate(query: &Query) -> Result<()> {
    let analysis = analyze_query(query);
    let expected = query.model.name();

    if let Some(found) = analysis.models.iter().find(|m| **m != expected) {
        return Err(Error::cross_model(expected, *found));
    }

    if let Some(unknown) = analysis
        .fields
        .iter()
        .find(|f| query.model.field(f.name()).is_none())
    {
        return Err(Error::invalid_query(format!(
            "{} has no field '{}'",
            expected,
            unknown.name()
        )));
    }

    if let Some(filter) = &query.filter {
        check_groups(filter)?;
    }
    Ok(())
}

fn check_groups(node: &Node) -> Result<()> {
    if let Node::Group(g) = node {
        if g.op == Logical::Not && g.children.is_empty() {
            return Err(Error::invalid_query("negation of nothing"));
        }
        for child in &g.children {
            check_groups(child)?;
        }
    }
    Ok(())
}
