/// Query AST and backend translators.
///
/// ```text
/// FieldRef builders (builder.rs)
///       ↓
/// Query AST          (types.rs)
///       ↓
/// Validation         (analyzer.rs)
///       ↓
/// SQL compiler       (compiler.rs)    Document compiler (document.rs)
///       ↓                                   ↓
/// SQLite / PostgreSQL drivers         in-memory document driver
/// ```
pub mod analyzer;
pub mod builder;
pub mod compiler;
pub mod document;
pub mod types;

pub use analyzer::{analyze_query, validate, QueryAnalysis};
pub use compiler::{
    compile_count, compile_create_table, compile_delete, compile_drop_table, compile_insert,
    compile_select, compile_update, quote_ident, Dialect, SqlStatement,
};
pub use document::{compile_filter, compile_find, FindDocument};
pub use types::*;
