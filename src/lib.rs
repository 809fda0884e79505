pub mod ast;
pub mod config;
pub mod database;
pub mod driver;
pub mod error;
pub mod lazy;
pub mod model;

pub use database::{
    BatchCursor, Database, DbResult, Find, Persist, QueryResult, QueryScope, Transaction,
};
pub use driver::Driver;
pub use error::{Error, ErrorKind, Result};
pub use lazy::{LazyField, LazyState, Loader};
pub use model::{
    Field, FieldMeta, FieldType, FromValue, Model, ModelCollection, ModelSchema, Record, Value,
};
