//! The contract every storage backend implements.
//!
//! Drivers are raw producers: they return values or raise [`Error`]s and
//! never build result envelopes. Wrapping happens once, in the facade.
mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryDriver;
pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use async_trait::async_trait;
use std::sync::Arc;

use crate::ast::Query;
use crate::config::{Backend, DatabaseConfig};
use crate::error::{Error, Result};
use crate::model::{ModelCollection, ModelSchema, Record};

/// Name used for the savepoint opened at nesting `depth` (1-based).
pub fn savepoint_name(depth: usize) -> String {
    format!("sp_{}", depth)
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert `records` and return them as stored, generated keys included.
    async fn add(&self, schema: &'static ModelSchema, records: Vec<Record>) -> Result<Vec<Record>>;

    /// Every record matching the query, honoring its ordering and window.
    async fn fetch(&self, query: &Query) -> Result<Vec<Record>>;

    async fn count(&self, query: &Query) -> Result<u64>;

    async fn update(&self, query: &Query, values: &Record) -> Result<u64>;

    async fn delete(&self, query: &Query) -> Result<u64>;

    /// Begin a transaction, or a savepoint when one is already open.
    async fn begin_transaction(&self) -> Result<()>;

    /// Commit the outermost transaction, or release the innermost savepoint.
    async fn commit(&self) -> Result<()>;

    /// Roll back the outermost transaction, or back to the innermost savepoint.
    async fn rollback(&self) -> Result<()>;

    /// Open transaction scopes on this handle; zero outside a transaction.
    fn transaction_depth(&self) -> usize;

    async fn create_schema(&self, models: &ModelCollection) -> Result<()>;

    async fn drop_schema(&self, models: &ModelCollection) -> Result<()>;

    /// A new handle on the same database that owns its own connection.
    async fn session(&self) -> Result<Arc<dyn Driver>>;

    async fn ping(&self) -> Result<()>;
}

/// Open the driver described by `config`.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Driver>> {
    tracing::info!("connecting to {} ({})", config.name, config.display_string());
    let driver: Arc<dyn Driver> = match &config.backend {
        Backend::Sqlite { path } => Arc::new(SqliteDriver::open(path).await?),
        Backend::Postgres(pg) => Arc::new(PostgresDriver::connect(pg).await?),
        Backend::Memory => Arc::new(MemoryDriver::new()),
    };
    Ok(driver)
}

pub(crate) fn no_transaction() -> Error {
    Error::transaction("no transaction is active")
}
