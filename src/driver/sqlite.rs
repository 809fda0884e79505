use async_trait::async_trait;
use sqlx::error::ErrorKind as SqlxErrorKind;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{no_transaction, savepoint_name, Driver};
use crate::ast::{self, Dialect, Query, SqlStatement};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{parse_timestamp, FieldType, ModelCollection, ModelSchema, Record, Value};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite driver backed by sqlx.
///
/// Each handle owns one pooled connection, so everything issued through a
/// handle (including an open transaction) runs on that connection in order.
pub struct SqliteDriver {
    pool: SqlitePool,
    session: Mutex<Session>,
    depth: AtomicUsize,
}

struct Session {
    conn: Option<PoolConnection<Sqlite>>,
    depth: usize,
}

impl Session {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::connection("connection already released"))
    }
}

impl SqliteDriver {
    /// Open a database file, or a private in-memory database for `:memory:`.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| map_sqlx_error(e, "invalid SQLite location"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error(e, "failed to open SQLite database"))?;
        Self::from_pool(pool).await
    }

    /// A fresh in-memory database. Sessions opened from it share its tables.
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let conn = pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error(e, "failed to acquire SQLite connection"))?;
        Ok(Self {
            pool,
            session: Mutex::new(Session {
                conn: Some(conn),
                depth: 0,
            }),
            depth: AtomicUsize::new(0),
        })
    }

    async fn run(&self, statement: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        sqlx::query(statement)
            .execute(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "statement failed"))?;
        Ok(())
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if session.depth > 0 {
            // Never hand a connection with an open transaction back to the pool.
            if let Some(conn) = session.conn.take() {
                tracing::warn!(
                    "SQLite handle dropped inside a transaction (depth {}); closing its connection",
                    session.depth
                );
                drop(conn.detach());
            }
        }
    }
}

fn bind_params<'q>(mut query: SqliteQuery<'q>, params: &'q [Value]) -> SqliteQuery<'q> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<i64>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Timestamp(t) => query.bind(t.to_rfc3339()),
        };
    }
    query
}

fn decode_row(schema: &ModelSchema, row: &SqliteRow) -> Result<Record> {
    let mut record = Record::new();
    for (idx, field) in schema.fields().iter().enumerate() {
        let read_err = |e: sqlx::Error| {
            map_sqlx_error(e, &format!("failed to read {}.{}", schema.name(), field.name()))
        };
        let value = match field.ty() {
            FieldType::Int => Value::from(row.try_get::<Option<i64>, _>(idx).map_err(read_err)?),
            FieldType::Float => {
                Value::from(row.try_get::<Option<f64>, _>(idx).map_err(read_err)?)
            }
            FieldType::Text => {
                Value::from(row.try_get::<Option<String>, _>(idx).map_err(read_err)?)
            }
            FieldType::Bool => Value::from(
                row.try_get::<Option<i64>, _>(idx)
                    .map_err(read_err)?
                    .map(|i| i != 0),
            ),
            FieldType::Bytes => {
                Value::from(row.try_get::<Option<Vec<u8>>, _>(idx).map_err(read_err)?)
            }
            FieldType::Timestamp => match row.try_get::<Option<String>, _>(idx).map_err(read_err)? {
                Some(text) => Value::Timestamp(parse_timestamp(&text)?),
                None => Value::Null,
            },
        };
        record.set(field.name(), value);
    }
    Ok(record)
}

/// Map a sqlx error onto the driver error kinds, keeping it as the source.
fn map_sqlx_error(err: sqlx::Error, context: &str) -> Error {
    let kind = match &err {
        sqlx::Error::Database(db) => match db.kind() {
            SqlxErrorKind::UniqueViolation
            | SqlxErrorKind::ForeignKeyViolation
            | SqlxErrorKind::NotNullViolation
            | SqlxErrorKind::CheckViolation => ErrorKind::Constraint,
            _ => ErrorKind::Query,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Connection,
        _ => ErrorKind::Query,
    };
    Error::with_source(kind, format!("{}: {}", context, err), err)
}

fn log_statement(stmt: &SqlStatement) {
    tracing::debug!(sql = %stmt.sql, params = stmt.params.len(), "sqlite");
}

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn add(&self, schema: &'static ModelSchema, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut session = self.session.lock().await;
        let mut stored = Vec::with_capacity(records.len());
        for record in &records {
            let stmt = ast::compile_insert(schema, record, Dialect::Sqlite)?;
            log_statement(&stmt);
            let row = bind_params(sqlx::query(&stmt.sql), &stmt.params)
                .fetch_one(session.conn()?)
                .await
                .map_err(|e| map_sqlx_error(e, &format!("failed to insert {}", schema.name())))?;
            stored.push(decode_row(schema, &row)?);
        }
        Ok(stored)
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        let stmt = ast::compile_select(query, Dialect::Sqlite)?;
        log_statement(&stmt);
        let mut session = self.session.lock().await;
        let rows = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_all(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "fetch failed"))?;
        rows.iter().map(|row| decode_row(query.model, row)).collect()
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        let stmt = ast::compile_count(query, Dialect::Sqlite)?;
        log_statement(&stmt);
        let mut session = self.session.lock().await;
        let row = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_one(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "count failed"))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| map_sqlx_error(e, "count failed"))?;
        Ok(count.max(0) as u64)
    }

    async fn update(&self, query: &Query, values: &Record) -> Result<u64> {
        let stmt = ast::compile_update(query, values, Dialect::Sqlite)?;
        log_statement(&stmt);
        let mut session = self.session.lock().await;
        let done = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .execute(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "update failed"))?;
        Ok(done.rows_affected())
    }

    async fn delete(&self, query: &Query) -> Result<u64> {
        let stmt = ast::compile_delete(query, Dialect::Sqlite)?;
        log_statement(&stmt);
        let mut session = self.session.lock().await;
        let done = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .execute(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "delete failed"))?;
        Ok(done.rows_affected())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let statement = match session.depth {
            0 => "BEGIN".to_string(),
            depth => format!("SAVEPOINT {}", ast::quote_ident(&savepoint_name(depth))),
        };
        tracing::debug!(depth = session.depth, "{}", statement);
        sqlx::query(&statement)
            .execute(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "begin failed").into_transaction("begin failed"))?;
        session.depth += 1;
        self.depth.store(session.depth, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let statement = match session.depth {
            0 => return Err(no_transaction()),
            1 => "COMMIT".to_string(),
            depth => format!(
                "RELEASE SAVEPOINT {}",
                ast::quote_ident(&savepoint_name(depth - 1))
            ),
        };
        tracing::debug!(depth = session.depth, "{}", statement);
        sqlx::query(&statement)
            .execute(session.conn()?)
            .await
            .map_err(|e| map_sqlx_error(e, "commit failed").into_transaction("commit failed"))?;
        session.depth -= 1;
        self.depth.store(session.depth, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let statements = match session.depth {
            0 => return Err(no_transaction()),
            1 => vec!["ROLLBACK".to_string()],
            depth => {
                let name = ast::quote_ident(&savepoint_name(depth - 1));
                vec![
                    format!("ROLLBACK TO SAVEPOINT {}", name),
                    format!("RELEASE SAVEPOINT {}", name),
                ]
            }
        };
        for statement in &statements {
            tracing::debug!(depth = session.depth, "{}", statement);
            sqlx::query(statement)
                .execute(session.conn()?)
                .await
                .map_err(|e| {
                    map_sqlx_error(e, "rollback failed").into_transaction("rollback failed")
                })?;
        }
        session.depth -= 1;
        self.depth.store(session.depth, Ordering::SeqCst);
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    async fn create_schema(&self, models: &ModelCollection) -> Result<()> {
        tracing::info!("creating {} SQLite tables for {}", models.len(), models.name());
        for schema in models.models() {
            let ddl = ast::compile_create_table(schema, Dialect::Sqlite);
            tracing::debug!(sql = %ddl, "sqlite");
            self.run(&ddl)
                .await
                .map_err(|e| e.into_schema(format!("failed to create {}", schema.name())))?;
        }
        Ok(())
    }

    async fn drop_schema(&self, models: &ModelCollection) -> Result<()> {
        for schema in models.models().iter().rev() {
            let ddl = ast::compile_drop_table(schema);
            tracing::debug!(sql = %ddl, "sqlite");
            self.run(&ddl)
                .await
                .map_err(|e| e.into_schema(format!("failed to drop {}", schema.name())))?;
        }
        Ok(())
    }

    async fn session(&self) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(SqliteDriver::from_pool(self.pool.clone()).await?))
    }

    async fn ping(&self) -> Result<()> {
        self.run("SELECT 1").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Direction;
    use crate::model::fixtures::{Item, Product, User};
    use crate::model::Model;

    async fn driver_with(models: ModelCollection) -> SqliteDriver {
        let driver = SqliteDriver::in_memory().await.unwrap();
        driver.create_schema(&models).await.unwrap();
        driver
    }

    fn product(category: &str, price: i64, in_stock: bool) -> Record {
        Record::new()
            .with("category", category)
            .with("price", price)
            .with("in_stock", in_stock)
    }

    #[tokio::test]
    async fn test_insert_returns_generated_keys() {
        let driver = driver_with(ModelCollection::new("t").with::<User>()).await;
        let stored = driver
            .add(
                User::schema(),
                vec![Record::new().with("name", "ada"), Record::new().with("name", "bob")],
            )
            .await
            .unwrap();
        assert_eq!(stored[0].read::<i64>("id").unwrap(), 1);
        assert_eq!(stored[1].read::<i64>("id").unwrap(), 2);
        assert_eq!(stored[1].read::<String>("name").unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_grouping_selects_expected_rows() {
        let driver = driver_with(ModelCollection::new("t").with::<Product>()).await;
        driver
            .add(
                Product::schema(),
                vec![
                    product("X", 10, true),
                    product("Y", 30, true),
                    product("Y", 10, false),
                ],
            )
            .await
            .unwrap();

        let query = Query::build(
            Product::schema(),
            [Product::field("category")
                .eq("X")
                .or(Product::field("price").lt(25))
                .and(Product::field("in_stock").eq(true))],
        )
        .unwrap();
        let rows = driver.fetch(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].read::<String>("category").unwrap(), "X");
        assert!(rows[0].read::<bool>("in_stock").unwrap());
    }

    #[tokio::test]
    async fn test_pagination_window() {
        let driver = driver_with(ModelCollection::new("t").with::<Item>()).await;
        let items = (0..20)
            .map(|i| Record::new().with("name", format!("item_{}", i)).with("position", i))
            .collect();
        driver.add(Item::schema(), items).await.unwrap();

        let query = Query::new(Item::schema())
            .order_by(Item::field("id"), Direction::Ascending)
            .limit(5, Some(2));
        let names: Vec<String> = driver
            .fetch(&query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.read::<String>("name").unwrap())
            .collect();
        assert_eq!(names, vec!["item_5", "item_6", "item_7", "item_8", "item_9"]);
    }

    #[tokio::test]
    async fn test_null_filter_and_count() {
        let driver = driver_with(ModelCollection::new("t").with::<Item>()).await;
        driver
            .add(
                Item::schema(),
                vec![
                    Record::new().with("name", "a").with("position", 1),
                    Record::new().with("name", "b").with("position", Value::Null),
                ],
            )
            .await
            .unwrap();

        let nulls = Query::build(Item::schema(), [Item::field("position").eq(Value::Null)])
            .unwrap();
        assert_eq!(driver.count(&nulls).await.unwrap(), 1);
        let rows = driver.fetch(&nulls).await.unwrap();
        assert_eq!(rows[0].read::<String>("name").unwrap(), "b");

        let not_null =
            Query::build(Item::schema(), [Item::field("position").ne(Value::Null)]).unwrap();
        assert_eq!(driver.count(&not_null).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_counts() {
        let driver = driver_with(ModelCollection::new("t").with::<Product>()).await;
        driver
            .add(
                Product::schema(),
                vec![product("X", 1, true), product("X", 2, true), product("Z", 3, true)],
            )
            .await
            .unwrap();

        let xs = Query::build(Product::schema(), [Product::field("category").eq("X")]).unwrap();
        let updated = driver
            .update(&xs, &Record::new().with("in_stock", false))
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let out = Query::build(Product::schema(), [Product::field("in_stock").eq(false)]).unwrap();
        assert_eq!(driver.delete(&out).await.unwrap(), 2);
        assert_eq!(driver.count(&Query::new(Product::schema())).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nested_rollback_discards_inner_commit() {
        let driver = driver_with(ModelCollection::new("t").with::<User>()).await;
        let session = driver.session().await.unwrap();

        session.begin_transaction().await.unwrap();
        session
            .add(User::schema(), vec![Record::new().with("name", "a")])
            .await
            .unwrap();
        session.begin_transaction().await.unwrap();
        assert_eq!(session.transaction_depth(), 2);
        session
            .add(User::schema(), vec![Record::new().with("name", "b")])
            .await
            .unwrap();
        session.commit().await.unwrap();
        assert_eq!(session.count(&Query::new(User::schema())).await.unwrap(), 2);
        session.rollback().await.unwrap();
        assert_eq!(session.transaction_depth(), 0);

        assert_eq!(driver.count(&Query::new(User::schema())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inner_rollback_keeps_outer_work() {
        let driver = driver_with(ModelCollection::new("t").with::<User>()).await;
        let session = driver.session().await.unwrap();

        session.begin_transaction().await.unwrap();
        session
            .add(User::schema(), vec![Record::new().with("name", "a")])
            .await
            .unwrap();
        session.begin_transaction().await.unwrap();
        session
            .add(User::schema(), vec![Record::new().with("name", "b")])
            .await
            .unwrap();
        session.rollback().await.unwrap();
        session.commit().await.unwrap();

        let rows = driver.fetch(&Query::new(User::schema())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].read::<String>("name").unwrap(), "a");
    }

    #[tokio::test]
    async fn test_commit_without_transaction() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let err = driver.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }

    #[tokio::test]
    async fn test_unique_violation_is_constraint() {
        let driver = driver_with(ModelCollection::new("t").with::<User>()).await;
        driver
            .add(User::schema(), vec![Record::new().with("id", 7).with("name", "a")])
            .await
            .unwrap();
        let err = driver
            .add(User::schema(), vec![Record::new().with("id", 7).with("name", "b")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
    }

    #[tokio::test]
    async fn test_missing_table_is_query_error() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let err = driver.fetch(&Query::new(User::schema())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
    }

    #[tokio::test]
    async fn test_drop_schema() {
        let models = ModelCollection::new("t").with::<User>();
        let driver = driver_with(models.clone()).await;
        driver.drop_schema(&models).await.unwrap();
        assert!(driver.count(&Query::new(User::schema())).await.is_err());
    }
}
