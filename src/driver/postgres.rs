use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row};

use super::{no_transaction, savepoint_name, Driver};
use crate::ast::{self, Dialect, Query, SqlStatement};
use crate::config::{PostgresConfig, SslMode};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{parse_timestamp, ModelCollection, ModelSchema, Record, Value};

type Param = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL driver on a deadpool-postgres pool.
///
/// Like the SQLite driver, each handle pins one pooled client for its
/// lifetime; [`Driver::session`] checks out another.
pub struct PostgresDriver {
    pool: Pool,
    timeout: Duration,
    session: Mutex<Session>,
    depth: AtomicUsize,
}

struct Session {
    client: Option<Object>,
    depth: usize,
}

impl Session {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::connection("connection already released"))
    }
}

impl PostgresDriver {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = config
            .connection_string()
            .parse()
            .map_err(|e| map_pg_error(e, "invalid connection settings"))?;
        let mut manager_config = ManagerConfig::default();
        manager_config.recycling_method = RecyclingMethod::Fast;

        let manager = match config.ssl_mode {
            SslMode::Disable => Manager::from_config(pg_config, NoTls, manager_config),
            // Prefer/Require: TLS, verification depends on accept_invalid_certs
            SslMode::Prefer | SslMode::Require => {
                Manager::from_config(pg_config, build_tls_connector(config, false)?, manager_config)
            }
            SslMode::VerifyCa | SslMode::VerifyFull => {
                Manager::from_config(pg_config, build_tls_connector(config, true)?, manager_config)
            }
        };
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| {
                Error::with_source(ErrorKind::Connection, "failed to build connection pool", e)
            })?;

        tracing::info!("connected to PostgreSQL at {}", config.display_string());
        Self::from_pool(pool, Duration::from_secs(config.connect_timeout_secs)).await
    }

    pub async fn from_pool(pool: Pool, timeout: Duration) -> Result<Self> {
        let client = checkout(&pool, timeout).await?;
        Ok(Self {
            pool,
            timeout,
            session: Mutex::new(Session {
                client: Some(client),
                depth: 0,
            }),
            depth: AtomicUsize::new(0),
        })
    }

    async fn query_rows(&self, stmt: &SqlStatement, context: &str) -> Result<Vec<Row>> {
        log_statement(stmt);
        let session = self.session.lock().await;
        let client = session.client()?;
        let prepared = client
            .prepare_cached(&stmt.sql)
            .await
            .map_err(|e| map_pg_error(e, context))?;
        let params = bind_params(&stmt.params, prepared.params())?;
        client
            .query(&prepared, &param_refs(&params))
            .await
            .map_err(|e| map_pg_error(e, context))
    }

    async fn execute(&self, stmt: &SqlStatement, context: &str) -> Result<u64> {
        log_statement(stmt);
        let session = self.session.lock().await;
        let client = session.client()?;
        let prepared = client
            .prepare_cached(&stmt.sql)
            .await
            .map_err(|e| map_pg_error(e, context))?;
        let params = bind_params(&stmt.params, prepared.params())?;
        client
            .execute(&prepared, &param_refs(&params))
            .await
            .map_err(|e| map_pg_error(e, context))
    }

    async fn batch(&self, statement: &str) -> Result<()> {
        let session = self.session.lock().await;
        session
            .client()?
            .batch_execute(statement)
            .await
            .map_err(|e| map_pg_error(e, "statement failed"))
    }
}

impl Drop for PostgresDriver {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if session.depth > 0 {
            if let Some(client) = session.client.take() {
                tracing::warn!(
                    "PostgreSQL handle dropped inside a transaction (depth {}); closing its connection",
                    session.depth
                );
                drop(Object::take(client));
            }
        }
    }
}

async fn checkout(pool: &Pool, timeout: Duration) -> Result<Object> {
    match tokio::time::timeout(timeout, pool.get()).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(PoolError::Backend(e))) => Err(map_pg_error(e, "failed to connect to PostgreSQL")),
        Ok(Err(e)) => Err(Error::with_source(
            ErrorKind::Connection,
            "failed to check out a connection",
            e,
        )),
        Err(_) => Err(Error::connection(format!(
            "connection timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Build a TLS connector. `strict_verify` ignores `accept_invalid_certs`.
fn build_tls_connector(config: &PostgresConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read(ca_path).map_err(|e| {
            Error::with_source(
                ErrorKind::Connection,
                format!("failed to read CA certificate file: {}", ca_path),
                e,
            )
        })?;
        for cert in pem_blocks(&pem)? {
            let cert = native_tls::Certificate::from_pem(cert.as_bytes()).map_err(|e| {
                Error::with_source(ErrorKind::Connection, "failed to parse certificate", e)
            })?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().map_err(|e| {
        Error::with_source(ErrorKind::Connection, "failed to build TLS connector", e)
    })?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one PEM string per certificate.
fn pem_blocks(pem: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(pem).map_err(|e| {
        Error::with_source(ErrorKind::Connection, "CA certificate file is not valid UTF-8", e)
    })?;

    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            current = Some(String::new());
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line.trim());
            block.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") {
            blocks.extend(current.take());
        }
    }

    if blocks.is_empty() {
        return Err(Error::connection("no certificates found in CA file"));
    }
    Ok(blocks)
}

/// Convert a value for a parameter the server typed as `ty`.
///
/// NULL is bound as a typed `None` so the server accepts it for any column.
fn to_sql_param(value: &Value, ty: &Type) -> Result<Param> {
    let mismatch = || {
        Error::query(format!(
            "cannot bind {} value to a {} parameter",
            value.type_name(),
            ty
        ))
    };
    let narrow = |i: i64| Error::query(format!("{} does not fit a {} parameter", i, ty));

    Ok(match (value, ty.clone()) {
        (Value::Null, Type::BOOL) => Box::new(None::<bool>),
        (Value::Null, Type::INT2) => Box::new(None::<i16>),
        (Value::Null, Type::INT4) => Box::new(None::<i32>),
        (Value::Null, Type::INT8) => Box::new(None::<i64>),
        (Value::Null, Type::FLOAT4) => Box::new(None::<f32>),
        (Value::Null, Type::FLOAT8) => Box::new(None::<f64>),
        (Value::Null, Type::BYTEA) => Box::new(None::<Vec<u8>>),
        (Value::Null, Type::TIMESTAMPTZ) => Box::new(None::<DateTime<Utc>>),
        (Value::Null, Type::TIMESTAMP) => Box::new(None::<NaiveDateTime>),
        (Value::Null, _) => Box::new(None::<String>),

        (Value::Bool(b), Type::BOOL) => Box::new(*b),
        (Value::Int(i), Type::BOOL) => Box::new(*i != 0),
        (Value::Int(i), Type::INT2) => Box::new(i16::try_from(*i).map_err(|_| narrow(*i))?),
        (Value::Int(i), Type::INT4) => Box::new(i32::try_from(*i).map_err(|_| narrow(*i))?),
        (Value::Int(i), Type::INT8) => Box::new(*i),
        (Value::Int(i), Type::FLOAT8) => Box::new(*i as f64),
        (Value::Float(f), Type::FLOAT4) => Box::new(*f as f32),
        (Value::Float(f), Type::FLOAT8) => Box::new(*f),
        (Value::Text(s), Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME) => {
            Box::new(s.clone())
        }
        (Value::Text(s), Type::TIMESTAMPTZ) => Box::new(parse_timestamp(s)?),
        (Value::Bytes(b), Type::BYTEA) => Box::new(b.clone()),
        (Value::Timestamp(t), Type::TIMESTAMPTZ) => Box::new(*t),
        (Value::Timestamp(t), Type::TIMESTAMP) => Box::new(t.naive_utc()),
        _ => return Err(mismatch()),
    })
}

fn bind_params(values: &[Value], types: &[Type]) -> Result<Vec<Param>> {
    if values.len() != types.len() {
        return Err(Error::query(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| to_sql_param(value, ty))
        .collect()
}

fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| &**p as &(dyn ToSql + Sync))
        .collect()
}

fn decode_value(row: &Row, idx: usize) -> std::result::Result<Value, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_().clone();
    Ok(match ty {
        Type::BOOL => Value::from(row.try_get::<_, Option<bool>>(idx)?),
        Type::INT2 => Value::from(row.try_get::<_, Option<i16>>(idx)?),
        Type::INT4 => Value::from(row.try_get::<_, Option<i32>>(idx)?),
        Type::INT8 => Value::from(row.try_get::<_, Option<i64>>(idx)?),
        Type::FLOAT4 => Value::from(row.try_get::<_, Option<f32>>(idx)?),
        Type::FLOAT8 => Value::from(row.try_get::<_, Option<f64>>(idx)?),
        Type::BYTEA => Value::from(row.try_get::<_, Option<Vec<u8>>>(idx)?),
        Type::TIMESTAMPTZ => Value::from(row.try_get::<_, Option<DateTime<Utc>>>(idx)?),
        Type::TIMESTAMP => Value::from(
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|naive| naive.and_utc()),
        ),
        _ => Value::from(row.try_get::<_, Option<String>>(idx)?),
    })
}

fn decode_row(schema: &ModelSchema, row: &Row) -> Result<Record> {
    let mut record = Record::new();
    for (idx, field) in schema.fields().iter().enumerate() {
        let value = decode_value(row, idx).map_err(|e| {
            map_pg_error(e, &format!("failed to read {}.{}", schema.name(), field.name()))
        })?;
        record.set(field.name(), value);
    }
    Ok(record)
}

/// Error kind for a five-character SQLSTATE, by class.
pub(crate) fn categorize_sqlstate(code: &str) -> ErrorKind {
    match code.get(..2) {
        Some("23") => ErrorKind::Constraint,
        Some("08") => ErrorKind::Connection,
        Some("25") | Some("40") => ErrorKind::Transaction,
        _ => ErrorKind::Query,
    }
}

fn map_pg_error(err: tokio_postgres::Error, context: &str) -> Error {
    let kind = match err.code() {
        Some(state) => categorize_sqlstate(state.code()),
        None if err.is_closed() => ErrorKind::Connection,
        None if std::error::Error::source(&err).is_some_and(|s| s.is::<std::io::Error>()) => {
            ErrorKind::Connection
        }
        None => ErrorKind::Query,
    };
    let message = match err.as_db_error() {
        Some(db) => format!("{}: {}", context, db.message()),
        None => format!("{}: {}", context, err),
    };
    Error::with_source(kind, message, err)
}

fn log_statement(stmt: &SqlStatement) {
    tracing::debug!(sql = %stmt.sql, params = stmt.params.len(), "postgres");
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn add(&self, schema: &'static ModelSchema, records: Vec<Record>) -> Result<Vec<Record>> {
        let context = format!("failed to insert {}", schema.name());
        let mut stored = Vec::with_capacity(records.len());
        for record in &records {
            let stmt = ast::compile_insert(schema, record, Dialect::Postgres)?;
            let rows = self.query_rows(&stmt, &context).await?;
            let row = rows
                .first()
                .ok_or_else(|| Error::query(format!("{}: no row returned", context)))?;
            stored.push(decode_row(schema, row)?);
        }
        Ok(stored)
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        let stmt = ast::compile_select(query, Dialect::Postgres)?;
        let rows = self.query_rows(&stmt, "fetch failed").await?;
        rows.iter().map(|row| decode_row(query.model, row)).collect()
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        let stmt = ast::compile_count(query, Dialect::Postgres)?;
        let rows = self.query_rows(&stmt, "count failed").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::query("count returned no row"))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| map_pg_error(e, "count failed"))?;
        Ok(count.max(0) as u64)
    }

    async fn update(&self, query: &Query, values: &Record) -> Result<u64> {
        let stmt = ast::compile_update(query, values, Dialect::Postgres)?;
        self.execute(&stmt, "update failed").await
    }

    async fn delete(&self, query: &Query) -> Result<u64> {
        let stmt = ast::compile_delete(query, Dialect::Postgres)?;
        self.execute(&stmt, "delete failed").await
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let statement = match session.depth {
            0 => "BEGIN".to_string(),
            depth => format!("SAVEPOINT {}", ast::quote_ident(&savepoint_name(depth))),
        };
        tracing::debug!(depth = session.depth, "{}", statement);
        session
            .client()?
            .batch_execute(&statement)
            .await
            .map_err(|e| map_pg_error(e, "begin failed").into_transaction("begin failed"))?;
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
        session
            .client()?
            .batch_execute(&statement)
            .await
            .map_err(|e| map_pg_error(e, "commit failed").into_transaction("commit failed"))?;
        session.depth -= 1;
        self.depth.store(session.depth, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let statement = match session.depth {
            0 => return Err(no_transaction()),
            1 => "ROLLBACK".to_string(),
            depth => {
                let name = ast::quote_ident(&savepoint_name(depth - 1));
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        };
        tracing::debug!(depth = session.depth, "{}", statement);
        session
            .client()?
            .batch_execute(&statement)
            .await
            .map_err(|e| map_pg_error(e, "rollback failed").into_transaction("rollback failed"))?;
        session.depth -= 1;
        self.depth.store(session.depth, Ordering::SeqCst);
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    async fn create_schema(&self, models: &ModelCollection) -> Result<()> {
        tracing::info!("creating {} PostgreSQL tables for {}", models.len(), models.name());
        for schema in models.models() {
            let ddl = ast::compile_create_table(schema, Dialect::Postgres);
            tracing::debug!(sql = %ddl, "postgres");
            self.batch(&ddl)
                .await
                .map_err(|e| e.into_schema(format!("failed to create {}", schema.name())))?;
        }
        Ok(())
    }

    async fn drop_schema(&self, models: &ModelCollection) -> Result<()> {
        for schema in models.models().iter().rev() {
            let ddl = ast::compile_drop_table(schema);
            tracing::debug!(sql = %ddl, "postgres");
            self.batch(&ddl)
                .await
                .map_err(|e| e.into_schema(format!("failed to drop {}", schema.name())))?;
        }
        Ok(())
    }

    async fn session(&self) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(
            PostgresDriver::from_pool(self.pool.clone(), self.timeout).await?,
        ))
    }

    async fn ping(&self) -> Result<()> {
        self.batch("SELECT 1").await
    }
}
