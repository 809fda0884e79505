use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value as Json};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{no_transaction, Driver};
use crate::ast::{self, FindDocument, Query};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{ModelCollection, ModelSchema, Record, Value};

type Document = Map<String, Json>;

#[derive(Debug, Clone, Default)]
struct Store {
    collections: HashMap<String, Collection>,
}

#[derive(Debug, Clone, Default)]
struct Collection {
    documents: Vec<Document>,
}

impl Store {
    fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::query(format!("no such collection: {}", name)))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::query(format!("no such collection: {}", name)))
    }

    fn create_tables(&mut self, tables: &[String]) {
        for table in tables {
            self.collections.entry(table.clone()).or_default();
        }
    }

    fn drop_tables(&mut self, tables: &[String]) {
        for table in tables {
            self.collections.remove(table);
        }
    }
}

/// State every handle on one store shares.
#[derive(Default)]
struct Shared {
    store: Mutex<Store>,
    /// Last key handed out per collection. Never rolled back.
    sequences: Mutex<HashMap<String, i64>>,
}

/// A write made inside a transaction.
enum Change {
    Insert {
        schema: &'static ModelSchema,
        documents: Vec<Document>,
    },
    Update {
        table: String,
        filter: Json,
        changes: Vec<(String, Json)>,
    },
    Delete {
        table: String,
        filter: Json,
    },
    Create {
        tables: Vec<String>,
    },
    Drop {
        tables: Vec<String>,
    },
}

impl Change {
    fn apply(&self, store: &mut Store) -> Result<()> {
        match self {
            Change::Insert { schema, documents } => {
                let collection = store.collection_mut(schema.table())?;
                // Keys were assigned when the documents were first inserted.
                let mut unused = 0;
                insert_all(collection, schema, documents.clone(), &mut unused)?;
            }
            Change::Update {
                table,
                filter,
                changes,
            } => {
                update_matching(store.collection_mut(table)?, filter, changes)?;
            }
            Change::Delete { table, filter } => {
                delete_matching(store.collection_mut(table)?, filter)?;
            }
            Change::Create { tables } => store.create_tables(tables),
            Change::Drop { tables } => store.drop_tables(tables),
        }
        Ok(())
    }
}

#[derive(Default)]
struct Session {
    /// Private copy of the store while a transaction is open.
    working: Option<Store>,
    /// Writes since the outermost begin, oldest first.
    log: Vec<Change>,
    /// Working copy and log length at each open savepoint.
    savepoints: Vec<(Store, usize)>,
}

/// Document store kept in process memory.
///
/// Queries go through the document translator and are evaluated against
/// JSON documents. A transaction reads and writes a private copy of the
/// store and records its writes; the outermost commit replays them onto
/// the shared store as it is at that moment. A replayed write that no
/// longer applies (duplicate key, dropped collection) fails the commit.
///
/// Keys come from per-collection sequences that, like database sequences,
/// are not rolled back.
pub struct MemoryDriver {
    shared: Arc<Shared>,
    session: Mutex<Session>,
    depth: AtomicUsize,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::on(Arc::new(Shared::default()))
    }

    fn on(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            session: Mutex::new(Session::default()),
            depth: AtomicUsize::new(0),
        }
    }

    /// Run `f` against the transaction copy if one is open, else the shared store.
    async fn read<R>(&self, f: impl FnOnce(&Store) -> Result<R>) -> Result<R> {
        let session = self.session.lock().await;
        match session.working.as_ref() {
            Some(store) => f(store),
            None => f(&*self.shared.store.lock().await),
        }
    }

    /// Like [`read`](Self::read), but inside a transaction a successful
    /// write is also logged as `change` for replay at commit.
    async fn write<R>(
        &self,
        f: impl FnOnce(&mut Store) -> Result<R>,
        change: impl FnOnce(&R) -> Change,
    ) -> Result<R> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        match session.working.as_mut() {
            Some(store) => {
                let outcome = f(store)?;
                session.log.push(change(&outcome));
                Ok(outcome)
            }
            None => f(&mut *self.shared.store.lock().await),
        }
    }
}

fn encode(schema: &ModelSchema, record: &Record) -> Result<Document> {
    for (name, _) in record.iter() {
        if schema.field(name).is_none() {
            return Err(Error::invalid_query(format!(
                "{} has no field '{}'",
                schema.name(),
                name
            )));
        }
    }
    Ok(schema
        .fields()
        .iter()
        .map(|field| {
            let value = record.get(field.name()).map_or(Json::Null, Value::to_json);
            (field.column().to_string(), value)
        })
        .collect())
}

fn decode(schema: &ModelSchema, document: &Document) -> Result<Record> {
    let mut record = Record::new();
    for field in schema.fields() {
        let json = document.get(field.column()).unwrap_or(&NULL);
        record.set(field.name(), Value::from_json(json, field.ty())?);
    }
    Ok(record)
}

fn insert(
    collection: &mut Collection,
    schema: &ModelSchema,
    mut document: Document,
    next_id: &mut i64,
) -> Result<Document> {
    for field in schema.fields() {
        let column = field.column();
        let missing = document.get(column).map_or(true, Json::is_null);
        if field.is_auto() {
            if missing {
                *next_id += 1;
                document.insert(column.to_string(), Json::from(*next_id));
            } else if let Some(id) = document.get(column).and_then(Json::as_i64) {
                *next_id = (*next_id).max(id);
            }
        } else if missing && !field.is_optional() {
            return Err(Error::constraint(format!(
                "{}.{} may not be null",
                schema.name(),
                field.name()
            )));
        }
    }

    let keys: Vec<&str> = schema.key_fields().iter().map(|f| f.column()).collect();
    if !keys.is_empty() {
        let duplicate = collection.documents.iter().any(|existing| {
            keys.iter().all(|k| {
                json_eq(
                    existing.get(*k).unwrap_or(&NULL),
                    document.get(*k).unwrap_or(&NULL),
                )
            })
        });
        if duplicate {
            return Err(Error::constraint(format!("duplicate key in {}", schema.name())));
        }
    }

    collection.documents.push(document.clone());
    Ok(document)
}

/// Insert every document or none, like a multi-row insert.
fn insert_all(
    collection: &mut Collection,
    schema: &ModelSchema,
    documents: Vec<Document>,
    next_id: &mut i64,
) -> Result<Vec<Document>> {
    let mut staged = collection.clone();
    let stored = documents
        .into_iter()
        .map(|document| insert(&mut staged, schema, document, next_id))
        .collect::<Result<Vec<_>>>()?;
    *collection = staged;
    Ok(stored)
}

/// Evaluated up front so a bad filter changes nothing.
fn hits(collection: &Collection, filter: &Json) -> Result<Vec<bool>> {
    collection
        .documents
        .iter()
        .map(|document| matches(document, filter))
        .collect()
}

fn update_matching(
    collection: &mut Collection,
    filter: &Json,
    changes: &[(String, Json)],
) -> Result<u64> {
    let hits = hits(collection, filter)?;
    let mut updated = 0;
    for (document, hit) in collection.documents.iter_mut().zip(hits) {
        if hit {
            for (column, value) in changes {
                document.insert(column.clone(), value.clone());
            }
            updated += 1;
        }
    }
    Ok(updated)
}

fn delete_matching(collection: &mut Collection, filter: &Json) -> Result<u64> {
    let mut hits = hits(collection, filter)?.into_iter();
    let before = collection.documents.len();
    collection
        .documents
        .retain(|_| !hits.next().unwrap_or(false));
    Ok((before - collection.documents.len()) as u64)
}

fn find(collection: &Collection, find: &FindDocument) -> Result<Vec<Document>> {
    let mut matched = Vec::new();
    for document in &collection.documents {
        if matches(document, &find.filter)? {
            matched.push(document.clone());
        }
    }
    matched.sort_by(|a, b| {
        find.sort
            .iter()
            .map(|(column, order)| {
                let ord = sort_order(
                    a.get(column).unwrap_or(&NULL),
                    b.get(column).unwrap_or(&NULL),
                );
                if *order < 0 {
                    ord.reverse()
                } else {
                    ord
                }
            })
            .find(|ord| *ord != CmpOrdering::Equal)
            .unwrap_or(CmpOrdering::Equal)
    });
    let limit = find.limit.map_or(usize::MAX, |l| l as usize);
    Ok(matched
        .into_iter()
        .skip(find.skip as usize)
        .take(limit)
        .collect())
}

static NULL: Json = Json::Null;

/// Evaluate a filter document against one document.
fn matches(document: &Document, filter: &Json) -> Result<bool> {
    let Json::Object(clauses) = filter else {
        return Err(Error::query(format!("filter must be a document, got {}", filter)));
    };
    for (key, condition) in clauses {
        let ok = match key.as_str() {
            "$and" => all_of(document, condition)?,
            "$or" => any_of(document, condition)?,
            "$nor" => !any_of(document, condition)?,
            "$expr" => expression(document, condition)?,
            column => field_matches(document.get(column).unwrap_or(&NULL), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clause_list(condition: &Json) -> Result<&Vec<Json>> {
    condition
        .as_array()
        .ok_or_else(|| Error::query(format!("expected a list of filters, got {}", condition)))
}

fn all_of(document: &Document, condition: &Json) -> Result<bool> {
    for clause in clause_list(condition)? {
        if !matches(document, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(document: &Document, condition: &Json) -> Result<bool> {
    for clause in clause_list(condition)? {
        if matches(document, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn field_matches(value: &Json, condition: &Json) -> Result<bool> {
    let operators = match condition {
        Json::Object(ops) if ops.keys().all(|k| k.starts_with('$')) => ops,
        literal => return Ok(json_eq(value, literal)),
    };
    for (op, operand) in operators {
        if !apply(op, value, operand)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `$ne` and `$nin` never match a null or missing value, the same as SQL
/// `<>` and `NOT IN` against NULL.
fn apply(op: &str, value: &Json, operand: &Json) -> Result<bool> {
    Ok(match op {
        "$eq" => json_eq(value, operand),
        "$ne" => !value.is_null() && !json_eq(value, operand),
        "$gt" => compare(value, operand) == Some(CmpOrdering::Greater),
        "$gte" => matches!(compare(value, operand), Some(CmpOrdering::Greater | CmpOrdering::Equal)),
        "$lt" => compare(value, operand) == Some(CmpOrdering::Less),
        "$lte" => matches!(compare(value, operand), Some(CmpOrdering::Less | CmpOrdering::Equal)),
        "$in" => clause_list(operand)?.iter().any(|item| json_eq(value, item)),
        "$nin" => {
            !value.is_null() && !clause_list(operand)?.iter().any(|item| json_eq(value, item))
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| Error::query("$regex needs a string pattern"))?;
            let regex = Regex::new(pattern).map_err(|e| {
                Error::with_source(ErrorKind::Query, format!("invalid pattern {}", pattern), e)
            })?;
            value.as_str().is_some_and(|text| regex.is_match(text))
        }
        other => return Err(Error::query(format!("unsupported operator {}", other))),
    })
}

/// `{"$op": ["$a", "$b"]}` with `$`-prefixed strings naming columns.
fn expression(document: &Document, condition: &Json) -> Result<bool> {
    let Json::Object(ops) = condition else {
        return Err(Error::query(format!("invalid $expr {}", condition)));
    };
    for (op, operands) in ops {
        let resolved: Vec<&Json> = clause_list(operands)?
            .iter()
            .map(|operand| match operand.as_str().and_then(|s| s.strip_prefix('$')) {
                Some(column) => document.get(column).unwrap_or(&NULL),
                None => operand,
            })
            .collect();
        let [left, right] = resolved.as_slice() else {
            return Err(Error::query(format!("{} needs two operands", op)));
        };
        if !apply(op, left, right)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => compare(a, b) == Some(CmpOrdering::Equal),
        _ => a == b,
    }
}

/// Ordering between two values of the same kind; `None` when incomparable.
fn compare(a: &Json, b: &Json) -> Option<CmpOrdering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting: nulls first, then by kind, then by value.
fn sort_order(a: &Json, b: &Json) -> CmpOrdering {
    fn rank(v: &Json) -> u8 {
        match v {
            Json::Null => 0,
            Json::Bool(_) => 1,
            Json::Number(_) => 2,
            Json::String(_) => 3,
            Json::Array(_) => 4,
            Json::Object(_) => 5,
        }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| compare(a, b).unwrap_or(CmpOrdering::Equal))
}

fn tables(models: &ModelCollection) -> Vec<String> {
    models
        .models()
        .iter()
        .map(|schema| schema.table().to_string())
        .collect()
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, schema: &'static ModelSchema, records: Vec<Record>) -> Result<Vec<Record>> {
        let documents = records
            .iter()
            .map(|record| encode(schema, record))
            .collect::<Result<Vec<_>>>()?;
        let mut sequences = self.shared.sequences.lock().await;
        let sequence = sequences.entry(schema.table().to_string()).or_insert(0);
        let mut next_id = *sequence;
        let stored = self
            .write(
                |store| {
                    let collection = store.collection_mut(schema.table())?;
                    insert_all(collection, schema, documents, &mut next_id)
                },
                |stored| Change::Insert {
                    schema,
                    documents: stored.clone(),
                },
            )
            .await?;
        *sequence = next_id;
        stored.iter().map(|document| decode(schema, document)).collect()
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        let find_doc = ast::compile_find(query)?;
        tracing::debug!(collection = %find_doc.collection, filter = %find_doc.filter, "memory");
        let documents = self
            .read(|store| find(store.collection(&find_doc.collection)?, &find_doc))
            .await?;
        documents
            .iter()
            .map(|document| decode(query.model, document))
            .collect()
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        let filter = ast::compile_filter(query)?;
        self.read(|store| {
            let hits = hits(store.collection(query.model.table())?, &filter)?;
            Ok(hits.into_iter().filter(|hit| *hit).count() as u64)
        })
        .await
    }

    async fn update(&self, query: &Query, values: &Record) -> Result<u64> {
        let filter = ast::compile_filter(query)?;
        let schema = query.model;
        let mut changes = Vec::with_capacity(values.len());
        for (name, value) in values.iter() {
            let field = schema.field(name).ok_or_else(|| {
                Error::invalid_query(format!("{} has no field '{}'", schema.name(), name))
            })?;
            changes.push((field.column().to_string(), value.to_json()));
        }
        if changes.is_empty() {
            return Err(Error::invalid_query("update with no values"));
        }

        self.write(
            |store| update_matching(store.collection_mut(schema.table())?, &filter, &changes),
            |_| Change::Update {
                table: schema.table().to_string(),
                filter: filter.clone(),
                changes: changes.clone(),
            },
        )
        .await
    }

    async fn delete(&self, query: &Query) -> Result<u64> {
        let filter = ast::compile_filter(query)?;
        let table = query.model.table();
        self.write(
            |store| delete_matching(store.collection_mut(table)?, &filter),
            |_| Change::Delete {
                table: table.to_string(),
                filter: filter.clone(),
            },
        )
        .await
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        match session.working.clone() {
            None => {
                let snapshot = self.shared.store.lock().await.clone();
                session.working = Some(snapshot);
                session.log.clear();
            }
            Some(current) => session.savepoints.push((current, session.log.len())),
        }
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(depth, "memory begin");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        if session.working.is_none() {
            return Err(no_transaction());
        }
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        if session.savepoints.pop().is_some() {
            tracing::debug!(depth, "memory release savepoint");
            return Ok(());
        }

        // The transaction ends here whether or not the replay succeeds.
        session.working = None;
        let log = mem::take(&mut session.log);
        let mut shared = self.shared.store.lock().await;
        let mut merged = shared.clone();
        for change in &log {
            change.apply(&mut merged).map_err(|e| {
                e.into_transaction("commit conflicts with a concurrent write; rolled back")
            })?;
        }
        *shared = merged;
        tracing::debug!(depth, changes = log.len(), "memory commit");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        if session.working.is_none() {
            return Err(no_transaction());
        }
        match session.savepoints.pop() {
            Some((store, len)) => {
                session.working = Some(store);
                session.log.truncate(len);
            }
            None => {
                session.working = None;
                session.log.clear();
            }
        }
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(depth, "memory rollback");
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    async fn create_schema(&self, models: &ModelCollection) -> Result<()> {
        tracing::info!("creating {} collections for {}", models.len(), models.name());
        let tables = tables(models);
        self.write(
            |store| {
                store.create_tables(&tables);
                Ok(())
            },
            |_| Change::Create {
                tables: tables.clone(),
            },
        )
        .await
    }

    async fn drop_schema(&self, models: &ModelCollection) -> Result<()> {
        let tables = tables(models);
        self.write(
            |store| {
                store.drop_tables(&tables);
                Ok(())
            },
            |_| Change::Drop {
                tables: tables.clone(),
            },
        )
        .await
    }

    async fn session(&self) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(MemoryDriver::on(self.shared.clone())))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
