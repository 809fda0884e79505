//! Lazily resolved relationship fields.
//!
//! A [`LazyField`] holds a resolver bound to the driver its owner was read
//! from. The first await runs the resolver; every await that arrives while
//! it is in flight shares the same pending future, so one field issues at
//! most one query at a time. Outcomes, failures included, stay cached until
//! [`LazyField::refresh`] is called.
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::ast::{Direction, Query};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::model::{Field, Model, ModelSchema, Record, Value};

type Resolver<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type Pending<T> = Shared<BoxFuture<'static, Result<Arc<T>>>>;

/// Observable resolution state of a [`LazyField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

enum State<T> {
    NotLoaded,
    Loading { generation: u64, pending: Pending<T> },
    Loaded(Arc<T>),
    Failed(Error),
}

struct Inner<T> {
    resolver: Option<Resolver<T>>,
    state: Mutex<State<T>>,
    generation: AtomicU64,
}

/// A per-instance relationship slot that loads on first await.
///
/// Clones share the cache: a model instance and its clones see one state.
pub struct LazyField<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for LazyField<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> LazyField<T> {
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        Self::with_state(Some(Arc::new(resolver)), State::NotLoaded)
    }

    /// A field that already holds `value` and has nothing to reload from.
    pub fn loaded(value: T) -> Self {
        Self::with_state(None, State::Loaded(Arc::new(value)))
    }

    /// A field on an instance that was never read from a database.
    pub fn detached() -> Self {
        Self::with_state(None, State::NotLoaded)
    }

    fn with_state(resolver: Option<Resolver<T>>, state: State<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                state: Mutex::new(state),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> LazyState {
        match &*self.lock() {
            State::NotLoaded => LazyState::NotLoaded,
            State::Loading { .. } => LazyState::Loading,
            State::Loaded(_) => LazyState::Loaded,
            State::Failed(_) => LazyState::Failed,
        }
    }

    /// Resolve on first use, join an in-flight load, or return the cache.
    pub async fn get(&self) -> Result<Arc<T>> {
        let (generation, pending) = {
            let mut state = self.lock();
            match &*state {
                State::Loaded(value) => return Ok(value.clone()),
                State::Failed(err) => return Err(err.clone()),
                State::Loading {
                    generation,
                    pending,
                } => (*generation, pending.clone()),
                State::NotLoaded => self.start(&mut state),
            }
        };
        self.settle(generation, pending).await
    }

    /// Like [`get`](Self::get), substituting `default` for a failure.
    pub async fn get_or(&self, default: T) -> Arc<T> {
        match self.get().await {
            Ok(value) => value,
            Err(_) => Arc::new(default),
        }
    }

    /// Re-run the resolver and replace whatever is cached.
    pub async fn refresh(&self) -> Result<Arc<T>> {
        let (generation, pending) = {
            let mut state = self.lock();
            self.start(&mut state)
        };
        self.settle(generation, pending).await
    }

    /// Resolve only when nothing has been loaded yet.
    pub async fn refresh_if_needed(&self) -> Result<Arc<T>> {
        self.get().await
    }

    fn start(&self, state: &mut State<T>) -> (u64, Pending<T>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = match &self.inner.resolver {
            Some(resolver) => resolver().map(|outcome| outcome.map(Arc::new)).boxed(),
            None => futures::future::ready(Err(Error::invalid_query(
                "relationship field is not bound to a database",
            )))
            .boxed(),
        }
        .shared();
        *state = State::Loading {
            generation,
            pending: pending.clone(),
        };
        (generation, pending)
    }

    async fn settle(&self, generation: u64, pending: Pending<T>) -> Result<Arc<T>> {
        let outcome = pending.await;
        let mut state = self.lock();
        // A refresh may have started a newer load in the meantime.
        if matches!(&*state, State::Loading { generation: current, .. } if *current == generation)
        {
            *state = match &outcome {
                Ok(value) => State::Loaded(value.clone()),
                Err(err) => State::Failed(err.clone()),
            };
        }
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for LazyField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyField({:?})", self.state())
    }
}

/// Builds relationship fields bound to one driver.
///
/// Handed to [`Model::from_record`] so that instances read through a
/// transaction resolve their relationships on that same transaction.
#[derive(Clone)]
pub struct Loader {
    driver: Arc<dyn Driver>,
}

impl Loader {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// At most one `T` related to `owner`.
    ///
    /// Follows `O`'s reference onto `T` when there is one (N:1). Otherwise
    /// looks for a `T` whose reference points back at `owner` (1:1).
    pub fn the_related<O: Model, T: Model>(&self, owner: &Record) -> LazyField<Option<T>> {
        let loader = self.clone();
        let owner = owner.clone();
        LazyField::new(move || {
            let loader = loader.clone();
            let owner = owner.clone();
            async move {
                let (field, value) = match O::schema().reference_to(T::schema()) {
                    Some(fk) => {
                        let target = fk
                            .reference()
                            .map(|r| r.field())
                            .ok_or_else(|| missing_reference::<O, T>())?;
                        (target, value_of(&owner, fk.name()))
                    }
                    None => {
                        let back = T::schema()
                            .reference_to(O::schema())
                            .ok_or_else(|| missing_reference::<O, T>())?;
                        let source = back
                            .reference()
                            .map(|r| r.field())
                            .ok_or_else(|| missing_reference::<O, T>())?;
                        (back.name(), value_of(&owner, source))
                    }
                };
                if value.is_null() {
                    return Ok(None);
                }

                let query = Query::build(T::schema(), [T::field(field).eq(value.clone())])?
                    .limit(2, None);
                let mut rows = loader.driver.fetch(&query).await?;
                match rows.len() {
                    0 => Ok(None),
                    1 => {
                        let record = rows.remove(0);
                        T::from_record(&record, &loader).map(Some)
                    }
                    _ => Err(Error::query(format!(
                        "more than one {} has {} = {}",
                        T::schema().name(),
                        field,
                        value
                    ))),
                }
            }
            .boxed()
        })
    }

    /// Every `T` whose reference points at `owner` (1:N).
    pub fn every_related<O: Model, T: Model>(&self, owner: &Record) -> LazyField<Vec<T>> {
        let loader = self.clone();
        let owner = owner.clone();
        LazyField::new(move || {
            let loader = loader.clone();
            let owner = owner.clone();
            async move {
                let fk = T::schema()
                    .reference_to(O::schema())
                    .ok_or_else(|| missing_reference::<T, O>())?;
                let source = fk
                    .reference()
                    .map(|r| r.field())
                    .ok_or_else(|| missing_reference::<T, O>())?;
                let query = Query::build(
                    T::schema(),
                    [T::field(fk.name()).eq(value_of(&owner, source))],
                )?;
                loader.load_all(by_key(query)).await
            }
            .boxed()
        })
    }

    /// Every `T` linked to `owner` through association rows `A` (N:M).
    ///
    /// Two driver calls: the links for `owner`, then the targets whose key
    /// is in the set of linked keys.
    pub fn associated<O: Model, A: Model, T: Model>(&self, owner: &Record) -> LazyField<Vec<T>> {
        let loader = self.clone();
        let owner = owner.clone();
        LazyField::new(move || {
            let loader = loader.clone();
            let owner = owner.clone();
            async move {
                let to_owner = A::schema()
                    .reference_to(O::schema())
                    .ok_or_else(|| missing_reference::<A, O>())?;
                let to_target = A::schema()
                    .reference_to(T::schema())
                    .ok_or_else(|| missing_reference::<A, T>())?;
                let (owner_key, target_key) = match (to_owner.reference(), to_target.reference()) {
                    (Some(o), Some(t)) => (o.field(), t.field()),
                    _ => return Err(missing_reference::<A, T>()),
                };

                let links = Query::build(
                    A::schema(),
                    [A::field(to_owner.name()).eq(value_of(&owner, owner_key))],
                )?;
                let linked = linked_keys(&loader.driver.fetch(&links).await?, to_target);
                if linked.is_empty() {
                    return Ok(Vec::new());
                }

                let targets = Query::build(T::schema(), [T::field(target_key).is_in(linked)])?;
                loader.load_all(by_key(targets)).await
            }
            .boxed()
        })
    }

    async fn load_all<T: Model>(&self, query: Query) -> Result<Vec<T>> {
        self.driver
            .fetch(&query)
            .await?
            .iter()
            .map(|record| T::from_record(record, self))
            .collect()
    }
}

fn value_of(record: &Record, field: &str) -> Value {
    record.get(field).cloned().unwrap_or(Value::Null)
}

fn by_key(query: Query) -> Query {
    let schema: &'static ModelSchema = query.model;
    schema.key_fields().iter().fold(query, |q, key| {
        q.order_by(schema.field_ref(key.name()), Direction::Ascending)
    })
}

/// Distinct non-null values of `field` across `links`, in first-seen order.
fn linked_keys(links: &[Record], field: &Field) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    for link in links {
        let value = value_of(link, field.name());
        if value.is_null() || !seen.insert(value.to_string()) {
            continue;
        }
        keys.push(value);
    }
    keys
}

fn missing_reference<A: Model, B: Model>() -> Error {
    Error::invalid_query(format!(
        "{} declares no reference to {}",
        A::schema().name(),
        B::schema().name()
    ))
}
