use std::marker::PhantomData;
use std::sync::Arc;

use super::cursor::BatchCursor;
use super::result::{wrap, DbResult, QueryResult};
use super::transaction::Transaction;
use super::Setup;
use crate::ast::{Direction, FieldRef, Node, Query};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::lazy::Loader;
use crate::model::{Model, Record};

/// Query builder returned by `find`.
///
/// Building never fails: an invalid predicate is carried along and comes
/// back as the `Failure` of whichever terminal operation runs.
pub struct Find<M> {
    driver: Arc<dyn Driver>,
    gate: Gate,
    query: Result<Query>,
    _model: PhantomData<fn() -> M>,
}

/// What must hold before a terminal operation reaches the driver.
pub(crate) enum Gate {
    /// Schema setup has run.
    Setup(Arc<Setup>),
    /// The transaction is still open and innermost.
    Scope(Transaction),
}

impl<M: Model> Find<M> {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        gate: Gate,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Self {
        Self {
            driver,
            gate,
            query: Query::build(M::schema(), nodes),
            _model: PhantomData,
        }
    }

    pub fn order_by(mut self, field: FieldRef, direction: Direction) -> Self {
        self.query = self.query.and_then(|q| {
            if field.model() != q.model.name() {
                return Err(Error::cross_model(q.model.name(), field.model()));
            }
            Ok(q.order_by(field, direction))
        });
        self
    }

    /// `count` models of the 1-based `page`; no page means the first.
    pub fn limit(mut self, count: u64, page: Option<u64>) -> Self {
        self.query = self.query.map(|q| q.limit(count, page));
        self
    }

    async fn ready(&self) -> Result<Query> {
        match &self.gate {
            Gate::Setup(setup) => setup.ensure(&self.driver).await?,
            Gate::Scope(tx) => tx.check_open()?,
        }
        self.query.clone()
    }

    /// Every match, as a cursor. The first batch is already fetched.
    pub async fn all(self) -> QueryResult<M> {
        wrap(async {
            let query = self.ready().await?;
            BatchCursor::open(self.driver.clone(), query).await
        })
        .await
    }

    /// The first match; `NoResult` when nothing matches.
    pub async fn one(self) -> DbResult<M> {
        wrap(async {
            match self.fetch_first().await? {
                Some(model) => Ok(model),
                None => Err(Error::no_result(M::schema().name())),
            }
        })
        .await
    }

    /// The first match, or `None`.
    pub async fn first(self) -> DbResult<Option<M>> {
        wrap(self.fetch_first()).await
    }

    pub async fn count(self) -> DbResult<u64> {
        wrap(async {
            let query = self.ready().await?;
            self.driver.count(&query).await
        })
        .await
    }

    /// Set `values` on every match and return how many changed.
    pub async fn update(self, values: Record) -> DbResult<u64> {
        wrap(async {
            let query = self.ready().await?;
            self.driver.update(&query, &values).await
        })
        .await
    }

    pub async fn delete(self) -> DbResult<u64> {
        wrap(async {
            let query = self.ready().await?;
            self.driver.delete(&query).await
        })
        .await
    }

    async fn fetch_first(&self) -> Result<Option<M>> {
        let query = self.ready().await?.batch(0, 1);
        let records = self.driver.fetch(&query).await?;
        records
            .first()
            .map(|record| M::from_record(record, &Loader::new(self.driver.clone())))
            .transpose()
    }
}
