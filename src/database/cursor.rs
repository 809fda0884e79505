use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::ast::{Direction, Query};
use crate::driver::Driver;
use crate::error::Result;
use crate::lazy::Loader;
use crate::model::{Model, Record};

/// Rows fetched per round trip.
pub const BATCH_SIZE: u64 = 100;

/// Single-pass cursor over the models a query matched.
///
/// Rows are fetched in windows of [`BATCH_SIZE`] inside the query's own
/// limit and page. A cursor cannot be rewound; draining it consumes it.
pub struct BatchCursor<M> {
    driver: Arc<dyn Driver>,
    loader: Loader,
    query: Query,
    buffer: VecDeque<Record>,
    next_batch: u64,
    exhausted: bool,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> BatchCursor<M> {
    /// Open the cursor and fetch the first batch.
    pub(crate) async fn open(driver: Arc<dyn Driver>, query: Query) -> Result<Self> {
        let mut cursor = Self {
            loader: Loader::new(driver.clone()),
            driver,
            query: stable_order(query),
            buffer: VecDeque::new(),
            next_batch: 0,
            exhausted: false,
            _model: PhantomData,
        };
        cursor.fill().await?;
        Ok(cursor)
    }

    async fn fill(&mut self) -> Result<()> {
        let batch = self.query.batch(self.next_batch, BATCH_SIZE);
        let records = self.driver.fetch(&batch).await?;
        tracing::debug!(
            model = self.query.model.name(),
            batch = self.next_batch,
            rows = records.len(),
            "fetched batch"
        );
        self.next_batch += 1;
        if (records.len() as u64) < BATCH_SIZE {
            self.exhausted = true;
        }
        self.buffer.extend(records);
        Ok(())
    }

    /// The next model, fetching another batch when the buffer runs dry.
    ///
    /// A failed fetch is returned once and ends the cursor.
    pub async fn next(&mut self) -> Option<Result<M>> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill().await {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let record = self.buffer.pop_front()?;
        Some(M::from_record(&record, &self.loader))
    }

    pub async fn to_list(mut self) -> Result<Vec<M>> {
        let mut models = Vec::new();
        while let Some(model) = self.next().await {
            models.push(model?);
        }
        Ok(models)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<M>> {
        stream::unfold(self, |mut cursor| async move {
            let item = cursor.next().await?;
            Some((item, cursor))
        })
    }
}

impl<M> fmt::Debug for BatchCursor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCursor")
            .field("model", &self.query.model.name())
            .field("buffered", &self.buffer.len())
            .field("next_batch", &self.next_batch)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Order by the key fields when the query has no ordering, so that
/// consecutive windows never overlap.
fn stable_order(query: Query) -> Query {
    if !query.ordering().is_empty() {
        return query;
    }
    let schema = query.model;
    schema.key_fields().iter().fold(query, |q, key| {
        q.order_by(schema.field_ref(key.name()), Direction::Ascending)
    })
}
