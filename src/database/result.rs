use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use super::cursor::BatchCursor;
use crate::error::{Error, Result};
use crate::model::Model;

/// Outcome of a public database operation.
///
/// Built exactly once, by the facade. `Success` cannot exist without its
/// value.
#[must_use]
#[derive(Debug, Clone)]
pub enum DbResult<T> {
    Success(T),
    Failure(Error),
}

/// Result of a query: a single-pass cursor over the matching models.
pub type QueryResult<M> = DbResult<BatchCursor<M>>;

impl<T> DbResult<T> {
    /// The value, or the wrapped error.
    pub fn value(self) -> Result<T> {
        match self {
            DbResult::Success(value) => Ok(value),
            DbResult::Failure(err) => Err(err),
        }
    }

    pub fn value_or(self, default: T) -> T {
        match self {
            DbResult::Success(value) => value,
            DbResult::Failure(_) => default,
        }
    }

    pub fn value_or_else(self, f: impl FnOnce(Error) -> T) -> T {
        match self {
            DbResult::Success(value) => value,
            DbResult::Failure(err) => f(err),
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            DbResult::Success(_) => None,
            DbResult::Failure(err) => Some(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DbResult::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DbResult<U> {
        match self {
            DbResult::Success(value) => DbResult::Success(f(value)),
            DbResult::Failure(err) => DbResult::Failure(err),
        }
    }

    pub fn as_ref(&self) -> DbResult<&T> {
        match self {
            DbResult::Success(value) => DbResult::Success(value),
            DbResult::Failure(err) => DbResult::Failure(err.clone()),
        }
    }
}

impl<T> From<Result<T>> for DbResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => DbResult::Success(value),
            Err(err) => DbResult::Failure(err),
        }
    }
}

impl<T> From<DbResult<T>> for Result<T> {
    fn from(result: DbResult<T>) -> Self {
        result.value()
    }
}

impl<M: Model> DbResult<BatchCursor<M>> {
    /// Drain the cursor into a list.
    pub async fn to_list(self) -> DbResult<Vec<M>> {
        match self {
            DbResult::Success(cursor) => cursor.to_list().await.into(),
            DbResult::Failure(err) => DbResult::Failure(err),
        }
    }
}

/// Run `operation` and wrap whatever comes out of it, panics included.
pub(crate) async fn wrap<T, F>(operation: F) -> DbResult<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(operation).catch_unwind().await {
        Ok(outcome) => outcome.into(),
        Err(payload) => DbResult::Failure(panicked(payload)),
    }
}

pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("operation panicked: {}", message);
    Error::internal(format!("operation panicked: {}", message))
}
