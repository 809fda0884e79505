use async_trait::async_trait;

use super::query::Find;
use super::result::DbResult;
use super::transaction::Transaction;
use super::Database;
use crate::ast::Node;
use crate::error::{Error, Result};
use crate::model::{Model, Record};

/// Something queries can be started from: a database or an open transaction.
pub trait QueryScope {
    fn find<M: Model>(&self, nodes: impl IntoIterator<Item = Node>) -> Find<M>;
}

impl QueryScope for Database {
    fn find<M: Model>(&self, nodes: impl IntoIterator<Item = Node>) -> Find<M> {
        Database::find(self, nodes)
    }
}

impl QueryScope for Transaction {
    fn find<M: Model>(&self, nodes: impl IntoIterator<Item = Node>) -> Find<M> {
        Transaction::find(self, nodes)
    }
}

/// Operations on a stored instance, addressed by its key fields.
///
/// Implemented for every [`Model`]. An instance whose key fields are unset
/// was never stored; every operation on it fails with `InvalidQuery`.
#[async_trait]
pub trait Persist: Model {
    /// Write every non-key field to the stored row. Returns the rows changed.
    async fn save<S>(&self, scope: &S) -> DbResult<u64>
    where
        S: QueryScope + Sync,
    {
        match by_key(self) {
            Ok((keys, values)) => scope.find::<Self>(keys).update(values).await,
            Err(err) => DbResult::Failure(err),
        }
    }

    /// The stored row as a fresh instance; `NoResult` if it is gone.
    async fn reload<S>(&self, scope: &S) -> DbResult<Self>
    where
        S: QueryScope + Sync,
    {
        match by_key(self) {
            Ok((keys, _)) => scope.find::<Self>(keys).one().await,
            Err(err) => DbResult::Failure(err),
        }
    }

    /// Delete the stored row. Returns the rows removed.
    async fn delete<S>(&self, scope: &S) -> DbResult<u64>
    where
        S: QueryScope + Sync,
    {
        match by_key(self) {
            Ok((keys, _)) => scope.find::<Self>(keys).delete().await,
            Err(err) => DbResult::Failure(err),
        }
    }
}

impl<M: Model> Persist for M {}

/// Split an instance into a key predicate and its remaining values.
fn by_key<M: Model>(model: &M) -> Result<(Vec<Node>, Record)> {
    let schema = M::schema();
    let keys = schema.key_fields();
    if keys.is_empty() {
        return Err(Error::invalid_query(format!(
            "{} has no key fields",
            schema.name()
        )));
    }
    let mut values = model.to_record();
    let mut predicate = Vec::with_capacity(keys.len());
    for key in keys {
        match values.remove(key.name()) {
            Some(value) if !value.is_null() => {
                predicate.push(schema.field_ref(key.name()).eq(value));
            }
            _ => {
                return Err(Error::invalid_query(format!(
                    "{}.{} is not set",
                    schema.name(),
                    key.name()
                )))
            }
        }
    }
    Ok((predicate, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, SqliteDriver};
    use crate::error::ErrorKind;
    use crate::model::fixtures::{Item, PostTag};
    use crate::model::ModelCollection;
    use std::sync::Arc;

    fn models() -> ModelCollection {
        ModelCollection::new("persist").with::<Item>().with::<PostTag>()
    }

    async fn databases() -> Vec<Database> {
        vec![
            Database::new(Arc::new(SqliteDriver::in_memory().await.unwrap())).with_models(models()),
            Database::new(Arc::new(MemoryDriver::new())).with_models(models()),
        ]
    }

    #[tokio::test]
    async fn test_save_reload_delete() {
        for db in databases().await {
            let mut stored = db
                .add([Item::new("draft", Some(1)), Item::new("other", Some(2))])
                .await
                .value()
                .unwrap();
            let mut item = stored.remove(0);

            item.name = "final".to_string();
            item.position = None;
            assert_eq!(item.save(&db).await.value().unwrap(), 1);

            let reloaded = item.reload(&db).await.value().unwrap();
            assert_eq!(reloaded, item);
            let untouched = stored[0].reload(&db).await.value().unwrap();
            assert_eq!(untouched.name, "other");

            assert_eq!(item.delete(&db).await.value().unwrap(), 1);
            let gone = item.reload(&db).await;
            assert_eq!(gone.error().map(Error::kind), Some(ErrorKind::NoResult));
            assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_composite_key_delete() {
        let db = Database::new(Arc::new(MemoryDriver::new())).with_models(models());
        db.add([
            PostTag {
                post_id: 1,
                tag_id: 1,
            },
            PostTag {
                post_id: 1,
                tag_id: 2,
            },
        ])
        .await
        .value()
        .unwrap();
        let link = PostTag {
            post_id: 1,
            tag_id: 2,
        };
        assert_eq!(link.delete(&db).await.value().unwrap(), 1);
        assert_eq!(db.find::<PostTag>([]).count().await.value().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unstored_instance_is_rejected() {
        let db = Database::new(Arc::new(MemoryDriver::new())).with_models(models());
        let fresh = Item::new("never added", None);
        assert_eq!(
            fresh.save(&db).await.error().map(Error::kind),
            Some(ErrorKind::InvalidQuery)
        );
        assert_eq!(
            fresh.delete(&db).await.error().map(Error::kind),
            Some(ErrorKind::InvalidQuery)
        );
    }

    #[tokio::test]
    async fn test_save_inside_a_transaction() {
        let db = Database::new(Arc::new(MemoryDriver::new())).with_models(models());
        let mut item = db
            .add([Item::new("before", None)])
            .await
            .value()
            .unwrap()
            .remove(0);

        let tx = db.transaction().await.value().unwrap();
        item.name = "after".to_string();
        item.save(&tx).await.value().unwrap();
        tx.rollback().await.value().unwrap();

        assert_eq!(item.reload(&db).await.value().unwrap().name, "before");
    }
}
