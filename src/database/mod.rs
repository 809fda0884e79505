//! The public facade.
//!
//! Every operation here returns a [`DbResult`]. Drivers below only ever
//! return `Result`s; this is the one place they are wrapped.
mod cursor;
mod persist;
mod query;
mod result;
mod transaction;

pub use cursor::{BatchCursor, BATCH_SIZE};
pub use persist::{Persist, QueryScope};
pub use query::Find;
pub use result::{DbResult, QueryResult};
pub use transaction::Transaction;

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

use crate::ast::Node;
use crate::config::DatabaseConfig;
use crate::driver::{self, Driver};
use crate::error::Result;
use crate::lazy::Loader;
use crate::model::{Model, ModelCollection};
use query::Gate;
use result::{panicked, wrap};

/// Schema setup shared by a database and its clones.
pub(crate) struct Setup {
    models: Mutex<ModelCollection>,
    done: OnceCell<()>,
    implicit: AtomicBool,
}

impl Setup {
    fn new() -> Self {
        Self {
            models: Mutex::new(ModelCollection::default()),
            done: OnceCell::new(),
            implicit: AtomicBool::new(true),
        }
    }

    fn models(&self) -> ModelCollection {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_models(&self, models: ModelCollection) {
        *self.models.lock().unwrap_or_else(PoisonError::into_inner) = models;
    }

    /// Stop creating `models` implicitly if they are the registered ones.
    fn forget(&self, models: &ModelCollection) {
        let mut registered = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        if registered.name() == models.name() {
            *registered = ModelCollection::new(models.name());
        }
    }

    /// Create the registered schema the first time any entry point runs.
    pub(crate) async fn ensure(&self, driver: &Arc<dyn Driver>) -> Result<()> {
        if !self.implicit.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.done
            .get_or_try_init(|| async {
                let models = self.models();
                if models.is_empty() {
                    return Ok(());
                }
                tracing::info!(
                    "creating schema for collection '{}' ({} models)",
                    models.name(),
                    models.len()
                );
                driver
                    .create_schema(&models)
                    .await
                    .map_err(|e| e.into_schema("implicit schema setup failed"))
            })
            .await?;
        Ok(())
    }
}

/// Entry point for application code.
///
/// Cheap to clone; clones share the driver and the setup state.
#[derive(Clone)]
pub struct Database {
    driver: Arc<dyn Driver>,
    setup: Arc<Setup>,
}

impl Database {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            setup: Arc::new(Setup::new()),
        }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::new(driver::connect(config).await?))
    }

    /// Register the models implicit setup creates.
    pub fn with_models(self, models: ModelCollection) -> Self {
        self.setup.set_models(models);
        self
    }

    /// Turn implicit schema creation on first use on or off.
    pub fn implicit_setup(self, enabled: bool) -> Self {
        self.setup.implicit.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub async fn ping(&self) -> DbResult<()> {
        wrap(self.driver.ping()).await
    }

    /// Drop and recreate the schema for `models`, then use them from now on.
    pub async fn use_models(&self, models: ModelCollection) -> DbResult<()> {
        wrap(async {
            tracing::info!("resetting schema for collection '{}'", models.name());
            self.driver.drop_schema(&models).await?;
            self.driver.create_schema(&models).await?;
            self.setup.set_models(models);
            // Already created; implicit setup has nothing left to do.
            let _ = self.setup.done.set(());
            Ok(())
        })
        .await
    }

    /// Drop the schema for `models`. If they are the registered models,
    /// implicit setup no longer creates them.
    pub async fn remove_models(&self, models: &ModelCollection) -> DbResult<()> {
        wrap(async {
            tracing::info!("removing schema for collection '{}'", models.name());
            self.driver.drop_schema(models).await?;
            self.setup.forget(models);
            Ok(())
        })
        .await
    }

    /// Insert `models` and return them as stored, generated keys included.
    pub async fn add<M: Model>(&self, models: impl IntoIterator<Item = M>) -> DbResult<Vec<M>> {
        let records: Vec<_> = models.into_iter().map(|m| m.to_record()).collect();
        wrap(async {
            self.setup.ensure(&self.driver).await?;
            let stored = self.driver.add(M::schema(), records).await?;
            let loader = Loader::new(self.driver.clone());
            stored
                .iter()
                .map(|record| M::from_record(record, &loader))
                .collect()
        })
        .await
    }

    /// Start a query on `M`. The nodes are ANDed together.
    pub fn find<M: Model>(&self, nodes: impl IntoIterator<Item = Node>) -> Find<M> {
        Find::new(self.driver.clone(), Gate::Setup(self.setup.clone()), nodes)
    }

    /// Begin a transaction on a connection of its own.
    pub async fn transaction(&self) -> DbResult<Transaction> {
        wrap(async {
            self.setup.ensure(&self.driver).await?;
            let session = self.driver.session().await?;
            session.begin_transaction().await?;
            Ok(Transaction::new(session))
        })
        .await
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err` or
    /// panics. If `f` finishes the transaction itself it is left alone.
    pub async fn atomic<T, F, Fut>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = match self.transaction().await {
            DbResult::Success(tx) => tx,
            DbResult::Failure(err) => return DbResult::Failure(err),
        };
        let outcome = AssertUnwindSafe(async { f(tx.clone()).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) if tx.is_finished() => DbResult::Success(value),
            Ok(Ok(value)) => tx.commit().await.map(|()| value),
            Ok(Err(err)) => {
                roll_back_quietly(&tx).await;
                DbResult::Failure(err)
            }
            Err(payload) => {
                let err = panicked(payload);
                roll_back_quietly(&tx).await;
                DbResult::Failure(err)
            }
        }
    }
}

async fn roll_back_quietly(tx: &Transaction) {
    if tx.is_finished() {
        return;
    }
    if let DbResult::Failure(err) = tx.rollback().await {
        tracing::warn!("rollback after failed atomic block failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Direction;
    use crate::driver::{MemoryDriver, SqliteDriver};
    use crate::error::{Error, ErrorKind};
    use crate::model::fixtures::{Item, Post, Product, Sample, User};
    use chrono::{TimeZone, Utc};
    use crate::model::Record;
    use std::time::Duration;

    fn models() -> ModelCollection {
        ModelCollection::new("tests")
            .with::<User>()
            .with::<Post>()
            .with::<Item>()
            .with::<Product>()
            .with::<Sample>()
    }

    async fn sqlite() -> Database {
        let driver = SqliteDriver::in_memory().await.unwrap();
        Database::new(Arc::new(driver)).with_models(models())
    }

    fn memory() -> Database {
        Database::new(Arc::new(MemoryDriver::new())).with_models(models())
    }

    async fn seed_items(db: &Database, rows: i64) {
        let items = (0..rows).map(|i| Item::new(&format!("item_{}", i), Some(i)));
        db.add(items).await.value().unwrap();
    }

    async fn seed_products(db: &Database) {
        db.add([
            Product::new("X", 10, true),
            Product::new("Y", 30, true),
            Product::new("Y", 10, false),
        ])
        .await
        .value()
        .unwrap();
    }

    async fn names(db: &Database) -> Vec<String> {
        db.find::<Item>([])
            .all()
            .await
            .to_list()
            .await
            .value()
            .unwrap()
            .into_iter()
            .map(|item| item.name)
            .collect()
    }

    #[tokio::test]
    async fn test_add_populates_keys() {
        let db = sqlite().await;
        let users = db
            .add([User::new("ada"), User::new("bob")])
            .await
            .value()
            .unwrap();
        assert_eq!(users[0].id, Some(1));
        assert_eq!(users[1].id, Some(2));
    }

    #[tokio::test]
    async fn test_second_page_is_offset_by_count() {
        for db in [sqlite().await, memory()] {
            seed_items(&db, 20).await;
            let page: Vec<String> = db
                .find::<Item>([])
                .limit(5, Some(2))
                .all()
                .await
                .to_list()
                .await
                .value()
                .unwrap()
                .into_iter()
                .map(|item| item.name)
                .collect();
            assert_eq!(page, vec!["item_5", "item_6", "item_7", "item_8", "item_9"]);
        }
    }

    #[tokio::test]
    async fn test_or_then_and_keeps_grouping() {
        for db in [sqlite().await, memory()] {
            seed_products(&db).await;
            let predicate = Product::field("category")
                .eq("X")
                .or(Product::field("price").lt(25))
                .and(Product::field("in_stock").eq(true));
            let matched = db
                .find::<Product>([predicate])
                .all()
                .await
                .to_list()
                .await
                .value()
                .unwrap();
            assert_eq!(matched, vec![Product {
                id: Some(1),
                ..Product::new("X", 10, true)
            }]);
        }
    }

    #[tokio::test]
    async fn test_one_without_match_is_no_result() {
        let db = sqlite().await;
        seed_items(&db, 3).await;
        let result = db
            .find::<Item>([Item::field("name").eq("missing")])
            .one()
            .await;
        assert_eq!(result.error().map(Error::kind), Some(ErrorKind::NoResult));

        let first = db
            .find::<Item>([Item::field("name").eq("missing")])
            .first()
            .await;
        assert!(first.value().unwrap().is_none());

        let found = db.find::<Item>([Item::field("position").eq(2)]).one().await;
        assert_eq!(found.value().unwrap().name, "item_2");
    }

    #[tokio::test]
    async fn test_null_comparison() {
        let db = memory();
        db.add([Item::new("a", None), Item::new("b", Some(1))])
            .await
            .value()
            .unwrap();
        let null = crate::model::Value::Null;
        let missing = db
            .find::<Item>([Item::field("position").eq(null.clone())])
            .count()
            .await;
        assert_eq!(missing.value().unwrap(), 1);
        let present = db
            .find::<Item>([Item::field("position").ne(null)])
            .one()
            .await;
        assert_eq!(present.value().unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_count_update_delete() {
        for db in [sqlite().await, memory()] {
            seed_items(&db, 10).await;
            let low = || Item::field("position").lt(4);
            assert_eq!(db.find::<Item>([low()]).count().await.value().unwrap(), 4);

            let updated = db
                .find::<Item>([low()])
                .update(Record::new().with("name", "low"))
                .await;
            assert_eq!(updated.value().unwrap(), 4);
            assert_eq!(
                db.find::<Item>([Item::field("name").eq("low")])
                    .count()
                    .await
                    .value()
                    .unwrap(),
                4
            );

            assert_eq!(db.find::<Item>([low()]).delete().await.value().unwrap(), 4);
            assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 6);
        }
    }

    #[tokio::test]
    async fn test_order_by_descending() {
        let db = sqlite().await;
        seed_items(&db, 3).await;
        let first = db
            .find::<Item>([])
            .order_by(Item::field("position"), Direction::Descending)
            .first()
            .await;
        assert_eq!(first.value().unwrap().map(|i| i.name), Some("item_2".into()));
    }

    #[tokio::test]
    async fn test_cross_model_predicate_fails() {
        let db = memory();
        let result = db.find::<Item>([User::field("name").eq("ada")]).all().await;
        assert_eq!(
            result.error().map(Error::kind),
            Some(ErrorKind::CrossModelQuery)
        );

        let ordered = db
            .find::<Item>([])
            .order_by(User::field("name"), Direction::Ascending)
            .count()
            .await;
        assert_eq!(
            ordered.error().map(Error::kind),
            Some(ErrorKind::CrossModelQuery)
        );
    }

    #[tokio::test]
    async fn test_constraint_violation_is_a_failure() {
        let db = sqlite().await;
        let mut item = Item::new("dup", None);
        item.id = Some(7);
        db.add([item.clone()]).await.value().unwrap();
        let again = db.add([item]).await;
        assert_eq!(again.error().map(Error::kind), Some(ErrorKind::Constraint));
    }

    #[tokio::test]
    async fn test_lazy_fields_follow_the_facade_driver() {
        let db = sqlite().await;
        let ada = db.add([User::new("ada")]).await.value().unwrap().remove(0);
        let id = ada.id.unwrap();
        db.add([Post::new("first", id), Post::new("second", id)])
            .await
            .value()
            .unwrap();

        let user = db
            .find::<User>([User::field("name").eq("ada")])
            .one()
            .await
            .value()
            .unwrap();
        let titles: Vec<String> = user
            .posts
            .get()
            .await
            .unwrap()
            .iter()
            .map(|p| p.title.clone())
            .collect();
        assert_eq!(titles, vec!["first", "second"]);

        let post = db.find::<Post>([]).first().await.value().unwrap().unwrap();
        let author = post.author.get().await.unwrap();
        assert_eq!((*author).as_ref().map(|u| u.name.as_str()), Some("ada"));
    }

    #[tokio::test]
    async fn test_atomic_commits_on_ok() {
        for db in [sqlite().await, memory()] {
            let result = db
                .atomic(|tx| async move {
                    tx.add([Item::new("kept", None)]).await.value()?;
                    Ok(7)
                })
                .await;
            assert_eq!(result.value().unwrap(), 7);
            assert_eq!(names(&db).await, vec!["kept"]);
        }
    }

    #[tokio::test]
    async fn test_atomic_rolls_back_on_err() {
        for db in [sqlite().await, memory()] {
            let result: DbResult<()> = db
                .atomic(|tx| async move {
                    tx.add([Item::new("discarded", None)]).await.value()?;
                    Err(Error::query("changed my mind"))
                })
                .await;
            assert_eq!(result.error().map(Error::kind), Some(ErrorKind::Query));
            assert!(names(&db).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_atomic_rolls_back_on_panic() {
        let db = memory();
        let result: DbResult<()> = db
            .atomic(|tx| async move {
                tx.add([Item::new("discarded", None)]).await.value()?;
                panic!("handler blew up");
            })
            .await;
        let err = result.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("handler blew up"));
        assert!(names(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_inner_commit_is_undone_by_outer_rollback() {
        for db in [sqlite().await, memory()] {
            let outer = db.transaction().await.value().unwrap();
            outer.add([Item::new("a", None)]).await.value().unwrap();
            let inner = outer.transaction().await.value().unwrap();
            assert_eq!(inner.depth(), outer.depth() + 1);
            inner.add([Item::new("b", None)]).await.value().unwrap();

            // The outer scope cannot finish while the inner one is open.
            let early = outer.commit().await;
            assert_eq!(early.error().map(Error::kind), Some(ErrorKind::Transaction));

            inner.commit().await.value().unwrap();
            assert_eq!(outer.find::<Item>([]).count().await.value().unwrap(), 2);
            outer.rollback().await.value().unwrap();

            assert!(names(&db).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_more_work() {
        let db = memory();
        let tx = db.transaction().await.value().unwrap();
        tx.commit().await.value().unwrap();
        assert!(tx.is_finished());
        assert_eq!(
            tx.rollback().await.error().map(Error::kind),
            Some(ErrorKind::Transaction)
        );
        assert_eq!(
            tx.add([Item::new("late", None)]).await.error().map(Error::kind),
            Some(ErrorKind::Transaction)
        );
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_queries() {
        for db in [sqlite().await, memory()] {
            seed_items(&db, 2).await;
            let tx = db.transaction().await.value().unwrap();
            tx.commit().await.value().unwrap();

            let late = tx.find::<Item>([]).delete().await;
            assert_eq!(late.error().map(Error::kind), Some(ErrorKind::Transaction));
            let late = tx.find::<Item>([]).count().await;
            assert_eq!(late.error().map(Error::kind), Some(ErrorKind::Transaction));
            assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_outer_scope_rejects_queries_while_nested() {
        for db in [sqlite().await, memory()] {
            let outer = db.transaction().await.value().unwrap();
            outer.add([Item::new("a", None)]).await.value().unwrap();
            let inner = outer.transaction().await.value().unwrap();

            let blocked = outer.find::<Item>([]).count().await;
            assert_eq!(blocked.error().map(Error::kind), Some(ErrorKind::Transaction));
            let blocked = outer.find::<Item>([]).update(Record::new().with("name", "b")).await;
            assert_eq!(blocked.error().map(Error::kind), Some(ErrorKind::Transaction));

            inner.commit().await.value().unwrap();
            assert_eq!(outer.find::<Item>([]).count().await.value().unwrap(), 1);
            outer.commit().await.value().unwrap();
            assert_eq!(names(&db).await, vec!["a"]);
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let db = memory();
        let tx = db.transaction().await.value().unwrap();
        tx.add([Item::new("orphan", None)]).await.value().unwrap();
        let session = tx.driver().clone();
        assert_eq!(session.transaction_depth(), 1);
        drop(tx);

        for _ in 0..50 {
            if session.transaction_depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.transaction_depth(), 0);
        assert!(names(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_implicit_setup_can_be_disabled() {
        let db = Database::new(Arc::new(MemoryDriver::new()))
            .with_models(models())
            .implicit_setup(false);
        let result = db.find::<Item>([]).count().await;
        assert!(result.is_failure());

        db.use_models(models()).await.value().unwrap();
        assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_use_models_resets_data() {
        let db = sqlite().await;
        seed_items(&db, 3).await;
        db.use_models(models()).await.value().unwrap();
        assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ping() {
        assert!(memory().ping().await.is_success());
        assert!(sqlite().await.ping().await.is_success());
    }

    #[tokio::test]
    async fn test_transaction_commit_keeps_concurrent_adds() {
        let db = memory();
        {
            let tx = db.transaction().await.value().unwrap();
            tx.add([Item::new("in_tx", Some(1))]).await.value().unwrap();
            db.add([Item::new("outside", Some(2))]).await.value().unwrap();
            tx.commit().await.value().unwrap();
            assert_eq!(names(&db).await, vec!["in_tx", "outside"]);
        }
    }

    #[tokio::test]
    async fn test_remove_models_stops_implicit_setup() {
        for db in [sqlite().await, memory()] {
            seed_items(&db, 2).await;
            db.remove_models(&models()).await.value().unwrap();
            assert!(db.find::<Item>([]).count().await.is_failure());
            assert!(db.add([Item::new("again", None)]).await.is_failure());

            db.use_models(models()).await.value().unwrap();
            assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_schema_changes_inside_a_transaction() {
        let db = memory();
        seed_items(&db, 2).await;

        let tx = db.transaction().await.value().unwrap();
        tx.remove_models(&models()).await.value().unwrap();
        assert!(tx.find::<Item>([]).count().await.is_failure());
        tx.rollback().await.value().unwrap();
        assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 2);

        let tx = db.transaction().await.value().unwrap();
        tx.use_models(&models()).await.value().unwrap();
        assert_eq!(tx.find::<Item>([]).count().await.value().unwrap(), 0);
        tx.commit().await.value().unwrap();
        assert_eq!(db.find::<Item>([]).count().await.value().unwrap(), 0);

        assert_eq!(
            tx.remove_models(&models()).await.error().map(Error::kind),
            Some(ErrorKind::Transaction)
        );
    }

    fn sample(rank: Option<&str>) -> Sample {
        let taken_at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap()
            + chrono::Duration::microseconds(123_456);
        Sample {
            id: None,
            ratio: -0.25,
            payload: vec![0, 255, 7, 0],
            taken_at,
            active: true,
            rank: rank.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_every_scalar_type_round_trips() {
        for db in [sqlite().await, memory()] {
            let stored = db
                .add([sample(Some("first")), sample(None)])
                .await
                .value()
                .unwrap();
            for expected in stored {
                let id = expected.id.unwrap();
                let found = db
                    .find::<Sample>([Sample::schema().field_ref("id").eq(id)])
                    .one()
                    .await
                    .value()
                    .unwrap();
                assert_eq!(found, expected);
            }

            let ranked = db
                .find::<Sample>([Sample::schema().field_ref("rank").eq("first")])
                .count()
                .await
                .value()
                .unwrap();
            assert_eq!(ranked, 1);
        }
    }
}
