use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::query::{Find, Gate};
use super::result::{wrap, DbResult};
use crate::ast::Node;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::lazy::Loader;
use crate::model::{Model, ModelCollection};

/// A transaction scope on its own connection.
///
/// Clones refer to the same scope. Once every clone is gone, a scope that
/// was neither committed nor rolled back is rolled back in the background.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Scope>,
}

struct Scope {
    driver: Arc<dyn Driver>,
    /// Driver transaction depth while this scope is the innermost one.
    depth: usize,
    finished: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(driver: Arc<dyn Driver>) -> Self {
        let depth = driver.transaction_depth();
        Self {
            inner: Arc::new(Scope {
                driver,
                depth,
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub async fn add<M: Model>(&self, models: impl IntoIterator<Item = M>) -> DbResult<Vec<M>> {
        let records = models.into_iter().map(|m| m.to_record()).collect();
        wrap(async {
            self.check_open()?;
            let driver = &self.inner.driver;
            let stored = driver.add(M::schema(), records).await?;
            let loader = Loader::new(driver.clone());
            stored
                .iter()
                .map(|record| M::from_record(record, &loader))
                .collect()
        })
        .await
    }

    /// Query inside this transaction. Lazy fields on the results resolve
    /// on the transaction's connection too.
    ///
    /// The terminal operation fails once this scope is finished or while a
    /// nested scope is open.
    pub fn find<M: Model>(&self, nodes: impl IntoIterator<Item = Node>) -> Find<M> {
        Find::new(self.inner.driver.clone(), Gate::Scope(self.clone()), nodes)
    }

    /// Drop and recreate the schema for `models` inside this transaction.
    pub async fn use_models(&self, models: &ModelCollection) -> DbResult<()> {
        wrap(async {
            self.check_open()?;
            self.inner.driver.drop_schema(models).await?;
            self.inner.driver.create_schema(models).await
        })
        .await
    }

    /// Drop the schema for `models` inside this transaction.
    pub async fn remove_models(&self, models: &ModelCollection) -> DbResult<()> {
        wrap(async {
            self.check_open()?;
            self.inner.driver.drop_schema(models).await
        })
        .await
    }

    /// Open a nested scope backed by a savepoint.
    pub async fn transaction(&self) -> DbResult<Transaction> {
        wrap(async {
            self.check_open()?;
            self.inner.driver.begin_transaction().await?;
            Ok(Transaction::new(self.inner.driver.clone()))
        })
        .await
    }

    pub async fn commit(&self) -> DbResult<()> {
        wrap(async {
            self.finish()?;
            self.inner.driver.commit().await
        })
        .await
    }

    pub async fn rollback(&self) -> DbResult<()> {
        wrap(async {
            self.finish()?;
            self.inner.driver.rollback().await
        })
        .await
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::transaction("transaction already finished"));
        }
        let current = self.inner.driver.transaction_depth();
        if current != self.inner.depth {
            return Err(Error::transaction(format!(
                "a nested transaction is still open (depth {} inside {})",
                current, self.inner.depth
            )));
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.check_open()?;
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return Err(Error::transaction("transaction already finished"));
        }
        Ok(())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            "transaction dropped without commit or rollback (depth {}); rolling back",
            self.depth
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let driver = self.driver.clone();
                handle.spawn(async move {
                    if let Err(err) = driver.rollback().await {
                        tracing::warn!("background rollback failed: {}", err);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("no async runtime available; transaction left to its connection");
            }
        }
    }
}
