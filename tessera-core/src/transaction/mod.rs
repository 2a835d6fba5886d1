//! Transaction coordination across one or two independently-transactional stores
//!
//! Single-store mode is an ordinary begin/commit/rollback wrapper. Hybrid mode drives two
//! stores side by side and commits them in a fixed order, A then B. It is not a distributed
//! transaction: if B's commit fails (or the process dies) after A committed, A keeps its
//! changes. That window is reported as `TransactionFailed` and is reconciled later by the
//! sync sweep.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ServiceError;
use crate::metrics::CoreMetrics;

pub use memory::{MemoryTransactionalStore, MemoryTx};
pub use sql::SqlStore;

/// A store that can run a unit of work inside its own transaction.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Open transaction handle; dropping it without commit discards the work.
    type Tx: Send;

    fn name(&self) -> &str;

    async fn begin(&self) -> Result<Self::Tx, ServiceError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), ServiceError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), ServiceError>;
}

#[derive(Default)]
pub struct TransactionCoordinator {
    metrics: Option<Arc<CoreMetrics>>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<CoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `work` inside one transaction on `store`.
    ///
    /// Commits when `work` succeeds. When it fails the transaction is rolled back and the
    /// error from `work` is returned unchanged; a rollback failure is only logged.
    #[instrument(skip_all, fields(store = store.name()))]
    pub async fn run<S, T, F>(&self, store: &S, work: F) -> Result<T, ServiceError>
    where
        S: TransactionalStore,
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, ServiceError>> + Send,
        T: Send,
    {
        let mut tx = store.begin().await?;

        match work(&mut tx).await {
            Ok(value) => {
                store.commit(tx).await.map_err(|e| {
                    self.record("single", "commit_failed");
                    ServiceError::TransactionFailed(format!(
                        "commit on {} failed: {}",
                        store.name(),
                        e
                    ))
                })?;
                debug!("Committed transaction on {}", store.name());
                self.record("single", "committed");
                Ok(value)
            }
            Err(cause) => {
                warn!("Transaction on {} failed, rolling back: {}", store.name(), cause);
                Self::rollback_logged(store, tx).await;
                self.record("single", "rolled_back");
                Err(cause)
            }
        }
    }

    /// Run `work_a` on store A and `work_b` on store B, then commit A followed by B.
    ///
    /// If either unit of work fails, both transactions are rolled back and that error is
    /// returned unchanged. If A's commit fails, B is rolled back. If B's commit fails after A
    /// committed, the stores are left inconsistent and `TransactionFailed` says so.
    #[instrument(skip_all, fields(store_a = store_a.name(), store_b = store_b.name()))]
    pub async fn run_hybrid<A, B, TA, TB, FA, FB>(
        &self,
        store_a: &A,
        store_b: &B,
        work_a: FA,
        work_b: FB,
    ) -> Result<(TA, TB), ServiceError>
    where
        A: TransactionalStore,
        B: TransactionalStore,
        FA: for<'c> FnOnce(&'c mut A::Tx) -> BoxFuture<'c, Result<TA, ServiceError>> + Send,
        FB: for<'c> FnOnce(&'c mut B::Tx) -> BoxFuture<'c, Result<TB, ServiceError>> + Send,
        TA: Send,
        TB: Send,
    {
        let mut tx_a = store_a.begin().await?;
        let mut tx_b = match store_b.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                Self::rollback_logged(store_a, tx_a).await;
                self.record("hybrid", "rolled_back");
                return Err(e);
            }
        };

        let value_a = match work_a(&mut tx_a).await {
            Ok(value) => value,
            Err(cause) => {
                warn!("Hybrid phase on {} failed, rolling back both: {}", store_a.name(), cause);
                Self::rollback_logged(store_a, tx_a).await;
                Self::rollback_logged(store_b, tx_b).await;
                self.record("hybrid", "rolled_back");
                return Err(cause);
            }
        };

        let value_b = match work_b(&mut tx_b).await {
            Ok(value) => value,
            Err(cause) => {
                warn!("Hybrid phase on {} failed, rolling back both: {}", store_b.name(), cause);
                Self::rollback_logged(store_a, tx_a).await;
                Self::rollback_logged(store_b, tx_b).await;
                self.record("hybrid", "rolled_back");
                return Err(cause);
            }
        };

        if let Err(e) = store_a.commit(tx_a).await {
            error!("Commit on {} failed, rolling back {}: {}", store_a.name(), store_b.name(), e);
            Self::rollback_logged(store_b, tx_b).await;
            self.record("hybrid", "commit_failed");
            return Err(ServiceError::TransactionFailed(format!(
                "commit on {} failed, nothing committed: {}",
                store_a.name(),
                e
            )));
        }

        if let Err(e) = store_b.commit(tx_b).await {
            error!(
                "Partial commit: {} committed but {} failed to commit: {}",
                store_a.name(),
                store_b.name(),
                e
            );
            self.record("hybrid", "partial_commit");
            return Err(ServiceError::TransactionFailed(format!(
                "partial commit: {} committed, {} failed to commit: {}",
                store_a.name(),
                store_b.name(),
                e
            )));
        }

        info!("Committed hybrid transaction on {} and {}", store_a.name(), store_b.name());
        self.record("hybrid", "committed");
        Ok((value_a, value_b))
    }

    async fn rollback_logged<S: TransactionalStore>(store: &S, tx: S::Tx) {
        if let Err(e) = store.rollback(tx).await {
            error!("Rollback on {} failed: {}", store.name(), e);
        }
    }

    fn record(&self, mode: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.transactions.with_label_values(&[mode, outcome]).inc();
        }
    }
}
