//! SQLx-backed transactional store
//!
//! The transaction handle is a `sqlx::Transaction<'static, DB>`; units of work run their
//! queries against `&mut **tx`.

use async_trait::async_trait;
use sqlx::{Database, Pool, Postgres, Sqlite, Transaction};

use super::TransactionalStore;
use crate::database::connection::DatabasePool;
use crate::error::ServiceError;

pub struct SqlStore<DB: Database> {
    name: String,
    pool: Pool<DB>,
}

impl<DB: Database> SqlStore<DB> {
    pub fn new(name: impl Into<String>, pool: Pool<DB>) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }
}

impl SqlStore<Postgres> {
    /// Store over the Postgres variant of a `DatabasePool`.
    pub fn from_database_pool(name: impl Into<String>, pool: &DatabasePool) -> Option<Self> {
        match pool {
            DatabasePool::Postgres(pool) => Some(Self::new(name, pool.clone())),
            DatabasePool::Sqlite(_) => None,
        }
    }
}

impl SqlStore<Sqlite> {
    /// Store over the SQLite variant of a `DatabasePool`.
    pub fn from_database_pool(name: impl Into<String>, pool: &DatabasePool) -> Option<Self> {
        match pool {
            DatabasePool::Sqlite(pool) => Some(Self::new(name, pool.clone())),
            DatabasePool::Postgres(_) => None,
        }
    }
}

macro_rules! impl_sql_store {
    ($db:ty) => {
        #[async_trait]
        impl TransactionalStore for SqlStore<$db> {
            type Tx = Transaction<'static, $db>;

            fn name(&self) -> &str {
                &self.name
            }

            async fn begin(&self) -> Result<Self::Tx, ServiceError> {
                self.pool.begin().await.map_err(|e| {
                    ServiceError::DatabaseError(format!(
                        "{}: failed to begin transaction: {}",
                        self.name, e
                    ))
                })
            }

            async fn commit(&self, tx: Self::Tx) -> Result<(), ServiceError> {
                tx.commit().await.map_err(|e| {
                    ServiceError::DatabaseError(format!("{}: commit failed: {}", self.name, e))
                })
            }

            async fn rollback(&self, tx: Self::Tx) -> Result<(), ServiceError> {
                tx.rollback().await.map_err(|e| {
                    ServiceError::DatabaseError(format!("{}: rollback failed: {}", self.name, e))
                })
            }
        }
    };
}

impl_sql_store!(Postgres);
impl_sql_store!(Sqlite);
