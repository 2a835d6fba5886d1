//! Database connection management with SQLx
//!
//! Provides connection pooling for the relational mirror store on PostgreSQL or SQLite.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Postgres, Sqlite};
use std::time::Duration;
use tracing::info;

use crate::config::{env_or, redact_url};
use crate::error::ServiceError;

/// Database connection pool enum supporting both PostgreSQL and SQLite
#[derive(Clone, Debug)]
pub enum DatabasePool {
    Postgres(Pool<Postgres>),
    Sqlite(Pool<Sqlite>),
}

impl DatabasePool {
    /// Create a new PostgreSQL connection pool and run migrations
    pub async fn new_postgres(config: &DatabaseConfig) -> Result<Self, ServiceError> {
        info!(
            "Creating PostgreSQL connection pool with {} max connections",
            config.max_connections
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                ServiceError::DatabaseError(format!("Failed to create PostgreSQL pool: {}", e))
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ServiceError::DatabaseError(format!("Failed to run migrations: {}", e)))?;

        info!("PostgreSQL connection pool created successfully");
        Ok(DatabasePool::Postgres(pool))
    }

    /// Create a new SQLite connection pool and run migrations
    pub async fn new_sqlite(config: &DatabaseConfig) -> Result<Self, ServiceError> {
        info!("Creating SQLite connection pool with {} max connections", config.max_connections);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                ServiceError::DatabaseError(format!("Failed to create SQLite pool: {}", e))
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ServiceError::DatabaseError(format!("Failed to run migrations: {}", e)))?;

        info!("SQLite connection pool created successfully");
        Ok(DatabasePool::Sqlite(pool))
    }

    /// Health check for the database connection
    pub async fn health_check(&self) -> Result<(), ServiceError> {
        match self {
            DatabasePool::Postgres(pool) => {
                sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        ServiceError::DatabaseError(format!(
                            "PostgreSQL health check failed: {}",
                            e
                        ))
                    })?;
            }
            DatabasePool::Sqlite(pool) => {
                sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        ServiceError::DatabaseError(format!("SQLite health check failed: {}", e))
                    })?;
            }
        }
        Ok(())
    }

    /// Get connection pool statistics
    pub fn get_stats(&self) -> ConnectionStats {
        match self {
            DatabasePool::Postgres(pool) => ConnectionStats {
                size: pool.size(),
                idle: pool.num_idle(),
                is_closed: pool.is_closed(),
            },
            DatabasePool::Sqlite(pool) => ConnectionStats {
                size: pool.size(),
                idle: pool.num_idle(),
                is_closed: pool.is_closed(),
            },
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub size: u32,
    pub idle: usize,
    pub is_closed: bool,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 10,
            connection_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    /// Create configuration for PostgreSQL
    pub fn postgres(database_url: String) -> Self {
        Self {
            database_url,
            max_connections: 20,
            connection_timeout_seconds: 30,
        }
    }

    /// Create configuration for SQLite
    pub fn sqlite(database_url: String) -> Self {
        Self {
            database_url,
            max_connections: 5,
            connection_timeout_seconds: 30,
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_or("DATABASE_URL", defaults.database_url),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", defaults.max_connections),
            connection_timeout_seconds: env_or(
                "DATABASE_CONNECT_TIMEOUT_SECONDS",
                defaults.connection_timeout_seconds,
            ),
        }
    }
}

/// Initialize database connection pool based on configuration
pub async fn initialize_database(config: &DatabaseConfig) -> Result<DatabasePool, ServiceError> {
    info!("Initializing database with URL: {}", redact_url(&config.database_url));

    if config.database_url.starts_with("postgres://")
        || config.database_url.starts_with("postgresql://")
    {
        DatabasePool::new_postgres(config).await
    } else if config.database_url.starts_with("sqlite:") {
        DatabasePool::new_sqlite(config).await
    } else {
        Err(ServiceError::ConfigError(
            "Unsupported database URL format. Use postgres:// or sqlite:".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        let config = DatabaseConfig::sqlite("mysql://localhost/db".to_string());
        let err = initialize_database(&config).await.unwrap_err();
        assert!(matches!(err, ServiceError::ConfigError(_)));
    }

    #[tokio::test]
    async fn sqlite_memory_pool_is_healthy() {
        let mut config = DatabaseConfig::sqlite("sqlite::memory:".to_string());
        config.max_connections = 1;
        let pool = initialize_database(&config).await.unwrap();
        pool.health_check().await.unwrap();
        assert!(!pool.get_stats().is_closed);
    }
}
