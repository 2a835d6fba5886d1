//! Tessera Core - cross-store consistency and caching primitives
//!
//! Shared by the platform's service processes: a namespaced cache with per-service circuit
//! breakers, distributed locks, single-store and two-store transaction coordination, saga
//! compensation, and propagation of canonical records into mirror stores with identity mapping.

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod observability;
pub mod retry;
pub mod saga;
pub mod sync;
pub mod transaction;

// Re-export commonly used types for convenience
pub use cache::{CacheKey, CacheRegistry, ServiceCache};
pub use config::CoreConfig;
pub use error::{Result, ServiceError};
pub use lock::{LockGuard, LockManager};
pub use metrics::CoreMetrics;
pub use retry::RetryPolicy;
pub use saga::{CompensableStep, CompensationRunner, FnStep, SagaError};
pub use sync::{MappingDirection, MappingLookup, SyncOrchestrator};
pub use transaction::{TransactionCoordinator, TransactionalStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
