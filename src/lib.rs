//! Resilient data-access and analytics-caching core for the survey platform.
//!
//! The crate owns the connection pool over the relational store, transaction
//! management with retry of transient conflicts, the TTL-scoped analytics
//! cache, the statistics engine, and the orchestrator that composes them.
//! Route handlers, schema validation and report rendering live elsewhere and
//! consume this crate through its public types.

// Module declarations
pub mod analytics;
pub mod persistence;
pub mod store;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

// Re-export the composition surface
pub use analytics::{
    AnalyticsOptions, AnalyticsService, CacheConfig, CacheManager, StatsEngine, TrendInterval,
};
pub use persistence::{
    ConnectionPool, IsolationLevel, PoolConfig, RetryOptions, TransactionManager,
    TransactionOptions,
};
pub use store::{ConnectionFactory, Row, StoreConnection, StoreError, StoreResult};
pub use utils::{ErrorKind, SurveyError, SurveyResult};
