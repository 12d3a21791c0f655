//! Persistence Layer for the Survey Store
//!
//! Connection pooling and transaction management over the narrow store
//! contract. Everything above this layer borrows connections through the
//! pool; nothing reaches around it to the underlying store.

pub mod connection_pool;
pub mod transaction_manager;

pub use connection_pool::{ConnectionPool, PoolConfig, PoolMetrics, PoolStats, PooledConnection};
pub use transaction_manager::{
    IsolationLevel, RetryClassifier, RetryOptions, SqlStateClassifier, Transaction,
    TransactionManager, TransactionOptions, TransactionState, TransactionStats,
};
