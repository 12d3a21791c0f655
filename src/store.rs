//! Narrow contract for the relational store consumed by the data-access core
//!
//! The core never talks to a concrete driver directly: the pool owns
//! `StoreConnection` objects produced by a `ConnectionFactory`, and everything
//! above the pool goes through those. Rows come back as loosely-typed maps so
//! callers can parse the aggregate shapes they asked for.

use crate::utils::SurveyError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// A single result row: column name to JSON-shaped value
pub type Row = HashMap<String, Value>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures surfaced by a store driver
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("statement failed: {message}")]
    Statement {
        message: String,
        /// Driver error code (e.g. an SQLSTATE) used by retry classification
        code: Option<String>,
    },
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for SurveyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(msg) => SurveyError::network_error(msg),
            StoreError::Statement { message, code } => {
                let e = SurveyError::database_error(message);
                match code {
                    Some(code) => e.with_code(code),
                    None => e,
                }
            }
            StoreError::Timeout(msg) => SurveyError::timeout_error(msg),
            StoreError::Closed => SurveyError::database_error("connection is closed"),
            StoreError::Serialization(e) => SurveyError::parse_error(e.to_string()),
        }
    }
}

/// One live connection to the relational store.
///
/// Statements are parameterized SQL with `?` placeholders. The store is
/// expected to support `BEGIN`/`COMMIT`/`ROLLBACK`, savepoints, and a settable
/// per-transaction isolation level and read-only mode; the transaction manager
/// issues those as ordinary statements through this trait.
#[async_trait]
pub trait StoreConnection: Send {
    /// Execute a write statement, returning the affected-row count
    async fn execute(&mut self, sql: &str, params: &[Value]) -> StoreResult<u64>;

    /// Execute a read statement, returning all result rows
    async fn query(&mut self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>>;

    /// Close the underlying physical connection
    async fn close(&mut self) -> StoreResult<()>;
}

/// Produces physical connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> StoreResult<Box<dyn StoreConnection>>;
}
