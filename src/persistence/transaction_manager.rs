//! Transaction Management for the Survey Store
//!
//! Provides atomic units of work over one borrowed pool connection with
//! configurable isolation, read-only mode, savepoint checkpoints, and
//! retry-with-backoff of transient store conflicts.

use crate::persistence::connection_pool::{ConnectionPool, PooledConnection};
use crate::store::Row;
use crate::utils::logger::{LogLevel, Logger};
use crate::utils::{ErrorKind, SurveyError, SurveyResult};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Transaction isolation level, rendered as a fixed follow-up statement.
/// A closed enumeration: isolation never reaches the store as spliced text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"
            }
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Options applied when a transaction begins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: bool,
}

/// Options governing `with_retry`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Total invocation bound: the operation runs at most this many times
    pub max_retries: u32,
    /// Base backoff; attempt k waits `retry_delay_ms * 2^(k-1)`
    pub retry_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// Transaction state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Unstarted,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

/// Cumulative unit-of-work counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStats {
    pub total_transactions: u64,
    pub committed_transactions: u64,
    pub rolled_back_transactions: u64,
    pub retries_performed: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for TransactionStats {
    fn default() -> Self {
        Self {
            total_transactions: 0,
            committed_transactions: 0,
            rolled_back_transactions: 0,
            retries_performed: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Classifies which failures are worth re-attempting.
///
/// The default allowlist is tied to SQLSTATE codes; a deployment against a
/// store with different codes supplies its own classifier at construction.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, error: &SurveyError) -> bool;
}

static DEFAULT_RETRYABLE_SQLSTATES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "40001", // serialization_failure
        "40P01", // deadlock_detected
        "08000", // connection_exception
        "08003", // connection_does_not_exist
        "08006", // connection_failure
        "53300", // too_many_connections
        "57P03", // cannot_connect_now
    ]
    .into_iter()
    .collect()
});

/// Default classifier: connection-failure kind, or a statement error whose
/// driver code is on the closed SQLSTATE allowlist. Acquire/connect timeouts
/// are left to a higher layer.
pub struct SqlStateClassifier {
    codes: HashSet<String>,
}

impl SqlStateClassifier {
    pub fn with_codes(codes: impl IntoIterator<Item = String>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }
}

impl Default for SqlStateClassifier {
    fn default() -> Self {
        Self {
            codes: DEFAULT_RETRYABLE_SQLSTATES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl RetryClassifier for SqlStateClassifier {
    fn is_retryable(&self, error: &SurveyError) -> bool {
        match error.kind {
            ErrorKind::NetworkError => true,
            ErrorKind::DatabaseError => error
                .code()
                .map(|code| self.codes.contains(code))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// One transaction over one borrowed connection.
///
/// The handle is `&mut`-threaded: operations on it are strictly ordered, and
/// it is not meant to be shared across callers.
pub struct Transaction {
    conn: PooledConnection,
    state: TransactionState,
    savepoints: Vec<String>,
    transaction_id: String,
    logger: Logger,
}

impl Transaction {
    pub fn new(conn: PooledConnection) -> Self {
        Self {
            conn,
            state: TransactionState::Unstarted,
            savepoints: Vec::new(),
            transaction_id: Uuid::new_v4().to_string(),
            logger: Logger::new(LogLevel::Info),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn id(&self) -> &str {
        &self.transaction_id
    }

    /// Begin the transaction, applying isolation level and read-only mode as
    /// typed follow-up statements
    pub async fn begin(&mut self, options: &TransactionOptions) -> SurveyResult<()> {
        if self.state.is_active() {
            return Err(SurveyError::transaction_already_active(format!(
                "transaction {} is already active",
                self.transaction_id
            )));
        }
        if self.state.is_terminal() {
            return Err(SurveyError::transaction_already_active(format!(
                "transaction {} handle was already used",
                self.transaction_id
            )));
        }

        self.conn.execute("BEGIN", &[]).await?;
        self.state = TransactionState::Active;

        if let Some(isolation) = options.isolation_level {
            self.conn.execute(isolation.as_sql(), &[]).await?;
        }
        if options.read_only {
            self.conn.execute("SET TRANSACTION READ ONLY", &[]).await?;
        }

        self.logger.debug(&format!(
            "started transaction {} (isolation: {:?}, read_only: {})",
            self.transaction_id, options.isolation_level, options.read_only
        ));
        Ok(())
    }

    fn ensure_active(&self, operation: &str) -> SurveyResult<()> {
        if !self.state.is_active() {
            return Err(SurveyError::transaction_not_active(format!(
                "{} requires an active transaction (state: {:?})",
                operation, self.state
            )));
        }
        Ok(())
    }

    /// Execute a write statement inside the transaction
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> SurveyResult<u64> {
        self.ensure_active("execute")?;
        log::debug!(
            "executing statement in transaction {}: {}",
            self.transaction_id,
            sql
        );
        self.conn.execute(sql, params).await
    }

    /// Execute a read statement inside the transaction
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> SurveyResult<Vec<Row>> {
        self.ensure_active("query")?;
        self.conn.query(sql, params).await
    }

    pub async fn commit(&mut self) -> SurveyResult<()> {
        self.ensure_active("commit")?;
        self.conn.execute("COMMIT", &[]).await?;
        self.state = TransactionState::Committed;
        self.savepoints.clear();
        self.logger
            .debug(&format!("committed transaction {}", self.transaction_id));
        Ok(())
    }

    /// Roll the transaction back. Idempotent: a no-op on a handle that is not
    /// active.
    pub async fn rollback(&mut self) -> SurveyResult<()> {
        if !self.state.is_active() {
            return Ok(());
        }
        self.conn.execute("ROLLBACK", &[]).await?;
        self.state = TransactionState::RolledBack;
        self.savepoints.clear();
        self.logger
            .debug(&format!("rolled back transaction {}", self.transaction_id));
        Ok(())
    }

    /// Create a named checkpoint inside the active transaction
    pub async fn savepoint(&mut self, name: &str) -> SurveyResult<()> {
        self.ensure_active("savepoint")?;
        let name = validate_savepoint_name(name)?;
        // Identifier validated above; identifiers cannot be bound as parameters
        self.conn
            .execute(&format!("SAVEPOINT {}", name), &[])
            .await?;
        if !self.savepoints.contains(&name.to_string()) {
            self.savepoints.push(name.to_string());
        }
        Ok(())
    }

    /// Return state to the named checkpoint without ending the transaction
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> SurveyResult<()> {
        self.ensure_active("rollback_to_savepoint")?;
        let name = validate_savepoint_name(name)?;
        self.conn
            .execute(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await
            .map(|_| ())
    }

    pub async fn release_savepoint(&mut self, name: &str) -> SurveyResult<()> {
        self.ensure_active("release_savepoint")?;
        let name = validate_savepoint_name(name)?;
        self.conn
            .execute(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await?;
        self.savepoints.retain(|sp| sp != name);
        Ok(())
    }
}

fn validate_savepoint_name(name: &str) -> SurveyResult<&str> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_head || !valid_tail || name.len() > 64 {
        return Err(SurveyError::validation_error(format!(
            "invalid savepoint name: {:?}",
            name
        )));
    }
    Ok(name)
}

/// Executes units of work against the pool.
///
/// Explicitly constructed and injected; callers receive it via composition
/// rather than any global lookup.
pub struct TransactionManager {
    pool: ConnectionPool,
    classifier: Arc<dyn RetryClassifier>,
    stats: Arc<Mutex<TransactionStats>>,
    logger: Logger,
}

impl TransactionManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self::with_classifier(pool, Arc::new(SqlStateClassifier::default()))
    }

    pub fn with_classifier(pool: ConnectionPool, classifier: Arc<dyn RetryClassifier>) -> Self {
        Self {
            pool,
            classifier,
            stats: Arc::new(Mutex::new(TransactionStats::default())),
            logger: Logger::new(LogLevel::Info),
        }
    }

    /// Borrow a connection and begin a transaction on it. The caller owns the
    /// handle and must commit or roll back; dropping the handle returns the
    /// connection either way.
    pub async fn begin(&self, options: &TransactionOptions) -> SurveyResult<Transaction> {
        let conn = self.pool.acquire().await?;
        let mut tx = Transaction::new(conn);
        if let Err(e) = tx.begin(options).await {
            // A failed isolation/read-only follow-up leaves the store mid-
            // transaction; the connection must not go back dirty
            let _ = tx.rollback().await;
            return Err(e);
        }
        let mut stats = self.stats.lock().unwrap();
        stats.total_transactions += 1;
        stats.last_updated = Utc::now();
        Ok(tx)
    }

    /// Run a unit of work atomically: begin, invoke `work`, commit on success,
    /// roll back and rethrow on any failure from `work` or from the commit.
    /// The borrowed connection is released on every exit path.
    pub async fn with_transaction<R, F>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> SurveyResult<R>
    where
        F: for<'a> FnOnce(&'a mut Transaction) -> BoxFuture<'a, SurveyResult<R>>,
    {
        let mut tx = self.begin(&options).await?;

        let outcome = match work(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    let mut stats = self.stats.lock().unwrap();
                    stats.committed_transactions += 1;
                    stats.last_updated = Utc::now();
                    Ok(value)
                }
                Err(commit_err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        self.logger.error(&format!(
                            "rollback after failed commit also failed for {}: {}",
                            tx.id(),
                            rollback_err
                        ));
                    }
                    self.record_rollback();
                    Err(commit_err)
                }
            },
            Err(work_err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    self.logger.error(&format!(
                        "rollback failed for {}: {}",
                        tx.id(),
                        rollback_err
                    ));
                }
                self.record_rollback();
                Err(work_err)
            }
        };
        // tx drops here, releasing the pooled connection
        outcome
    }

    fn record_rollback(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.rolled_back_transactions += 1;
        stats.last_updated = Utc::now();
    }

    /// Re-invoke `operation` on retryable-classified failures with exponential
    /// backoff. Non-retryable errors and exhausted retries propagate as-is.
    pub async fn with_retry<R, F, Fut>(
        &self,
        options: RetryOptions,
        mut operation: F,
    ) -> SurveyResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SurveyResult<R>>,
    {
        let max_attempts = options.max_retries.max(1);
        let mut attempt: u32 = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !self.classifier.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay_ms = options
                        .retry_delay_ms
                        .saturating_mul(1u64 << (attempt - 1).min(32));
                    self.logger.warn(&format!(
                        "retryable store error on attempt {}/{}: {}; backing off {}ms",
                        attempt, max_attempts, err, delay_ms
                    ));
                    {
                        let mut stats = self.stats.lock().unwrap();
                        stats.retries_performed += 1;
                        stats.last_updated = Utc::now();
                    }
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn statistics(&self) -> TransactionStats {
        self.stats.lock().unwrap().clone()
    }
}
