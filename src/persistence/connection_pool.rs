//! Connection Management for the Survey Store
//!
//! Provides bounded connection pooling, health monitoring, metrics snapshots,
//! idle reaping, and graceful drain on shutdown for the relational store
//! backing the survey platform.

use crate::store::{ConnectionFactory, Row, StoreConnection};
use crate::utils::logger::{LogLevel, Logger};
use crate::utils::{SurveyError, SurveyResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    /// Idle connections older than this are closed by the reaper
    pub idle_timeout_ms: u64,
    /// Bound on establishing warm-up connections
    pub connection_timeout_ms: u64,
    /// Bound on waiting for a free slot in `acquire`
    pub acquire_timeout_ms: u64,
    /// Bound on establishing a fresh connection during `acquire`
    pub create_timeout_ms: u64,
    /// Bound on closing a physical connection
    pub destroy_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub create_retry_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_check_query: String,
    pub enable_metrics: bool,
    pub metrics_interval_ms: u64,
    pub enable_tls: bool,
    /// Wall-clock bound on `graceful_shutdown` draining outstanding connections
    pub shutdown_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            idle_timeout_ms: 30_000,
            connection_timeout_ms: 30_000,
            acquire_timeout_ms: 60_000,
            create_timeout_ms: 3_000,
            destroy_timeout_ms: 5_000,
            reap_interval_ms: 1_000,
            create_retry_interval_ms: 200,
            health_check_interval_ms: 30_000,
            health_check_query: "SELECT 1".to_string(),
            enable_metrics: true,
            metrics_interval_ms: 60_000,
            enable_tls: false,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Point-in-time pool snapshot, read-only to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_connections: u32,
    pub idle_connections: u32,
    pub waiting_requests: u32,
    pub min_connections: u32,
    pub max_connections: u32,
}

/// Cumulative pool counters for observability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_connections_created: u64,
    pub total_connections_destroyed: u64,
    pub acquire_requests: u64,
    pub acquire_failures: u64,
    pub last_health_check_ms: i64,
    pub last_health_check_passed: bool,
}

struct IdleConnection {
    conn: Box<dyn StoreConnection>,
    idle_since: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    /// Physical connections currently alive (idle + borrowed)
    total: u32,
    draining: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    stats: Mutex<PoolStats>,
    last_metrics: Mutex<PoolMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
    logger: Logger,
}

/// A connection borrowed from the pool.
///
/// Returning it is automatic: dropping the guard puts the connection back on
/// the idle list (or destroys it while the pool is draining).
pub struct PooledConnection {
    conn: Option<Box<dyn StoreConnection>>,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Execute a write statement on the borrowed connection
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> SurveyResult<u64> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(sql, params).await.map_err(Into::into),
            None => Err(SurveyError::internal_error(
                "pooled connection already released",
            )),
        }
    }

    /// Execute a read statement on the borrowed connection
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> SurveyResult<Vec<Row>> {
        match self.conn.as_mut() {
            Some(conn) => conn.query(sql, params).await.map_err(Into::into),
            None => Err(SurveyError::internal_error(
                "pooled connection already released",
            )),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("held", &self.conn.is_some())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
        // Permit drops after the connection is accounted for
    }
}

impl PoolInner {
    fn is_draining(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    fn release(&self, conn: Box<dyn StoreConnection>) {
        let mut state = self.state.lock().unwrap();
        if state.draining {
            // Late return during drain: the connection is dropped, not reused
            state.total = state.total.saturating_sub(1);
            drop(state);
            self.stats.lock().unwrap().total_connections_destroyed += 1;
            self.logger.debug("connection discarded during drain");
        } else {
            state.idle.push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
    }

    fn snapshot(&self, state: &PoolState) -> PoolMetrics {
        PoolMetrics {
            total_connections: state.total,
            idle_connections: state.idle.len() as u32,
            waiting_requests: self.waiting.load(Ordering::SeqCst) as u32,
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
        }
    }
}

/// Bounded pool of live store connections shared by the whole data-access core
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1) as usize;
        let metrics = PoolMetrics {
            total_connections: 0,
            idle_connections: 0,
            waiting_requests: 0,
            min_connections: config.min_connections,
            max_connections: config.max_connections,
        };
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    draining: false,
                }),
                semaphore: Arc::new(Semaphore::new(max)),
                waiting: AtomicUsize::new(0),
                stats: Mutex::new(PoolStats::default()),
                last_metrics: Mutex::new(metrics),
                tasks: Mutex::new(Vec::new()),
                shutdown_started: AtomicBool::new(false),
                logger: Logger::new(LogLevel::Info),
            }),
        }
    }

    /// Warm the minimum connection set and start the background timers
    pub async fn start(&self) -> SurveyResult<()> {
        let config = self.inner.config.clone();
        for _ in 0..config.min_connections {
            let connect = self.inner.factory.connect();
            match tokio::time::timeout(Duration::from_millis(config.connection_timeout_ms), connect)
                .await
            {
                Ok(Ok(conn)) => {
                    let mut state = self.inner.state.lock().unwrap();
                    state.idle.push(IdleConnection {
                        conn,
                        idle_since: Instant::now(),
                    });
                    state.total += 1;
                    drop(state);
                    self.inner.stats.lock().unwrap().total_connections_created += 1;
                }
                Ok(Err(e)) => {
                    self.inner
                        .logger
                        .warn(&format!("warm-up connection failed: {}", e));
                    tokio::time::sleep(Duration::from_millis(config.create_retry_interval_ms))
                        .await;
                }
                Err(_) => {
                    self.inner.logger.warn(&format!(
                        "warm-up connection not established within {}ms",
                        config.connection_timeout_ms
                    ));
                    tokio::time::sleep(Duration::from_millis(config.create_retry_interval_ms))
                        .await;
                }
            }
        }

        self.spawn_timers();
        self.inner.logger.info(&format!(
            "connection pool started (min={}, max={})",
            config.min_connections, config.max_connections
        ));
        Ok(())
    }

    fn spawn_timers(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();

        let health_pool = self.clone();
        tasks.push(tokio::spawn(async move {
            let interval = Duration::from_millis(health_pool.inner.config.health_check_interval_ms);
            loop {
                tokio::time::sleep(interval).await;
                if health_pool.inner.is_draining() {
                    break;
                }
                health_pool.health_check().await;
            }
        }));

        if self.inner.config.enable_metrics {
            let metrics_pool = self.clone();
            tasks.push(tokio::spawn(async move {
                let interval = Duration::from_millis(metrics_pool.inner.config.metrics_interval_ms);
                loop {
                    tokio::time::sleep(interval).await;
                    if metrics_pool.inner.is_draining() {
                        break;
                    }
                    let metrics = metrics_pool.metrics();
                    metrics_pool.inner.logger.debug(&format!(
                        "pool metrics: total={}, idle={}, waiting={}",
                        metrics.total_connections,
                        metrics.idle_connections,
                        metrics.waiting_requests
                    ));
                }
            }));
        }

        let reap_pool = self.clone();
        tasks.push(tokio::spawn(async move {
            let interval = Duration::from_millis(reap_pool.inner.config.reap_interval_ms);
            loop {
                tokio::time::sleep(interval).await;
                if reap_pool.inner.is_draining() {
                    break;
                }
                reap_pool.reap_idle().await;
            }
        }));
    }

    /// Borrow a connection, waiting up to `acquire_timeout_ms` for a free slot
    pub async fn acquire(&self) -> SurveyResult<PooledConnection> {
        let inner = &self.inner;
        if inner.is_draining() {
            return Err(SurveyError::pool_shutting_down(
                "acquire rejected: pool is shutting down",
            ));
        }
        inner.stats.lock().unwrap().acquire_requests += 1;

        inner.waiting.fetch_add(1, Ordering::SeqCst);
        let waited = tokio::time::timeout(
            Duration::from_millis(inner.config.acquire_timeout_ms),
            inner.semaphore.clone().acquire_owned(),
        )
        .await;
        inner.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = match waited {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                // Semaphore closed by graceful_shutdown while we were waiting
                return Err(SurveyError::pool_shutting_down(
                    "acquire rejected: pool is shutting down",
                ));
            }
            Err(_) => {
                inner.stats.lock().unwrap().acquire_failures += 1;
                return Err(SurveyError::acquire_timeout(format!(
                    "no connection available within {}ms",
                    inner.config.acquire_timeout_ms
                )));
            }
        };

        if inner.is_draining() {
            return Err(SurveyError::pool_shutting_down(
                "acquire rejected: pool is shutting down",
            ));
        }

        // Prefer a pooled connection, discarding any that sat idle too long
        let idle_timeout = Duration::from_millis(inner.config.idle_timeout_ms);
        loop {
            let candidate = {
                let mut state = inner.state.lock().unwrap();
                match state.idle.pop() {
                    Some(ic) if ic.idle_since.elapsed() > idle_timeout => {
                        state.total = state.total.saturating_sub(1);
                        Some((ic, true))
                    }
                    Some(ic) => Some((ic, false)),
                    None => None,
                }
            };
            match candidate {
                Some((mut ic, true)) => {
                    let _ = ic.conn.close().await;
                    inner.stats.lock().unwrap().total_connections_destroyed += 1;
                    continue;
                }
                Some((ic, false)) => {
                    return Ok(PooledConnection {
                        conn: Some(ic.conn),
                        _permit: Some(permit),
                        pool: inner.clone(),
                    });
                }
                None => break,
            }
        }

        // No idle connection: create a fresh one under the held permit
        {
            inner.state.lock().unwrap().total += 1;
        }
        let connect = inner.factory.connect();
        match tokio::time::timeout(Duration::from_millis(inner.config.create_timeout_ms), connect)
            .await
        {
            Ok(Ok(conn)) => {
                inner.stats.lock().unwrap().total_connections_created += 1;
                Ok(PooledConnection {
                    conn: Some(conn),
                    _permit: Some(permit),
                    pool: inner.clone(),
                })
            }
            Ok(Err(e)) => {
                inner.state.lock().unwrap().total -= 1;
                let mut stats = inner.stats.lock().unwrap();
                stats.acquire_failures += 1;
                drop(stats);
                inner
                    .logger
                    .error(&format!("failed to create connection: {}", e));
                Err(e.into())
            }
            Err(_) => {
                inner.state.lock().unwrap().total -= 1;
                inner.stats.lock().unwrap().acquire_failures += 1;
                Err(SurveyError::connect_timeout(format!(
                    "connection not established within {}ms",
                    inner.config.create_timeout_ms
                )))
            }
        }
    }

    /// One-shot read: acquire, execute, release in all cases
    pub async fn query(&self, sql: &str, params: &[Value]) -> SurveyResult<Vec<Row>> {
        let started = Instant::now();
        let mut conn = self.acquire().await?;
        let result = conn.query(sql, params).await;
        let elapsed = started.elapsed().as_millis();
        match &result {
            Ok(rows) => self.inner.logger.debug(&format!(
                "query completed: {} ({}ms, {} rows)",
                truncate_statement(sql),
                elapsed,
                rows.len()
            )),
            Err(e) => self.inner.logger.error(&format!(
                "query failed: {} ({}ms): {}",
                truncate_statement(sql),
                elapsed,
                e
            )),
        }
        result
    }

    /// One-shot write: acquire, execute, release in all cases
    pub async fn execute(&self, sql: &str, params: &[Value]) -> SurveyResult<u64> {
        let started = Instant::now();
        let mut conn = self.acquire().await?;
        let result = conn.execute(sql, params).await;
        let elapsed = started.elapsed().as_millis();
        match &result {
            Ok(affected) => self.inner.logger.debug(&format!(
                "statement completed: {} ({}ms, {} rows affected)",
                truncate_statement(sql),
                elapsed,
                affected
            )),
            Err(e) => self.inner.logger.error(&format!(
                "statement failed: {} ({}ms): {}",
                truncate_statement(sql),
                elapsed,
                e
            )),
        }
        result
    }

    /// Probe the store with the configured health-check query.
    /// The borrowed connection is released even when the probe fails.
    pub async fn health_check(&self) -> bool {
        let passed = match self.acquire().await {
            Ok(mut conn) => match conn.query(&self.inner.config.health_check_query, &[]).await {
                Ok(_) => true,
                Err(e) => {
                    self.inner
                        .logger
                        .warn(&format!("health check probe failed: {}", e));
                    false
                }
            },
            Err(e) => {
                self.inner
                    .logger
                    .warn(&format!("health check could not borrow a connection: {}", e));
                false
            }
        };
        let mut stats = self.inner.stats.lock().unwrap();
        stats.last_health_check_ms = crate::utils::time::get_current_timestamp_ms();
        stats.last_health_check_passed = passed;
        passed
    }

    /// Best-effort, non-blocking snapshot of the pool
    pub fn metrics(&self) -> PoolMetrics {
        match self.inner.state.try_lock() {
            Ok(state) => {
                let metrics = self.inner.snapshot(&state);
                drop(state);
                *self.inner.last_metrics.lock().unwrap() = metrics.clone();
                metrics
            }
            // State is contended: fall back to the last refreshed snapshot
            Err(_) => self.inner.last_metrics.lock().unwrap().clone(),
        }
    }

    /// Cumulative counters since pool construction
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().unwrap().clone()
    }

    /// Close idle connections older than `idle_timeout_ms`, keeping `min` warm
    pub async fn reap_idle(&self) -> u32 {
        let idle_timeout = Duration::from_millis(self.inner.config.idle_timeout_ms);
        let min = self.inner.config.min_connections;
        let mut expired = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let mut i = 0;
            while i < state.idle.len() {
                if state.total > min && state.idle[i].idle_since.elapsed() > idle_timeout {
                    expired.push(state.idle.remove(i));
                    state.total -= 1;
                } else {
                    i += 1;
                }
            }
        }

        let reaped = expired.len() as u32;
        for mut ic in expired {
            let close = ic.conn.close();
            let _ = tokio::time::timeout(
                Duration::from_millis(self.inner.config.destroy_timeout_ms),
                close,
            )
            .await;
        }
        if reaped > 0 {
            self.inner.stats.lock().unwrap().total_connections_destroyed += reaped as u64;
            self.inner
                .logger
                .debug(&format!("reaped {} idle connections", reaped));
        }
        reaped
    }

    /// Drain the pool: fail new acquires fast, wait for borrowed connections
    /// to come home (bounded by `shutdown_timeout_ms`), then close everything.
    /// Safe to call more than once; only the first call drains.
    pub async fn graceful_shutdown(&self) {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.logger.info("pool drain started");
        {
            self.inner.state.lock().unwrap().draining = true;
        }
        // Wake queued acquires so they fail fast instead of waiting out their timeout
        self.inner.semaphore.close();

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let deadline = Instant::now() + Duration::from_millis(self.inner.config.shutdown_timeout_ms);
        loop {
            let outstanding = {
                let state = self.inner.state.lock().unwrap();
                state.total.saturating_sub(state.idle.len() as u32)
            };
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                self.inner.logger.warn(&format!(
                    "drain timed out with {} connections still outstanding",
                    outstanding
                ));
                break;
            }
            self.inner.logger.info(&format!(
                "draining: {} connections outstanding",
                outstanding
            ));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let idle: Vec<IdleConnection> = {
            let mut state = self.inner.state.lock().unwrap();
            let drained: Vec<IdleConnection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len() as u32);
            drained
        };
        let closed = idle.len() as u64;
        for mut ic in idle {
            let close = ic.conn.close();
            let _ = tokio::time::timeout(
                Duration::from_millis(self.inner.config.destroy_timeout_ms),
                close,
            )
            .await;
        }
        self.inner.stats.lock().unwrap().total_connections_destroyed += closed;
        self.inner.logger.info("pool drain complete");
    }

    /// Trigger `graceful_shutdown` once on process termination (Ctrl-C/SIGTERM)
    pub fn register_shutdown_signal(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                pool.inner.logger.info("termination signal received");
                pool.graceful_shutdown().await;
            }
        });
    }
}

fn truncate_statement(sql: &str) -> String {
    const MAX_LOGGED: usize = 120;
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() > MAX_LOGGED {
        format!("{}...", &flat[..MAX_LOGGED])
    } else {
        flat
    }
}
