//! Analytics Cache Manager
//!
//! TTL-scoped memoization of derived analytics, stored as rows of the
//! `analytics_cache` table and addressed by (subject id, metric name,
//! optional category filter). Writes are single atomic upserts against the
//! table's uniqueness constraint; a second `set` for the same key overwrites
//! in place. Concurrent writers for the same key are last-writer-wins — there
//! is no single-flight de-duplication of concurrent misses.

use crate::persistence::connection_pool::ConnectionPool;
use crate::store::Row;
use crate::utils::logger::{LogLevel, Logger};
use crate::utils::time::TimeService;
use crate::utils::{SurveyError, SurveyResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 24,
        }
    }
}

/// One cached analytics result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub subject_id: i64,
    pub metric_name: String,
    pub category_filter: Option<String>,
    pub metric_data: Value,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is live iff `now < expires_at`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Aggregate cache counters for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub expired_entries: u64,
    pub oldest_generated_at: Option<DateTime<Utc>>,
    pub newest_generated_at: Option<DateTime<Utc>>,
}

/// Sole writer of the `analytics_cache` table
pub struct CacheManager {
    pool: ConnectionPool,
    config: CacheConfig,
    time: TimeService,
    logger: Logger,
}

impl CacheManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self::with_config(pool, CacheConfig::default())
    }

    pub fn with_config(pool: ConnectionPool, config: CacheConfig) -> Self {
        Self {
            pool,
            config,
            time: TimeService::new(),
            logger: Logger::new(LogLevel::Info),
        }
    }

    /// Upsert the entry for (subject_id, metric, category_filter), stamping
    /// `generated_at = now` and `expires_at = now + ttl` (default TTL when
    /// `ttl_hours` is not given). Returns the written entry.
    pub async fn set(
        &self,
        subject_id: i64,
        metric: &str,
        payload: Value,
        category_filter: Option<&str>,
        ttl_hours: Option<i64>,
    ) -> SurveyResult<CacheEntry> {
        let now = self.time.now_utc();
        let ttl = ttl_hours.unwrap_or(self.config.default_ttl_hours);
        let expires_at = now + Duration::hours(ttl);

        let params = vec![
            Value::from(subject_id),
            Value::from(metric),
            category_filter.map(Value::from).unwrap_or(Value::Null),
            payload.clone(),
            Value::from(now.to_rfc3339()),
            Value::from(expires_at.to_rfc3339()),
        ];
        self.pool
            .execute(
                "INSERT INTO analytics_cache \
                 (subject_id, metric_name, category_filter, metric_data, generated_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(subject_id, metric_name, category_filter) \
                 DO UPDATE SET metric_data = excluded.metric_data, \
                 generated_at = excluded.generated_at, expires_at = excluded.expires_at",
                &params,
            )
            .await?;

        self.logger.debug(&format!(
            "cached metric '{}' for subject {} (filter: {:?}, ttl: {}h)",
            metric, subject_id, category_filter, ttl
        ));

        Ok(CacheEntry {
            subject_id,
            metric_name: metric.to_string(),
            category_filter: category_filter.map(str::to_string),
            metric_data: payload,
            generated_at: now,
            expires_at,
        })
    }

    /// Fetch the live entry for the key, or `None` when absent or expired.
    /// Expiry is lazy: an expired row is left in place for the sweeper.
    /// Read errors are real failures and propagate; they are never reported
    /// as a miss.
    pub async fn get(
        &self,
        subject_id: i64,
        metric: &str,
        category_filter: Option<&str>,
    ) -> SurveyResult<Option<CacheEntry>> {
        // Absence and presence of the filter are distinct keys and must never alias
        let (sql, params) = match category_filter {
            Some(filter) => (
                "SELECT subject_id, metric_name, category_filter, metric_data, \
                 generated_at, expires_at FROM analytics_cache \
                 WHERE subject_id = ? AND metric_name = ? AND category_filter = ?",
                vec![
                    Value::from(subject_id),
                    Value::from(metric),
                    Value::from(filter),
                ],
            ),
            None => (
                "SELECT subject_id, metric_name, category_filter, metric_data, \
                 generated_at, expires_at FROM analytics_cache \
                 WHERE subject_id = ? AND metric_name = ? AND category_filter IS NULL",
                vec![Value::from(subject_id), Value::from(metric)],
            ),
        };

        let rows = self.pool.query(sql, &params).await?;
        let row = match rows.into_iter().next() {
            Some(row) => row,
            None => return Ok(None),
        };

        let entry = parse_entry(&row)?;
        if !entry.is_live(self.time.now_utc()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Delete cached entries for the subject — every metric, or only the named
    /// one (across all category filters). Returns the count deleted.
    pub async fn invalidate(&self, subject_id: i64, metric: Option<&str>) -> SurveyResult<u64> {
        let deleted = match metric {
            Some(metric) => {
                self.pool
                    .execute(
                        "DELETE FROM analytics_cache WHERE subject_id = ? AND metric_name = ?",
                        &[Value::from(subject_id), Value::from(metric)],
                    )
                    .await?
            }
            None => {
                self.pool
                    .execute(
                        "DELETE FROM analytics_cache WHERE subject_id = ?",
                        &[Value::from(subject_id)],
                    )
                    .await?
            }
        };
        self.logger.debug(&format!(
            "invalidated {} cache entries for subject {} (metric: {:?})",
            deleted, subject_id, metric
        ));
        Ok(deleted)
    }

    /// Delete every expired entry regardless of subject. Intended to run on a
    /// schedule; returns the count deleted.
    pub async fn cleanup_expired(&self) -> SurveyResult<u64> {
        let now = self.time.now_utc().to_rfc3339();
        let deleted = self
            .pool
            .execute(
                "DELETE FROM analytics_cache WHERE expires_at <= ?",
                &[Value::from(now)],
            )
            .await?;
        if deleted > 0 {
            self.logger
                .info(&format!("swept {} expired cache entries", deleted));
        }
        Ok(deleted)
    }

    /// Aggregate counts over the whole cache table
    pub async fn get_stats(&self) -> SurveyResult<CacheStats> {
        let now = self.time.now_utc().to_rfc3339();
        let rows = self
            .pool
            .query(
                "SELECT COUNT(*) AS total_entries, \
                 SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END) AS expired_entries, \
                 MIN(generated_at) AS oldest_generated_at, \
                 MAX(generated_at) AS newest_generated_at \
                 FROM analytics_cache",
                &[Value::from(now)],
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SurveyError::cache_error("cache stats query returned no rows"))?;

        Ok(CacheStats {
            total_entries: row
                .get("total_entries")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            expired_entries: row
                .get("expired_entries")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            oldest_generated_at: parse_optional_timestamp(&row, "oldest_generated_at")?,
            newest_generated_at: parse_optional_timestamp(&row, "newest_generated_at")?,
        })
    }
}

fn parse_entry(row: &Row) -> SurveyResult<CacheEntry> {
    let metric_data = match row.get("metric_data") {
        // Stores returning JSON text instead of a structured value
        Some(Value::String(text)) => serde_json::from_str(text)
            .map_err(|e| SurveyError::parse_error(format!("invalid cached payload: {}", e)))?,
        Some(value) => value.clone(),
        None => {
            return Err(SurveyError::cache_error(
                "cache row is missing metric_data",
            ))
        }
    };

    Ok(CacheEntry {
        subject_id: row
            .get("subject_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SurveyError::cache_error("cache row is missing subject_id"))?,
        metric_name: row
            .get("metric_name")
            .and_then(Value::as_str)
            .ok_or_else(|| SurveyError::cache_error("cache row is missing metric_name"))?
            .to_string(),
        category_filter: row
            .get("category_filter")
            .and_then(Value::as_str)
            .map(str::to_string),
        metric_data,
        generated_at: parse_timestamp(row, "generated_at")?,
        expires_at: parse_timestamp(row, "expires_at")?,
    })
}

fn parse_timestamp(row: &Row, column: &str) -> SurveyResult<DateTime<Utc>> {
    let text = row.get(column).and_then(Value::as_str).ok_or_else(|| {
        SurveyError::cache_error(format!("cache row is missing {}", column))
    })?;
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SurveyError::parse_error(format!("invalid {} timestamp: {}", column, e)))
}

fn parse_optional_timestamp(row: &Row, column: &str) -> SurveyResult<Option<DateTime<Utc>>> {
    match row.get(column) {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| SurveyError::parse_error(format!("invalid {} timestamp: {}", column, e))),
        _ => Ok(None),
    }
}
