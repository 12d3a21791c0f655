//! Analytics Orchestration for Survey Results
//!
//! Answers the three derived-analytics query shapes (summary, category
//! breakdown, trend) by composing the cache manager, the connection pool and
//! the statistics engine: check cache, on miss query raw aggregates, compute,
//! write through, return. The orchestrator owns no persistent state of its
//! own.

use crate::analytics::cache_manager::CacheManager;
use crate::analytics::statistics::{
    BasicStatistics, ConfidenceInterval, DistributionBin, StatsEngine, TrendPoint, TrendResult,
};
use crate::persistence::connection_pool::ConnectionPool;
use crate::utils::logger::{LogLevel, Logger};
use crate::utils::{SurveyError, SurveyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const METRIC_SUMMARY: &str = "summary";
const METRIC_CATEGORY_BREAKDOWN: &str = "category_breakdown";
const METRIC_TRENDS: &str = "trends";

const DISTRIBUTION_BINS: usize = 10;
const CONFIDENCE_LEVEL_PCT: f64 = 95.0;

/// Per-call options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsOptions {
    pub use_cache: bool,
}

impl Default for AnalyticsOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

/// Time bucketing for trend queries. A closed enumeration: the bucket format
/// never comes from caller-influenced text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendInterval {
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "monthly")]
    Monthly,
}

impl TrendInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendInterval::Daily => "daily",
            TrendInterval::Weekly => "weekly",
            TrendInterval::Monthly => "monthly",
        }
    }

    fn bucket_format(&self) -> &'static str {
        match self {
            TrendInterval::Daily => "%Y-%m-%d",
            TrendInterval::Weekly => "%Y-%W",
            TrendInterval::Monthly => "%Y-%m",
        }
    }
}

/// Full descriptive summary of a survey's numeric responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveySummary {
    pub survey_id: i64,
    pub response_count: u64,
    pub statistics: BasicStatistics,
    pub distribution: Vec<DistributionBin>,
    pub confidence_interval: ConfidenceInterval,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStatistics {
    pub category: String,
    pub response_count: u64,
    pub statistics: BasicStatistics,
}

/// Per-category breakdown, optionally narrowed to one category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub survey_id: i64,
    pub category_filter: Option<String>,
    pub categories: Vec<CategoryStatistics>,
    pub generated_at: DateTime<Utc>,
}

/// Trend classification over time-bucketed response averages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyTrend {
    pub survey_id: i64,
    pub interval: TrendInterval,
    pub points: Vec<TrendPoint>,
    pub trend: TrendResult,
    pub generated_at: DateTime<Utc>,
}

/// Composes pool, cache and statistics into the analytics query surface
pub struct AnalyticsService {
    pool: ConnectionPool,
    cache: Arc<CacheManager>,
    logger: Logger,
}

impl AnalyticsService {
    pub fn new(pool: ConnectionPool, cache: Arc<CacheManager>) -> Self {
        Self {
            pool,
            cache,
            logger: Logger::new(LogLevel::Info),
        }
    }

    /// Descriptive summary over all numeric responses of the survey
    pub async fn summary(
        &self,
        survey_id: i64,
        options: &AnalyticsOptions,
    ) -> SurveyResult<SurveySummary> {
        if options.use_cache {
            if let Some(cached) = self
                .read_cached::<SurveySummary>(survey_id, METRIC_SUMMARY, None)
                .await?
            {
                return Ok(cached);
            }
        }

        self.ensure_survey_exists(survey_id).await?;
        let values = self.fetch_numeric_samples(survey_id).await?;

        let statistics = StatsEngine::basic_statistics(&values)?;
        let distribution = StatsEngine::distribution(&values, DISTRIBUTION_BINS);
        let confidence_interval = StatsEngine::confidence_interval(&values, CONFIDENCE_LEVEL_PCT)?;

        let summary = SurveySummary {
            survey_id,
            response_count: values.len() as u64,
            statistics,
            distribution,
            confidence_interval,
            generated_at: Utc::now(),
        };

        if options.use_cache {
            self.cache
                .set(
                    survey_id,
                    METRIC_SUMMARY,
                    serde_json::to_value(&summary)?,
                    None,
                    None,
                )
                .await?;
        }
        Ok(summary)
    }

    /// Per-category descriptive statistics, optionally narrowed to one
    /// category (the narrowing is part of the cache key)
    pub async fn category_analysis(
        &self,
        survey_id: i64,
        category: Option<&str>,
        options: &AnalyticsOptions,
    ) -> SurveyResult<CategoryBreakdown> {
        if options.use_cache {
            if let Some(cached) = self
                .read_cached::<CategoryBreakdown>(survey_id, METRIC_CATEGORY_BREAKDOWN, category)
                .await?
            {
                return Ok(cached);
            }
        }

        self.ensure_survey_exists(survey_id).await?;

        let (sql, params): (&str, Vec<Value>) = match category {
            Some(filter) => (
                "SELECT category, numeric_value FROM survey_responses \
                 WHERE survey_id = ? AND numeric_value IS NOT NULL AND category = ?",
                vec![Value::from(survey_id), Value::from(filter)],
            ),
            None => (
                "SELECT category, numeric_value FROM survey_responses \
                 WHERE survey_id = ? AND numeric_value IS NOT NULL",
                vec![Value::from(survey_id)],
            ),
        };
        let rows = self.pool.query(sql, &params).await?;

        let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in &rows {
            let name = row
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("uncategorized")
                .to_string();
            if let Some(value) = row.get("numeric_value").and_then(Value::as_f64) {
                grouped.entry(name).or_default().push(value);
            }
        }

        let mut categories = Vec::with_capacity(grouped.len());
        for (name, values) in grouped {
            categories.push(CategoryStatistics {
                response_count: values.len() as u64,
                statistics: StatsEngine::basic_statistics(&values)?,
                category: name,
            });
        }

        let breakdown = CategoryBreakdown {
            survey_id,
            category_filter: category.map(str::to_string),
            categories,
            generated_at: Utc::now(),
        };

        if options.use_cache {
            self.cache
                .set(
                    survey_id,
                    METRIC_CATEGORY_BREAKDOWN,
                    serde_json::to_value(&breakdown)?,
                    category,
                    None,
                )
                .await?;
        }
        Ok(breakdown)
    }

    /// Direction of the survey's response averages over time buckets
    /// (the interval is part of the cache key)
    pub async fn trend_analysis(
        &self,
        survey_id: i64,
        interval: TrendInterval,
        options: &AnalyticsOptions,
    ) -> SurveyResult<SurveyTrend> {
        if options.use_cache {
            if let Some(cached) = self
                .read_cached::<SurveyTrend>(survey_id, METRIC_TRENDS, Some(interval.as_str()))
                .await?
            {
                return Ok(cached);
            }
        }

        self.ensure_survey_exists(survey_id).await?;

        let sql = format!(
            "SELECT strftime('{}', submitted_at) AS bucket, AVG(numeric_value) AS avg_value \
             FROM survey_responses WHERE survey_id = ? AND numeric_value IS NOT NULL \
             GROUP BY bucket ORDER BY bucket",
            interval.bucket_format()
        );
        let rows = self.pool.query(&sql, &[Value::from(survey_id)]).await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            let bucket = row
                .get("bucket")
                .and_then(Value::as_str)
                .ok_or_else(|| SurveyError::database_error("trend row is missing bucket"))?
                .to_string();
            let value = row
                .get("avg_value")
                .and_then(Value::as_f64)
                .ok_or_else(|| SurveyError::database_error("trend row is missing avg_value"))?;
            points.push(TrendPoint { bucket, value });
        }

        let trend = StatsEngine::trend_analysis(&points);
        let result = SurveyTrend {
            survey_id,
            interval,
            points,
            trend,
            generated_at: Utc::now(),
        };

        if options.use_cache {
            self.cache
                .set(
                    survey_id,
                    METRIC_TRENDS,
                    serde_json::to_value(&result)?,
                    Some(interval.as_str()),
                    None,
                )
                .await?;
        }
        Ok(result)
    }

    /// Drop every cached metric for the survey (e.g. after new responses land)
    pub async fn invalidate_survey(&self, survey_id: i64) -> SurveyResult<u64> {
        self.cache.invalidate(survey_id, None).await
    }

    async fn read_cached<T: serde::de::DeserializeOwned>(
        &self,
        survey_id: i64,
        metric: &str,
        category_filter: Option<&str>,
    ) -> SurveyResult<Option<T>> {
        match self.cache.get(survey_id, metric, category_filter).await? {
            Some(entry) => match serde_json::from_value(entry.metric_data) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // A payload this crate cannot read anymore is stale by
                    // definition; recompute instead of failing the request
                    self.logger.warn(&format!(
                        "discarding unreadable cached '{}' for subject {}: {}",
                        metric, survey_id, e
                    ));
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Fail with NotFound before any statistics run for an unknown survey
    async fn ensure_survey_exists(&self, survey_id: i64) -> SurveyResult<()> {
        let rows = self
            .pool
            .query(
                "SELECT id FROM surveys WHERE id = ?",
                &[Value::from(survey_id)],
            )
            .await?;
        if rows.is_empty() {
            return Err(SurveyError::not_found(format!(
                "survey {} not found",
                survey_id
            )));
        }
        Ok(())
    }

    async fn fetch_numeric_samples(&self, survey_id: i64) -> SurveyResult<Vec<f64>> {
        let rows = self
            .pool
            .query(
                "SELECT numeric_value FROM survey_responses \
                 WHERE survey_id = ? AND numeric_value IS NOT NULL",
                &[Value::from(survey_id)],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("numeric_value").and_then(Value::as_f64))
            .collect())
    }
}
