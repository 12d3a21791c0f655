//! In-memory store double for testing the data-access core.
//!
//! Implements the store contract over shared in-memory tables, with error
//! simulation and a statement log. The dispatch understands the fixed
//! statement set this crate issues; it is a test double, not a SQL engine.

use crate::store::{ConnectionFactory, Row, StoreConnection, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct CacheRow {
    subject_id: i64,
    metric_name: String,
    category_filter: Option<String>,
    metric_data: Value,
    generated_at: String,
    expires_at: String,
}

#[derive(Debug, Clone)]
struct ResponseRow {
    survey_id: i64,
    category: String,
    numeric_value: f64,
    submitted_at: String,
}

#[derive(Default)]
struct MemoryState {
    statements: Vec<String>,
    failure_queue: VecDeque<(String, Option<String>)>,
    surveys: HashSet<i64>,
    responses: Vec<ResponseRow>,
    cache_rows: Vec<CacheRow>,
    connections_created: u32,
    connections_closed: u32,
}

/// Shared handle over the in-memory store state
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Factory producing connections that share this store's state
    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(MemoryFactory {
            state: self.state.clone(),
        })
    }

    /// Queue one statement failure; the next execute/query on any connection
    /// returns it
    pub fn fail_next_statement(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failure_queue
            .push_back((message.to_string(), None));
    }

    /// Queue one statement failure carrying a driver error code
    pub fn fail_next_statement_with_code(&self, message: &str, code: &str) {
        self.state
            .lock()
            .unwrap()
            .failure_queue
            .push_back((message.to_string(), Some(code.to_string())));
    }

    /// Every statement executed so far, in order, across all connections
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn created_connections(&self) -> u32 {
        self.state.lock().unwrap().connections_created
    }

    pub fn closed_connections(&self) -> u32 {
        self.state.lock().unwrap().connections_closed
    }

    pub fn cache_row_count(&self) -> usize {
        self.state.lock().unwrap().cache_rows.len()
    }

    pub fn add_survey(&self, survey_id: i64) {
        self.state.lock().unwrap().surveys.insert(survey_id);
    }

    pub fn add_response(&self, survey_id: i64, category: &str, value: f64, submitted_at: &str) {
        self.state.lock().unwrap().responses.push(ResponseRow {
            survey_id,
            category: category.to_string(),
            numeric_value: value,
            submitted_at: submitted_at.to_string(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryFactory {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn connect(&self) -> StoreResult<Box<dyn StoreConnection>> {
        let mut state = self.state.lock().unwrap();
        state.connections_created += 1;
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl MemoryConnection {
    fn check_in(&self, sql: &str) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let mut state = self.state.lock().unwrap();
        state.statements.push(sql.to_string());
        if let Some((message, code)) = state.failure_queue.pop_front() {
            return Err(StoreError::Statement { message, code });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> StoreResult<u64> {
        self.check_in(sql)?;
        let mut state = self.state.lock().unwrap();

        if sql.starts_with("INSERT INTO analytics_cache") {
            let subject_id = params[0].as_i64().unwrap_or_default();
            let metric_name = params[1].as_str().unwrap_or_default().to_string();
            let category_filter = params[2].as_str().map(str::to_string);
            let row = CacheRow {
                subject_id,
                metric_name: metric_name.clone(),
                category_filter: category_filter.clone(),
                metric_data: params[3].clone(),
                generated_at: params[4].as_str().unwrap_or_default().to_string(),
                expires_at: params[5].as_str().unwrap_or_default().to_string(),
            };
            // Upsert against the (subject_id, metric_name, category_filter) key
            let existing = state.cache_rows.iter().position(|r| {
                r.subject_id == subject_id
                    && r.metric_name == metric_name
                    && r.category_filter == category_filter
            });
            match existing {
                Some(index) => state.cache_rows[index] = row,
                None => state.cache_rows.push(row),
            }
            return Ok(1);
        }

        if sql.starts_with("DELETE FROM analytics_cache WHERE subject_id = ? AND metric_name") {
            let subject_id = params[0].as_i64().unwrap_or_default();
            let metric_name = params[1].as_str().unwrap_or_default();
            let before = state.cache_rows.len();
            state
                .cache_rows
                .retain(|r| !(r.subject_id == subject_id && r.metric_name == metric_name));
            return Ok((before - state.cache_rows.len()) as u64);
        }

        if sql.starts_with("DELETE FROM analytics_cache WHERE subject_id = ?") {
            let subject_id = params[0].as_i64().unwrap_or_default();
            let before = state.cache_rows.len();
            state.cache_rows.retain(|r| r.subject_id != subject_id);
            return Ok((before - state.cache_rows.len()) as u64);
        }

        if sql.starts_with("DELETE FROM analytics_cache WHERE expires_at") {
            let cutoff = params[0].as_str().unwrap_or_default().to_string();
            let before = state.cache_rows.len();
            state
                .cache_rows
                .retain(|r| !timestamp_lte(&r.expires_at, &cutoff));
            return Ok((before - state.cache_rows.len()) as u64);
        }

        // Transaction control and ad-hoc writes need no table semantics here
        Ok(0)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        self.check_in(sql)?;
        let state = self.state.lock().unwrap();

        if sql.contains("FROM analytics_cache WHERE subject_id") {
            let subject_id = params[0].as_i64().unwrap_or_default();
            let metric_name = params[1].as_str().unwrap_or_default();
            let wants_null_filter = sql.contains("category_filter IS NULL");
            let filter = if wants_null_filter {
                None
            } else {
                params[2].as_str().map(str::to_string)
            };
            let rows = state
                .cache_rows
                .iter()
                .filter(|r| {
                    r.subject_id == subject_id
                        && r.metric_name == metric_name
                        && r.category_filter == filter
                })
                .map(cache_row_to_row)
                .collect();
            return Ok(rows);
        }

        if sql.starts_with("SELECT COUNT(*)") && sql.contains("FROM analytics_cache") {
            let cutoff = params[0].as_str().unwrap_or_default().to_string();
            let expired = state
                .cache_rows
                .iter()
                .filter(|r| timestamp_lte(&r.expires_at, &cutoff))
                .count() as u64;
            let mut row = Row::new();
            row.insert(
                "total_entries".to_string(),
                Value::from(state.cache_rows.len() as u64),
            );
            row.insert("expired_entries".to_string(), Value::from(expired));
            let oldest = state.cache_rows.iter().map(|r| &r.generated_at).min();
            let newest = state.cache_rows.iter().map(|r| &r.generated_at).max();
            row.insert(
                "oldest_generated_at".to_string(),
                oldest.map(|t| Value::from(t.clone())).unwrap_or(Value::Null),
            );
            row.insert(
                "newest_generated_at".to_string(),
                newest.map(|t| Value::from(t.clone())).unwrap_or(Value::Null),
            );
            return Ok(vec![row]);
        }

        if sql.starts_with("SELECT id FROM surveys WHERE id = ?") {
            let survey_id = params[0].as_i64().unwrap_or_default();
            if state.surveys.contains(&survey_id) {
                let mut row = Row::new();
                row.insert("id".to_string(), Value::from(survey_id));
                return Ok(vec![row]);
            }
            return Ok(Vec::new());
        }

        if sql.starts_with("SELECT numeric_value FROM survey_responses") {
            let survey_id = params[0].as_i64().unwrap_or_default();
            let rows = state
                .responses
                .iter()
                .filter(|r| r.survey_id == survey_id)
                .map(|r| {
                    let mut row = Row::new();
                    row.insert("numeric_value".to_string(), Value::from(r.numeric_value));
                    row
                })
                .collect();
            return Ok(rows);
        }

        if sql.starts_with("SELECT category, numeric_value") {
            let survey_id = params[0].as_i64().unwrap_or_default();
            let filter = if sql.contains("AND category = ?") {
                params[1].as_str().map(str::to_string)
            } else {
                None
            };
            let rows = state
                .responses
                .iter()
                .filter(|r| {
                    r.survey_id == survey_id
                        && filter.as_deref().map(|f| r.category == f).unwrap_or(true)
                })
                .map(|r| {
                    let mut row = Row::new();
                    row.insert("category".to_string(), Value::from(r.category.clone()));
                    row.insert("numeric_value".to_string(), Value::from(r.numeric_value));
                    row
                })
                .collect();
            return Ok(rows);
        }

        if sql.contains("strftime") && sql.contains("GROUP BY bucket") {
            let survey_id = params[0].as_i64().unwrap_or_default();
            // Bucket by date prefix, matching the strftime format in the query
            let prefix_len = if sql.contains("%Y-%m-%d") { 10 } else { 7 };
            let mut buckets: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for r in state.responses.iter().filter(|r| r.survey_id == survey_id) {
                let bucket = r
                    .submitted_at
                    .chars()
                    .take(prefix_len)
                    .collect::<String>();
                buckets.entry(bucket).or_default().push(r.numeric_value);
            }
            let rows = buckets
                .into_iter()
                .map(|(bucket, values)| {
                    let avg = values.iter().sum::<f64>() / values.len() as f64;
                    let mut row = Row::new();
                    row.insert("bucket".to_string(), Value::from(bucket));
                    row.insert("avg_value".to_string(), Value::from(avg));
                    row
                })
                .collect();
            return Ok(rows);
        }

        // Health probes and unknown reads succeed with no rows
        Ok(Vec::new())
    }

    async fn close(&mut self) -> StoreResult<()> {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().connections_closed += 1;
        }
        Ok(())
    }
}

fn cache_row_to_row(r: &CacheRow) -> Row {
    let mut row = Row::new();
    row.insert("subject_id".to_string(), Value::from(r.subject_id));
    row.insert("metric_name".to_string(), Value::from(r.metric_name.clone()));
    row.insert(
        "category_filter".to_string(),
        r.category_filter
            .as_ref()
            .map(|f| Value::from(f.clone()))
            .unwrap_or(Value::Null),
    );
    row.insert("metric_data".to_string(), r.metric_data.clone());
    row.insert("generated_at".to_string(), Value::from(r.generated_at.clone()));
    row.insert("expires_at".to_string(), Value::from(r.expires_at.clone()));
    row
}

fn timestamp_lte(left: &str, right: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        (Ok(l), Ok(r)) => l <= r,
        _ => left <= right,
    }
}
