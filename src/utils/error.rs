// src/utils/error.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type SurveyResult<T> = Result<T, SurveyError>;

/// Custom error details for additional context
pub type ErrorDetails = HashMap<String, serde_json::Value>;

/// Main error type for the survey data-access core
/// Optimized for size by boxing large fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyError {
    pub message: String,
    pub details: Option<Box<ErrorDetails>>, // Boxed to reduce struct size
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    #[default]
    UnknownError,
    DatabaseError,
    NetworkError,
    ValidationError,
    ConfigurationError,
    SerializationError,
    DeserializationError,
    TimeoutError,
    NotFoundError,
    CacheError,
    InternalServerError,
    Internal,
    // Pool lifecycle failures
    PoolShuttingDown,
    AcquireTimeout,
    ConnectTimeout,
    // Transaction state-machine misuse (programmer error, never retried)
    TransactionNotActive,
    TransactionAlreadyActive,
    // Statistics engine input failure (caller bug, never retried)
    EmptyDataset,
}

impl fmt::Display for SurveyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SurveyError {}

impl SurveyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            status: None,
            error_code: None,
            kind,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(Box::new(details));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    /// Store-level error code (e.g. an SQLSTATE), when the store supplied one
    pub fn code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    // Convenience constructors for common error types
    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DatabaseError, message)
            .with_status(500)
            .with_code("DATABASE_ERROR")
    }

    pub fn network_error<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::NetworkError, message)
            .with_status(503)
            .with_code("NETWORK_ERROR")
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
            .with_status(400)
            .with_code("VALIDATION_ERROR")
    }

    pub fn not_found<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::NotFoundError, message)
            .with_status(404)
            .with_code("NOT_FOUND")
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeserializationError, message)
            .with_status(400)
            .with_code("PARSE_ERROR")
    }

    pub fn serialization_error<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::SerializationError, message)
            .with_status(400)
            .with_code("SERIALIZATION_ERROR")
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
            .with_status(500)
            .with_code("CONFIG_ERROR")
    }

    pub fn timeout_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimeoutError, message)
            .with_status(408)
            .with_code("TIMEOUT_ERROR")
    }

    pub fn cache_error<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::CacheError, message)
            .with_status(500)
            .with_code("CACHE_ERROR")
    }

    pub fn internal_error<T: Into<String>>(message: T) -> Self {
        Self::new(ErrorKind::Internal, message)
            .with_status(500)
            .with_code("INTERNAL_ERROR")
    }

    pub fn pool_shutting_down(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PoolShuttingDown, message)
            .with_status(503)
            .with_code("POOL_SHUTTING_DOWN")
    }

    pub fn acquire_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AcquireTimeout, message)
            .with_status(503)
            .with_code("ACQUIRE_TIMEOUT")
    }

    pub fn connect_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectTimeout, message)
            .with_status(503)
            .with_code("CONNECT_TIMEOUT")
    }

    pub fn transaction_not_active(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransactionNotActive, message)
            .with_status(500)
            .with_code("TRANSACTION_NOT_ACTIVE")
    }

    pub fn transaction_already_active(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransactionAlreadyActive, message)
            .with_status(500)
            .with_code("TRANSACTION_ALREADY_ACTIVE")
    }

    pub fn empty_dataset(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EmptyDataset, message)
            .with_status(400)
            .with_code("EMPTY_DATASET")
    }
}

// Implement From conversions for common error types
impl From<serde_json::Error> for SurveyError {
    fn from(err: serde_json::Error) -> Self {
        SurveyError::parse_error(format!("JSON parsing error: {}", err))
    }
}

impl From<String> for SurveyError {
    fn from(err: String) -> Self {
        Self::validation_error(err)
    }
}

impl From<&str> for SurveyError {
    fn from(err: &str) -> Self {
        Self::validation_error(err.to_string())
    }
}
