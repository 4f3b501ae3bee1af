//! Error types for Sift

use std::time::Duration;

use thiserror::Error;

use crate::models::BudgetPeriod;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Insufficient budget: {period} budget would be exceeded \
         (current: ${current:.4}, estimated: ${estimated:.4}, limit: ${limit:.2})"
    )]
    InsufficientBudget {
        period: BudgetPeriod,
        current: f64,
        estimated: f64,
        limit: f64,
    },

    #[error("Rate limited: {reason} (retry in {}s)", .retry_after.as_secs())]
    RateLimited { reason: String, retry_after: Duration },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Model not available: {0}")]
    ModelNotAvailable(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("{operation} timed out after {}ms", .elapsed.as_millis())]
    Timeout { operation: String, elapsed: Duration },

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the job layer may retry the failed work unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Pool(_)
                | Self::Io(_)
                | Self::Http(_)
                | Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
