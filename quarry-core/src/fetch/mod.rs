//! Fetch collaborator: work units, fetch errors and the `Fetcher` trait.
//!
//! The `Fetcher` trait abstracts over data sources (an HTTP API, synthetic
//! data) so the scheduler can swap implementations and tests can script them.
//! Fetchers are single-call: retries, pacing and the circuit breaker are owned
//! by the scheduler.

pub mod circuit_breaker;
pub mod http;
pub mod pacing;
pub mod synthetic;

pub use circuit_breaker::CircuitBreaker;
pub use http::{HttpFetcher, HttpSourceConfig};
pub use pacing::RateGate;
pub use synthetic::{SyntheticConfig, SyntheticFetcher};

use crate::error::ConfigError;
use crate::record::Table;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::invalid(
                "range",
                format!("start {start} is after end {end}"),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every calendar day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// A named slice of a job's history. Each phase has its own checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(flatten)]
    pub range: DateRange,
}

/// One entity over one date range: the atomic piece of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub entity_id: String,
    pub range: DateRange,
}

impl WorkUnit {
    pub fn new(entity_id: impl Into<String>, range: DateRange) -> Self {
        Self {
            entity_id: entity_id.into(),
            range,
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.entity_id, self.range)
    }
}

/// Failure of a single fetch. Never fatal to a job.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormat(String),

    #[error("source refused requests: {0}")]
    Blocked(String),

    #[error("entity not found: {entity_id}")]
    NotFound { entity_id: String },
}

impl FetchError {
    /// Errors that open the circuit breaker immediately.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, FetchError::Blocked(_))
    }

    /// Minimum wait the source asked for, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            FetchError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// A data source that turns one work unit into a table of records.
pub trait Fetcher: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Check credentials and parameters before any work is issued.
    fn preflight(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Fetch every record for `unit`. An empty table is a valid answer.
    fn fetch(&self, unit: &WorkUnit) -> Result<Table, FetchError>;

    /// Whether the source is currently willing to serve requests.
    fn is_available(&self) -> bool {
        true
    }
}
