//! Errors that abort a job step.

use quarry_core::{ConfigError, MergeError, PersistenceError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("report export failed: {0}")]
    Report(String),
}
