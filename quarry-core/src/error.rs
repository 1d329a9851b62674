//! Error types shared across the core.
//!
//! Fetch failures live next to the fetch trait (`fetch::FetchError`) and are
//! never fatal to a job. The two types here are: configuration errors, which
//! abort a job before any work starts, and persistence errors, which abort the
//! current flush without advancing the checkpoint.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal configuration problems, detected before any fetch is issued.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential: environment variable '{var}' is not set")]
    MissingCredential { var: String },

    #[error("invalid parameter '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("cannot read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("cannot parse {what}: {reason}")]
    Parse { what: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Durable-storage failures (disk full, permissions, unreadable files).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parquet error on {path}: {reason}")]
    Parquet { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl PersistenceError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn parquet(path: &Path, reason: impl ToString) -> Self {
        Self::Parquet {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
