//! Quarry Core: records, durable state and data-quality rules for resumable
//! acquisition of partitioned time series.
//!
//! This crate contains everything below the job runner:
//! - Record model with an explicit field schema and natural keys
//! - Checkpoint store (atomic JSON, resume cursor, completed units)
//! - Dataset store (Parquet partition files and the final dataset)
//! - Merge engine (revision-ordered dedup)
//! - Validator with independent rules
//! - Fetch collaborator trait, HTTP and synthetic sources, pacing gate, circuit breaker
//! - Progress events and entity universes

pub mod checkpoint;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod progress;
pub mod record;
pub mod storage;
pub mod universe;
pub mod validate;

pub use checkpoint::{CheckpointState, CheckpointStore};
pub use error::{ConfigError, PersistenceError};
pub use fetch::{DateRange, FetchError, Fetcher, Phase, WorkUnit};
pub use merge::{MergeEngine, MergeError, MergeStats};
pub use progress::{ProgressEvent, ProgressSink, UnitOutcome};
pub use record::{FieldKind, FieldSpec, FieldValue, NaturalKey, Record, RecordSchema, SchemaError, Table};
pub use storage::{DatasetMeta, DatasetStore, LoadedPartitions};
pub use validate::{Severity, ValidationConfig, ValidationError, ValidationReport, Validator};
