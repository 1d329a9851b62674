//! Quarry Runner: job configuration, fetch scheduling, finalize and reports.
//!
//! This crate builds on `quarry-core` to provide:
//! - TOML job configuration (entities, phases, pacing, source, schema, rules)
//! - Fetch scheduler with checkpointed resume, retries and a circuit breaker
//! - Finalize step: merge partitions into the final dataset, validate, commit
//! - Job orchestration over phases, status and reset
//! - Validation report export (JSON, CSV)

pub mod config;
pub mod error;
pub mod finalize;
pub mod job;
pub mod report;
pub mod scheduler;

pub use config::{EntitiesSection, FetchSettings, JobConfig, JobSection, SourceConfig};
pub use error::JobError;
pub use finalize::{build_candidate, finalize, Candidate, FinalizeOutcome};
pub use job::{AcquireSummary, FinalizeSummary, Job, JobStatus, PhaseStatus};
pub use report::{export_report_csv, export_report_json, import_report_json, save_report};
pub use scheduler::{FetchScheduler, SchedulerOutcome};
