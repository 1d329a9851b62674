//! Job orchestration over phases: acquire, finalize, status, reset.
//!
//! Each phase runs with its own checkpoint file under the job's data
//! directory; all phases write partitions into the same dataset store and are
//! merged together by one finalize.

use crate::config::JobConfig;
use crate::error::JobError;
use crate::finalize::{self, Candidate, FinalizeOutcome};
use crate::report;
use crate::scheduler::{FetchScheduler, SchedulerOutcome};
use chrono::{DateTime, Utc};
use quarry_core::progress::ProgressSink;
use quarry_core::{DatasetMeta, DatasetStore, Fetcher, RecordSchema, Validator};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A loaded job: configuration plus everything resolved from it.
pub struct Job {
    config: JobConfig,
    entities: Vec<String>,
    schema: RecordSchema,
    validator: Validator,
    store: DatasetStore,
}

/// Result of one `acquire` pass over all phases.
#[derive(Debug, Clone, Default)]
pub struct AcquireSummary {
    pub phases: Vec<SchedulerOutcome>,
    /// A phase stopped on an open circuit breaker; later phases did not run.
    pub halted: bool,
}

impl AcquireSummary {
    pub fn all_complete(&self) -> bool {
        !self.halted && self.phases.iter().all(|p| p.job_complete)
    }

    pub fn fetch_calls(&self) -> usize {
        self.phases.iter().map(|p| p.fetch_calls).sum()
    }

    pub fn failed(&self) -> usize {
        self.phases.iter().map(|p| p.failed).sum()
    }
}

#[derive(Debug, Clone)]
pub struct FinalizeSummary {
    pub outcome: FinalizeOutcome,
    pub report_path: PathBuf,
    pub checkpoints_cleared: bool,
    /// Entities sent back to the fetch queue because their partition file
    /// was unreadable.
    pub reopened: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub name: String,
    pub completed: usize,
    pub total: usize,
    pub cursor_index: usize,
    pub job_complete: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// Entities with failed runs, by consecutive failure count.
    pub failing: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: String,
    pub entities: usize,
    pub phases: Vec<PhaseStatus>,
    pub pending_partitions: usize,
    pub final_dataset: Option<DatasetMeta>,
}

impl Job {
    pub fn from_config(config: JobConfig) -> Result<Self, JobError> {
        let entities = config.resolve_entities()?;
        let schema = config.record_schema()?;
        let validator = Validator::from_config(&config.validation);
        let store = config.store();
        info!(
            job = %config.job.name,
            entities = entities.len(),
            phases = config.phases().len(),
            "loaded job"
        );
        Ok(Self {
            config,
            entities,
            schema,
            validator,
            store,
        })
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// Run every phase in order. A halted phase stops the pass: the breaker
    /// is shared, so later phases would hit the same blocked source.
    pub fn acquire(
        &self,
        fetcher: &dyn Fetcher,
        progress: &dyn ProgressSink,
    ) -> Result<AcquireSummary, JobError> {
        let scheduler = FetchScheduler::new(
            fetcher,
            &self.store,
            progress,
            self.schema.clone(),
            self.config.fetch.clone(),
        );

        let mut summary = AcquireSummary::default();
        for phase in self.config.phases() {
            let checkpoint = self.config.checkpoint_store(&phase.name);
            let outcome = scheduler.run_phase(&phase, &self.entities, &checkpoint)?;
            let halted = outcome.halted;
            summary.phases.push(outcome);
            if halted {
                warn!(phase = %phase.name, "acquisition halted; re-run after the cooldown");
                summary.halted = true;
                break;
            }
        }
        Ok(summary)
    }

    /// Merge, validate and commit; always writes the validation report.
    ///
    /// With `clear_checkpoints`, phase checkpoints are removed after a
    /// committed merge of a fully acquired job, so the next `acquire` starts
    /// an incremental pass from scratch.
    pub fn finalize(
        &self,
        progress: &dyn ProgressSink,
        clear_checkpoints: bool,
    ) -> Result<FinalizeSummary, JobError> {
        let outcome = finalize::finalize(&self.store, &self.schema, &self.validator, progress)?;
        let report_path = self.save_report(&outcome.report)?;
        let reopened = self.reopen_quarantined(&outcome.quarantined)?;
        if outcome.committed {
            self.forget_partitions(&outcome.partitions_consumed)?;
        }

        let mut checkpoints_cleared = false;
        if clear_checkpoints {
            if outcome.committed && self.all_phases_complete()? {
                self.reset()?;
                checkpoints_cleared = true;
            } else {
                warn!("checkpoints kept: merge not committed or job not fully acquired");
            }
        }

        Ok(FinalizeSummary {
            outcome,
            report_path,
            checkpoints_cleared,
            reopened,
        })
    }

    /// Build and validate the candidate dataset without committing it.
    ///
    /// Loading may still quarantine unreadable partitions; their entities are
    /// reopened the same way `finalize` does.
    pub fn validate_only(&self) -> Result<(Candidate, PathBuf), JobError> {
        let candidate = finalize::build_candidate(&self.store, &self.schema, &self.validator)?;
        let path = self.save_report(&candidate.report)?;
        self.reopen_quarantined(&candidate.quarantined)?;
        Ok((candidate, path))
    }

    pub fn status(&self) -> Result<JobStatus, JobError> {
        let mut phases = Vec::new();
        for phase in self.config.phases() {
            let state = self.config.checkpoint_store(&phase.name).load()?;
            let completed = self
                .entities
                .iter()
                .filter(|e| state.is_complete(e))
                .count();
            let mut failing: Vec<(String, u32)> = state.failure_counts.into_iter().collect();
            failing.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            phases.push(PhaseStatus {
                name: phase.name,
                completed,
                total: self.entities.len(),
                cursor_index: state.cursor_index,
                job_complete: state.job_complete,
                last_update: state.last_update,
                failing,
            });
        }

        Ok(JobStatus {
            job: self.config.job.name.clone(),
            entities: self.entities.len(),
            phases,
            pending_partitions: self.store.list_partitions()?.len(),
            final_dataset: self.store.final_meta(),
        })
    }

    /// Remove every phase checkpoint. Partitions and the final dataset stay.
    pub fn reset(&self) -> Result<(), JobError> {
        for phase in self.config.phases() {
            self.config.checkpoint_store(&phase.name).clear()?;
        }
        info!(job = %self.config.job.name, "cleared phase checkpoints");
        Ok(())
    }

    /// Take the entities of quarantined partition files out of every phase
    /// checkpoint so the next `acquire` fetches them again.
    fn reopen_quarantined(&self, quarantined: &[PathBuf]) -> Result<Vec<String>, JobError> {
        if quarantined.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<&str> = quarantined.iter().filter_map(|p| file_name(p)).collect();
        let mut reopened = Vec::new();
        for phase in self.config.phases() {
            let checkpoint = self.config.checkpoint_store(&phase.name);
            let mut state = checkpoint.load()?;
            let before = reopened.len();
            for name in &names {
                reopened.extend(state.reopen_partition(name));
            }
            if reopened.len() > before {
                state.advance_cursor(&self.entities);
                checkpoint.save(&state)?;
            }
        }

        if reopened.is_empty() {
            warn!(
                files = quarantined.len(),
                "quarantined partitions have no checkpoint record; their entities cannot be refetched"
            );
        } else {
            warn!(
                files = quarantined.len(),
                entities = reopened.len(),
                "reopened entities of quarantined partitions; re-run acquire"
            );
        }
        Ok(reopened)
    }

    fn forget_partitions(&self, consumed: &[PathBuf]) -> Result<(), JobError> {
        for phase in self.config.phases() {
            let checkpoint = self.config.checkpoint_store(&phase.name);
            let mut state = checkpoint.load()?;
            if state.forget_partitions(consumed.iter().filter_map(|p| file_name(p))) {
                checkpoint.save(&state)?;
            }
        }
        Ok(())
    }

    fn all_phases_complete(&self) -> Result<bool, JobError> {
        for phase in self.config.phases() {
            let state = self.config.checkpoint_store(&phase.name).load()?;
            if !state.covers(&self.entities) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn save_report(&self, report: &quarry_core::ValidationReport) -> Result<PathBuf, JobError> {
        report::save_report(report, &self.config.reports_dir())
            .map_err(|e| JobError::Report(format!("{e:#}")))
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}
