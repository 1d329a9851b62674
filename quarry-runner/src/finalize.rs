//! Finalize: merge partitions into the final dataset, validate, commit.
//!
//! The prior final dataset is merge input 0 and partitions follow in file
//! order, so a re-downloaded row with an equal revision replaces the stored
//! one. A candidate with any critical finding is rejected and nothing on disk
//! changes. Neither is a candidate built while a partition file had to be
//! quarantined: its rows are missing, so committing would drop them.

use crate::error::JobError;
use quarry_core::progress::{ProgressEvent, ProgressSink};
use quarry_core::{
    DatasetMeta, DatasetStore, MergeEngine, MergeStats, RecordSchema, Table, ValidationReport,
    Validator,
};
use std::path::PathBuf;
use tracing::{info, warn};

/// A merged, validated table that has not been committed yet.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub table: Table,
    pub report: ValidationReport,
    pub stats: MergeStats,
    /// Partition files merged into `table`.
    pub partitions: Vec<PathBuf>,
    /// Unreadable partition files left out of `table`.
    pub quarantined: Vec<PathBuf>,
    pub had_prior: bool,
}

#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub committed: bool,
    pub report: ValidationReport,
    pub stats: MergeStats,
    /// Partition files merged and removed by a commit.
    pub partitions_consumed: Vec<PathBuf>,
    /// Partition files quarantined while loading. Non-empty means no commit.
    pub quarantined: Vec<PathBuf>,
    /// Metadata of the newly committed dataset; `None` when rejected.
    pub meta: Option<DatasetMeta>,
}

/// Merge the prior final dataset with every partition and validate the result.
pub fn build_candidate(
    store: &DatasetStore,
    schema: &RecordSchema,
    validator: &Validator,
) -> Result<Candidate, JobError> {
    let prior = store.read_final(schema)?;
    let had_prior = prior.is_some();
    let loaded = store.load_partitions(schema)?;

    let mut inputs = Vec::with_capacity(loaded.tables.len() + 1);
    inputs.extend(prior);
    let mut partitions = Vec::with_capacity(loaded.tables.len());
    for (path, table) in loaded.tables {
        partitions.push(path);
        inputs.push(table);
    }

    let (table, stats) = MergeEngine::new(schema.clone()).merge_with_stats(inputs)?;
    info!(
        inputs = stats.inputs,
        input_rows = stats.input_rows,
        output_rows = stats.output_rows,
        superseded = stats.superseded,
        "merged candidate dataset"
    );

    let report = validator.validate(&table);
    Ok(Candidate {
        table,
        report,
        stats,
        partitions,
        quarantined: loaded.quarantined,
        had_prior,
    })
}

/// Build a candidate and commit it if it has no critical findings.
pub fn finalize(
    store: &DatasetStore,
    schema: &RecordSchema,
    validator: &Validator,
    progress: &dyn ProgressSink,
) -> Result<FinalizeOutcome, JobError> {
    let candidate = build_candidate(store, schema, validator)?;

    if !candidate.quarantined.is_empty() {
        warn!(
            quarantined = candidate.quarantined.len(),
            "partition files were unreadable; final dataset left untouched"
        );
        return Ok(report_only(candidate, progress));
    }

    if candidate.partitions.is_empty() {
        info!(had_prior = candidate.had_prior, "no new partitions; final dataset left as is");
        return Ok(report_only(candidate, progress));
    }

    if !candidate.report.is_acceptable() {
        warn!(
            summary = %candidate.report.summary(),
            "candidate rejected; final dataset and partitions left untouched"
        );
        return Ok(report_only(candidate, progress));
    }

    // Final dataset first: if removing partitions fails, the next finalize
    // merges them again and gets the same result.
    let meta = store.write_final(&candidate.table)?;
    store.remove_partitions(&candidate.partitions)?;
    info!(
        rows = meta.rows,
        entities = meta.entities,
        hash = %meta.data_hash,
        partitions = candidate.partitions.len(),
        "committed final dataset"
    );

    progress.on_event(&ProgressEvent::ValidationReport {
        report: candidate.report.clone(),
        committed: true,
    });
    Ok(FinalizeOutcome {
        committed: true,
        partitions_consumed: candidate.partitions,
        quarantined: Vec::new(),
        report: candidate.report,
        stats: candidate.stats,
        meta: Some(meta),
    })
}

fn report_only(candidate: Candidate, progress: &dyn ProgressSink) -> FinalizeOutcome {
    progress.on_event(&ProgressEvent::ValidationReport {
        report: candidate.report.clone(),
        committed: false,
    });
    FinalizeOutcome {
        committed: false,
        report: candidate.report,
        stats: candidate.stats,
        partitions_consumed: Vec::new(),
        quarantined: candidate.quarantined,
        meta: None,
    }
}
