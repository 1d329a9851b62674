//! Merge engine: combine partition tables and the prior final dataset into one
//! deduplicated, sorted table.
//!
//! Rows are ordered by `(entity_id, period_key, revision)` and the last row of
//! each natural key survives. Ties on revision go to the row from the later
//! input (then the later row within that input), so a newer download
//! supersedes an older one carrying the same revision. Because the revision is
//! part of the sort key, a stale revision can never win merely by arriving
//! later.

use crate::record::{Record, RecordSchema, SchemaError, Table};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("input {input} violates the dataset schema: {source}")]
    Schema {
        input: usize,
        #[source]
        source: SchemaError,
    },
}

/// Row counts from a merge, for logging and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inputs: usize,
    pub input_rows: usize,
    pub output_rows: usize,
    /// Rows dropped because a newer revision of the same key was present.
    pub superseded: usize,
}

/// A row plus its position in the merge input, for deterministic tie-breaking.
struct Tagged {
    input: usize,
    row: usize,
    record: Record,
}

/// Merges tables that share one record schema.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    schema: RecordSchema,
}

impl MergeEngine {
    pub fn new(schema: RecordSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Merge zero or more tables into one candidate final dataset.
    pub fn merge(&self, inputs: Vec<Table>) -> Result<Table, MergeError> {
        self.merge_with_stats(inputs).map(|(table, _)| table)
    }

    /// Like [`MergeEngine::merge`], also returning row counts.
    pub fn merge_with_stats(&self, inputs: Vec<Table>) -> Result<(Table, MergeStats), MergeError> {
        let mut stats = MergeStats {
            inputs: inputs.len(),
            ..MergeStats::default()
        };

        let mut rows = Vec::with_capacity(inputs.iter().map(Table::len).sum());
        for (input, table) in inputs.into_iter().enumerate() {
            self.schema
                .conform(&table)
                .map_err(|source| MergeError::Schema { input, source })?;
            for (row, mut record) in table.records.into_iter().enumerate() {
                self.schema.normalize(&mut record);
                rows.push(Tagged { input, row, record });
            }
        }
        stats.input_rows = rows.len();

        rows.sort_by(|a, b| {
            a.record
                .entity_id
                .cmp(&b.record.entity_id)
                .then_with(|| a.record.period_key.cmp(&b.record.period_key))
                .then_with(|| a.record.revision.cmp(&b.record.revision))
                .then_with(|| a.input.cmp(&b.input))
                .then_with(|| a.row.cmp(&b.row))
        });

        let mut merged: Vec<Record> = Vec::with_capacity(rows.len());
        for Tagged { record, .. } in rows {
            let same_key = merged.last().is_some_and(|last| {
                last.entity_id == record.entity_id && last.period_key == record.period_key
            });
            if same_key {
                let last = merged.len() - 1;
                merged[last] = record;
            } else {
                merged.push(record);
            }
        }

        stats.output_rows = merged.len();
        stats.superseded = stats.input_rows - stats.output_rows;
        debug!(
            inputs = stats.inputs,
            input_rows = stats.input_rows,
            output_rows = stats.output_rows,
            superseded = stats.superseded,
            "merged tables"
        );

        Ok((Table::with_records(self.schema.clone(), merged), stats))
    }
}
