//! Fetch scheduler: drives one phase of a job to completion, resumably.
//!
//! Entities are processed strictly in list order, one fetch in flight at a
//! time, every call passing the same [`RateGate`]. Rows are buffered and
//! flushed to a new partition file every `flush_size` processed entities; the
//! checkpoint is saved only after the partition file has landed, so a crash
//! at any point re-does at most one batch.
//!
//! An entity whose fetch fails (after its retries) is left incomplete and is
//! picked up again by the next run. An entity whose fetch succeeds with no
//! rows is complete: "no data in range" is an answer, not a failure.

use crate::config::FetchSettings;
use crate::error::JobError;
use chrono::Utc;
use quarry_core::fetch::{CircuitBreaker, FetchError, Fetcher, Phase, RateGate, WorkUnit};
use quarry_core::progress::{ProgressEvent, ProgressSink, UnitOutcome};
use quarry_core::{CheckpointState, CheckpointStore, DatasetStore, Record, RecordSchema, Table};
use std::mem;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one scheduler pass over a phase did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerOutcome {
    pub phase: String,
    /// Entities fetched with at least one row.
    pub fetched: usize,
    /// Entities that answered with no rows.
    pub empty: usize,
    /// Entities left incomplete after exhausting their attempts.
    pub failed: usize,
    /// Entities already complete before this run.
    pub skipped: usize,
    /// Fetch calls issued, retries included.
    pub fetch_calls: usize,
    pub partitions_written: usize,
    pub rows_written: usize,
    /// The circuit breaker opened and the pass stopped early.
    pub halted: bool,
    /// Every entity of the phase is complete.
    pub job_complete: bool,
}

/// Runs phases against one fetcher and one dataset store.
pub struct FetchScheduler<'a> {
    fetcher: &'a dyn Fetcher,
    store: &'a DatasetStore,
    progress: &'a dyn ProgressSink,
    schema: RecordSchema,
    settings: FetchSettings,
    gate: RateGate,
    breaker: CircuitBreaker,
}

/// Mutable state of one pass, between flushes.
struct Pass<'p> {
    phase: &'p Phase,
    entities: &'p [String],
    checkpoint: &'p CheckpointStore,
    state: CheckpointState,
    buffer: Vec<Record>,
    /// Completed since the last flush, not yet in the persisted state.
    pending: Vec<String>,
    outcome: SchedulerOutcome,
}

impl<'a> FetchScheduler<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        store: &'a DatasetStore,
        progress: &'a dyn ProgressSink,
        schema: RecordSchema,
        settings: FetchSettings,
    ) -> Self {
        let gate = RateGate::new(settings.pacing());
        let breaker =
            CircuitBreaker::with_threshold(settings.breaker_cooldown(), settings.breaker_threshold);
        Self {
            fetcher,
            store,
            progress,
            schema,
            settings,
            gate,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run one pass over `entities` for `phase`, resuming from `checkpoint`.
    pub fn run_phase(
        &self,
        phase: &Phase,
        entities: &[String],
        checkpoint: &CheckpointStore,
    ) -> Result<SchedulerOutcome, JobError> {
        self.fetcher.preflight()?;

        let state = checkpoint.load()?;
        if state.job_complete && state.covers(entities) {
            info!(phase = %phase.name, "phase already complete, nothing to fetch");
            let outcome = SchedulerOutcome {
                phase: phase.name.clone(),
                skipped: entities.len(),
                job_complete: true,
                ..SchedulerOutcome::default()
            };
            self.emit_done(&outcome);
            return Ok(outcome);
        }

        let mut pass = Pass {
            phase,
            entities,
            checkpoint,
            state,
            buffer: Vec::new(),
            pending: Vec::new(),
            outcome: SchedulerOutcome {
                phase: phase.name.clone(),
                ..SchedulerOutcome::default()
            },
        };

        // Entities added to the list since the last run may sit before the
        // stored cursor; the low-water mark covers them.
        let resume = pass.state.cursor_index.min(first_incomplete(&pass.state, entities));
        if resume > 0 {
            info!(phase = %phase.name, resume, total = entities.len(), "resuming");
        }
        pass.outcome.skipped = resume;

        let mut processed_since_flush = 0;
        for (index, entity_id) in entities.iter().enumerate().skip(resume) {
            if pass.state.is_complete(entity_id) {
                pass.outcome.skipped += 1;
                continue;
            }
            if !self.breaker.is_allowed() || !self.fetcher.is_available() {
                warn!(
                    phase = %phase.name,
                    remaining_cooldown_secs = self.breaker.remaining_cooldown().as_secs(),
                    "source unavailable, stopping this pass"
                );
                pass.outcome.halted = true;
                break;
            }

            self.progress.on_event(&ProgressEvent::UnitStarted {
                phase: phase.name.clone(),
                entity_id: entity_id.clone(),
                index,
                total: entities.len(),
            });

            let unit = WorkUnit::new(entity_id.as_str(), phase.range);
            let (result, attempts) = self.fetch_with_retry(&unit, &mut pass.outcome);
            let result = result.and_then(|table| self.check_schema(table));

            let outcome = match result {
                Ok(table) if table.is_empty() => {
                    pass.outcome.empty += 1;
                    pass.pending.push(entity_id.clone());
                    processed_since_flush += 1;
                    UnitOutcome::Empty
                }
                Ok(table) => {
                    let rows = table.len();
                    pass.outcome.fetched += 1;
                    pass.buffer.extend(table.records);
                    pass.pending.push(entity_id.clone());
                    processed_since_flush += 1;
                    UnitOutcome::Fetched { rows }
                }
                Err(error) => {
                    pass.outcome.failed += 1;
                    self.note_failure(&mut pass.state, &phase.name, entity_id);
                    UnitOutcome::Failed {
                        error: error.to_string(),
                        attempts,
                    }
                }
            };
            self.progress.on_event(&ProgressEvent::UnitDone {
                phase: phase.name.clone(),
                entity_id: entity_id.clone(),
                outcome,
            });

            if processed_since_flush >= self.settings.flush_size {
                self.flush(&mut pass)?;
                processed_since_flush = 0;
            }
        }

        // Final flush regardless of batch size; also persists failure counts.
        self.flush(&mut pass)?;

        let outcome = pass.outcome;
        self.emit_done(&outcome);
        Ok(outcome)
    }

    /// Issue `unit` through the gate, retrying transient failures with
    /// exponential backoff. Returns the last result and the attempts used.
    fn fetch_with_retry(
        &self,
        unit: &WorkUnit,
        outcome: &mut SchedulerOutcome,
    ) -> (Result<Table, FetchError>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.gate.acquire();
            outcome.fetch_calls += 1;

            let error = match self.fetcher.fetch(unit) {
                Ok(table) => {
                    self.breaker.record_success();
                    return (Ok(table), attempt);
                }
                Err(error) => error,
            };

            if error.trips_breaker() {
                warn!(unit = %unit, %error, "source blocked us, opening circuit breaker");
                self.breaker.trip();
                return (Err(error), attempt);
            }

            let transient = matches!(
                error,
                FetchError::Network(_) | FetchError::RateLimited { .. }
            );
            if transient {
                self.breaker.record_failure();
            }
            if !transient || attempt >= self.settings.max_attempts || !self.breaker.is_allowed() {
                return (Err(error), attempt);
            }

            let delay = self.backoff_for(attempt, &error);
            debug!(unit = %unit, attempt, %error, delay_ms = delay.as_millis() as u64, "retrying");
            self.gate.hold_for(delay);
        }
    }

    fn backoff_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let exp = self
            .settings
            .backoff()
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let requested = error
            .retry_after_secs()
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        exp.max(requested).min(self.settings.max_backoff())
    }

    /// A table that does not follow the dataset schema is a format failure of
    /// this unit, never a reason to stop the job.
    fn check_schema(&self, table: Table) -> Result<Table, FetchError> {
        self.schema
            .conform(&table)
            .map_err(|e| FetchError::ResponseFormat(e.to_string()))?;
        Ok(table)
    }

    fn note_failure(&self, state: &mut CheckpointState, phase: &str, entity_id: &str) {
        let count = state.failure_counts.entry(entity_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.settings.warn_after_failed_runs {
            warn!(
                %phase,
                %entity_id,
                failed_runs = *count,
                "entity keeps failing; check the source for this id"
            );
        }
    }

    /// Write buffered rows as a partition, then persist the checkpoint.
    fn flush(&self, pass: &mut Pass<'_>) -> Result<(), JobError> {
        let rows = pass.buffer.len();
        if rows > 0 {
            let table = Table::with_records(self.schema.clone(), mem::take(&mut pass.buffer));
            let path = self.store.write_partition(&pass.phase.name, &table)?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                pass.state.record_partition(name, &pass.pending);
            }
            pass.outcome.partitions_written += 1;
            pass.outcome.rows_written += rows;
        }

        let units = pass.pending.len();
        for id in pass.pending.drain(..) {
            pass.state.failure_counts.remove(&id);
            pass.state.completed_units.insert(id);
        }
        pass.state.advance_cursor(pass.entities);
        pass.state.job_complete = pass.state.covers(pass.entities);
        pass.state.last_update = Some(Utc::now());
        pass.checkpoint.save(&pass.state)?;
        pass.outcome.job_complete = pass.state.job_complete;

        self.progress.on_event(&ProgressEvent::Flush {
            phase: pass.phase.name.clone(),
            rows,
            units,
            cursor_index: pass.state.cursor_index,
        });
        Ok(())
    }

    fn emit_done(&self, outcome: &SchedulerOutcome) {
        self.progress.on_event(&ProgressEvent::JobDone {
            phase: outcome.phase.clone(),
            fetched: outcome.fetched,
            empty: outcome.empty,
            failed: outcome.failed,
            halted: outcome.halted,
        });
    }
}

fn first_incomplete(state: &CheckpointState, entities: &[String]) -> usize {
    entities
        .iter()
        .position(|e| !state.is_complete(e))
        .unwrap_or(entities.len())
}
