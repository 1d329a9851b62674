//! Progress events emitted by the scheduler and the finalize step.
//!
//! Sinks are observers only; nothing they do feeds back into a job.

use crate::validate::ValidationReport;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// How one unit ended in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum UnitOutcome {
    Fetched { rows: usize },
    Empty,
    Failed { error: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    UnitStarted {
        phase: String,
        entity_id: String,
        index: usize,
        total: usize,
    },
    UnitDone {
        phase: String,
        entity_id: String,
        outcome: UnitOutcome,
    },
    Flush {
        phase: String,
        rows: usize,
        units: usize,
        cursor_index: usize,
    },
    JobDone {
        phase: String,
        fetched: usize,
        empty: usize,
        failed: usize,
        halted: bool,
    },
    ValidationReport {
        report: ValidationReport,
        committed: bool,
    },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::UnitStarted {
                phase,
                entity_id,
                index,
                total,
            } => info!(%phase, %entity_id, "[{}/{}] fetching", index + 1, total),
            ProgressEvent::UnitDone {
                phase,
                entity_id,
                outcome,
            } => match outcome {
                UnitOutcome::Fetched { rows } => info!(%phase, %entity_id, rows, "fetched"),
                UnitOutcome::Empty => info!(%phase, %entity_id, "no rows in range"),
                UnitOutcome::Failed { error, attempts } => {
                    warn!(%phase, %entity_id, attempts, %error, "fetch failed")
                }
            },
            ProgressEvent::Flush {
                phase,
                rows,
                units,
                cursor_index,
            } => info!(%phase, rows, units, cursor_index, "flushed partition"),
            ProgressEvent::JobDone {
                phase,
                fetched,
                empty,
                failed,
                halted,
            } => {
                if *halted {
                    warn!(%phase, fetched, empty, failed, "phase halted by circuit breaker");
                } else {
                    info!(%phase, fetched, empty, failed, "phase pass complete");
                }
            }
            ProgressEvent::ValidationReport { report, committed } => {
                if *committed {
                    info!(committed, "{}", report.summary());
                } else {
                    warn!(committed, "{}", report.summary());
                }
            }
        }
    }
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Keeps every event in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entity ids that reached `UnitStarted`, in order.
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::UnitStarted { entity_id, .. } => Some(entity_id),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
