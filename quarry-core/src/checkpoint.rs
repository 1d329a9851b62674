//! Checkpoint store: the durable record of which work units are done.
//!
//! The checkpoint is a small JSON document written with write-new-then-rename,
//! so a crash mid-save leaves either the new state or the previous one on disk.
//! A leftover `.tmp` file from a torn save is simply ignored: it is equivalent
//! to the last checkpoint not having been taken, and the scheduler refetches
//! those units (idempotent, newer revisions win the merge).
//!
//! One process owns a checkpoint path at a time. The store does no locking;
//! running two acquisition jobs against the same path is unsupported.

use crate::error::PersistenceError;
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Progress of one job phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Entities whose fetch succeeded and whose rows are durably flushed.
    pub completed_units: BTreeSet<String>,
    /// Index of the first entity (in job order) that is not yet complete.
    pub cursor_index: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub job_complete: bool,
    /// Consecutive runs in which an entity exhausted its fetch attempts.
    #[serde(default)]
    pub failure_counts: BTreeMap<String, u32>,
    /// Entities flushed with each partition file still awaiting merge, by
    /// file name. Lets an unreadable partition send its entities back to
    /// the fetch queue.
    #[serde(default)]
    pub partition_units: BTreeMap<String, BTreeSet<String>>,
}

impl CheckpointState {
    pub fn is_complete(&self, entity_id: &str) -> bool {
        self.completed_units.contains(entity_id)
    }

    /// Move the cursor to the first entity of `entities` not yet complete.
    /// Entities that failed earlier in the list keep the cursor behind them,
    /// so a resumed run still retries them.
    pub fn advance_cursor(&mut self, entities: &[String]) {
        self.cursor_index = entities
            .iter()
            .position(|e| !self.completed_units.contains(e))
            .unwrap_or(entities.len());
    }

    /// True when every entity in `entities` is complete.
    pub fn covers(&self, entities: &[String]) -> bool {
        entities.iter().all(|e| self.completed_units.contains(e))
    }

    pub fn record_partition<'a, I>(&mut self, file_name: &str, entity_ids: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.partition_units
            .entry(file_name.to_string())
            .or_default()
            .extend(entity_ids.into_iter().cloned());
    }

    /// Mark the entities of a lost partition file as not done and return them.
    ///
    /// The caller still has to move the cursor with [`advance_cursor`](Self::advance_cursor).
    pub fn reopen_partition(&mut self, file_name: &str) -> Vec<String> {
        let Some(units) = self.partition_units.remove(file_name) else {
            return Vec::new();
        };
        for id in &units {
            self.completed_units.remove(id);
        }
        self.job_complete = false;
        units.into_iter().collect()
    }

    /// Drop bookkeeping for partition files merged into the final dataset.
    /// Returns true if anything was removed.
    pub fn forget_partitions<'a, I>(&mut self, file_names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let before = self.partition_units.len();
        for name in file_names {
            self.partition_units.remove(name);
        }
        self.partition_units.len() != before
    }
}

/// File-backed checkpoint store for one job phase.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the persisted state, or the default state if none was ever saved.
    pub fn load(&self) -> Result<CheckpointState, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CheckpointState::default()),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };
        serde_json::from_str(&content).map_err(|e| PersistenceError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the persisted state.
    pub fn save(&self, state: &CheckpointState) -> Result<(), PersistenceError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| PersistenceError::Serialization(format!("checkpoint: {e}")))?;
        write_atomic(&self.path, &json)
    }

    /// Merge `entity_ids` into the persisted completed set and return the new state.
    pub fn mark_complete<'a, I>(&self, entity_ids: I) -> Result<CheckpointState, PersistenceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.load()?;
        for id in entity_ids {
            state.failure_counts.remove(id);
            state.completed_units.insert(id.to_string());
        }
        state.last_update = Some(Utc::now());
        self.save(&state)?;
        Ok(state)
    }

    /// Remove the checkpoint. Only used once a job is merged and finalized.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }
}
