#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use quarry_core::fetch::{FetchError, Fetcher, WorkUnit};
use quarry_core::{FieldKind, FieldSpec, FieldValue, Record, RecordSchema, Table};
use quarry_runner::{Job, JobConfig};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

pub fn bar_schema() -> RecordSchema {
    RecordSchema::new(vec![
        FieldSpec::new("high", FieldKind::Float),
        FieldSpec::new("low", FieldKind::Float),
    ])
    .unwrap()
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

pub fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// An in-memory source. Every entity answers with two bars at a fixed
/// revision; overrides, panics and failures can be scripted per entity.
pub struct ScriptedSource {
    revision: DateTime<Utc>,
    overrides: HashMap<String, Vec<(String, f64, f64)>>,
    panic_on: Mutex<HashSet<String>>,
    fail_on: HashMap<String, FetchError>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(revision: DateTime<Utc>) -> Self {
        Self {
            revision,
            overrides: HashMap::new(),
            panic_on: Mutex::new(HashSet::new()),
            fail_on: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the default bars of `entity` with `(period, high, low)` rows.
    pub fn with_bars(mut self, entity: &str, bars: &[(&str, f64, f64)]) -> Self {
        let rows = bars.iter().map(|(p, h, l)| (p.to_string(), *h, *l)).collect();
        self.overrides.insert(entity.to_string(), rows);
        self
    }

    /// Panic the first time `entity` is fetched, like a process dying mid-run.
    pub fn panic_once_on(self, entity: &str) -> Self {
        self.panic_on.lock().unwrap().insert(entity.to_string());
        self
    }

    pub fn failing(mut self, entity: &str, error: FetchError) -> Self {
        self.fail_on.insert(entity.to_string(), error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, unit: &WorkUnit) -> Result<Table, FetchError> {
        let entity = unit.entity_id.as_str();
        self.calls.lock().unwrap().push(entity.to_string());

        if self.panic_on.lock().unwrap().remove(entity) {
            panic!("simulated crash while fetching {entity}");
        }
        if let Some(error) = self.fail_on.get(entity) {
            return Err(error.clone());
        }

        let default = vec![
            ("20240102".to_string(), 10.0, 9.0),
            ("20240103".to_string(), 11.0, 10.0),
        ];
        let rows = self.overrides.get(entity).unwrap_or(&default);
        let records = rows
            .iter()
            .map(|(period, high, low)| {
                Record::new(entity, period.as_str(), self.revision)
                    .with("high", FieldValue::Float(*high))
                    .with("low", FieldValue::Float(*low))
            })
            .collect();
        Ok(Table::with_records(bar_schema(), records))
    }
}

/// A single-range job over `entities` with high/low bars and an ordered-pair
/// rule, storing everything under `dir`.
pub fn bar_job(dir: &Path, entities: &[&str], flush_size: usize) -> Job {
    let list = entities
        .iter()
        .map(|e| format!("\"{e}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        r#"
[job]
name = "bars"
data_dir = "{dir}"

[entities]
list = [{list}]

[range]
start = "2024-01-01"
end = "2024-01-31"

[fetch]
flush_size = {flush_size}
pacing_ms = 0
backoff_ms = 0

[source]
kind = "synthetic"

[schema]
fields = [
  {{ name = "high", kind = "float" }},
  {{ name = "low", kind = "float" }},
]

[validation.range]
pairs = [{{ upper = "high", lower = "low" }}]
"#,
        dir = dir.display().to_string().replace('\\', "/"),
    );
    Job::from_config(JobConfig::from_toml(&toml).unwrap()).unwrap()
}
