//! Job configuration, loaded from TOML.
//!
//! ```toml
//! [job]
//! name = "daily"
//! data_dir = "data/daily"
//!
//! [entities]
//! list = ["600000.SH"]
//! file = "entities.txt"
//! universe = "universe.toml"
//! groups = ["csi300"]
//!
//! [[phases]]
//! name = "y2023"
//! start = "2023-01-01"
//! end = "2023-12-31"
//!
//! [fetch]
//! flush_size = 50
//! pacing_ms = 1200
//!
//! [source]
//! kind = "http"
//! url_template = "https://api.example.com/daily?code={entity}&start={start}&end={end}"
//! token_env = "QUARRY_TOKEN"
//!
//! [schema]
//! fields = [{ name = "close", kind = "float" }]
//!
//! [validation.range]
//! pairs = [{ upper = "high", lower = "low" }]
//! ```

use quarry_core::fetch::{
    DateRange, Fetcher, HttpFetcher, HttpSourceConfig, Phase, SyntheticConfig, SyntheticFetcher,
};
use quarry_core::universe::{dedup_preserving_order, load_entity_list, Universe};
use quarry_core::{CheckpointStore, ConfigError, DatasetStore, RecordSchema, ValidationConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSection {
    pub name: String,
    pub data_dir: PathBuf,
}

/// Where the entity list comes from. Sources are concatenated in the order
/// inline list, text file, universe groups, then deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitiesSection {
    pub list: Vec<String>,
    pub file: Option<PathBuf>,
    pub universe: Option<PathBuf>,
    /// Groups to take from `universe`; every group when empty.
    pub groups: Vec<String>,
}

fn default_flush_size() -> usize {
    50
}
fn default_pacing_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30 * 60
}
fn default_warn_after_failed_runs() -> u32 {
    3
}

/// Scheduler tuning: batch size, pacing, retries and the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Entities processed per partition flush.
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    /// Minimum interval between the starts of two fetch calls.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Attempts per entity per run (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    /// Log a warning once an entity has failed in this many runs in a row.
    #[serde(default = "default_warn_after_failed_runs")]
    pub warn_after_failed_runs: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            flush_size: default_flush_size(),
            pacing_ms: default_pacing_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            warn_after_failed_runs: default_warn_after_failed_runs(),
        }
    }
}

impl FetchSettings {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Http(HttpSourceConfig),
    Synthetic(SyntheticConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job: JobSection,
    #[serde(default)]
    pub entities: EntitiesSection,
    /// Single-phase shorthand; mutually exclusive with `phases`.
    #[serde(default)]
    pub range: Option<DateRange>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub fetch: FetchSettings,
    pub source: SourceConfig,
    /// Required for HTTP sources; synthetic sources bring their own.
    #[serde(default)]
    pub schema: Option<RecordSchema>,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl JobConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            what: "job config".into(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.name.trim().is_empty() {
            return Err(ConfigError::invalid("job.name", "must not be empty"));
        }

        let fetch = &self.fetch;
        if fetch.flush_size == 0 {
            return Err(ConfigError::invalid("fetch.flush_size", "must be at least 1"));
        }
        if fetch.max_attempts == 0 {
            return Err(ConfigError::invalid("fetch.max_attempts", "must be at least 1"));
        }
        if fetch.breaker_threshold == 0 {
            return Err(ConfigError::invalid("fetch.breaker_threshold", "must be at least 1"));
        }

        match (&self.range, self.phases.is_empty()) {
            (Some(_), false) => {
                return Err(ConfigError::invalid(
                    "range",
                    "give either [range] or [[phases]], not both",
                ))
            }
            (None, true) => {
                return Err(ConfigError::invalid("phases", "no [range] or [[phases]] given"))
            }
            _ => {}
        }

        let mut names = BTreeSet::new();
        for phase in self.phases() {
            if phase.range.start > phase.range.end {
                return Err(ConfigError::invalid(
                    format!("phases.{}", phase.name),
                    format!("start {} is after end {}", phase.range.start, phase.range.end),
                ));
            }
            if !is_valid_phase_name(&phase.name) {
                return Err(ConfigError::invalid(
                    "phases.name",
                    format!("'{}' may only use letters, digits, '_' and '-'", phase.name),
                ));
            }
            if !names.insert(phase.name.clone()) {
                return Err(ConfigError::invalid(
                    "phases.name",
                    format!("'{}' is used twice", phase.name),
                ));
            }
        }

        if self.entities.list.is_empty()
            && self.entities.file.is_none()
            && self.entities.universe.is_none()
        {
            return Err(ConfigError::invalid("entities", "no list, file or universe given"));
        }
        if !self.entities.groups.is_empty() && self.entities.universe.is_none() {
            return Err(ConfigError::invalid("entities.groups", "requires entities.universe"));
        }

        if let SourceConfig::Http(http) = &self.source {
            http.validate()?;
        }
        self.record_schema()?;
        Ok(())
    }

    /// The phases to run, in order. `[range]` becomes one phase named after the job.
    pub fn phases(&self) -> Vec<Phase> {
        match &self.range {
            Some(range) => vec![Phase {
                name: self.job.name.clone(),
                range: *range,
            }],
            None => self.phases.clone(),
        }
    }

    /// The deduplicated entity list, in job order.
    pub fn resolve_entities(&self) -> Result<Vec<String>, ConfigError> {
        let mut ids = self.entities.list.clone();
        if let Some(file) = &self.entities.file {
            ids.extend(load_entity_list(file)?);
        }
        if let Some(path) = &self.entities.universe {
            let universe = Universe::from_file(path)?;
            if self.entities.groups.is_empty() {
                ids.extend(universe.all());
            } else {
                ids.extend(universe.select(&self.entities.groups)?);
            }
        }

        let ids: Vec<String> = ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        let ids = dedup_preserving_order(ids);
        if ids.is_empty() {
            return Err(ConfigError::invalid("entities", "the entity list is empty"));
        }
        Ok(ids)
    }

    pub fn record_schema(&self) -> Result<RecordSchema, ConfigError> {
        let schema = match (&self.schema, &self.source) {
            (Some(schema), _) => schema.clone(),
            (None, SourceConfig::Synthetic(_)) => SyntheticFetcher::schema(),
            (None, SourceConfig::Http(_)) => {
                return Err(ConfigError::invalid("schema", "an http source needs a [schema]"))
            }
        };
        schema
            .check_definition()
            .map_err(|e| ConfigError::invalid("schema", e.to_string()))?;
        Ok(schema)
    }

    pub fn build_fetcher(&self) -> Result<Box<dyn Fetcher>, ConfigError> {
        let schema = self.record_schema()?;
        Ok(match &self.source {
            SourceConfig::Http(http) => Box::new(HttpFetcher::new(http.clone(), schema)?),
            SourceConfig::Synthetic(synthetic) => Box::new(SyntheticFetcher::new(synthetic.clone())),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.job.data_dir
    }

    pub fn store(&self) -> DatasetStore {
        DatasetStore::new(&self.job.data_dir)
    }

    pub fn checkpoint_store(&self, phase: &str) -> CheckpointStore {
        CheckpointStore::new(
            self.job
                .data_dir
                .join("checkpoints")
                .join(format!("{phase}.json")),
        )
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.job.data_dir.join("reports")
    }
}

fn is_valid_phase_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [job]
        name = "daily"
        data_dir = "data/daily"

        [entities]
        list = ["A", "B", "A"]

        [range]
        start = "2024-01-01"
        end = "2024-01-31"

        [source]
        kind = "synthetic"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = JobConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.fetch, FetchSettings::default());
        assert_eq!(config.resolve_entities().unwrap(), vec!["A", "B"]);

        let phases = config.phases();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].name, "daily");
        assert_eq!(config.record_schema().unwrap(), SyntheticFetcher::schema());
        assert!(config
            .checkpoint_store("daily")
            .path()
            .ends_with("checkpoints/daily.json"));
    }

    #[test]
    fn phases_and_validation_sections_parse() {
        let config = JobConfig::from_toml(
            r#"
            [job]
            name = "fin"
            data_dir = "data/fin"

            [entities]
            list = ["600000.SH"]

            [[phases]]
            name = "y2023"
            start = "2023-01-01"
            end = "2023-12-31"

            [[phases]]
            name = "y2024"
            start = "2024-01-01"
            end = "2024-12-31"

            [fetch]
            flush_size = 10
            pacing_ms = 1200

            [source]
            kind = "http"
            url_template = "https://api.example.invalid/fina?code={entity}&start={start}&end={end}"
            token_env = "QUARRY_TOKEN"
            records_pointer = "/data/items"
            revision_field = "ann_date"

            [schema]
            fields = [
                { name = "roe", kind = "float" },
                { name = "ann_date", kind = "date", nullable = false },
            ]

            [validation.range]
            bounds = [{ field = "roe", min = -100.0, max = 100.0 }]

            [validation.calendar]
            check_period_key = false
            "#,
        )
        .unwrap();

        assert_eq!(config.phases().len(), 2);
        assert_eq!(config.fetch.flush_size, 10);
        assert_eq!(config.fetch.max_attempts, 3);
        assert!(matches!(config.source, SourceConfig::Http(_)));
        assert_eq!(config.record_schema().unwrap().fields.len(), 2);
        assert!(!config.validation.calendar.check_period_key);
        assert_eq!(config.validation.range.bounds[0].max, Some(100.0));
    }

    fn with(extra: &str) -> String {
        format!("{MINIMAL}\n{extra}")
    }

    #[test]
    fn configs_compare_by_value_including_validation() {
        let a = JobConfig::from_toml(MINIMAL).unwrap();
        let b = JobConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(a, b);

        let stricter = JobConfig::from_toml(&with(
            "[validation.completeness]\nmin_entity_coverage = 0.9",
        ))
        .unwrap();
        assert_ne!(a, stricter);
        assert_ne!(a.validation, stricter.validation);
    }

    #[test]
    fn zero_flush_size_is_rejected() {
        let err = JobConfig::from_toml(&with("[fetch]\nflush_size = 0")).unwrap_err();
        assert!(err.to_string().contains("flush_size"));
    }

    #[test]
    fn range_and_phases_together_are_rejected() {
        let err = JobConfig::from_toml(&with(
            "[[phases]]\nname = \"p\"\nstart = \"2024-01-01\"\nend = \"2024-01-02\"",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn http_source_without_schema_is_rejected() {
        let toml = MINIMAL.replace(
            "kind = \"synthetic\"",
            "kind = \"http\"\nurl_template = \"https://x.invalid/{entity}\"",
        );
        let err = JobConfig::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("schema"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let toml = MINIMAL.replace("end = \"2024-01-31\"", "end = \"2023-01-31\"");
        assert!(JobConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn unparseable_toml_is_parse_error() {
        assert!(matches!(
            JobConfig::from_toml("[job\nname="),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn entity_file_and_universe_are_merged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("entities.txt");
        fs::write(&list, "C\n# comment\nA\n").unwrap();
        let universe = dir.path().join("universe.toml");
        fs::write(&universe, "[groups]\nbanks = [\"D\", \"C\"]\ntech = [\"E\"]\n").unwrap();

        let mut config = JobConfig::from_toml(MINIMAL).unwrap();
        config.entities.file = Some(list);
        config.entities.universe = Some(universe);
        config.entities.groups = vec!["banks".into()];

        assert_eq!(config.resolve_entities().unwrap(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn missing_entity_file_is_unreadable() {
        let mut config = JobConfig::from_toml(MINIMAL).unwrap();
        config.entities.file = Some(PathBuf::from("/nonexistent/quarry/entities.txt"));
        assert!(matches!(
            config.resolve_entities(),
            Err(ConfigError::Unreadable { .. })
        ));
    }
}
