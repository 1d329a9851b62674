//! Rule-based quality checks over a merged table.
//!
//! Each rule is independent and returns its findings as data. Findings are
//! never raised as errors; the only thing that blocks a merge from being
//! committed is a `Critical` finding.

pub mod calendar;
pub mod completeness;
pub mod consistency;
pub mod continuity;
pub mod range;
pub mod uniqueness;

pub use calendar::{CalendarConfig, CalendarRule, TradingCalendar};
pub use completeness::{CompletenessConfig, CompletenessRule};
pub use consistency::{ConsistencyCheck, ConsistencyRule};
pub use continuity::{ContinuityConfig, ContinuityRule};
pub use range::{FieldBounds, OrderedPair, RangeConfig, RangeRule};
pub use uniqueness::UniquenessRule;

use crate::record::{NaturalKey, Table};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How serious a finding is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        })
    }
}

/// Which rule produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Range,
    Consistency,
    Completeness,
    Uniqueness,
    Continuity,
    Calendar,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            RuleKind::Range => "range",
            RuleKind::Consistency => "consistency",
            RuleKind::Completeness => "completeness",
            RuleKind::Uniqueness => "uniqueness",
            RuleKind::Continuity => "continuity",
            RuleKind::Calendar => "calendar",
        })
    }
}

/// One data-quality finding. A report artifact, never authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub rule: RuleKind,
    pub severity: Severity,
    /// The record the finding is about; `None` for table-level findings.
    pub key: Option<NaturalKey>,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn new(rule: RuleKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity,
            key: None,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn for_key(mut self, key: NaturalKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_context(mut self, name: &str, value: impl ToString) -> Self {
        self.context.insert(name.to_string(), value.to_string());
        self
    }
}

/// A single independently testable check.
pub trait ValidationRule: Send + Sync {
    fn kind(&self) -> RuleKind;

    fn check(&self, table: &Table) -> Vec<ValidationError>;
}

/// Thresholds for every rule, as read from the job configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub range: RangeConfig,
    pub consistency: Vec<ConsistencyCheck>,
    pub completeness: CompletenessConfig,
    pub continuity: Option<ContinuityConfig>,
    pub calendar: CalendarConfig,
}

/// Findings for one table, sorted most severe first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub rows_checked: usize,
    pub findings: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn has_critical(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Critical)
    }

    /// A candidate dataset may be committed only without critical findings.
    pub fn is_acceptable(&self) -> bool {
        !self.has_critical()
    }

    pub fn by_rule(&self, rule: RuleKind) -> Vec<&ValidationError> {
        self.findings.iter().filter(|f| f.rule == rule).collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows checked: {} critical, {} errors, {} warnings",
            self.rows_checked,
            self.count(Severity::Critical),
            self.count(Severity::Error),
            self.count(Severity::Warning)
        )
    }
}

/// Runs a set of rules over a table.
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    /// A validator with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// All six rules, configured from `config`. Uniqueness is always on.
    pub fn from_config(config: &ValidationConfig) -> Self {
        let mut validator = Self::empty()
            .with_rule(RangeRule::new(config.range.clone()))
            .with_rule(ConsistencyRule::new(config.consistency.clone()))
            .with_rule(CompletenessRule::new(config.completeness.clone()))
            .with_rule(UniquenessRule)
            .with_rule(CalendarRule::new(config.calendar.clone()));
        if let Some(continuity) = &config.continuity {
            validator = validator.with_rule(ContinuityRule::new(continuity.clone()));
        }
        validator
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rule_kinds(&self) -> Vec<RuleKind> {
        self.rules.iter().map(|r| r.kind()).collect()
    }

    /// Run every rule (in parallel) and collect a deterministic report.
    pub fn validate(&self, table: &Table) -> ValidationReport {
        let mut findings: Vec<ValidationError> = self
            .rules
            .par_iter()
            .flat_map_iter(|rule| rule.check(table))
            .collect();

        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.rule.cmp(&b.rule))
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.message.cmp(&b.message))
        });

        ValidationReport {
            rows_checked: table.len(),
            findings,
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::from_config(&ValidationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldKind, FieldSpec, FieldValue, Record, RecordSchema};
    use chrono::{TimeZone, Utc};

    fn bars(rows: &[(&str, &str, f64, f64)]) -> Table {
        let schema = RecordSchema::new(vec![
            FieldSpec::new("high", FieldKind::Float),
            FieldSpec::new("low", FieldKind::Float),
        ])
        .unwrap();
        let rev = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let records = rows
            .iter()
            .map(|(e, p, high, low)| {
                Record::new(*e, *p, rev)
                    .with("high", FieldValue::Float(*high))
                    .with("low", FieldValue::Float(*low))
            })
            .collect();
        Table::with_records(schema, records)
    }

    fn high_low_config() -> ValidationConfig {
        ValidationConfig {
            range: RangeConfig {
                bounds: Vec::new(),
                pairs: vec![OrderedPair {
                    upper: "high".into(),
                    lower: "low".into(),
                }],
            },
            ..ValidationConfig::default()
        }
    }

    #[test]
    fn inverted_high_low_is_critical_and_blocks() {
        let validator = Validator::from_config(&high_low_config());
        let report = validator.validate(&bars(&[("A", "20240102", 5.0, 8.0)]));

        assert_eq!(report.count(Severity::Critical), 1);
        assert!(!report.is_acceptable());
        assert_eq!(report.findings[0].rule, RuleKind::Range);
    }

    #[test]
    fn clean_table_is_acceptable() {
        let validator = Validator::from_config(&high_low_config());
        let report = validator.validate(&bars(&[
            ("A", "20240102", 8.0, 5.0),
            ("A", "20240103", 9.0, 6.0),
        ]));
        assert!(report.findings.is_empty(), "{:?}", report.findings);
        assert!(report.is_acceptable());
    }

    #[test]
    fn warnings_and_errors_do_not_block() {
        let validator = Validator::from_config(&high_low_config());
        // duplicate key → error; unparseable date → error
        let report = validator.validate(&bars(&[
            ("A", "20240102", 8.0, 5.0),
            ("A", "20240102", 8.0, 5.0),
            ("A", "not-a-date", 8.0, 5.0),
        ]));
        assert!(report.count(Severity::Error) >= 2);
        assert!(report.is_acceptable());
    }

    #[test]
    fn findings_are_sorted_most_severe_first() {
        let validator = Validator::from_config(&high_low_config());
        let report = validator.validate(&bars(&[
            ("A", "bad", 8.0, 5.0),
            ("B", "20240102", 1.0, 2.0),
        ]));
        let severities: Vec<Severity> = report.findings.iter().map(|f| f.severity).collect();
        let mut sorted = severities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(severities, sorted);
        assert_eq!(severities[0], Severity::Critical);
    }

    #[test]
    fn default_validator_runs_all_rules_but_continuity() {
        let kinds = Validator::default().rule_kinds();
        assert_eq!(
            kinds,
            vec![
                RuleKind::Range,
                RuleKind::Consistency,
                RuleKind::Completeness,
                RuleKind::Uniqueness,
                RuleKind::Calendar
            ]
        );
    }
}
