//! Continuity rule: flags implausible jumps in one field between an entity's
//! consecutive periods.
//!
//! Periods are ordered by `period_key` as text, which is chronological for
//! fixed-width keys such as `%Y%m%d` or `2020Q1`.

use super::{RuleKind, Severity, ValidationError, ValidationRule};
use crate::record::{Record, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityConfig {
    pub field: String,
    /// e.g. `0.5` flags any move of more than 50% between periods.
    pub max_relative_change: f64,
}

pub struct ContinuityRule {
    config: ContinuityConfig,
}

impl ContinuityRule {
    pub fn new(config: ContinuityConfig) -> Self {
        Self { config }
    }
}

impl ValidationRule for ContinuityRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Continuity
    }

    fn check(&self, table: &Table) -> Vec<ValidationError> {
        let field = self.config.field.as_str();

        let mut series: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
        for record in &table.records {
            series.entry(record.entity_id.as_str()).or_default().push(record);
        }

        let mut findings = Vec::new();
        for records in series.values_mut() {
            records.sort_by(|a, b| a.period_key.cmp(&b.period_key));

            // Consecutive non-null observations; nulls do not break the chain.
            let observed: Vec<(&Record, f64)> = records
                .iter()
                .filter_map(|r| r.number(field).map(|v| (*r, v)))
                .collect();

            for pair in observed.windows(2) {
                let (prev, prev_value) = pair[0];
                let (curr, curr_value) = pair[1];
                if prev_value == 0.0 {
                    continue;
                }
                let change = (curr_value - prev_value) / prev_value.abs();
                if change.abs() > self.config.max_relative_change {
                    findings.push(
                        ValidationError::new(
                            RuleKind::Continuity,
                            Severity::Warning,
                            format!(
                                "{field} moved {:+.1}% from {} to {}",
                                change * 100.0,
                                prev.period_key,
                                curr.period_key
                            ),
                        )
                        .for_key(curr.key())
                        .with_context("field", field)
                        .with_context("previous_period", &prev.period_key)
                        .with_context("previous", prev_value)
                        .with_context("current", curr_value),
                    );
                }
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldKind, FieldSpec, FieldValue, RecordSchema};
    use chrono::{TimeZone, Utc};

    fn closes(rows: &[(&str, &str, Option<f64>)]) -> Table {
        let schema = RecordSchema::new(vec![FieldSpec::new("close", FieldKind::Float)]).unwrap();
        let rev = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let records = rows
            .iter()
            .map(|(e, p, v)| {
                let r = Record::new(*e, *p, rev);
                match v {
                    Some(v) => r.with("close", FieldValue::Float(*v)),
                    None => r,
                }
            })
            .collect();
        Table::with_records(schema, records)
    }

    fn rule() -> ContinuityRule {
        ContinuityRule::new(ContinuityConfig {
            field: "close".into(),
            max_relative_change: 0.5,
        })
    }

    #[test]
    fn large_jump_is_flagged_on_later_period() {
        let findings = rule().check(&closes(&[
            ("A", "20240103", Some(25.0)),
            ("A", "20240102", Some(10.0)),
            ("A", "20240104", Some(26.0)),
        ]));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].key.as_ref().unwrap().period_key, "20240103");
        assert_eq!(findings[0].context["previous_period"], "20240102");
    }

    #[test]
    fn entities_are_tracked_separately() {
        let findings = rule().check(&closes(&[
            ("A", "20240102", Some(10.0)),
            ("B", "20240103", Some(100.0)),
            ("A", "20240103", Some(11.0)),
        ]));
        assert!(findings.is_empty());
    }

    #[test]
    fn nulls_are_skipped_over() {
        let findings = rule().check(&closes(&[
            ("A", "20240102", Some(10.0)),
            ("A", "20240103", None),
            ("A", "20240104", Some(30.0)),
        ]));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].key.as_ref().unwrap().period_key, "20240104");
    }
}
