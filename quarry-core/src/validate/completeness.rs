//! Completeness rule: entity coverage per period and null ratios.

use super::{RuleKind, Severity, ValidationError, ValidationRule};
use crate::record::Table;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletenessConfig {
    /// Minimum share of the table's entities that must appear in every period.
    pub min_entity_coverage: Option<f64>,
    /// Maximum share of null cells across all declared fields.
    pub max_missing_ratio: Option<f64>,
    /// Maximum null share for individual fields.
    pub field_missing_ratio: BTreeMap<String, f64>,
}

pub struct CompletenessRule {
    config: CompletenessConfig,
}

impl CompletenessRule {
    pub fn new(config: CompletenessConfig) -> Self {
        Self { config }
    }

    fn coverage(&self, table: &Table, floor: f64, findings: &mut Vec<ValidationError>) {
        let total = table.entity_ids().len();
        if total == 0 {
            return;
        }

        let mut per_period: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for record in &table.records {
            per_period
                .entry(record.period_key.as_str())
                .or_default()
                .insert(record.entity_id.as_str());
        }

        for (period, entities) in per_period {
            let coverage = entities.len() as f64 / total as f64;
            if coverage < floor {
                findings.push(
                    ValidationError::new(
                        RuleKind::Completeness,
                        Severity::Warning,
                        format!(
                            "period {period} covers {} of {total} entities",
                            entities.len()
                        ),
                    )
                    .with_context("period", period)
                    .with_context("coverage", format!("{coverage:.4}"))
                    .with_context("min_entity_coverage", floor),
                );
            }
        }
    }

    fn missing(&self, table: &Table, findings: &mut Vec<ValidationError>) {
        let rows = table.len();
        if rows == 0 || table.schema.fields.is_empty() {
            return;
        }

        let mut nulls: BTreeMap<&str, usize> = BTreeMap::new();
        for name in table.schema.field_names() {
            let count = table
                .records
                .iter()
                .filter(|r| r.get(name).is_none())
                .count();
            nulls.insert(name, count);
        }

        if let Some(ceiling) = self.config.max_missing_ratio {
            let cells = rows * table.schema.fields.len();
            let ratio = nulls.values().sum::<usize>() as f64 / cells as f64;
            if ratio > ceiling {
                findings.push(
                    ValidationError::new(
                        RuleKind::Completeness,
                        Severity::Warning,
                        format!("{:.2}% of cells are null", ratio * 100.0),
                    )
                    .with_context("missing_ratio", format!("{ratio:.4}"))
                    .with_context("max_missing_ratio", ceiling),
                );
            }
        }

        for (field, ceiling) in &self.config.field_missing_ratio {
            let Some(count) = nulls.get(field.as_str()) else {
                continue;
            };
            let ratio = *count as f64 / rows as f64;
            if ratio > *ceiling {
                findings.push(
                    ValidationError::new(
                        RuleKind::Completeness,
                        Severity::Warning,
                        format!("{field} is null in {count} of {rows} rows"),
                    )
                    .with_context("field", field)
                    .with_context("missing_ratio", format!("{ratio:.4}"))
                    .with_context("max_missing_ratio", ceiling),
                );
            }
        }
    }
}

impl ValidationRule for CompletenessRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Completeness
    }

    fn check(&self, table: &Table) -> Vec<ValidationError> {
        let mut findings = Vec::new();
        if let Some(floor) = self.config.min_entity_coverage {
            self.coverage(table, floor, &mut findings);
        }
        self.missing(table, &mut findings);
        findings
    }
}
