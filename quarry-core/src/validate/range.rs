//! Range rule: per-field bounds and ordered field pairs.

use super::{RuleKind, Severity, ValidationError, ValidationRule};
use crate::record::Table;
use serde::{Deserialize, Serialize};

/// Inclusive bounds for one numeric field. Either side may be open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBounds {
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Two fields where `upper` must never be below `lower` (e.g. high/low).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedPair {
    pub upper: String,
    pub lower: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    pub bounds: Vec<FieldBounds>,
    pub pairs: Vec<OrderedPair>,
}

/// Out-of-bounds values are warnings; an inverted pair is critical.
pub struct RangeRule {
    config: RangeConfig,
}

impl RangeRule {
    pub fn new(config: RangeConfig) -> Self {
        Self { config }
    }
}

impl ValidationRule for RangeRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Range
    }

    fn check(&self, table: &Table) -> Vec<ValidationError> {
        let mut findings = Vec::new();

        for record in &table.records {
            for bounds in &self.config.bounds {
                let Some(value) = record.number(&bounds.field) else {
                    continue;
                };
                let below = bounds.min.is_some_and(|min| value < min);
                let above = bounds.max.is_some_and(|max| value > max);
                if below || above || !value.is_finite() {
                    findings.push(
                        ValidationError::new(
                            RuleKind::Range,
                            Severity::Warning,
                            format!("{} = {value} outside configured range", bounds.field),
                        )
                        .for_key(record.key())
                        .with_context("field", &bounds.field)
                        .with_context("value", value)
                        .with_context("min", fmt_bound(bounds.min))
                        .with_context("max", fmt_bound(bounds.max)),
                    );
                }
            }

            for pair in &self.config.pairs {
                let (Some(upper), Some(lower)) =
                    (record.number(&pair.upper), record.number(&pair.lower))
                else {
                    continue;
                };
                if upper < lower {
                    findings.push(
                        ValidationError::new(
                            RuleKind::Range,
                            Severity::Critical,
                            format!("{} ({upper}) is below {} ({lower})", pair.upper, pair.lower),
                        )
                        .for_key(record.key())
                        .with_context(&pair.upper, upper)
                        .with_context(&pair.lower, lower),
                    );
                }
            }
        }

        findings
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}
