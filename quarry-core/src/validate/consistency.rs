//! Consistency rule: a derived field should match the product of its factors.
//!
//! Typical use is `amount ≈ volume × price × scale`, where `scale` absorbs unit
//! differences (lots vs shares, thousands vs units).

use super::{RuleKind, Severity, ValidationError, ValidationRule};
use crate::record::Table;
use serde::{Deserialize, Serialize};

fn default_scale() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    0.05
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    /// The derived field (e.g. `amount`).
    pub target: String,
    /// Fields whose product the target should equal (e.g. `["vol", "vwap"]`).
    pub factors: Vec<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Maximum relative error before a warning is raised.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

pub struct ConsistencyRule {
    checks: Vec<ConsistencyCheck>,
}

impl ConsistencyRule {
    pub fn new(checks: Vec<ConsistencyCheck>) -> Self {
        Self { checks }
    }
}

impl ValidationRule for ConsistencyRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Consistency
    }

    fn check(&self, table: &Table) -> Vec<ValidationError> {
        let mut findings = Vec::new();

        for record in &table.records {
            for check in &self.checks {
                let Some(actual) = record.number(&check.target) else {
                    continue;
                };
                let factors: Option<Vec<f64>> =
                    check.factors.iter().map(|f| record.number(f)).collect();
                let Some(factors) = factors else {
                    continue;
                };
                let expected = factors.iter().product::<f64>() * check.scale;

                let error = relative_error(actual, expected);
                if error > check.tolerance {
                    findings.push(
                        ValidationError::new(
                            RuleKind::Consistency,
                            Severity::Warning,
                            format!(
                                "{} = {actual} differs from {} = {expected} by {:.2}%",
                                check.target,
                                check.factors.join(" × "),
                                error * 100.0
                            ),
                        )
                        .for_key(record.key())
                        .with_context("field", &check.target)
                        .with_context("actual", actual)
                        .with_context("expected", expected)
                        .with_context("relative_error", error),
                    );
                }
            }
        }

        findings
    }
}

/// `|actual - expected| / |expected|`, with zero expected handled explicitly.
fn relative_error(actual: f64, expected: f64) -> f64 {
    if expected == 0.0 {
        if actual == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (actual - expected).abs() / expected.abs()
    }
}
