//! Uniqueness rule: each natural key appears at most once.

use super::{RuleKind, Severity, ValidationError, ValidationRule};
use crate::record::{NaturalKey, Table};
use std::collections::BTreeMap;

/// Reports every natural key that occurs more than once, as an error.
/// A merged table never trips this; it guards tables produced elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniquenessRule;

impl ValidationRule for UniquenessRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Uniqueness
    }

    fn check(&self, table: &Table) -> Vec<ValidationError> {
        let mut counts: BTreeMap<NaturalKey, usize> = BTreeMap::new();
        for key in table.keys() {
            *counts.entry(key).or_insert(0) += 1;
        }

        counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(key, n)| {
                ValidationError::new(
                    RuleKind::Uniqueness,
                    Severity::Error,
                    format!("{key} appears {n} times"),
                )
                .for_key(key)
                .with_context("occurrences", n)
            })
            .collect()
    }
}
