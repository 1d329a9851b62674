//! Entity universe: named groups of entity ids, and plain-text entity lists.
//!
//! A universe is a TOML file mapping group names (an index, a board, an
//! industry) to member ids. A job selects one or more groups; the resulting
//! list is deduplicated in first-seen order, since the scheduler's cursor is an
//! index into it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Universe {
    pub groups: BTreeMap<String, Vec<String>>,
}

impl Universe {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            what: "universe TOML".into(),
            reason: e.to_string(),
        })
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Members of `names`, in the order given, deduplicated.
    pub fn select(&self, names: &[String]) -> Result<Vec<String>, ConfigError> {
        let mut selected = Vec::new();
        for name in names {
            let members = self.groups.get(name).ok_or_else(|| {
                ConfigError::invalid(
                    "entities.groups",
                    format!("unknown group '{name}' (known: {})", self.group_names().join(", ")),
                )
            })?;
            selected.extend(members.iter().cloned());
        }
        Ok(dedup_preserving_order(selected))
    }

    /// Every member of every group, groups in name order.
    pub fn all(&self) -> Vec<String> {
        dedup_preserving_order(self.groups.values().flatten().cloned().collect())
    }
}

/// Parse a text entity list: one id per line, blank lines and `#` comments ignored.
pub fn parse_entity_list(content: &str) -> Vec<String> {
    let ids = content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    dedup_preserving_order(ids)
}

pub fn load_entity_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(parse_entity_list(&content))
}

pub fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIVERSE: &str = r#"
        [groups]
        csi300 = ["600000.SH", "000001.SZ", "600519.SH"]
        banks = ["600000.SH", "601398.SH"]
    "#;

    #[test]
    fn select_keeps_first_seen_order() {
        let u = Universe::from_toml(UNIVERSE).unwrap();
        let ids = u.select(&["banks".into(), "csi300".into()]).unwrap();
        assert_eq!(ids, vec!["600000.SH", "601398.SH", "000001.SZ", "600519.SH"]);
    }

    #[test]
    fn unknown_group_is_config_error() {
        let u = Universe::from_toml(UNIVERSE).unwrap();
        let err = u.select(&["nope".into()]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn all_flattens_groups() {
        let u = Universe::from_toml(UNIVERSE).unwrap();
        assert_eq!(u.all().len(), 4);
    }

    #[test]
    fn text_list_skips_comments_and_duplicates() {
        let ids = parse_entity_list("# header\nA\n\n B  # inline\nA\nC\n");
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn bad_toml_is_parse_error() {
        assert!(matches!(
            Universe::from_toml("groups = 3"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
