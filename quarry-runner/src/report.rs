//! Validation report export: JSON and CSV artifacts.
//!
//! Reports are written next to the dataset under `reports/`, one pair of
//! files per finalize attempt, whether or not the merge was committed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quarry_core::ValidationReport;

// ─── JSON export ────────────────────────────────────────────────────

/// Serialize a report to pretty JSON.
pub fn export_report_json(report: &ValidationReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to serialize ValidationReport to JSON")
}

/// Read a report previously written by [`save_report`].
pub fn import_report_json(json: &str) -> Result<ValidationReport> {
    serde_json::from_str(json).context("failed to deserialize ValidationReport from JSON")
}

// ─── CSV export ─────────────────────────────────────────────────────

/// One row per finding.
///
/// Columns: severity, rule, entity_id, period_key, message, context.
/// Context entries are joined as `name=value` pairs separated by `;`.
pub fn export_report_csv(report: &ValidationReport) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["severity", "rule", "entity_id", "period_key", "message", "context"])?;

    for f in &report.findings {
        let (entity, period) = f
            .key
            .as_ref()
            .map(|k| (k.entity_id.as_str(), k.period_key.as_str()))
            .unwrap_or(("", ""));
        let context = f
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        wtr.write_record([
            &f.severity.to_string(),
            &f.rule.to_string(),
            entity,
            period,
            &f.message,
            &context,
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact pair ──────────────────────────────────────────────────

/// Write `validation_{timestamp}.json` and `.csv` under `dir`.
///
/// Returns the path of the JSON file.
pub fn save_report(report: &ValidationReport, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report dir: {}", dir.display()))?;

    let stem = format!(
        "validation_{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ")
    );
    let json_path = dir.join(format!("{stem}.json"));
    std::fs::write(&json_path, export_report_json(report)?)
        .with_context(|| format!("failed to write {}", json_path.display()))?;

    let csv_path = dir.join(format!("{stem}.csv"));
    std::fs::write(&csv_path, export_report_csv(report)?)
        .with_context(|| format!("failed to write {}", csv_path.display()))?;

    Ok(json_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::validate::RuleKind;
    use quarry_core::{NaturalKey, Severity, ValidationError};

    fn sample() -> ValidationReport {
        ValidationReport {
            rows_checked: 10,
            findings: vec![
                ValidationError::new(RuleKind::Range, Severity::Critical, "high < low")
                    .for_key(NaturalKey::new("A", "20240102"))
                    .with_context("high", 5.0)
                    .with_context("low", 8.0),
                ValidationError::new(RuleKind::Completeness, Severity::Warning, "thin period, \"20240103\"")
                    .with_context("coverage", 0.5),
            ],
        }
    }

    #[test]
    fn csv_has_one_row_per_finding() {
        let csv = export_report_csv(&sample()).unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "critical");
        assert_eq!(&rows[0][1], "range");
        assert_eq!(&rows[0][2], "A");
        assert_eq!(&rows[0][5], "high=5;low=8");
        // Table-level finding: empty key columns, quoting survives.
        assert_eq!(&rows[1][2], "");
        assert_eq!(&rows[1][4], "thin period, \"20240103\"");
    }

    #[test]
    fn json_reads_back() {
        let report = sample();
        let json = export_report_json(&report).unwrap();
        assert_eq!(import_report_json(&json).unwrap(), report);
    }

    #[test]
    fn save_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = save_report(&sample(), &dir.path().join("reports")).unwrap();

        assert!(json_path.exists());
        assert!(json_path.with_extension("csv").exists());
    }
}
