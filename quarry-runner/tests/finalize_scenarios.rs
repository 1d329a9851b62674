//! End-to-end finalize: revision supersession, rejected candidates and
//! unreadable partition files.

mod common;

use common::{at, bar_job, ScriptedSource};
use quarry_core::progress::{NullProgress, ProgressEvent, RecordingProgress};
use quarry_core::validate::RuleKind;
use quarry_core::Severity;
use quarry_runner::import_report_json;
use std::fs;

#[test]
fn newer_revision_replaces_and_older_revision_does_not() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1"], 10);

    // First pass: revision at 09:00.
    job.acquire(
        &ScriptedSource::new(at(5, 9)).with_bars("E1", &[("20240102", 10.0, 9.0)]),
        &NullProgress,
    )
    .unwrap();
    let fin = job.finalize(&NullProgress, true).unwrap();
    assert!(fin.outcome.committed && fin.checkpoints_cleared);

    // The source restates the bar with a later announcement.
    job.acquire(
        &ScriptedSource::new(at(5, 15)).with_bars("E1", &[("20240102", 12.0, 9.5)]),
        &NullProgress,
    )
    .unwrap();
    let fin = job.finalize(&NullProgress, true).unwrap();
    assert!(fin.outcome.committed);
    assert_eq!(fin.outcome.stats.superseded, 1);

    let merged = job.store().read_final(job.schema()).unwrap().unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged.records[0].number("high"), Some(12.0));
    assert_eq!(merged.records[0].revision, at(5, 15));

    // A stale copy downloaded later must not win.
    job.acquire(
        &ScriptedSource::new(at(4, 9)).with_bars("E1", &[("20240102", 99.0, 1.0)]),
        &NullProgress,
    )
    .unwrap();
    job.finalize(&NullProgress, false).unwrap();

    let merged = job.store().read_final(job.schema()).unwrap().unwrap();
    assert_eq!(merged.records[0].number("high"), Some(12.0));
    assert_eq!(merged.records[0].revision, at(5, 15));
}

#[test]
fn inverted_high_low_is_rejected_and_final_dataset_is_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1", "E2"], 10);

    job.acquire(&ScriptedSource::new(at(5, 18)), &NullProgress)
        .unwrap();
    let good = job.finalize(&NullProgress, true).unwrap();
    assert!(good.outcome.committed);
    let committed = job.store().read_final(job.schema()).unwrap().unwrap();
    let meta = job.store().final_meta().unwrap();

    let bad = ScriptedSource::new(at(6, 18)).with_bars("E2", &[("20240104", 5.0, 8.0)]);
    job.acquire(&bad, &NullProgress).unwrap();
    let pending = job.store().list_partitions().unwrap();
    assert!(!pending.is_empty());

    let progress = RecordingProgress::new();
    let fin = job.finalize(&progress, true).unwrap();

    assert!(!fin.outcome.committed);
    assert!(!fin.checkpoints_cleared);
    let critical: Vec<_> = fin
        .outcome
        .report
        .findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].rule, RuleKind::Range);
    assert_eq!(critical[0].key.as_ref().unwrap().entity_id, "E2");
    assert_eq!(fin.outcome.report.by_rule(RuleKind::Range), critical);
    assert!(fin.outcome.report.by_rule(RuleKind::Uniqueness).is_empty());

    // Nothing on disk moved.
    assert_eq!(job.store().read_final(job.schema()).unwrap().unwrap(), committed);
    assert_eq!(job.store().final_meta().unwrap(), meta);
    assert_eq!(job.store().list_partitions().unwrap(), pending);
    assert!(progress
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::ValidationReport { committed: false, .. })));

    // The report is on disk for the operator.
    let saved = import_report_json(&std::fs::read_to_string(&fin.report_path).unwrap()).unwrap();
    assert_eq!(saved, fin.outcome.report);
}

#[test]
fn validate_only_reports_without_committing() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1"], 10);
    job.acquire(&ScriptedSource::new(at(5, 18)), &NullProgress)
        .unwrap();

    let (candidate, report_path) = job.validate_only().unwrap();
    assert_eq!(candidate.table.len(), 2);
    assert!(candidate.report.is_acceptable());
    assert!(report_path.exists());
    assert!(job.store().final_meta().is_none());
    assert_eq!(job.store().list_partitions().unwrap().len(), 1);
}

#[test]
fn unreadable_partition_is_refetched_instead_of_lost() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1", "E2", "E3"], 2);
    job.acquire(&ScriptedSource::new(at(5, 18)), &NullProgress)
        .unwrap();

    let partitions = job.store().list_partitions().unwrap();
    assert_eq!(partitions.len(), 2);
    let damaged = partitions[1].clone();
    assert!(damaged.ends_with("bars-00002.parquet"));
    fs::write(&damaged, b"torn write").unwrap();

    let fin = job.finalize(&NullProgress, true).unwrap();
    assert!(!fin.outcome.committed);
    assert!(!fin.checkpoints_cleared);
    assert_eq!(fin.outcome.quarantined, vec![damaged]);
    assert_eq!(fin.reopened, vec!["E3".to_string()]);
    assert!(job.store().final_meta().is_none());

    let state = job.config().checkpoint_store("bars").load().unwrap();
    assert!(!state.is_complete("E3"));
    assert!(!state.job_complete);
    assert_eq!(state.cursor_index, 2);

    let source = ScriptedSource::new(at(5, 18));
    let again = job.acquire(&source, &NullProgress).unwrap();
    assert!(again.all_complete());
    assert_eq!(source.calls(), vec!["E3"]);

    let fin = job.finalize(&NullProgress, false).unwrap();
    assert!(fin.outcome.committed);
    let merged = job.store().read_final(job.schema()).unwrap().unwrap();
    assert_eq!(merged.len(), 6);
    assert_eq!(merged.entity_ids().len(), 3);
    assert!(job
        .config()
        .checkpoint_store("bars")
        .load()
        .unwrap()
        .partition_units
        .is_empty());
}
