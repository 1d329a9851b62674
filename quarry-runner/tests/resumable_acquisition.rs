//! Acquisition across runs: idempotence, crash recovery and retry-by-rerun.

mod common;

use common::{at, bar_job, ScriptedSource};
use quarry_core::fetch::FetchError;
use quarry_core::progress::{NullProgress, ProgressEvent, RecordingProgress};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[test]
fn completed_job_rerun_fetches_nothing_and_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1", "E2", "E3"], 2);
    let source = ScriptedSource::new(at(5, 18));

    let first = job.acquire(&source, &NullProgress).unwrap();
    assert!(first.all_complete());
    assert_eq!(source.calls().len(), 3);

    let checkpoint = job.config().checkpoint_store("bars");
    let before = fs::read(checkpoint.path()).unwrap();

    let second = job.acquire(&source, &NullProgress).unwrap();
    assert!(second.all_complete());
    assert_eq!(second.fetch_calls(), 0);
    assert_eq!(source.calls().len(), 3);
    assert_eq!(fs::read(checkpoint.path()).unwrap(), before);
}

#[test]
fn crash_after_first_flush_refetches_only_the_unflushed_entity() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1", "E2", "E3"], 2);
    let source = ScriptedSource::new(at(5, 18)).panic_once_on("E3");

    let crashed = catch_unwind(AssertUnwindSafe(|| job.acquire(&source, &NullProgress)));
    assert!(crashed.is_err());

    let state = job.config().checkpoint_store("bars").load().unwrap();
    assert!(state.is_complete("E1") && state.is_complete("E2"));
    assert!(!state.is_complete("E3"));
    assert_eq!(state.cursor_index, 2);
    assert_eq!(job.store().list_partitions().unwrap().len(), 1);

    let progress = RecordingProgress::new();
    let resumed = job.acquire(&source, &progress).unwrap();
    assert!(resumed.all_complete());
    assert_eq!(progress.started(), vec!["E3".to_string()]);
    assert_eq!(source.calls(), vec!["E1", "E2", "E3", "E3"]);

    let fin = job.finalize(&NullProgress, false).unwrap();
    assert!(fin.outcome.committed);
    assert_eq!(fin.outcome.meta.unwrap().rows, 6);
}

#[test]
fn interrupted_and_uninterrupted_runs_produce_the_same_dataset() {
    let entities = ["E1", "E2", "E3", "E4", "E5"];

    let straight_dir = tempfile::tempdir().unwrap();
    let straight = bar_job(straight_dir.path(), &entities, 2);
    straight
        .acquire(&ScriptedSource::new(at(5, 18)), &NullProgress)
        .unwrap();
    let expected = straight.finalize(&NullProgress, false).unwrap();

    let resumed_dir = tempfile::tempdir().unwrap();
    let resumed = bar_job(resumed_dir.path(), &entities, 2);
    let source = ScriptedSource::new(at(5, 18)).panic_once_on("E4");
    assert!(catch_unwind(AssertUnwindSafe(|| resumed.acquire(&source, &NullProgress))).is_err());
    resumed.acquire(&source, &NullProgress).unwrap();
    let actual = resumed.finalize(&NullProgress, false).unwrap();

    // E3 was fetched in the crashed run but never flushed, so it is fetched again.
    assert_eq!(
        source.calls(),
        vec!["E1", "E2", "E3", "E4", "E3", "E4", "E5"]
    );
    assert_eq!(
        expected.outcome.meta.unwrap().data_hash,
        actual.outcome.meta.unwrap().data_hash
    );
    assert_eq!(
        straight.store().read_final(straight.schema()).unwrap(),
        resumed.store().read_final(resumed.schema()).unwrap()
    );
}

#[test]
fn failed_entity_is_retried_by_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1", "E2", "E3"], 10);

    let flaky = ScriptedSource::new(at(5, 18)).failing(
        "E2",
        FetchError::NotFound {
            entity_id: "E2".into(),
        },
    );
    let first = job.acquire(&flaky, &NullProgress).unwrap();
    assert!(!first.all_complete());
    assert_eq!(first.failed(), 1);

    let status = job.status().unwrap();
    assert_eq!(status.phases[0].completed, 2);
    assert_eq!(status.phases[0].cursor_index, 1);
    assert_eq!(status.phases[0].failing, vec![("E2".to_string(), 1)]);

    let healthy = ScriptedSource::new(at(5, 18));
    let second = job.acquire(&healthy, &NullProgress).unwrap();
    assert!(second.all_complete());
    assert_eq!(healthy.calls(), vec!["E2"]);
    assert!(job.status().unwrap().phases[0].failing.is_empty());
}

#[test]
fn entities_added_to_the_list_are_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(at(5, 18));
    bar_job(dir.path(), &["E1", "E2"], 10)
        .acquire(&source, &NullProgress)
        .unwrap();

    let grown = bar_job(dir.path(), &["E0", "E1", "E2", "E3"], 10);
    let summary = grown.acquire(&source, &NullProgress).unwrap();

    assert!(summary.all_complete());
    assert_eq!(source.calls(), vec!["E1", "E2", "E0", "E3"]);
}

#[test]
fn blocked_source_halts_the_job_and_resumes_later() {
    let dir = tempfile::tempdir().unwrap();
    let job = bar_job(dir.path(), &["E1", "E2", "E3"], 10);

    let blocked = ScriptedSource::new(at(5, 18)).failing("E2", FetchError::Blocked("HTTP 403".into()));
    let progress = RecordingProgress::new();
    let summary = job.acquire(&blocked, &progress).unwrap();

    assert!(summary.halted);
    assert!(!summary.all_complete());
    assert_eq!(blocked.calls(), vec!["E1", "E2"]);
    assert!(progress
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::JobDone { halted: true, .. })));

    // A fresh process after the cooldown gets a fresh breaker.
    let healthy = ScriptedSource::new(at(5, 18));
    assert!(job.acquire(&healthy, &NullProgress).unwrap().all_complete());
    assert_eq!(healthy.calls(), vec!["E2", "E3"]);
}
