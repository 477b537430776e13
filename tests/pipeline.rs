mod common;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use common::{CheckerBehavior, FakeApi, FakeChecker, MB, sparse_file, utf8_dir, zip_bytes};
use crosscheck_worker::domain::{EventId, WorkId};
use crosscheck_worker::layout::CacheLayout;
use crosscheck_worker::pipeline::{TaskPipeline, TickOutcome, TickStage};
use crosscheck_worker::store::{SqliteWorkStore, WorkStore};

type Pipeline = TaskPipeline<FakeApi, SqliteWorkStore, FakeChecker>;

const OVERVIEW: &str = r#"{
    "top_comparisons": [
        {"first_submission": "3", "second_submission": "1",
         "similarities": {"AVG": 0.8, "MAX": 0.95}},
        {"first_submission": "2", "second_submission": "3", "similarity": 0.4},
        {"first_submission": "1", "second_submission": "2", "similarity": 0.9}
    ]
}"#;

fn submission(id: u64) -> Vec<u8> {
    let source = format!("class Work{id} {{}}");
    zip_bytes(&[("Program.cs", source.as_str())])
}

fn event_api(works: &[u64]) -> FakeApi {
    works
        .iter()
        .fold(FakeApi::default().with_event(7, works), |api, id| {
            api.with_archive(*id, submission(*id))
        })
}

fn pipeline(temp: &tempfile::TempDir, api: FakeApi, behavior: CheckerBehavior) -> Pipeline {
    let layout = CacheLayout::new(utf8_dir(temp.path()));
    layout.ensure().unwrap();
    let checker = FakeChecker::new(layout.result_path(), behavior);
    let store = SqliteWorkStore::open_in_memory().unwrap();
    TaskPipeline::new(api, store, checker, layout, 50)
}

fn overview() -> CheckerBehavior {
    CheckerBehavior::Overview(OVERVIEW.to_string())
}

#[test]
fn idle_tick_does_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&temp, FakeApi::default(), overview());

    assert_eq!(pipeline.process(), TickOutcome::NoTask);
    assert_eq!(pipeline.checker().call_count(), 0);
}

#[test]
fn single_work_event_skips_checker() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[3]).with_task(7, 3);
    let pipeline = pipeline(&temp, api, overview());

    assert_eq!(pipeline.process(), TickOutcome::NotEnoughWorks);
    assert_eq!(pipeline.checker().call_count(), 0);
    assert!(pipeline.api().reports.lock().unwrap().is_empty());
}

#[test]
fn new_work_missing_from_event_sends_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[1, 2]).with_task(7, 9);
    let pipeline = pipeline(&temp, api, overview());

    assert_eq!(pipeline.process(), TickOutcome::NoFilesToCompare);
    let calls = pipeline.checker().calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.is_none());
    assert!(pipeline.api().reports.lock().unwrap().is_empty());
}

#[test]
fn full_tick_reports_matches_for_new_work() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[1, 2, 3]).with_task(7, 3);
    let pipeline = pipeline(&temp, api, overview());

    assert_eq!(
        pipeline.process(),
        TickOutcome::Reported { sent: 2, total: 2 }
    );

    let calls = pipeline.checker().calls.lock().unwrap();
    let (new_work, old_works) = &calls[0];
    let layout = pipeline.layout();
    assert_eq!(new_work.as_ref(), Some(&layout.work_dir(WorkId::new(3))));
    let mut old_works = old_works.clone();
    old_works.sort();
    assert_eq!(
        old_works,
        vec![layout.work_dir(WorkId::new(1)), layout.work_dir(WorkId::new(2))]
    );

    let reports = pipeline.api().reports.lock().unwrap();
    assert_eq!(reports[0].event_id, EventId::new(7));
    assert_eq!(reports[0].work_id, WorkId::new(3));
    assert_eq!(reports[0].matched_work_id, WorkId::new(1));
    assert_eq!(reports[0].similarity, 0.8);
    assert_eq!(reports[0].max_similarity, Some(0.95));
    assert_eq!(reports[1].matched_work_id, WorkId::new(2));
    assert!(!layout.result_path().exists());
}

#[test]
fn report_failure_stops_sending() {
    let temp = tempfile::tempdir().unwrap();
    let api = FakeApi {
        fail_reports_from: Some(1),
        ..event_api(&[1, 2, 3]).with_task(7, 3)
    };
    let pipeline = pipeline(&temp, api, overview());

    assert_eq!(
        pipeline.process(),
        TickOutcome::Reported { sent: 1, total: 2 }
    );
    assert_eq!(pipeline.api().reports.lock().unwrap().len(), 1);
}

#[test]
fn checker_failure_is_contained() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[1, 2]).with_task(7, 2);
    let pipeline = pipeline(&temp, api, CheckerBehavior::Fail);

    assert_eq!(
        pipeline.process(),
        TickOutcome::Failed(TickStage::Checker)
    );
    assert!(pipeline.api().reports.lock().unwrap().is_empty());
}

#[test]
fn unreadable_result_is_removed() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[1, 2]).with_task(7, 2);
    let pipeline = pipeline(
        &temp,
        api,
        CheckerBehavior::Overview("not json".to_string()),
    );

    assert_eq!(
        pipeline.process(),
        TickOutcome::Failed(TickStage::ParseResults)
    );
    assert!(!pipeline.layout().result_path().exists());
}

#[test]
fn unknown_event_fails_resolution() {
    let temp = tempfile::tempdir().unwrap();
    let api = FakeApi::default().with_task(404, 1);
    let pipeline = pipeline(&temp, api, overview());

    assert_eq!(
        pipeline.process(),
        TickOutcome::Failed(TickStage::ResolveWorks)
    );
}

#[test]
fn tick_enforces_cache_budget() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[1, 2, 3]).with_task(7, 3);
    let pipeline = pipeline(&temp, api, overview());

    let stale = WorkId::new(100);
    let stale_dir: Utf8PathBuf = pipeline.layout().work_dir(stale);
    sparse_file(&stale_dir.join("100").join("big.bin"), 60 * MB);
    let long_ago = DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap();
    pipeline.store().save(stale, &stale_dir, long_ago).unwrap();

    pipeline.process();

    assert!(!stale_dir.exists());
    assert!(pipeline.store().get(stale).is_err());
    assert!(pipeline.store().get(WorkId::new(3)).is_ok());
}

#[test]
fn consecutive_tasks_reuse_cached_works() {
    let temp = tempfile::tempdir().unwrap();
    let api = event_api(&[1, 2, 3]).with_task(7, 3).with_task(7, 3);
    let pipeline = pipeline(&temp, api, overview());

    pipeline.process();
    pipeline.process();

    assert_eq!(pipeline.api().download_count(), 3);
    assert_eq!(pipeline.checker().call_count(), 2);
}
