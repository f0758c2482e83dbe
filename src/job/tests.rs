//! Unit tests for the job controller, store, and log cursor.

use std::time::Duration;

use super::*;
use crate::test_support::{
    ManualClock, RecordingEvents, ScriptedService, report, running_with_segments,
};
use rstest::{fixture, rstest};

#[fixture]
fn options() -> AwaitOptions {
    AwaitOptions {
        policy: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(60)),
        stream_logs: true,
    }
}

fn seeded_store(job_id: &str) -> MemoryJobStore {
    let store = MemoryJobStore::new();
    store
        .create(JobRecord::pending(job_id))
        .expect("seed record");
    store
}

#[rstest]
#[tokio::test]
async fn submit_records_pending_job() {
    let service = ScriptedService::new();
    service.set_job_id("job-42");
    let store = MemoryJobStore::new();
    let clock = ManualClock::new();

    let job_id = JobController::new(&service, &store, &clock)
        .submit(&JobRequest::new("https://example.test/song.mp3"))
        .await
        .expect("submit");

    assert_eq!(job_id, "job-42");
    let record = store.get("job-42").expect("store").expect("record");
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(service.submitted().len(), 1);
}

#[rstest]
#[tokio::test]
async fn submit_failure_is_not_retried() {
    let service = ScriptedService::new();
    service.fail_submit(ServiceError::Http {
        status: 503,
        message: String::from("Models not ready yet. Please wait."),
    });
    let store = MemoryJobStore::new();
    let clock = ManualClock::new();

    let err = JobController::new(&service, &store, &clock)
        .submit(&JobRequest::new("https://example.test/song.mp3"))
        .await
        .expect_err("submit rejected");

    assert!(err.to_string().contains("Models not ready"), "{err}");
    assert!(store.list().expect("store").is_empty());
}

#[rstest]
#[tokio::test]
async fn streams_each_log_byte_once(options: AwaitOptions) {
    let service = ScriptedService::new();
    service.script_reports([
        report("job-1", JobStatus::Running),
        report("job-1", JobStatus::Running),
        report("job-1", JobStatus::Completed),
    ]);
    service.push_logs("abc", 3);
    service.push_logs("", 3);
    service.push_logs("def", 6);
    let store = seeded_store("job-1");
    let clock = ManualClock::new();
    let mut events = RecordingEvents::default();

    let outcome = JobController::new(&service, &store, &clock)
        .await_completion("job-1", options, &mut events)
        .await
        .expect("job completes");

    assert_eq!(events.log_text(), "abcdef");
    assert_eq!(outcome.log_bytes, 6);
    assert_eq!(service.log_offsets(), vec![0, 3, 3]);
    assert_eq!(events.phases, vec![JobStatus::Running, JobStatus::Completed]);
    assert_eq!(outcome.record.status, JobStatus::Completed);
}

#[rstest]
#[tokio::test]
async fn log_failure_switches_to_progress(options: AwaitOptions) {
    let service = ScriptedService::new();
    service.script_reports([
        running_with_segments("job-1", 1, 4),
        running_with_segments("job-1", 2, 4),
        report("job-1", JobStatus::Completed),
    ]);
    service.push_log_failure(ServiceError::Transport {
        message: String::from("reset by peer"),
    });
    let store = seeded_store("job-1");
    let clock = ManualClock::new();
    let mut events = RecordingEvents::default();

    JobController::new(&service, &store, &clock)
        .await_completion("job-1", options, &mut events)
        .await
        .expect("job completes");

    assert_eq!(events.disabled.len(), 1);
    assert_eq!(service.log_offsets(), vec![0]);
    let lines: Vec<String> = events
        .progress
        .iter()
        .filter_map(JobProgress::describe)
        .collect();
    assert_eq!(lines, vec!["25% (1/4)", "50% (2/4)"]);
}

#[rstest]
#[tokio::test]
async fn failed_job_carries_remote_message(options: AwaitOptions) {
    let service = ScriptedService::new();
    let mut failed = report("job-1", JobStatus::Failed);
    failed.error = Some(String::from("demucs exited with status 1"));
    service.script_reports([report("job-1", JobStatus::Running), failed]);
    service.push_logs("starting\n", 9);
    service.push_logs("traceback\n", 19);
    let store = seeded_store("job-1");
    let clock = ManualClock::new();
    let mut events = RecordingEvents::default();

    let err = JobController::new(&service, &store, &clock)
        .await_completion("job-1", options, &mut events)
        .await
        .expect_err("job fails");

    match err {
        JobError::Failed { job_id, message } => {
            assert_eq!(job_id, "job-1");
            assert_eq!(message, "demucs exited with status 1");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(events.log_text(), "starting\ntraceback\n");
}

#[rstest]
#[tokio::test]
async fn timeout_leaves_job_running(options: AwaitOptions) {
    let service = ScriptedService::new();
    service.script_reports([report("job-1", JobStatus::Running)]);
    let store = seeded_store("job-1");
    let clock = ManualClock::new();
    let mut events = RecordingEvents::default();

    let err = JobController::new(&service, &store, &clock)
        .await_completion("job-1", options, &mut events)
        .await
        .expect_err("job never finishes");

    assert!(matches!(err, JobError::Timeout { .. }));
    let record = store.get("job-1").expect("store").expect("record");
    assert_eq!(record.status, JobStatus::Running);
}

#[rstest]
#[tokio::test]
async fn stale_reports_do_not_regress(options: AwaitOptions) {
    let service = ScriptedService::new();
    service.script_reports([
        report("job-1", JobStatus::Running),
        report("job-1", JobStatus::Pending),
        report("job-1", JobStatus::Completed),
    ]);
    let store = seeded_store("job-1");
    let clock = ManualClock::new();
    let mut events = RecordingEvents::default();

    JobController::new(&service, &store, &clock)
        .await_completion("job-1", options, &mut events)
        .await
        .expect("job completes");

    assert_eq!(events.phases, vec![JobStatus::Running, JobStatus::Completed]);
}

#[rstest]
#[tokio::test]
async fn delete_drops_local_record() {
    let service = ScriptedService::new();
    let store = seeded_store("job-1");
    let clock = ManualClock::new();

    JobController::new(&service, &store, &clock)
        .delete("job-1")
        .await
        .expect("delete");

    assert_eq!(service.deleted(), vec![String::from("job-1")]);
    assert!(store.get("job-1").expect("store").is_none());
}

#[rstest]
#[tokio::test]
async fn delete_refusal_keeps_local_record() {
    let service = ScriptedService::new();
    service.fail_delete(ServiceError::Http {
        status: 400,
        message: String::from("Cannot delete running job"),
    });
    let store = seeded_store("job-1");
    let clock = ManualClock::new();

    let err = JobController::new(&service, &store, &clock)
        .delete("job-1")
        .await
        .expect_err("running job");

    assert!(err.to_string().contains("Cannot delete running job"));
    assert!(store.get("job-1").expect("store").is_some());
}

#[rstest]
#[case(JobStatus::Completed, JobStatus::Running, false)]
#[case(JobStatus::Failed, JobStatus::Completed, false)]
#[case(JobStatus::Running, JobStatus::Pending, false)]
#[case(JobStatus::Pending, JobStatus::Running, true)]
#[case(JobStatus::Running, JobStatus::Failed, true)]
#[case(JobStatus::Running, JobStatus::Running, true)]
fn record_transitions_never_regress(
    #[case] current: JobStatus,
    #[case] reported: JobStatus,
    #[case] applied: bool,
) {
    let mut record = JobRecord {
        status: current,
        ..JobRecord::pending("job-1")
    };
    let outcome = record.apply(&report("job-1", reported));
    assert_eq!(outcome == UpdateOutcome::Applied, applied);
    let expected = if applied { reported } else { current };
    assert_eq!(record.status, expected);
}

#[rstest]
fn duplicate_records_are_rejected() {
    let store = seeded_store("job-1");
    let err = store
        .create(JobRecord::pending("job-1"))
        .expect_err("duplicate");
    assert_eq!(
        err,
        StoreError::Duplicate {
            job_id: String::from("job-1")
        }
    );
}

fn chunk(logs: &str, offset: u64) -> crate::service::LogChunk {
    crate::service::LogChunk {
        logs: logs.to_owned(),
        offset,
        status: None,
    }
}

#[rstest]
fn cursor_ignores_non_advancing_chunks() {
    let mut cursor = LogCursor::default();
    assert_eq!(cursor.advance(&chunk("hello", 5)).as_deref(), Some("hello"));
    assert_eq!(cursor.advance(&chunk("hello", 5)), None);
    assert_eq!(cursor.advance(&chunk("", 9)), None);
    assert_eq!(cursor.offset(), 5);
    assert_eq!(cursor.advance(&chunk("old", 2)), None);
    assert_eq!(cursor.offset(), 5);
}

#[rstest]
fn cursor_trims_overlapping_text() {
    let mut cursor = LogCursor::default();
    cursor.advance(&chunk("abc", 3));
    assert_eq!(cursor.advance(&chunk("abcdef", 6)).as_deref(), Some("def"));
}

#[rstest]
#[case(Some(3), Some(4), None, Some("75% (3/4)"))]
#[case(Some(0), Some(0), Some(12.4), Some("12%"))]
#[case(None, None, Some(99.6), Some("100%"))]
#[case(None, None, None, None)]
fn progress_prefers_segments(
    #[case] completed: Option<u64>,
    #[case] total: Option<u64>,
    #[case] percent: Option<f64>,
    #[case] expected: Option<&str>,
) {
    let progress = JobProgress {
        completed_segments: completed,
        total_segments: total,
        percent,
        ..JobProgress::default()
    };
    assert_eq!(progress.describe().as_deref(), expected);
}

#[rstest]
fn console_events_render_progress_and_logs() {
    let mut buffer = Vec::new();
    {
        let mut console = ConsoleEvents::new(&mut buffer);
        console.phase_changed("job-1", JobStatus::Running);
        console.progress(&JobProgress {
            completed_segments: Some(1),
            total_segments: Some(2),
            ..JobProgress::default()
        });
        console.log_text("done\n");
    }
    let rendered = String::from_utf8(buffer).expect("utf8");
    assert_eq!(rendered, "job job-1: running\n\rProgress: 50% (1/2)\ndone\n");
}
