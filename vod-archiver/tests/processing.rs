mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use common::*;
use vod_archiver::database::models::{DownloadState, NewVod};
use vod_archiver::database::time::now_ms;
use vod_archiver::processing::{MediaLayout, ProcessingJob, Processors, StepError, TickOutcome};
use vod_archiver::resilience::{CircuitBreaker, CircuitState};

struct Harness {
    db: TestDb,
    downloader: Arc<FakeDownloader>,
    transcoder: Arc<FakeTranscoder>,
    uploader: Arc<FakeUploader>,
    breaker: Arc<CircuitBreaker>,
    layout: MediaLayout,
    job: ProcessingJob,
}

async fn harness(failure_threshold: u32) -> Harness {
    harness_with_cooldown(failure_threshold, Duration::from_secs(600)).await
}

async fn harness_with_cooldown(failure_threshold: u32, cooldown: Duration) -> Harness {
    let db = test_db().await;
    let downloader = Arc::new(FakeDownloader::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let uploader = Arc::new(FakeUploader::default());
    let breaker = Arc::new(CircuitBreaker::new(
        "chan",
        Arc::clone(&db.repos.kv),
        failure_threshold,
        cooldown,
    ));
    let layout = MediaLayout::new(db.dir.path().join("media"));
    let job = ProcessingJob::new(
        "chan",
        Arc::clone(&db.repos.vods),
        Processors {
            downloader: downloader.clone(),
            transcoder: transcoder.clone(),
            uploader: uploader.clone(),
        },
        Arc::clone(&breaker),
        layout.clone(),
        metrics("chan"),
        Duration::from_secs(60),
    );
    Harness {
        db,
        downloader,
        transcoder,
        uploader,
        breaker,
        layout,
        job,
    }
}

fn date(y: i32, m: u32, d: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
}

#[tokio::test]
async fn higher_priority_is_processed_first_regardless_of_date() {
    let h = harness(5).await;
    let high = insert_vod(&h.db, NewVod::new("chan", "high", date(2024, 1, 2)).with_priority(5)).await;
    let low = insert_vod(&h.db, NewVod::new("chan", "low", date(2024, 1, 1)).with_priority(1)).await;
    let cancel = CancellationToken::new();

    let first = h.job.tick(&cancel).await.unwrap();
    assert_eq!(
        first,
        TickOutcome::Uploaded {
            vod_id: high.id,
            url: "https://youtu.be/high".to_string()
        }
    );
    assert_eq!(*h.uploader.uploaded.lock(), vec!["high".to_string()]);

    let second = h.job.tick(&cancel).await.unwrap();
    assert!(matches!(second, TickOutcome::Uploaded { vod_id, .. } if vod_id == low.id));
    assert_eq!(h.job.tick(&cancel).await.unwrap(), TickOutcome::Idle);

    let done = h.db.repos.vods.get_vod(high.id).await.unwrap();
    assert_eq!(done.state(), Some(DownloadState::Uploaded));
    assert!(done.processed);
    assert_eq!(done.youtube_url.as_deref(), Some("https://youtu.be/high"));

    // The transcoded artifact is kept for retention; the source is gone
    let artifact = done.downloaded_path.clone().unwrap();
    assert!(std::path::Path::new(&artifact).exists());
    assert!(!h.layout.source_path(&done).exists());
}

#[tokio::test]
async fn ties_on_priority_go_to_the_earliest_date() {
    let h = harness(5).await;
    insert_vod(&h.db, NewVod::new("chan", "newer", date(2024, 3, 2))).await;
    insert_vod(&h.db, NewVod::new("chan", "older", date(2024, 3, 1))).await;

    h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(*h.uploader.uploaded.lock(), vec!["older".to_string()]);
}

#[tokio::test]
async fn transient_download_failure_rolls_back_and_counts_against_breaker() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.downloader.script.fail_next(StepError::Transient("connection reset".into()));

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::TransientFailure {
            vod_id: vod.id,
            state: DownloadState::Pending
        }
    );

    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Pending));
    // The partial file is kept for the retry to continue
    assert!(row.downloaded_path.is_some());
    assert_eq!(h.breaker.snapshot().await.unwrap().failure_count, 1);

    // Next tick retries and completes
    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Uploaded { .. }));
    assert_eq!(h.breaker.snapshot().await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn permanent_failure_marks_failed_without_tripping_breaker() {
    let h = harness(1).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "gone", date(2024, 1, 1))).await;
    h.downloader.script.fail_next(StepError::Permanent("video deleted".into()));

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Failed {
            vod_id: vod.id,
            reason: "video deleted".to_string()
        }
    );

    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Failed));
    assert_eq!(row.failure_reason.as_deref(), Some("video deleted"));
    assert!(row.downloaded_path.is_none());
    assert!(!row.processed);
    assert!(h.breaker.allow().await);

    // Failed VODs are not picked up again
    assert_eq!(h.job.tick(&CancellationToken::new()).await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn transient_upload_failure_stays_uploading() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.uploader.script.fail_next(StepError::Transient("503".into()));

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::TransientFailure {
            vod_id: vod.id,
            state: DownloadState::Uploading
        }
    );
    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Uploading));

    // Retry resumes at the upload step without downloading again
    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Uploaded { .. }));
    assert_eq!(h.downloader.calls.lock().len(), 1);
}

#[tokio::test]
async fn missing_credentials_block_without_breaker_failure() {
    let h = harness(1).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.uploader.script.fail_next(StepError::Credentials("no youtube token".into()));

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, TickOutcome::Blocked { vod_id: vod.id });
    assert_eq!(
        h.db.repos.vods.get_vod(vod.id).await.unwrap().state(),
        Some(DownloadState::Uploading)
    );
    assert_eq!(h.breaker.snapshot().await.unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn open_breaker_makes_tick_a_noop() {
    let h = harness(1).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.breaker.record_failure().await;

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, TickOutcome::BreakerOpen { vod_id: vod.id });
    assert!(h.downloader.calls.lock().is_empty());
    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Pending));
    assert_eq!(row.updated_at, vod.updated_at);
}

#[tokio::test]
async fn transient_transcode_failure_returns_to_downloaded() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.transcoder.script.fail_next(StepError::Transient("ffmpeg killed".into()));

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::TransientFailure {
            vod_id: vod.id,
            state: DownloadState::Downloaded
        }
    );
    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Downloaded));
    assert!(!h.layout.output_path(&row).exists());
    // Local step; the breaker only tracks upstream calls
    assert_eq!(h.breaker.snapshot().await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn recovery_resumes_verifiable_partial_download() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    let partial = h.layout.source_path(&vod);
    write_file(&partial, 64).await;
    force_row(&h.db, vod.id, "downloading", Some(&partial.to_string_lossy()), false, now_ms()).await;
    *h.downloader.resumable.lock() = true;

    let report = h.job.recover().await.unwrap();
    assert_eq!(report.resumable, vec![vod.id]);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(
        h.db.repos.vods.get_vod(vod.id).await.unwrap().state(),
        Some(DownloadState::Downloading)
    );

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Uploaded { .. }));
}

#[tokio::test]
async fn recovery_resets_unverifiable_download_to_pending() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    let partial = h.layout.source_path(&vod);
    write_file(&partial, 64).await;
    force_row(&h.db, vod.id, "downloading", Some(&partial.to_string_lossy()), false, now_ms()).await;
    *h.downloader.resumable.lock() = false;

    let report = h.job.recover().await.unwrap();
    assert!(report.resumable.is_empty());
    assert_eq!(report.rolled_back, 1);

    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Pending));
    assert!(row.downloaded_path.is_none());
    assert!(!partial.exists());
}

#[tokio::test]
async fn recovery_rolls_back_interrupted_transcode() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    let source = h.layout.source_path(&vod);
    let output = h.layout.output_path(&vod);
    write_file(&source, 64).await;
    write_file(&output, 10).await;
    force_row(&h.db, vod.id, "transcoding", Some(&source.to_string_lossy()), false, now_ms()).await;

    let report = h.job.recover().await.unwrap();
    assert_eq!(report.rolled_back, 1);

    let row = h.db.repos.vods.get_vod(vod.id).await.unwrap();
    assert_eq!(row.state(), Some(DownloadState::Downloaded));
    assert!(source.exists());
    assert!(!output.exists());
}

#[tokio::test]
async fn downloading_row_owned_elsewhere_is_left_alone() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    force_row(&h.db, vod.id, "downloading", Some("/elsewhere/v1.mp4"), false, now_ms()).await;

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, TickOutcome::Busy { vod_id: vod.id });
    assert!(h.downloader.calls.lock().is_empty());
}

#[tokio::test]
async fn cancelled_download_returns_to_pending() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.downloader.script.fail_next(StepError::Cancelled);

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, TickOutcome::Cancelled { vod_id: vod.id });
    assert_eq!(
        h.db.repos.vods.get_vod(vod.id).await.unwrap().state(),
        Some(DownloadState::Pending)
    );
    assert_eq!(h.breaker.snapshot().await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn storage_error_after_claim_does_not_strand_the_vod() {
    let h = harness(5).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    // A regular file where the media root should be breaks directory creation
    let media_root = h.db.dir.path().join("media");
    tokio::fs::write(&media_root, b"not a directory").await.unwrap();

    assert!(h.job.tick(&CancellationToken::new()).await.is_err());
    assert_eq!(
        h.db.repos.vods.get_vod(vod.id).await.unwrap().state(),
        Some(DownloadState::Downloading)
    );

    tokio::fs::remove_file(&media_root).await.unwrap();
    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Uploaded { vod_id, .. } if vod_id == vod.id));
    assert_eq!(*h.downloader.calls.lock(), vec!["v1".to_string()]);
}

/// Open the breaker and wait out its cooldown so the next call is a trial.
async fn await_trial(h: &Harness) {
    h.breaker.record_failure().await;
    assert_eq!(h.breaker.snapshot().await.unwrap().state, CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn permanent_answer_during_trial_closes_breaker() {
    let h = harness_with_cooldown(1, Duration::from_millis(100)).await;
    let gone = insert_vod(&h.db, NewVod::new("chan", "gone", date(2024, 1, 1))).await;
    let next = insert_vod(&h.db, NewVod::new("chan", "next", date(2024, 1, 2))).await;
    await_trial(&h).await;

    h.downloader.script.fail_next(StepError::Permanent("deleted upstream".into()));
    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Failed { vod_id, .. } if vod_id == gone.id));
    assert_eq!(h.breaker.snapshot().await.unwrap().state, CircuitState::Closed);

    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Uploaded { vod_id, .. } if vod_id == next.id));
}

#[tokio::test]
async fn trial_ending_without_verdict_is_handed_back() {
    let h = harness_with_cooldown(1, Duration::from_millis(100)).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    h.uploader.script.fail_next(StepError::Credentials("no youtube token".into()));
    assert_eq!(
        h.job.tick(&CancellationToken::new()).await.unwrap(),
        TickOutcome::Blocked { vod_id: vod.id }
    );
    await_trial(&h).await;

    h.uploader.script.fail_next(StepError::Credentials("no youtube token".into()));
    assert_eq!(
        h.job.tick(&CancellationToken::new()).await.unwrap(),
        TickOutcome::Blocked { vod_id: vod.id }
    );
    let record = h.breaker.snapshot().await.unwrap();
    assert_eq!(record.state, CircuitState::HalfOpen);
    assert_eq!(record.trial_started_at, None);

    // Without the release this tick would be denied for another cooldown
    let outcome = h.job.tick(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Uploaded { .. }));
    assert_eq!(h.breaker.snapshot().await.unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn cancelled_trial_is_handed_back() {
    let h = harness_with_cooldown(1, Duration::from_millis(100)).await;
    let vod = insert_vod(&h.db, NewVod::new("chan", "v1", date(2024, 1, 1))).await;
    await_trial(&h).await;

    h.downloader.script.fail_next(StepError::Cancelled);
    assert_eq!(
        h.job.tick(&CancellationToken::new()).await.unwrap(),
        TickOutcome::Cancelled { vod_id: vod.id }
    );
    let record = h.breaker.snapshot().await.unwrap();
    assert_eq!(record.state, CircuitState::HalfOpen);
    assert_eq!(record.trial_started_at, None);
    assert!(h.breaker.allow().await);
}
