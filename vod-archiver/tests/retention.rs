mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::*;
use vod_archiver::config::RetentionConfig;
use vod_archiver::database::models::{NewVod, VodDbModel};
use vod_archiver::database::time::now_ms;
use vod_archiver::metrics::Counter;
use vod_archiver::retention::{RetentionJob, RetentionReport};

/// An archived VOD `age_days` old with a local file of `bytes`.
async fn archived(db: &TestDb, id: &str, age_days: i64, bytes: usize) -> (VodDbModel, PathBuf) {
    let now = now_ms();
    let vod = insert_vod(db, NewVod::new("chan", id, now - age_days * DAY_MS)).await;
    let path = db.dir.path().join("media").join(format!("{}.mp4", id));
    write_file(&path, bytes).await;
    force_row(db, vod.id, "uploaded", Some(&path.to_string_lossy()), true, now - 2 * DAY_MS).await;
    (vod, path)
}

fn job(db: &TestDb, config: RetentionConfig) -> RetentionJob {
    RetentionJob::new("chan", config, Arc::clone(&db.repos.vods), metrics("chan"))
}

async fn path_of(db: &TestDb, id: i64) -> Option<String> {
    db.repos.vods.get_vod(id).await.unwrap().downloaded_path
}

#[tokio::test]
async fn keeps_union_of_count_and_age() {
    let db = test_db().await;
    let (a, a_path) = archived(&db, "a", 1, 10).await;
    let (b, b_path) = archived(&db, "b", 10, 10).await;
    let (c, c_path) = archived(&db, "c", 40, 10).await;
    let (d, d_path) = archived(&db, "d", 50, 20).await;

    let config = RetentionConfig {
        keep_days: Some(30),
        keep_count: Some(1),
        ..Default::default()
    };
    let report = job(&db, config).run_once().await.unwrap();

    assert_eq!(report.retained, 2);
    assert_eq!(report.cleaned, 2);
    assert_eq!(report.bytes_freed, 30);
    assert_eq!(report.errored, 0);

    assert!(a_path.exists() && b_path.exists());
    assert!(!c_path.exists() && !d_path.exists());
    assert!(path_of(&db, a.id).await.is_some());
    assert!(path_of(&db, b.id).await.is_some());
    assert!(path_of(&db, c.id).await.is_none());
    assert!(path_of(&db, d.id).await.is_none());

    // Rows and their archive metadata are kept
    let row = db.repos.vods.get_vod(d.id).await.unwrap();
    assert!(row.processed);
    assert_eq!(row.download_state, "uploaded");
}

#[tokio::test]
async fn count_can_retain_beyond_age_window() {
    let db = test_db().await;
    let (_, a_path) = archived(&db, "a", 1, 10).await;
    let (_, b_path) = archived(&db, "b", 10, 10).await;
    let (_, c_path) = archived(&db, "c", 40, 10).await;
    let (_, d_path) = archived(&db, "d", 50, 10).await;

    let config = RetentionConfig {
        keep_days: Some(5),
        keep_count: Some(3),
        ..Default::default()
    };
    let report = job(&db, config).run_once().await.unwrap();

    assert_eq!(report.retained, 3);
    assert_eq!(report.cleaned, 1);
    assert!(a_path.exists() && b_path.exists() && c_path.exists());
    assert!(!d_path.exists());
}

#[tokio::test]
async fn protected_vods_are_skipped() {
    let db = test_db().await;
    let now = now_ms();
    archived(&db, "newest", 1, 10).await;

    let (uploading, uploading_path) = archived(&db, "uploading", 40, 10).await;
    force_row(&db, uploading.id, "uploading", Some(&uploading_path.to_string_lossy()), false, now - 2 * DAY_MS).await;

    let (fresh, fresh_path) = archived(&db, "fresh", 41, 10).await;
    force_row(&db, fresh.id, "uploaded", Some(&fresh_path.to_string_lossy()), true, now).await;

    let (unarchived, unarchived_path) = archived(&db, "unarchived", 42, 10).await;
    force_row(
        &db,
        unarchived.id,
        "downloaded",
        Some(&unarchived_path.to_string_lossy()),
        false,
        now - 2 * DAY_MS,
    )
    .await;

    let config = RetentionConfig {
        keep_count: Some(1),
        ..Default::default()
    };
    let report = job(&db, config).run_once().await.unwrap();

    assert_eq!(report.cleaned, 0);
    assert_eq!(report.skipped, 3);
    assert!(uploading_path.exists() && fresh_path.exists() && unarchived_path.exists());
}

#[tokio::test]
async fn unarchived_files_are_deleted_when_not_required() {
    let db = test_db().await;
    let now = now_ms();
    let vod = insert_vod(&db, NewVod::new("chan", "old", now - 90 * DAY_MS)).await;
    let path = db.dir.path().join("old.mp4");
    write_file(&path, 5).await;
    force_row(&db, vod.id, "downloaded", Some(&path.to_string_lossy()), false, now - 2 * DAY_MS).await;

    let config = RetentionConfig {
        keep_days: Some(30),
        require_archived: false,
        ..Default::default()
    };
    let report = job(&db, config).run_once().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert!(!path.exists());
}

#[tokio::test]
async fn failed_vod_media_is_reclaimed_by_default() {
    let db = test_db().await;
    let now = now_ms();
    archived(&db, "keep", 1, 10).await;
    let vod = insert_vod(&db, NewVod::new("chan", "broken", now - 60 * DAY_MS)).await;
    let path = db.dir.path().join("media").join("broken.mp4");
    write_file(&path, 15).await;
    force_row(&db, vod.id, "failed", Some(&path.to_string_lossy()), false, now - 2 * DAY_MS).await;

    let config = RetentionConfig {
        keep_count: Some(1),
        ..Default::default()
    };
    let report = job(&db, config).run_once().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.bytes_freed, 15);
    assert!(!path.exists());
    assert!(path_of(&db, vod.id).await.is_none());
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let db = test_db().await;
    let now = now_ms();
    archived(&db, "keep", 1, 10).await;
    let (old, old_path) = archived(&db, "old", 60, 25).await;
    let (fresh, fresh_path) = archived(&db, "fresh", 61, 10).await;
    force_row(&db, fresh.id, "uploaded", Some(&fresh_path.to_string_lossy()), true, now).await;

    let config = RetentionConfig {
        keep_count: Some(1),
        dry_run: true,
        ..Default::default()
    };
    let report = job(&db, config).run_once().await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.cleaned, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.would_clean, 1);
    assert_eq!(report.would_free_bytes, 25);
    assert!(old_path.exists());
    assert!(path_of(&db, old.id).await.is_some());
}

#[tokio::test]
async fn failed_delete_restores_path() {
    let db = test_db().await;
    let now = now_ms();
    archived(&db, "keep", 1, 10).await;
    let vod = insert_vod(&db, NewVod::new("chan", "stuck", now - 60 * DAY_MS)).await;
    // A directory where the media file should be cannot be removed as a file
    let path = db.dir.path().join("stuck.mp4");
    tokio::fs::create_dir_all(&path).await.unwrap();
    force_row(&db, vod.id, "uploaded", Some(&path.to_string_lossy()), true, now - 2 * DAY_MS).await;

    let metrics = metrics("chan");
    let job = RetentionJob::new(
        "chan",
        RetentionConfig {
            keep_count: Some(1),
            ..Default::default()
        },
        Arc::clone(&db.repos.vods),
        metrics.clone(),
    );
    let report = job.run_once().await.unwrap();

    assert_eq!(report.errored, 1);
    assert_eq!(report.cleaned, 0);
    assert_eq!(path_of(&db, vod.id).await.as_deref(), Some(&*path.to_string_lossy()));
    assert_eq!(metrics.get(Counter::RetentionErrors), 1);

    // The restore counts as a fresh change, so the next pass waits out the
    // safety window before trying again
    let again = job.run_once().await.unwrap();
    assert_eq!(again.errored, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn inactive_without_thresholds() {
    let db = test_db().await;
    let (_, path) = archived(&db, "old", 365, 10).await;

    let job = job(&db, RetentionConfig::default());
    assert!(!job.is_active());
    let report = job.run_once().await.unwrap();
    assert_eq!(report, RetentionReport::default());
    assert!(path.exists());
}
