//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vod_archiver::database::models::{NewVod, VodDbModel};
use vod_archiver::database::{self, DbPool};
use vod_archiver::metrics::{ChannelMetrics, MetricsCollector};
use vod_archiver::processing::{Downloader, StepError, Transcoder, Uploader};
use vod_archiver::services::Repositories;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub struct TestDb {
    pub dir: TempDir,
    pub pool: DbPool,
    pub repos: Repositories,
}

pub async fn test_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("test.db").to_string_lossy().replace('\\', "/")
    );
    let pool = database::init_pool(&url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    let repos = Repositories::sqlx(&pool);
    TestDb { dir, pool, repos }
}

pub fn metrics(channel: &str) -> ChannelMetrics {
    Arc::new(MetricsCollector::new()).channel(channel)
}

/// Insert a VOD and return its row.
pub async fn insert_vod(db: &TestDb, vod: NewVod) -> VodDbModel {
    assert!(db.repos.vods.insert_if_absent(&vod).await.unwrap());
    db.repos
        .vods
        .find_by_twitch_id(&vod.channel, &vod.twitch_vod_id)
        .await
        .unwrap()
        .unwrap()
}

/// Force a row into a given shape, bypassing the state machine.
pub async fn force_row(
    db: &TestDb,
    id: i64,
    state: &str,
    path: Option<&str>,
    processed: bool,
    updated_at: i64,
) {
    sqlx::query(
        "UPDATE vods SET download_state = ?, downloaded_path = ?, processed = ?, updated_at = ? WHERE id = ?",
    )
    .bind(state)
    .bind(path)
    .bind(processed)
    .bind(updated_at)
    .bind(id)
    .execute(&db.pool)
    .await
    .unwrap();
}

pub async fn write_file(path: &Path, bytes: usize) {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, vec![0u8; bytes]).await.unwrap();
}

/// Scripted outcomes; an empty script means success.
#[derive(Default)]
pub struct Script(Mutex<VecDeque<StepError>>);

impl Script {
    pub fn fail_next(&self, error: StepError) {
        self.0.lock().push_back(error);
    }

    fn next(&self) -> Option<StepError> {
        self.0.lock().pop_front()
    }
}

#[derive(Default)]
pub struct FakeDownloader {
    pub script: Script,
    pub resumable: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(&self, vod: &VodDbModel, output: &Path, _cancel: &CancellationToken) -> Result<(), StepError> {
        self.calls.lock().push(vod.twitch_vod_id.clone());
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        match self.script.next() {
            Some(StepError::Transient(reason)) => {
                // Leave a partial file behind, like an interrupted transfer
                tokio::fs::write(output, b"partial").await.unwrap();
                Err(StepError::Transient(reason))
            }
            Some(error) => Err(error),
            None => {
                tokio::fs::write(output, b"source-media").await.unwrap();
                Ok(())
            }
        }
    }

    async fn can_resume(&self, _vod: &VodDbModel, _partial: &Path) -> bool {
        *self.resumable.lock()
    }
}

#[derive(Default)]
pub struct FakeTranscoder {
    pub script: Script,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        _vod: &VodDbModel,
        input: &Path,
        output: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if let Some(error) = self.script.next() {
            return Err(error);
        }
        tokio::fs::copy(input, output).await.unwrap();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUploader {
    pub script: Script,
    pub uploaded: Mutex<Vec<String>>,
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn upload(&self, vod: &VodDbModel, input: &Path, _cancel: &CancellationToken) -> Result<String, StepError> {
        assert!(input.exists(), "upload input must exist");
        if let Some(error) = self.script.next() {
            return Err(error);
        }
        self.uploaded.lock().push(vod.twitch_vod_id.clone());
        Ok(format!("https://youtu.be/{}", vod.twitch_vod_id))
    }
}
