mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use common::*;
use vod_archiver::chat::{ChatError, ChatMessage, ChatRecorder, ChatSource, ChatStream, FlushReport};
use vod_archiver::config::ChatConfig;
use vod_archiver::database::models::NewVod;
use vod_archiver::metrics::{ChannelMetrics, Counter};

fn message(id: &str, sent_at: i64) -> ChatMessage {
    ChatMessage {
        message_id: id.to_string(),
        user_id: "42".to_string(),
        username: "viewer".to_string(),
        content: format!("hello {}", id),
        sent_at,
    }
}

/// Hands out scripted connections in order; further connects fail.
#[derive(Default)]
struct ScriptedSource {
    connections: Mutex<VecDeque<ScriptedStream>>,
}

struct ScriptedStream {
    items: VecDeque<Result<ChatMessage, ChatError>>,
    /// Block after the script instead of ending the connection.
    hang: bool,
}

#[async_trait]
impl ChatStream for ScriptedStream {
    async fn next_message(&mut self) -> Result<Option<ChatMessage>, ChatError> {
        match self.items.pop_front() {
            Some(item) => item.map(Some),
            None if self.hang => std::future::pending().await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChatSource for ScriptedSource {
    async fn connect(&self, _channel: &str) -> Result<Box<dyn ChatStream>, ChatError> {
        match self.connections.lock().pop_front() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(ChatError::Connect("no more connections".to_string())),
        }
    }
}

fn recorder(db: &TestDb, config: ChatConfig, source: Arc<ScriptedSource>, metrics: ChannelMetrics) -> ChatRecorder {
    ChatRecorder::new(
        "chan",
        config,
        source,
        Arc::clone(&db.repos.chat),
        Arc::clone(&db.repos.vods),
        metrics,
    )
}

#[tokio::test]
async fn messages_attach_to_latest_vod_started_before_them() {
    let db = test_db().await;
    let first = insert_vod(&db, NewVod::new("chan", "first", 1_000)).await;
    // Still live: no duration reported yet
    let second = insert_vod(&db, NewVod::new("chan", "second", 5_000)).await;
    let recorder = recorder(&db, ChatConfig::default(), Arc::default(), metrics("chan"));

    recorder.push(message("a", 2_000));
    recorder.push(message("b", 4_999));
    recorder.push(message("c", 5_000));
    recorder.push(message("d", 9_000));
    let report = recorder.flush().await.unwrap();

    assert_eq!(report.stored, 4);
    assert_eq!(report.held, 0);
    assert_eq!(db.repos.chat.count_for_vod("chan", first.id).await.unwrap(), 2);
    assert_eq!(db.repos.chat.count_for_vod("chan", second.id).await.unwrap(), 2);

    let stored = db.repos.chat.list_for_vod("chan", second.id, 10).await.unwrap();
    let ids: Vec<&str> = stored.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "d"]);
    assert_eq!(stored[0].content, "hello c");
}

#[tokio::test]
async fn messages_after_a_finished_vod_wait_for_the_next_one() {
    let db = test_db().await;
    let hour = 60 * 60 * 1000;
    let yesterday = insert_vod(&db, NewVod::new("chan", "yesterday", 0).with_duration(2 * 60 * 60)).await;
    let config = ChatConfig {
        attach_slack_secs: 60,
        ..Default::default()
    };
    let recorder = recorder(&db, config, Arc::default(), metrics("chan"));

    // Within the slack after the end still belongs to yesterday's VOD
    recorder.push(message("late", 2 * hour + 30_000));
    recorder.push(message("today", 20 * hour));
    let report = recorder.flush().await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.held, 1);
    assert_eq!(db.repos.chat.count_for_vod("chan", yesterday.id).await.unwrap(), 1);

    let today = insert_vod(&db, NewVod::new("chan", "today", 19 * hour)).await;
    let report = recorder.flush().await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.held, 0);
    let stored = db.repos.chat.list_for_vod("chan", today.id, 10).await.unwrap();
    assert_eq!(stored[0].message_id, "today");
}

#[tokio::test]
async fn messages_wait_for_their_vod() {
    let db = test_db().await;
    let recorder = recorder(&db, ChatConfig::default(), Arc::default(), metrics("chan"));

    recorder.push(message("early", 2_000));
    let report = recorder.flush().await.unwrap();
    assert_eq!(
        report,
        FlushReport {
            held: 1,
            ..Default::default()
        }
    );
    assert_eq!(recorder.pending_len(), 1);

    let vod = insert_vod(&db, NewVod::new("chan", "live", 1_500)).await;
    let report = recorder.flush().await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.held, 0);
    assert_eq!(db.repos.chat.count_for_vod("chan", vod.id).await.unwrap(), 1);
}

#[tokio::test]
async fn redelivered_messages_are_stored_once() {
    let db = test_db().await;
    let vod = insert_vod(&db, NewVod::new("chan", "live", 0)).await;
    let recorder = recorder(&db, ChatConfig::default(), Arc::default(), metrics("chan"));

    recorder.push(message("m1", 10));
    recorder.push(message("m2", 20));
    assert_eq!(recorder.flush().await.unwrap().stored, 2);

    recorder.push(message("m2", 20));
    recorder.push(message("m3", 30));
    let report = recorder.flush().await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(db.repos.chat.count_for_vod("chan", vod.id).await.unwrap(), 3);
}

#[tokio::test]
async fn full_buffer_drops_oldest() {
    let db = test_db().await;
    let metrics = metrics("chan");
    let config = ChatConfig {
        max_pending_messages: 3,
        ..Default::default()
    };
    let recorder = recorder(&db, config, Arc::default(), metrics.clone());

    let mut dropped = 0;
    for i in 1..=5 {
        dropped += recorder.push(message(&format!("m{}", i), i * 10));
    }
    assert_eq!(dropped, 2);
    assert_eq!(recorder.pending_len(), 3);
    assert_eq!(metrics.get(Counter::ChatMessagesDropped), 2);

    let vod = insert_vod(&db, NewVod::new("chan", "live", 0)).await;
    recorder.flush().await.unwrap();
    let ids: Vec<String> = db
        .repos
        .chat
        .list_for_vod("chan", vod.id, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(ids, vec!["m3", "m4", "m5"]);
}

#[tokio::test]
async fn run_reconnects_and_flushes_on_shutdown() {
    let db = test_db().await;
    let vod = insert_vod(&db, NewVod::new("chan", "live", 0)).await;
    let source = Arc::new(ScriptedSource::default());
    source.connections.lock().extend([
        ScriptedStream {
            items: VecDeque::from([
                Ok(message("a", 10)),
                Ok(message("b", 20)),
                Err(ChatError::Closed("RECONNECT".to_string())),
            ]),
            hang: false,
        },
        ScriptedStream {
            items: VecDeque::from([Ok(message("c", 30))]),
            hang: true,
        },
    ]);

    let metrics = metrics("chan");
    let config = ChatConfig {
        flush_interval_ms: 60_000,
        flush_batch_size: 2,
        reconnect_initial_ms: 10,
        reconnect_max_ms: 20,
        ..Default::default()
    };
    let recorder = Arc::new(recorder(&db, config, source.clone(), metrics.clone()));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&recorder).run(cancel.clone()));

    // Wait until the second connection has delivered its message
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let reconnected = source.connections.lock().is_empty();
            let stored = db.repos.chat.count_for_vod("chan", vod.id).await.unwrap();
            if reconnected && (recorder.pending_len() == 1 || stored == 3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(db.repos.chat.count_for_vod("chan", vod.id).await.unwrap() >= 2);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

    assert_eq!(db.repos.chat.count_for_vod("chan", vod.id).await.unwrap(), 3);
    assert_eq!(recorder.pending_len(), 0);
    assert!(metrics.get(Counter::ChatReconnects) >= 1);
    assert_eq!(metrics.get(Counter::ChatMessagesStored), 3);
}
