use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use orbis_core::config::{BrokerConfig, SessionConfig};
use orbis_core::session::{
    convert, load_session, read_db, read_log, write_db, write_log, PlaybackState, RecorderState,
};
use orbis_core::{
    FactoryClient, MockTransport, MqttMessage, OrbisError, QoS, Result, SessionPlayer,
    SessionRecorder,
};

fn at(offset_ms: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T10:00:00.000Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::milliseconds(offset_ms)
}

fn sample() -> Vec<MqttMessage> {
    vec![
        MqttMessage::json("ccu/order/request", &json!({"type": "RED", "orderType": "PRODUCTION"})).with_timestamp(at(0)),
        MqttMessage::json("module/v1/ff/SVR4H73275/state", &json!({"orderId": "O1"})).with_timestamp(at(250)),
        MqttMessage::new("/j1/txt/1/i/cam", "binary-ish frame").with_timestamp(at(500)),
        MqttMessage::json("fts/v1/ff/5iO4/state", &json!({"orderId": "O1", "loads": []})).with_timestamp(at(1250)),
    ]
}

fn essentials(messages: &[MqttMessage]) -> Vec<(String, Vec<u8>, DateTime<Utc>)> {
    messages
        .iter()
        .map(|m| (m.topic.clone(), m.payload.clone(), m.timestamp))
        .collect()
}

fn mock_client() -> (Arc<MockTransport>, Arc<FactoryClient>) {
    let transport = Arc::new(MockTransport::new());
    let client = Arc::new(FactoryClient::new(transport.clone(), BrokerConfig::default()));
    (transport, client)
}

fn session_config(dir: &std::path::Path) -> SessionConfig {
    SessionConfig {
        directory: dir.to_path_buf(),
        fallback_interval_ms: 5,
        ..Default::default()
    }
}

#[test]
fn log_round_trip_preserves_messages() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.log");
    let messages = sample();

    write_log(&path, &messages)?;
    let loaded = read_log(&path)?;
    assert_eq!(loaded.messages, messages);
    assert!(loaded.malformed_timestamps.is_empty());
    Ok(())
}

#[test]
fn log_and_db_yield_the_same_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("session.log");
    let db = dir.path().join("session.db");
    let messages = sample();

    write_log(&log, &messages)?;
    write_db(&db, &messages)?;
    assert_eq!(essentials(&read_log(&log)?.messages), essentials(&read_db(&db)?.messages));

    let converted = dir.path().join("converted.db");
    assert_eq!(convert(&log, &converted)?, messages.len());
    assert_eq!(essentials(&load_session(&converted)?.messages), essentials(&messages));
    Ok(())
}

#[test]
fn malformed_lines_and_timestamps_are_tolerated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("legacy.log");
    std::fs::write(
        &path,
        concat!(
            r#"{"topic":"a","payload":"1","timestamp":"2025-03-01T10:00:00Z"}"#,
            "\n",
            "not json at all\n",
            r#"{"topic":"b","payload":{"inline":true},"timestamp":"yesterday"}"#,
            "\n",
        ),
    )?;

    let loaded = read_log(&path)?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.skipped_lines, 1);
    assert!(loaded.malformed_timestamps.contains(&1));
    assert_eq!(loaded.messages[1].payload_json(), Some(json!({"inline": true})));
    assert_eq!(loaded.messages[1].timestamp, loaded.messages[0].timestamp);
    Ok(())
}

#[test]
fn missing_db_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        read_db(&dir.path().join("absent.db")),
        Err(OrbisError::NotFound(_))
    ));
}

#[tokio::test]
async fn recorder_persists_everything_it_saw() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (transport, client) = mock_client();
    let recorder = SessionRecorder::new(client.clone(), session_config(dir.path()));

    recorder.connect().await?;
    recorder.start_recording("run").await?;
    assert!(matches!(recorder.start_recording("again").await, Err(OrbisError::State(_))));

    for message in sample() {
        assert!(transport.inject(message));
    }
    assert_eq!(recorder.message_count(), 4);

    recorder.pause().await?;
    assert!(!transport.inject(MqttMessage::new("ccu/state/stock", "{}")));
    recorder.resume().await?;

    let files = recorder.stop().await?;
    assert_eq!(recorder.state(), RecorderState::Stopped);
    assert_eq!(files.messages, 4);
    assert!(files.log.file_name().unwrap().to_string_lossy().starts_with("run_"));
    assert_eq!(read_log(&files.log)?.messages, sample());
    assert_eq!(essentials(&read_db(&files.db)?.messages), essentials(&sample()));
    Ok(())
}

#[tokio::test]
async fn recorder_cap_marks_degraded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (transport, client) = mock_client();
    let config = SessionConfig {
        max_buffered_messages: 2,
        ..session_config(dir.path())
    };
    let recorder = SessionRecorder::new(client, config);
    recorder.connect().await?;
    recorder.start_recording("capped").await?;

    for message in sample() {
        transport.inject(message);
    }
    let status = recorder.status();
    assert!(status.degraded);
    assert_eq!(status.messages, 2);
    assert_eq!(status.dropped, 2);
    Ok(())
}

#[tokio::test]
async fn player_republishes_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (transport, client) = mock_client();
    client.connect().await?;

    let path = dir.path().join("replay.log");
    write_log(&path, &sample())?;

    let player = SessionPlayer::new(client, &session_config(dir.path()));
    assert!(player.load(&path));
    player.start(100.0, false)?;
    tokio::time::timeout(StdDuration::from_secs(5), player.wait())
        .await
        .expect("replay finished");

    let status = player.status();
    assert_eq!(status.state, PlaybackState::Completed);
    assert_eq!(status.published, 4);
    assert_eq!(player.progress(), 1.0);

    let topics: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(
        topics,
        [
            "ccu/order/request",
            "module/v1/ff/SVR4H73275/state",
            "/j1/txt/1/i/cam",
            "fts/v1/ff/5iO4/state"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn empty_session_completes_immediately() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_transport, client) = mock_client();
    let player = SessionPlayer::new(client, &session_config(dir.path()));

    let empty = dir.path().join("empty.log");
    std::fs::write(&empty, "")?;
    assert!(!player.load(&empty));

    player.load_messages(Vec::new());
    player.start(1.0, false)?;
    tokio::time::timeout(StdDuration::from_secs(1), player.wait())
        .await
        .expect("empty replay finished");
    assert_eq!(player.status().state, PlaybackState::Completed);
    assert_eq!(player.progress(), 1.0);
    Ok(())
}

#[tokio::test]
async fn stop_rewinds_and_invalid_speed_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_transport, client) = mock_client();
    client.connect().await?;
    let player = SessionPlayer::new(client, &session_config(dir.path()));

    let slow: Vec<MqttMessage> = (0..3)
        .map(|i| MqttMessage::new("ccu/state/stock", "{}").with_timestamp(at(i * 60_000)))
        .collect();
    player.load_messages(slow);
    assert!(matches!(player.start(0.0, false), Err(OrbisError::State(_))));

    player.start(1.0, false)?;
    let mut status = player.subscribe();
    tokio::time::timeout(StdDuration::from_secs(2), async {
        while status.borrow().current_index < 1 {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("first message published");

    player.pause();
    assert!(!player.is_playing());
    assert_eq!(player.current_index(), 1);
    player.stop();
    assert_eq!(player.current_index(), 0);
    assert_eq!(player.status().state, PlaybackState::Stopped);
    Ok(())
}

fn live_and_binary() -> Vec<MqttMessage> {
    vec![
        // stamped with the wall clock, sub-microsecond digits included
        MqttMessage::new("ccu/state/stock", r#"{"stockItems":[]}"#),
        MqttMessage::new("/j1/txt/1/i/cam", vec![255u8, 216, 0, 16]).with_qos(QoS::AtMostOnce),
    ]
}

#[test]
fn live_timestamps_and_binary_payloads_survive_both_formats() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("live.log");
    let db = dir.path().join("live.db");
    let messages = live_and_binary();

    write_log(&log, &messages)?;
    assert_eq!(read_log(&log)?.messages, messages);

    write_db(&db, &messages)?;
    let from_db = read_db(&db)?.messages;
    assert_eq!(essentials(&from_db), essentials(&messages));
    assert_eq!(from_db[1].payload, vec![255u8, 216, 0, 16]);
    Ok(())
}

#[tokio::test]
async fn failed_save_keeps_the_recording() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let blocked = dir.path().join("sessions");
    std::fs::write(&blocked, "not a directory")?;

    let (transport, client) = mock_client();
    let recorder = SessionRecorder::new(client, session_config(&blocked));
    recorder.connect().await?;
    recorder.start_recording("blocked").await?;
    for message in sample().into_iter().take(2) {
        transport.inject(message);
    }

    assert!(recorder.stop().await.is_err());
    assert_eq!(recorder.state(), RecorderState::Recording);
    assert_eq!(recorder.message_count(), 2);

    std::fs::remove_file(&blocked)?;
    let files = recorder.stop().await?;
    assert_eq!(files.messages, 2);
    assert_eq!(recorder.state(), RecorderState::Stopped);
    assert_eq!(recorder.message_count(), 0);
    assert_eq!(read_log(&files.log)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn stop_during_a_slow_publish_stays_rewound() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (transport, client) = mock_client();
    client.connect().await?;
    transport.set_publish_delay(StdDuration::from_millis(300));

    let player = SessionPlayer::new(client, &session_config(dir.path()));
    player.load_messages(
        (0..3)
            .map(|i| MqttMessage::new("ccu/state/stock", "{}").with_timestamp(at(i * 60_000)))
            .collect(),
    );
    player.start(1.0, false)?;
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    player.stop();
    assert_eq!(player.current_index(), 0);

    tokio::time::sleep(StdDuration::from_millis(500)).await;
    assert_eq!(player.current_index(), 0);
    assert_eq!(player.status().state, PlaybackState::Stopped);
    Ok(())
}

#[tokio::test]
async fn pause_and_quick_resume_publish_each_message_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (transport, client) = mock_client();
    client.connect().await?;
    transport.set_publish_delay(StdDuration::from_millis(200));

    let player = SessionPlayer::new(client, &session_config(dir.path()));
    let topics = ["ccu/order/request", "ccu/order/response", "ccu/state/stock"];
    player.load_messages(
        topics
            .iter()
            .enumerate()
            .map(|(i, t)| MqttMessage::new(*t, "{}").with_timestamp(at(i as i64 * 10)))
            .collect(),
    );

    player.start(1.0, false)?;
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    player.pause();
    player.start(1.0, false)?;
    tokio::time::timeout(StdDuration::from_secs(5), player.wait())
        .await
        .expect("replay finished");

    let published: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(published, topics);
    assert_eq!(player.status().state, PlaybackState::Completed);
    Ok(())
}
