// Session file formats: JSONL `.log` and embedded SQLite `.db`
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::message::{parse_timestamp, MqttMessage, QoS};
use crate::{OrbisError, Result};

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFormat {
    Log,
    Db,
}

impl SessionFormat {
    /// Format by extension, falling back to the SQLite header for unknown extensions
    pub fn detect(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("log") | Some("jsonl") => return Ok(SessionFormat::Log),
            Some("db") | Some("sqlite") => return Ok(SessionFormat::Db),
            _ => {}
        }
        let mut header = [0u8; 16];
        let read = File::open(path)?.read(&mut header)?;
        if read == SQLITE_MAGIC.len() && &header[..] == SQLITE_MAGIC {
            Ok(SessionFormat::Db)
        } else {
            Ok(SessionFormat::Log)
        }
    }
}

/// A parsed session. Entries whose timestamp could not be parsed inherit the
/// previous timestamp and are listed in `malformed_timestamps`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedSession {
    pub messages: Vec<MqttMessage>,
    pub malformed_timestamps: BTreeSet<usize>,
    pub skipped_lines: usize,
}

impl LoadedSession {
    pub fn from_messages(messages: Vec<MqttMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn push(&mut self, message: MqttMessage, timestamp: Option<DateTime<Utc>>) {
        let timestamp = match timestamp {
            Some(ts) => ts,
            None => {
                self.malformed_timestamps.insert(self.messages.len());
                self.messages
                    .last()
                    .map(|m| m.timestamp)
                    .unwrap_or_default()
            }
        };
        self.messages.push(message.with_timestamp(timestamp));
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    topic: String,
    payload: Value,
    timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    qos: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retain: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
}

const BASE64_ENCODING: &str = "base64";

/// Text payloads are stored verbatim, anything else as base64
fn encode_payload(payload: &[u8]) -> (String, Option<String>) {
    match std::str::from_utf8(payload) {
        Ok(text) => (text.to_string(), None),
        Err(_) => (BASE64_STANDARD.encode(payload), Some(BASE64_ENCODING.to_string())),
    }
}

fn decode_payload(text: String, encoding: Option<&str>) -> std::result::Result<Vec<u8>, String> {
    match encoding {
        None => Ok(text.into_bytes()),
        Some(BASE64_ENCODING) => BASE64_STANDARD.decode(text).map_err(|e| e.to_string()),
        Some(other) => Err(format!("unknown payload encoding {other}")),
    }
}

/// Binary payloads go into the db as BLOBs
fn payload_column(payload: &[u8]) -> SqlValue {
    match std::str::from_utf8(payload) {
        Ok(text) => SqlValue::Text(text.to_string()),
        Err(_) => SqlValue::Blob(payload.to_vec()),
    }
}

pub fn write_log(path: &Path, messages: &[MqttMessage]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for message in messages {
        let (payload, encoding) = encode_payload(&message.payload);
        let line = LogLine {
            topic: message.topic.clone(),
            payload: Value::String(payload),
            timestamp: message.timestamp_rfc3339(),
            qos: Some(message.qos.into()),
            retain: Some(message.retain),
            encoding,
        };
        serde_json::to_writer(&mut out, &line)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    debug!(
        target: "session",
        path = %path.display(),
        count = messages.len(),
        "Session log written"
    );
    Ok(())
}

/// Read a JSONL session. Unparseable lines are skipped and counted.
pub fn read_log(path: &Path) -> Result<LoadedSession> {
    let reader = BufReader::new(File::open(path)?);
    let mut session = LoadedSession::default();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogLine = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(
                    target: "session",
                    line = number + 1,
                    error = %e,
                    "Skipping malformed session line"
                );
                session.skipped_lines += 1;
                continue;
            }
        };

        // Older recordings stored payload objects inline
        let text = match entry.payload {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let payload = match decode_payload(text, entry.encoding.as_deref()) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(
                    target: "session",
                    line = number + 1,
                    error = %e,
                    "Skipping undecodable payload"
                );
                session.skipped_lines += 1;
                continue;
            }
        };
        let qos = entry
            .qos
            .and_then(|q| QoS::try_from(q).ok())
            .unwrap_or_default();
        let message = MqttMessage::new(entry.topic, payload)
            .with_qos(qos)
            .with_retain(entry.retain.unwrap_or(false));
        session.push(message, parse_timestamp(&entry.timestamp));
    }

    if session.skipped_lines > 0 {
        warn!(
            target: "session",
            path = %path.display(),
            skipped = session.skipped_lines,
            "Session log contained malformed lines"
        );
    }
    Ok(session)
}

pub fn write_db(path: &Path, messages: &[MqttMessage]) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE mqtt_messages (
            id INTEGER PRIMARY KEY,
            topic TEXT NOT NULL,
            payload BLOB NOT NULL,
            timestamp TEXT NOT NULL
        );",
    )?;

    let tx = conn.transaction()?;
    {
        let mut insert =
            tx.prepare(
                "INSERT INTO mqtt_messages (topic, payload, timestamp) VALUES (?1, ?2, ?3)",
            )?;
        for message in messages {
            insert.execute(params![
                message.topic,
                payload_column(&message.payload),
                message.timestamp_rfc3339()
            ])?;
        }
    }
    tx.commit()?;
    debug!(
        target: "session",
        path = %path.display(),
        count = messages.len(),
        "Session database written"
    );
    Ok(())
}

pub fn read_db(path: &Path) -> Result<LoadedSession> {
    if !path.exists() {
        return Err(OrbisError::NotFound(format!("session {}", path.display())));
    }
    let conn = Connection::open(path)?;
    let has_table: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'mqtt_messages'",
        [],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if !has_table {
        return Err(OrbisError::NotFound(format!(
            "table mqtt_messages in {}",
            path.display()
        )));
    }

    let mut stmt = conn.prepare(
        "SELECT topic, payload, timestamp FROM mqtt_messages ORDER BY timestamp, id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, SqlValue>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut session = LoadedSession::default();
    for row in rows {
        let (topic, payload, timestamp) = row?;
        let payload = match payload {
            SqlValue::Text(text) => text.into_bytes(),
            SqlValue::Blob(bytes) => bytes,
            SqlValue::Integer(n) => n.to_string().into_bytes(),
            SqlValue::Real(x) => x.to_string().into_bytes(),
            SqlValue::Null => Vec::new(),
        };
        session.push(MqttMessage::new(topic, payload), parse_timestamp(&timestamp));
    }
    Ok(session)
}

/// Load a session in either format
pub fn load_session(path: &Path) -> Result<LoadedSession> {
    match SessionFormat::detect(path)? {
        SessionFormat::Log => read_log(path),
        SessionFormat::Db => read_db(path),
    }
}

/// Save by extension (`.db` or anything else as JSONL)
pub fn save_session(path: &Path, messages: &[MqttMessage]) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("db") | Some("sqlite") => write_db(path, messages),
        _ => write_log(path, messages),
    }
}

/// Convert between formats; returns the number of messages written
pub fn convert(src: &Path, dst: &Path) -> Result<usize> {
    let session = load_session(src)?;
    save_session(dst, &session.messages)?;
    Ok(session.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tolerates_bad_lines_and_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.log");
        fs::write(
            &path,
            concat!(
                r#"{"topic":"a","payload":"1","timestamp":"2025-01-01T10:00:00+01:00"}"#,
                "\n",
                "not json\n",
                r#"{"topic":"b","payload":{"x":1},"timestamp":"yesterday"}"#,
                "\n"
            ),
        )
        .unwrap();

        let session = read_log(&path).unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session.skipped_lines, 1);
        assert_eq!(session.malformed_timestamps, BTreeSet::from([1]));
        assert_eq!(session.messages[1].timestamp, session.messages[0].timestamp);
        assert_eq!(session.messages[1].payload_json().unwrap()["x"], 1);
    }

    #[test]
    fn database_without_table_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE other (id INTEGER);")
            .unwrap();
        assert!(matches!(read_db(&path), Err(OrbisError::NotFound(_))));
        assert_eq!(SessionFormat::detect(&path).unwrap(), SessionFormat::Db);
    }
}
