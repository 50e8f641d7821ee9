// Session recorder: taps `#` and persists to `.db` + `.log`
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::format::{write_db, write_log};
use crate::config::SessionConfig;
use crate::message::MqttMessage;
use crate::mqtt::{FactoryClient, MessageTap};
use crate::{OrbisError, Result};

const RECORD_FILTER: &str = "#";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderStatus {
    pub state: RecorderState,
    pub session_name: Option<String>,
    pub messages: usize,
    pub degraded: bool,
    pub dropped: u64,
}

/// Files written by [`SessionRecorder::stop`]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFiles {
    pub db: PathBuf,
    pub log: PathBuf,
    pub messages: usize,
}

/// Buffer shared with the broker I/O task. Appends only.
struct RecordingBuffer {
    messages: Mutex<Vec<MqttMessage>>,
    cap: usize,
    degraded: AtomicBool,
    dropped: AtomicU64,
}

impl MessageTap for RecordingBuffer {
    fn on_message(&self, message: &MqttMessage) {
        let mut messages = self.messages.lock();
        if messages.len() < self.cap {
            messages.push(message.clone());
        } else {
            self.degraded.store(true, Ordering::Relaxed);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct SessionRecorder {
    client: Arc<FactoryClient>,
    config: SessionConfig,
    buffer: Arc<RecordingBuffer>,
    state: Mutex<RecorderState>,
    session_name: Mutex<Option<String>>,
    tap_id: Mutex<Option<u64>>,
    last_autosave: Mutex<Instant>,
    degraded_reported: AtomicBool,
}

impl SessionRecorder {
    pub fn new(client: Arc<FactoryClient>, config: SessionConfig) -> Self {
        let cap = config.max_buffered_messages.max(1);
        Self {
            client,
            config,
            buffer: Arc::new(RecordingBuffer {
                messages: Mutex::new(Vec::new()),
                cap,
                degraded: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
            state: Mutex::new(RecorderState::Idle),
            session_name: Mutex::new(None),
            tap_id: Mutex::new(None),
            last_autosave: Mutex::new(Instant::now()),
            degraded_reported: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    pub fn state(&self) -> RecorderState {
        *self.state.lock()
    }

    pub async fn start_recording(&self, session_name: &str) -> Result<()> {
        let state = self.state();
        if state == RecorderState::Recording {
            return Err(OrbisError::State("recording already in progress".into()));
        }
        if state == RecorderState::Paused {
            return Err(OrbisError::State("recording is paused; resume or stop it first".into()));
        }

        *self.session_name.lock() = Some(session_name.to_string());
        self.buffer.degraded.store(false, Ordering::Relaxed);
        self.buffer.dropped.store(0, Ordering::Relaxed);
        self.degraded_reported.store(false, Ordering::Relaxed);
        *self.last_autosave.lock() = Instant::now();

        self.attach().await?;
        info!(target: "recorder", session = %session_name, "Recording started");
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        let tap: Arc<dyn MessageTap> = self.buffer.clone();
        let id = self.client.attach_tap(RECORD_FILTER, tap).await?;
        *self.tap_id.lock() = Some(id);
        *self.state.lock() = RecorderState::Recording;
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        let id = self.tap_id.lock().take();
        if let Some(id) = id {
            self.client.detach_tap(id).await?;
        }
        Ok(())
    }

    /// Stop receiving but keep the buffer
    pub async fn pause(&self) -> Result<()> {
        if self.state() != RecorderState::Recording {
            return Err(OrbisError::State("not recording".into()));
        }
        self.detach().await?;
        *self.state.lock() = RecorderState::Paused;
        info!(target: "recorder", messages = self.message_count(), "Recording paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        if self.state() != RecorderState::Paused {
            return Err(OrbisError::State("recording is not paused".into()));
        }
        self.attach().await?;
        info!(target: "recorder", "Recording resumed");
        Ok(())
    }

    /// Unsubscribe, persist the buffer as `<name>_<ts>.db` and `<name>_<ts>.log`
    /// in the session directory, then clear it. When persisting fails the
    /// buffer is kept and the previous state restored, so `stop` can be retried.
    pub async fn stop(&self) -> Result<SessionFiles> {
        let state = self.state();
        if !matches!(state, RecorderState::Recording | RecorderState::Paused) {
            return Err(OrbisError::State("no recording to stop".into()));
        }
        self.detach().await?;
        self.report_degraded();

        let messages = self.buffer.messages.lock().clone();
        let name = self
            .session_name
            .lock()
            .clone()
            .unwrap_or_else(|| "session".to_string());

        if messages.is_empty() {
            warn!(target: "recorder", session = %name, "Persisting an empty session");
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let dir = self.config.directory.clone();
        let db = dir.join(format!("{name}_{stamp}.db"));
        let log = dir.join(format!("{name}_{stamp}.log"));
        let count = messages.len();

        let (db_path, log_path) = (db.clone(), log.clone());
        let written = tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)?;
            write_db(&db_path, &messages)?;
            write_log(&log_path, &messages)
        })
        .await
        .map_err(|e| OrbisError::State(format!("session writer panicked: {e}")))
        .and_then(|result| result);

        if let Err(e) = written {
            warn!(target: "recorder", session = %name, error = %e, "Saving the recording failed");
            self.restore(state).await;
            return Err(e);
        }

        // only what was persisted is dropped; nothing can arrive while detached
        self.buffer.messages.lock().drain(..count);
        *self.state.lock() = RecorderState::Stopped;
        self.check_file_size(&log);
        info!(
            target: "recorder",
            session = %name,
            messages = count,
            log = %log.display(),
            "Recording stopped and saved"
        );
        Ok(SessionFiles {
            db,
            log,
            messages: count,
        })
    }

    async fn restore(&self, previous: RecorderState) {
        if previous == RecorderState::Recording {
            if let Err(e) = self.attach().await {
                warn!(
                    target: "recorder",
                    error = %e,
                    "Cannot resume recording after a failed save"
                );
                *self.state.lock() = RecorderState::Paused;
            }
        } else {
            *self.state.lock() = RecorderState::Paused;
        }
    }

    fn check_file_size(&self, path: &Path) {
        let limit = self.config.max_file_size_mb * 1024 * 1024;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > limit {
                warn!(
                    target: "recorder",
                    path = %path.display(),
                    bytes = meta.len(),
                    limit_mb = self.config.max_file_size_mb,
                    "Session file exceeds configured size"
                );
            }
        }
    }

    /// Warn once, from the caller side, when the buffer cap was hit
    fn report_degraded(&self) {
        if self.buffer.degraded.load(Ordering::Relaxed)
            && !self.degraded_reported.swap(true, Ordering::Relaxed)
        {
            warn!(
                target: "recorder",
                cap = self.buffer.cap,
                dropped = self.buffer.dropped.load(Ordering::Relaxed),
                "Recorder buffer cap reached; messages are being dropped"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<MqttMessage> {
        self.buffer.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.buffer.messages.lock().len()
    }

    pub fn is_degraded(&self) -> bool {
        self.buffer.degraded.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> RecorderStatus {
        self.report_degraded();
        RecorderStatus {
            state: self.state(),
            session_name: self.session_name.lock().clone(),
            messages: self.message_count(),
            degraded: self.is_degraded(),
            dropped: self.buffer.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn autosave_due(&self) -> bool {
        self.state() == RecorderState::Recording
            && self.last_autosave.lock().elapsed()
                >= Duration::from_secs(self.config.auto_save_interval_secs)
    }

    /// Write the current buffer to `<name>_autosave.log` without clearing it
    pub async fn autosave(&self) -> Result<PathBuf> {
        let messages = self.snapshot();
        let name = self
            .session_name
            .lock()
            .clone()
            .unwrap_or_else(|| "session".to_string());
        let dir = self.config.directory.clone();
        let path = dir.join(format!("{name}_autosave.log"));

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)?;
            write_log(&target, &messages)
        })
        .await
        .map_err(|e| OrbisError::State(format!("autosave writer panicked: {e}")))??;

        *self.last_autosave.lock() = Instant::now();
        self.report_degraded();
        info!(target: "recorder", path = %path.display(), "Autosaved session");
        Ok(path)
    }
}
