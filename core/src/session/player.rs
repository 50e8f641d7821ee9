// Session player: republishes a recorded session at simulated real time
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::format::{load_session, LoadedSession};
use crate::config::SessionConfig;
use crate::message::MqttMessage;
use crate::mqtt::FactoryClient;
use crate::{OrbisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub current_index: usize,
    pub total: usize,
    pub published: u64,
    pub failed: u64,
}

impl PlayerStatus {
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            if self.state == PlaybackState::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            self.current_index.min(self.total) as f64 / self.total as f64
        }
    }
}

struct Shared {
    client: Arc<FactoryClient>,
    session: RwLock<Arc<LoadedSession>>,
    current_index: AtomicUsize,
    is_playing: AtomicBool,
    // bumped on every start so a worker from an earlier run exits
    generation: AtomicU64,
    // bumped on every rewind; an in-flight publish only advances the cursor
    // when no rewind happened since it read its index
    rewinds: AtomicU64,
    cursor: Mutex<()>,
    published: AtomicU64,
    failed: AtomicU64,
    wake: Notify,
    status_tx: watch::Sender<PlayerStatus>,
    state: Mutex<PlaybackState>,
    fallback: Duration,
}

impl Shared {
    fn set_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
        self.broadcast();
    }

    fn broadcast(&self) {
        let status = PlayerStatus {
            state: *self.state.lock(),
            current_index: self.current_index.load(Ordering::SeqCst),
            total: self.session.read().len(),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        };
        self.status_tx.send_replace(status);
    }

    /// Current index and the rewind epoch it belongs to
    fn position(&self) -> (usize, u64) {
        let _cursor = self.cursor.lock();
        (
            self.current_index.load(Ordering::SeqCst),
            self.rewinds.load(Ordering::SeqCst),
        )
    }

    fn advance(&self, index: usize, epoch: u64) -> bool {
        let _cursor = self.cursor.lock();
        if self.rewinds.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.current_index.store(index + 1, Ordering::SeqCst);
        true
    }

    fn rewind(&self) {
        let _cursor = self.cursor.lock();
        self.rewinds.fetch_add(1, Ordering::SeqCst);
        self.current_index.store(0, Ordering::SeqCst);
    }

    fn running(&self, generation: u64) -> bool {
        self.is_playing.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }

    fn delay_before(&self, session: &LoadedSession, index: usize, speed: f64) -> Duration {
        if index == 0 {
            return Duration::ZERO;
        }
        let malformed = &session.malformed_timestamps;
        if malformed.contains(&index) || malformed.contains(&(index - 1)) {
            return self.fallback;
        }
        let delta = session.messages[index].timestamp - session.messages[index - 1].timestamp;
        let seconds = delta.num_microseconds().unwrap_or(0) as f64 / 1_000_000.0 / speed;
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

pub struct SessionPlayer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPlayer {
    pub fn new(client: Arc<FactoryClient>, config: &SessionConfig) -> Self {
        let (status_tx, _) = watch::channel(PlayerStatus {
            state: PlaybackState::Idle,
            current_index: 0,
            total: 0,
            published: 0,
            failed: 0,
        });
        Self {
            shared: Arc::new(Shared {
                client,
                session: RwLock::new(Arc::new(LoadedSession::default())),
                current_index: AtomicUsize::new(0),
                is_playing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                rewinds: AtomicU64::new(0),
                cursor: Mutex::new(()),
                published: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                wake: Notify::new(),
                status_tx,
                state: Mutex::new(PlaybackState::Idle),
                fallback: Duration::from_millis(config.fallback_interval_ms),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Load a `.log` or `.db` session. Problems are logged, never raised.
    pub fn load(&self, path: &Path) -> bool {
        match load_session(path) {
            Ok(session) if session.is_empty() => {
                warn!(target: "player", path = %path.display(), "Session contains no messages");
                false
            }
            Ok(session) => {
                info!(
                    target: "player",
                    path = %path.display(),
                    messages = session.len(),
                    malformed_timestamps = session.malformed_timestamps.len(),
                    "Session loaded"
                );
                self.load_session(session);
                true
            }
            Err(e) => {
                warn!(target: "player", path = %path.display(), error = %e, "Cannot load session");
                false
            }
        }
    }

    pub fn load_session(&self, session: LoadedSession) {
        self.halt();
        *self.shared.session.write() = Arc::new(session);
        self.shared.rewind();
        self.shared.published.store(0, Ordering::Relaxed);
        self.shared.failed.store(0, Ordering::Relaxed);
        self.shared.set_state(PlaybackState::Idle);
    }

    pub fn load_messages(&self, messages: Vec<MqttMessage>) {
        self.load_session(LoadedSession::from_messages(messages));
    }

    /// Replay from the current index on a dedicated task
    pub fn start(&self, speed: f64, looping: bool) -> Result<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(OrbisError::State(format!("invalid replay speed {speed}")));
        }
        if self.shared.is_playing.load(Ordering::SeqCst) {
            debug!(target: "player", "Replay already running");
            return Ok(());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.is_playing.store(true, Ordering::SeqCst);
        self.shared.set_state(PlaybackState::Playing);
        info!(target: "player", speed, looping, "Replay started");

        let shared = self.shared.clone();
        let previous = self.worker.lock().take();
        let handle = tokio::spawn(async move {
            // a paused worker may still be finishing its last publish
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            run(shared, generation, speed, looping).await;
        });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn halt(&self) {
        self.shared.is_playing.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    /// Suspend without resetting the position
    pub fn pause(&self) {
        if self.shared.is_playing.load(Ordering::SeqCst) {
            self.halt();
            self.shared.set_state(PlaybackState::Paused);
            info!(target: "player", index = self.current_index(), "Replay paused");
        }
    }

    /// Suspend and rewind to the first message
    pub fn stop(&self) {
        self.halt();
        self.shared.rewind();
        self.shared.set_state(PlaybackState::Stopped);
        info!(target: "player", "Replay stopped");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.is_playing.load(Ordering::SeqCst)
    }

    pub fn current_index(&self) -> usize {
        self.shared.current_index.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.shared.session.read().len()
    }

    pub fn status(&self) -> PlayerStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn progress(&self) -> f64 {
        self.status().progress()
    }

    /// Change notifications for UIs
    pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Wait for the current worker to exit
    pub async fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(target: "player", error = %e, "Replay worker failed");
            }
        }
    }
}

impl Drop for SessionPlayer {
    fn drop(&mut self) {
        self.halt();
    }
}

async fn run(shared: Arc<Shared>, generation: u64, speed: f64, looping: bool) {
    let session = shared.session.read().clone();
    let total = session.len();

    loop {
        while shared.running(generation) {
            let (index, epoch) = shared.position();
            if index >= total {
                break;
            }

            let delay = shared.delay_before(&session, index, speed);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            if !shared.running(generation) {
                return;
            }

            let message = &session.messages[index];
            if shared.client.publish_message(message).await {
                shared.published.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.failed.fetch_add(1, Ordering::Relaxed);
            }
            if !shared.advance(index, epoch) {
                return;
            }
            shared.broadcast();
        }

        if !shared.running(generation) {
            return;
        }
        if looping && total > 0 {
            debug!(target: "player", "Replay looping");
            shared.rewind();
            continue;
        }

        shared.is_playing.store(false, Ordering::SeqCst);
        shared.set_state(PlaybackState::Completed);
        info!(
            target: "player",
            published = shared.published.load(Ordering::Relaxed),
            failed = shared.failed.load(Ordering::Relaxed),
            "Replay completed"
        );
        return;
    }
}
