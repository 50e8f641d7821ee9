// Broker transport seam and the in-process loopback used for mock mode and tests
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::message::{topic_matches, MqttMessage, QoS};
use crate::{OrbisError, Result};

/// Callback invoked by the transport's I/O task for every inbound message.
///
/// Implementations must only append to buffers: no logging, no publishing,
/// no calls into managers.
pub type MessageSink = Arc<dyn Fn(MqttMessage) + Send + Sync>;

/// Connection to one broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session and start delivering inbound messages to `sink`.
    /// Returns once connected or with a `Transport` error.
    async fn connect(&self, sink: MessageSink) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Publish and wait for the broker acknowledgement appropriate to the QoS.
    /// `Ok(false)` means the broker did not acknowledge.
    async fn publish(&self, message: &MqttMessage) -> Result<bool>;

    fn is_connected(&self) -> bool;
}

/// Loopback broker: published messages are delivered back to the sink when a
/// subscription matches; tests inject inbound traffic directly.
pub struct MockTransport {
    connected: AtomicBool,
    loopback: bool,
    acknowledge: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    sink: Mutex<Option<MessageSink>>,
    subscriptions: DashMap<String, QoS>,
    published: Mutex<Vec<MqttMessage>>,
    publish_delay: Mutex<Duration>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            loopback: true,
            acknowledge: AtomicBool::new(true),
            failing_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            sink: Mutex::new(None),
            subscriptions: DashMap::new(),
            published: Mutex::new(Vec::new()),
            publish_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Record publications without echoing them to subscribers
    pub fn without_loopback() -> Self {
        Self {
            loopback: false,
            ..Self::new()
        }
    }

    /// Fail the next `n` connection attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_acknowledge(&self, ack: bool) {
        self.acknowledge.store(ack, Ordering::SeqCst);
    }

    /// Hold every publish for `delay` before it reaches the broker
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = delay;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulate a broker-side connection loss; subscriptions are forgotten as
    /// with a clean session.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
    }

    /// Deliver an inbound message as if the broker sent it.
    /// Returns false when not connected or no subscription matches.
    pub fn inject(&self, message: MqttMessage) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let matched = self
            .subscriptions
            .iter()
            .any(|s| topic_matches(s.key(), &message.topic));
        if !matched {
            return false;
        }
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink(message);
                true
            }
            None => false,
        }
    }

    pub fn published(&self) -> Vec<MqttMessage> {
        self.published.lock().clone()
    }

    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        subs.sort();
        subs
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, sink: MessageSink) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(OrbisError::Transport("mock broker refused connection".into()));
        }
        *self.sink.lock() = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(OrbisError::Transport("not connected".into()));
        }
        self.subscriptions.insert(filter.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscriptions.remove(filter);
        Ok(())
    }

    async fn publish(&self, message: &MqttMessage) -> Result<bool> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(OrbisError::Transport("not connected".into()));
        }
        let delay = *self.publish_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.published.lock().push(message.clone());
        if self.loopback {
            let mut echoed = message.clone();
            echoed.timestamp = Utc::now();
            self.inject(echoed);
        }
        Ok(self.acknowledge.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
