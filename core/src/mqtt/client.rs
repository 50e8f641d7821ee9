// Process-wide broker conduit: connection management, per-filter buffers, taps
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use super::buffer::{BufferSet, BufferSnapshot};
use super::transport::{MessageSink, Transport};
use crate::config::BrokerConfig;
use crate::message::{topic_matches, MqttMessage, OutboundMessage, QoS};
use crate::{OrbisError, Result};

/// Raw observer called from the broker I/O task. Must only append.
pub trait MessageTap: Send + Sync {
    fn on_message(&self, message: &MqttMessage);
}

struct TapEntry {
    filter: String,
    tap: Arc<dyn MessageTap>,
}

/// Client statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub connected: bool,
    pub buffered_filters: usize,
    pub active_taps: usize,
    pub publish_attempts: u64,
    pub publish_failures: u64,
}

pub struct FactoryClient {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    buffers: Arc<BufferSet>,
    taps: Arc<DashMap<u64, TapEntry>>,
    // filter -> qos for everything that must be (re)subscribed
    filters: DashMap<String, QoS>,
    next_tap_id: AtomicU64,
    publish_attempts: AtomicU64,
    publish_failures: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

impl FactoryClient {
    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        Self {
            transport,
            buffers: Arc::new(BufferSet::new(config.buffer_capacity)),
            config,
            taps: Arc::new(DashMap::new()),
            filters: DashMap::new(),
            next_tap_id: AtomicU64::new(1),
            publish_attempts: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The callback handed to the transport: fan out into buffers and taps
    fn sink(&self) -> MessageSink {
        let buffers = self.buffers.clone();
        let taps = self.taps.clone();
        Arc::new(move |message: MqttMessage| {
            buffers.deposit(&message);
            for entry in taps.iter() {
                if topic_matches(&entry.filter, &message.topic) {
                    entry.tap.on_message(&message);
                }
            }
        })
    }

    /// Connect with exponential backoff. Idempotent while connected.
    /// Every registered filter is subscribed again after a (re)connect.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.transport.is_connected() {
            return Ok(());
        }

        let attempts = self.config.connect_retries.max(1);
        let mut delay = Duration::from_millis(self.config.connect_backoff_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.connect(self.sink()).await {
                Ok(()) => {
                    info!(
                        target: "mqtt",
                        host = %self.config.effective_host(),
                        port = self.config.port,
                        attempt,
                        "Connected"
                    );
                    self.resubscribe().await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "mqtt", attempt, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| OrbisError::Transport("connect failed".into())))
    }

    async fn resubscribe(&self) {
        let filters: Vec<(String, QoS)> = self
            .filters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (filter, qos) in filters {
            if let Err(e) = self.transport.subscribe(&filter, qos).await {
                warn!(target: "mqtt", filter = %filter, error = %e, "Resubscribe failed");
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await?;
        info!(target: "mqtt", "Disconnected");
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Register filters, each with its own ring buffer. Already registered
    /// filters are left alone. Returns how many filters were new.
    pub async fn subscribe_many<S: AsRef<str>>(&self, filters: &[S], qos: QoS) -> Result<usize> {
        let mut added = 0;
        for filter in filters {
            let filter = filter.as_ref();
            if !self.buffers.register(filter) {
                continue;
            }
            added += 1;
            let newly_subscribed = self.filters.insert(filter.to_string(), qos).is_none();
            if newly_subscribed && self.connected() {
                self.transport.subscribe(filter, qos).await?;
            }
            debug!(target: "mqtt", filter = %filter, "Buffered subscription registered");
        }
        Ok(added)
    }

    /// Immutable snapshot of a filter's ring buffer; empty when never subscribed
    pub fn get_buffer(&self, filter: &str) -> BufferSnapshot {
        self.buffers.snapshot(filter)
    }

    pub fn buffered_filters(&self) -> Vec<String> {
        self.buffers.filters()
    }

    /// Observe every message matching `filter` from the I/O task
    pub async fn attach_tap(&self, filter: &str, tap: Arc<dyn MessageTap>) -> Result<u64> {
        let id = self.next_tap_id.fetch_add(1, Ordering::SeqCst);
        self.taps.insert(
            id,
            TapEntry {
                filter: filter.to_string(),
                tap,
            },
        );
        let newly_subscribed = self
            .filters
            .insert(filter.to_string(), QoS::AtLeastOnce)
            .is_none();
        if newly_subscribed && self.connected() {
            if let Err(e) = self.transport.subscribe(filter, QoS::AtLeastOnce).await {
                self.taps.remove(&id);
                self.filters.remove(filter);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Stop a tap; the broker subscription is dropped once nothing else uses the filter
    pub async fn detach_tap(&self, id: u64) -> Result<()> {
        let Some((_, entry)) = self.taps.remove(&id) else {
            return Ok(());
        };
        let still_used = self.buffers.contains(&entry.filter)
            || self.taps.iter().any(|t| t.filter == entry.filter);
        if !still_used {
            self.filters.remove(&entry.filter);
            if self.connected() {
                self.transport.unsubscribe(&entry.filter).await?;
            }
        }
        Ok(())
    }

    /// Best-effort publish. Returns whether the broker acknowledged within the
    /// configured timeout.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> bool {
        let message = MqttMessage::new(topic, payload).with_qos(qos).with_retain(retain);
        self.publish_message(&message).await
    }

    pub async fn publish_message(&self, message: &MqttMessage) -> bool {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);

        if !self.connected() {
            if let Err(e) = self.connect().await {
                warn!(
                    target: "mqtt",
                    topic = %message.topic,
                    error = %e,
                    "Publish skipped: broker unavailable"
                );
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let publish = self.transport.publish(message);
        let acknowledged = match timeout(self.config.publish_timeout(), publish).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                warn!(target: "mqtt", topic = %message.topic, error = %e, "Publish failed");
                false
            }
            Err(_) => {
                warn!(
                    target: "mqtt",
                    topic = %message.topic,
                    timeout_ms = self.config.publish_timeout_ms,
                    "Publish timed out"
                );
                false
            }
        };

        if !acknowledged {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
        acknowledged
    }

    pub async fn publish_outbound(&self, outbound: &OutboundMessage) -> bool {
        self.publish_message(&outbound.to_message()).await
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connected: self.connected(),
            buffered_filters: self.buffers.filters().len(),
            active_taps: self.taps.len(),
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
