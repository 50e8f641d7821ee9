// MQTT 3.1.1 transport on top of rumqttc's tokio event loop
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};

use super::transport::{MessageSink, Transport};
use crate::config::BrokerConfig;
use crate::message::{MqttMessage, QoS};
use crate::{OrbisError, Result};

const REQUEST_CHANNEL_CAPACITY: usize = 256;
const CONNECT_WAIT: Duration = Duration::from_secs(5);

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

struct PendingPublish {
    id: u64,
    qos: QoS,
    ack: oneshot::Sender<bool>,
}

/// State shared between the transport handle and its event loop task
#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    shutdown: AtomicBool,
    next_pending: AtomicU64,
    subscriptions: DashMap<String, QoS>,
    // Publishes handed to rumqttc but not yet assigned a packet id
    pending: Mutex<VecDeque<PendingPublish>>,
    // Packet id -> waiter for PubAck/PubComp
    inflight: DashMap<u16, oneshot::Sender<bool>>,
}

impl LinkState {
    fn on_outgoing_publish(&self, pkid: u16) {
        // Retransmission of a packet we already track
        if pkid != 0 && self.inflight.contains_key(&pkid) {
            return;
        }
        let Some(pending) = self.pending.lock().pop_front() else {
            return;
        };
        match pending.qos {
            QoS::AtMostOnce => {
                let _ = pending.ack.send(true);
            }
            _ => {
                self.inflight.insert(pkid, pending.ack);
            }
        }
    }

    fn resolve(&self, pkid: u16, acknowledged: bool) {
        if let Some((_, ack)) = self.inflight.remove(&pkid) {
            let _ = ack.send(acknowledged);
        }
    }

    fn enqueue(&self, qos: QoS, ack: oneshot::Sender<bool>) -> u64 {
        let id = self.next_pending.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back(PendingPublish { id, qos, ack });
        id
    }

    /// Forget a waiter whose request never reached rumqttc
    fn withdraw(&self, id: u64) {
        self.pending.lock().retain(|p| p.id != id);
    }

    fn fail_all(&self) {
        let keys: Vec<u16> = self.inflight.iter().map(|e| *e.key()).collect();
        for pkid in keys {
            self.resolve(pkid, false);
        }
        for pending in self.pending.lock().drain(..) {
            let _ = pending.ack.send(false);
        }
    }
}

/// Withdraws a queued waiter unless the request was handed to rumqttc.
/// Covers both a failed send and a publish future dropped mid-send.
struct PendingGuard<'a> {
    state: &'a LinkState,
    id: u64,
    sent: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.state.withdraw(self.id);
        }
    }
}

/// Live broker connection
pub struct RumqttTransport {
    config: BrokerConfig,
    state: Arc<LinkState>,
    client: Mutex<Option<AsyncClient>>,
    task: Mutex<Option<JoinHandle<()>>>,
    // Serializes enqueue + publish so packet ids map onto waiters in order
    publish_lock: tokio::sync::Mutex<()>,
}

impl RumqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Arc::new(LinkState::default()),
            client: Mutex::new(None),
            task: Mutex::new(None),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.effective_host(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(user) = &self.config.username {
            options.set_credentials(user.clone(), self.config.password.clone().unwrap_or_default());
        }
        options
    }

    fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| OrbisError::Transport("transport not started".into()))
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, sink: MessageSink) -> Result<()> {
        {
            let mut task = self.task.lock();
            if task.is_none() {
                let (client, eventloop) =
                    AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);
                *self.client.lock() = Some(client.clone());
                self.state.shutdown.store(false, Ordering::SeqCst);
                let backoff = Duration::from_millis(self.config.connect_backoff_ms.max(100));
                *task = Some(tokio::spawn(run_event_loop(
                    eventloop,
                    client,
                    self.state.clone(),
                    sink,
                    backoff,
                )));
            }
        }

        let state = self.state.clone();
        let wait = async move {
            while !state.connected.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(50)).await;
            }
        };
        timeout(CONNECT_WAIT, wait).await.map_err(|_| {
            OrbisError::Transport(format!(
                "broker {}:{} not reachable",
                self.config.effective_host(),
                self.config.port
            ))
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::SeqCst);
        let client = self.client.lock().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.fail_all();
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.state.subscriptions.insert(filter.to_string(), qos);
        self.client()?
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| OrbisError::Transport(format!("subscribe {filter}: {e}")))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.state.subscriptions.remove(filter);
        self.client()?
            .unsubscribe(filter)
            .await
            .map_err(|e| OrbisError::Transport(format!("unsubscribe {filter}: {e}")))
    }

    async fn publish(&self, message: &MqttMessage) -> Result<bool> {
        if !self.is_connected() {
            return Err(OrbisError::Transport("not connected".into()));
        }
        let client = self.client()?;
        let (tx, rx) = oneshot::channel();
        {
            let _lock = self.publish_lock.lock().await;
            let mut pending = PendingGuard {
                state: &self.state,
                id: self.state.enqueue(message.qos, tx),
                sent: false,
            };
            client
                .publish(
                    message.topic.clone(),
                    message.qos.into(),
                    message.retain,
                    message.payload.clone(),
                )
                .await
                .map_err(|e| OrbisError::Transport(format!("publish {}: {e}", message.topic)))?;
            pending.sent = true;
        }
        Ok(rx.await.unwrap_or(false))
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

/// Drive the rumqttc event loop. Inbound publishes go straight to the sink;
/// only connection transitions are logged.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<LinkState>,
    sink: MessageSink,
    backoff: Duration,
) {
    let mut delay = backoff;
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                sink(MqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos.into(),
                    retain: publish.retain,
                    timestamp: Utc::now(),
                });
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                state.connected.store(true, Ordering::SeqCst);
                delay = backoff;
                info!(
                    target: "mqtt",
                    subscriptions = state.subscriptions.len(),
                    "Connected to broker"
                );
                for sub in state.subscriptions.iter() {
                    let _ = client.try_subscribe(sub.key().clone(), (*sub.value()).into());
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => state.resolve(ack.pkid, true),
            Ok(Event::Incoming(Packet::PubComp(comp))) => state.resolve(comp.pkid, true),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state.connected.store(false, Ordering::SeqCst);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => state.on_outgoing_publish(pkid),
            Ok(_) => {}
            Err(e) => {
                if state.connected.swap(false, Ordering::SeqCst) {
                    warn!(target: "mqtt", error = %e, "Connection to broker lost; reconnecting");
                }
                state.fail_all();
                if state.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_send_does_not_steal_the_next_ack() {
        let state = LinkState::default();

        let (stale_tx, _stale_rx) = oneshot::channel();
        {
            // dropped unsent, as when rumqttc rejects the request
            let _pending = PendingGuard {
                state: &state,
                id: state.enqueue(QoS::AtLeastOnce, stale_tx),
                sent: false,
            };
        }
        assert!(state.pending.lock().is_empty());

        let (tx, mut rx) = oneshot::channel();
        let mut pending = PendingGuard {
            state: &state,
            id: state.enqueue(QoS::AtLeastOnce, tx),
            sent: false,
        };
        pending.sent = true;
        drop(pending);

        state.on_outgoing_publish(7);
        state.resolve(7, true);
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn withdraw_only_removes_its_own_waiter() {
        let state = LinkState::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, _second_rx) = oneshot::channel();
        let first = state.enqueue(QoS::AtMostOnce, first_tx);
        let second = state.enqueue(QoS::AtMostOnce, second_tx);
        assert_ne!(first, second);

        state.withdraw(second);
        state.on_outgoing_publish(0);
        assert_eq!(first_rx.try_recv(), Ok(true));
        assert!(state.pending.lock().is_empty());
    }
}
