// Observation pump: feeds buffered bus traffic into the managers
//
// The broker I/O task only appends to ring buffers. The pump reads new entries
// by sequence number on the caller's tick, so managers are never called from
// the I/O task.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controllers::ControllerRegistry;
use crate::inventory::{InventoryView, STOCK_TOPIC};
use crate::message::{MqttMessage, QoS};
use crate::mqtt::FactoryClient;
use crate::orders::OrderManager;
use crate::Result;

pub const OBSERVED_FILTERS: &[&str] = &[
    "module/v1/ff/+/factsheet",
    "module/v1/ff/+/state",
    "fts/v1/ff/+/factsheet",
    "fts/v1/ff/+/state",
    "ccu/order/response",
    STOCK_TOPIC,
];

const ORDER_RESPONSE_TOPIC: &str = "ccu/order/response";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub processed: usize,
    pub malformed: usize,
    pub orders_updated: usize,
    pub controllers_updated: usize,
    pub inventory_updates: usize,
    /// Entries evicted from a ring buffer before the pump saw them
    pub missed: u64,
}

impl PumpStats {
    fn absorb(&mut self, other: PumpStats) {
        self.processed += other.processed;
        self.malformed += other.malformed;
        self.orders_updated += other.orders_updated;
        self.controllers_updated += other.controllers_updated;
        self.inventory_updates += other.inventory_updates;
        self.missed += other.missed;
    }
}

pub struct ObservationPump {
    client: Arc<FactoryClient>,
    orders: Arc<OrderManager>,
    controllers: Arc<ControllerRegistry>,
    inventory: Arc<InventoryView>,
    cursors: Mutex<HashMap<String, u64>>,
    totals: Mutex<PumpStats>,
}

impl ObservationPump {
    pub fn new(
        client: Arc<FactoryClient>,
        orders: Arc<OrderManager>,
        controllers: Arc<ControllerRegistry>,
        inventory: Arc<InventoryView>,
    ) -> Self {
        Self {
            client,
            orders,
            controllers,
            inventory,
            cursors: Mutex::new(HashMap::new()),
            totals: Mutex::new(PumpStats::default()),
        }
    }

    pub async fn subscribe(&self) -> Result<()> {
        let added = self.client.subscribe_many(OBSERVED_FILTERS, QoS::AtLeastOnce).await?;
        debug!(target: "pump", added, "Observation filters registered");
        Ok(())
    }

    /// Drain everything that arrived since the previous tick
    pub fn tick(&self) -> PumpStats {
        let mut stats = PumpStats::default();
        for filter in OBSERVED_FILTERS {
            let snapshot = self.client.get_buffer(filter);
            let cursor = self.cursors.lock().get(*filter).copied().unwrap_or(0);

            if let Some(first) = snapshot.entries.first() {
                if first.seq > cursor + 1 {
                    let missed = first.seq - cursor - 1;
                    warn!(
                        target: "pump",
                        filter = %filter,
                        missed,
                        "Buffer evicted entries before they were observed"
                    );
                    stats.missed += missed;
                }
            }

            let mut last = cursor;
            for entry in snapshot.since(cursor) {
                self.dispatch(&entry.message, &mut stats);
                last = entry.seq;
            }
            if last != cursor {
                self.cursors.lock().insert(filter.to_string(), last);
            }
        }

        self.totals.lock().absorb(stats);
        stats
    }

    fn dispatch(&self, message: &MqttMessage, stats: &mut PumpStats) {
        stats.processed += 1;
        let Some(payload) = message.payload_json() else {
            debug!(target: "pump", topic = %message.topic, "Skipping non-JSON payload");
            stats.malformed += 1;
            return;
        };
        let topic = message.topic.as_str();

        if topic == ORDER_RESPONSE_TOPIC {
            stats.orders_updated += self.orders.process_order_response(&payload) as usize;
        } else if topic == STOCK_TOPIC {
            stats.inventory_updates += self.inventory.process_stock_message(&payload) as usize;
        } else if topic.ends_with("/factsheet") {
            let discovered = self.controllers.process_factsheet_message(topic, &payload);
            stats.controllers_updated += discovered.is_some() as usize;
        } else if topic.ends_with("/state") {
            let updated = self.controllers.process_state_message(topic, &payload);
            stats.controllers_updated += updated.is_some() as usize;
            if has_order_id(&payload) {
                stats.orders_updated += self.orders.process_state_message(&payload) as usize;
            }
        }
    }

    /// Totals over every tick so far
    pub fn totals(&self) -> PumpStats {
        *self.totals.lock()
    }

    /// Tick on a fixed interval until the returned task is aborted
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }
}

fn has_order_id(payload: &Value) -> bool {
    payload
        .get("orderId")
        .and_then(Value::as_str)
        .map_or(false, |id| !id.is_empty())
}
