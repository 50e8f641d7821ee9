// Warehouse inventory derived from `ccu/state/stock`
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const STOCK_TOPIC: &str = "ccu/state/stock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workpiece {
    pub id: String,
    #[serde(rename = "type")]
    pub color: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSlot {
    pub location: String,
    #[serde(default)]
    pub workpiece: Option<Workpiece>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockMessage {
    #[serde(default)]
    stock_items: Vec<StockSlot>,
}

#[derive(Debug, Default)]
struct Snapshot {
    slots: Vec<StockSlot>,
    updated_at: Option<DateTime<Utc>>,
}

/// Latest stock picture; each message replaces the previous one
#[derive(Debug, Default)]
pub struct InventoryView {
    snapshot: RwLock<Snapshot>,
}

impl InventoryView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the payload is not a stock message
    pub fn process_stock_message(&self, payload: &Value) -> bool {
        if payload.get("stockItems").is_none() {
            return false;
        }
        let stock = match StockMessage::deserialize(payload) {
            Ok(stock) => stock,
            Err(e) => {
                debug!(target: "inventory", error = %e, "Malformed stock message");
                return false;
            }
        };
        let mut slots = stock.stock_items;
        slots.sort_by(|a, b| a.location.cmp(&b.location));

        let mut snapshot = self.snapshot.write();
        snapshot.slots = slots;
        snapshot.updated_at = Some(Utc::now());
        true
    }

    pub fn slots(&self) -> Vec<StockSlot> {
        self.snapshot.read().slots.clone()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().updated_at
    }

    pub fn counts_by_color(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for workpiece in self.snapshot.read().slots.iter().filter_map(|s| s.workpiece.as_ref()) {
            *counts.entry(workpiece.color.clone()).or_default() += 1;
        }
        counts
    }

    pub fn free_slots(&self) -> Vec<String> {
        self.snapshot
            .read()
            .slots
            .iter()
            .filter(|s| s.workpiece.is_none())
            .map(|s| s.location.clone())
            .collect()
    }

    /// Slot holding the workpiece with this id
    pub fn find_workpiece(&self, id: &str) -> Option<StockSlot> {
        self.snapshot
            .read()
            .slots
            .iter()
            .find(|s| s.workpiece.as_ref().map_or(false, |w| w.id == id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn latest_stock_wins() {
        let view = InventoryView::new();
        assert!(!view.process_stock_message(&json!({"orderId": "x"})));
        assert!(view.updated_at().is_none());

        assert!(view.process_stock_message(&json!({
            "ts": "2025-03-01T10:00:00Z",
            "stockItems": [
                {"location": "B1", "workpiece": null},
                {"location": "A1", "workpiece": {"id": "04798eca341290", "type": "RED", "state": "RAW"}},
                {"location": "A2", "workpiece": {"id": "047389ca341291", "type": "BLUE", "state": "RAW"}},
                {"location": "A3", "workpiece": {"id": "047f8cca341290", "type": "RED", "state": "RAW"}}
            ]
        })));
        assert_eq!(view.counts_by_color()["RED"], 2);
        assert_eq!(view.free_slots(), vec!["B1"]);
        assert_eq!(view.find_workpiece("047389ca341291").unwrap().location, "A2");
        assert_eq!(view.slots()[0].location, "A1");

        assert!(view.process_stock_message(&json!({"stockItems": []})));
        assert!(view.counts_by_color().is_empty());
        assert!(view.find_workpiece("04798eca341290").is_none());
    }
}
