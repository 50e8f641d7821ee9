// VDA 5050 order manager
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{cutoff, span_hours, system_clock, SharedClock};
use crate::message::{iso_timestamp_now, OutboundMessage, QoS};
use crate::{OrbisError, Result};

pub const ORDER_REQUEST_TOPIC: &str = "ccu/order/request";
pub const DEFAULT_COLORS: [&str; 3] = ["RED", "BLUE", "WHITE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderAction {
    Storage,
    Retrieval,
    Transport,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Storage => "STORAGE",
            OrderAction::Retrieval => "RETRIEVAL",
            OrderAction::Transport => "TRANSPORT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Running => "RUNNING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    /// Map a response-level `status` string
    pub fn from_response(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "CREATED" | "ENQUEUED" | "WAITING" => Some(OrderStatus::Created),
            "RUNNING" | "IN_PROGRESS" | "STARTED" => Some(OrderStatus::Running),
            "COMPLETED" | "FINISHED" => Some(OrderStatus::Completed),
            "CANCELLED" | "CANCELED" => Some(OrderStatus::Cancelled),
            "FAILED" | "ERROR" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    /// Map a VDA 5050 `actionState.state`. WAITING keeps the order as created.
    pub fn from_action_state(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "WAITING" => Some(OrderStatus::Created),
            "INITIALIZING" | "RUNNING" | "PAUSED" => Some(OrderStatus::Running),
            "FINISHED" => Some(OrderStatus::Completed),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published on `ccu/order/request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: String,
    pub timestamp: String,
    pub action: OrderAction,
    #[serde(rename = "type")]
    pub color: String,
    pub workpiece_id: String,
    pub order_update_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_module: Option<String>,
}

impl OrderRequest {
    pub fn to_outbound(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage::new(
            ORDER_REQUEST_TOPIC,
            serde_json::to_value(self)?,
            QoS::AtLeastOnce,
        ))
    }
}

/// Untracked VDA 5050 instant action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantAction {
    pub header_id: u64,
    pub timestamp: String,
    pub version: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub actions: Vec<InstantActionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantActionItem {
    pub action_id: String,
    pub action_type: String,
    pub blocking_type: String,
    #[serde(default)]
    pub action_parameters: Value,
}

impl InstantAction {
    /// Addressed modules receive it on their own topic, everything else goes to the CCU
    pub fn topic(&self) -> String {
        if self.serial_number.is_empty() {
            "ccu/instantAction".to_string()
        } else {
            format!("module/v1/ff/{}/instantAction", self.serial_number)
        }
    }

    pub fn to_outbound(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage::new(
            self.topic(),
            serde_json::to_value(self)?,
            QoS::AtLeastOnce,
        ))
    }
}

/// Tracking record for one order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub action: OrderAction,
    pub color: String,
    pub workpiece_id: String,
    pub order_update_id: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: OrderStatus,
    pub response: Option<Value>,
    pub state: Option<Value>,
    pub action_state: Option<Value>,
    pub action_states: Vec<Value>,
    pub errors: Vec<Value>,
    pub target_module: Option<String>,
    pub source_module: Option<String>,
    pub result: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderStats {
    pub active: usize,
    pub history: usize,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_color: BTreeMap<String, usize>,
}

fn order_id_of(payload: &Value) -> Option<&str> {
    ["orderId", "order_id"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
}

fn array_of(payload: &Value, key: &str) -> Vec<Value> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub struct OrderManager {
    active: Mutex<HashMap<String, OrderRecord>>,
    history: Mutex<Vec<OrderRecord>>,
    colors: Vec<String>,
    clock: SharedClock,
    next_header_id: Mutex<u64>,
}

impl Default for OrderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderManager {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            colors: DEFAULT_COLORS.iter().map(|c| c.to_string()).collect(),
            clock,
            next_header_id: Mutex::new(0),
        }
    }

    /// Replace the accepted workpiece colors
    pub fn with_colors<S: Into<String>>(mut self, colors: impl IntoIterator<Item = S>) -> Self {
        self.colors = colors.into_iter().map(Into::into).collect();
        self
    }

    pub fn colors(&self) -> &[String] {
        &self.colors
    }

    fn normalize_color(&self, color: &str) -> Result<String> {
        let upper = color.trim().to_ascii_uppercase();
        if self.colors.contains(&upper) {
            Ok(upper)
        } else {
            Err(OrbisError::Protocol {
                topic: ORDER_REQUEST_TOPIC.to_string(),
                reason: format!("invalid color '{color}', expected one of {:?}", self.colors),
            })
        }
    }

    pub fn create_storage_order(
        &self,
        color: &str,
        workpiece_id: Option<&str>,
        target_module: Option<&str>,
    ) -> Result<OrderRequest> {
        self.create_order(OrderAction::Storage, color, workpiece_id, target_module, None)
    }

    pub fn create_retrieval_order(
        &self,
        color: &str,
        workpiece_id: Option<&str>,
        source_module: Option<&str>,
    ) -> Result<OrderRequest> {
        self.create_order(OrderAction::Retrieval, color, workpiece_id, None, source_module)
    }

    fn create_order(
        &self,
        action: OrderAction,
        color: &str,
        workpiece_id: Option<&str>,
        target_module: Option<&str>,
        source_module: Option<&str>,
    ) -> Result<OrderRequest> {
        let color = self.normalize_color(color)?;
        let now = self.clock.now();
        let workpiece_id = workpiece_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("WP_{color}_{}", now.timestamp()));

        let request = OrderRequest {
            order_id: Uuid::new_v4().to_string(),
            timestamp: iso_timestamp_now(),
            action,
            color: color.clone(),
            workpiece_id: workpiece_id.clone(),
            order_update_id: 0,
            target_module: target_module.map(str::to_string),
            source_module: source_module.map(str::to_string),
        };

        let record = OrderRecord {
            order_id: request.order_id.clone(),
            action,
            color,
            workpiece_id,
            order_update_id: 0,
            created_at: now,
            last_updated: now,
            status: OrderStatus::Created,
            response: None,
            state: None,
            action_state: None,
            action_states: Vec::new(),
            errors: Vec::new(),
            target_module: request.target_module.clone(),
            source_module: request.source_module.clone(),
            result: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        };

        info!(
            target: "orders",
            order_id = %record.order_id,
            action = action.as_str(),
            color = %record.color,
            "Order created"
        );
        self.active.lock().insert(record.order_id.clone(), record);
        Ok(request)
    }

    /// Build an instant action. Not tracked as an order.
    pub fn send_instant_action(
        &self,
        action_type: &str,
        params: Option<Value>,
        target_module: Option<&str>,
    ) -> InstantAction {
        let header_id = {
            let mut next = self.next_header_id.lock();
            *next += 1;
            *next
        };
        let action = InstantAction {
            header_id,
            timestamp: iso_timestamp_now(),
            version: "2.0.0".to_string(),
            manufacturer: "Fischertechnik".to_string(),
            serial_number: target_module.unwrap_or_default().to_string(),
            actions: vec![InstantActionItem {
                action_id: Uuid::new_v4().to_string(),
                action_type: action_type.to_string(),
                blocking_type: "NONE".to_string(),
                action_parameters: params.unwrap_or_else(|| Value::Object(Map::new())),
            }],
        };
        debug!(target: "orders", action_type, topic = %action.topic(), "Instant action built");
        action
    }

    /// Correlate a `ccu/order/response`. Returns false for unknown orders.
    pub fn process_order_response(&self, payload: &Value) -> bool {
        let Some(order_id) = order_id_of(payload) else {
            debug!(target: "orders", "Order response without orderId");
            return false;
        };
        let now = self.clock.now();
        let mut active = self.active.lock();
        let Some(record) = active.get_mut(order_id) else {
            warn!(target: "orders", order_id = %order_id, "Response for unknown order ignored");
            return false;
        };

        record.response = Some(payload.clone());
        record.last_updated = now;
        if let Some(update_id) = payload.get("orderUpdateId").and_then(Value::as_u64) {
            record.order_update_id = update_id;
        }
        if let Some(status) = payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(OrderStatus::from_response)
        {
            record.status = status;
        }
        debug!(
            target: "orders",
            order_id = %order_id,
            status = %record.status,
            "Order response applied"
        );
        true
    }

    /// Correlate a module/FTS state message carrying an `orderId`
    pub fn process_state_message(&self, payload: &Value) -> bool {
        let Some(order_id) = order_id_of(payload) else {
            return false;
        };
        let now = self.clock.now();
        let mut active = self.active.lock();
        let Some(record) = active.get_mut(order_id) else {
            debug!(target: "orders", order_id = %order_id, "State for untracked order ignored");
            return false;
        };

        record.state = Some(payload.clone());
        record.last_updated = now;
        record.action_states = array_of(payload, "actionStates");
        record.errors = array_of(payload, "errors");
        record.action_state = payload.get("actionState").cloned();

        if let Some(status) = record
            .action_state
            .as_ref()
            .and_then(|s| s.get("state"))
            .and_then(Value::as_str)
            .and_then(OrderStatus::from_action_state)
        {
            record.status = status;
        }
        true
    }

    /// Move an active order to history as COMPLETED
    pub fn complete_order(&self, order_id: &str, result: Option<Value>) -> bool {
        let Some(mut record) = self.active.lock().remove(order_id) else {
            warn!(target: "orders", order_id = %order_id, "Cannot complete unknown order");
            return false;
        };
        let now = self.clock.now();
        record.status = OrderStatus::Completed;
        record.completed_at = Some(now);
        record.last_updated = now;
        record.result = result;
        info!(target: "orders", order_id = %order_id, "Order completed");
        self.history.lock().push(record);
        true
    }

    /// Mark an active order CANCELLED. The record stays in the active map.
    pub fn cancel_order(&self, order_id: &str, reason: Option<&str>) -> bool {
        let now = self.clock.now();
        let mut active = self.active.lock();
        let Some(record) = active.get_mut(order_id) else {
            warn!(target: "orders", order_id = %order_id, "Cannot cancel unknown order");
            return false;
        };
        record.status = OrderStatus::Cancelled;
        record.cancelled_at = Some(now);
        record.last_updated = now;
        record.cancellation_reason = reason.map(str::to_string);
        info!(
            target: "orders",
            order_id = %order_id,
            reason = reason.unwrap_or(""),
            "Order cancelled"
        );
        true
    }

    pub fn get_order(&self, order_id: &str) -> Option<OrderRecord> {
        if let Some(record) = self.active.lock().get(order_id) {
            return Some(record.clone());
        }
        self.history
            .lock()
            .iter()
            .find(|r| r.order_id == order_id)
            .cloned()
    }

    pub fn is_active(&self, order_id: &str) -> bool {
        self.active.lock().contains_key(order_id)
    }

    /// Active orders sorted by creation time
    pub fn active_orders(&self) -> Vec<OrderRecord> {
        let mut orders: Vec<_> = self.active.lock().values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.order_id.cmp(&b.order_id)));
        orders
    }

    pub fn order_history(&self) -> Vec<OrderRecord> {
        self.history.lock().clone()
    }

    fn all_orders(&self) -> Vec<OrderRecord> {
        let mut orders = self.active_orders();
        orders.extend(self.order_history());
        orders
    }

    pub fn orders_by_color(&self, color: &str) -> Vec<OrderRecord> {
        let color = color.to_ascii_uppercase();
        self.all_orders().into_iter().filter(|o| o.color == color).collect()
    }

    pub fn orders_by_status(&self, status: OrderStatus) -> Vec<OrderRecord> {
        self.all_orders().into_iter().filter(|o| o.status == status).collect()
    }

    pub fn statistics(&self) -> OrderStats {
        let active = self.active.lock().len();
        let history = self.history.lock().len();
        let mut stats = OrderStats {
            active,
            history,
            total: active + history,
            ..Default::default()
        };
        for order in self.all_orders() {
            *stats.by_status.entry(order.status.to_string()).or_default() += 1;
            *stats.by_color.entry(order.color).or_default() += 1;
        }
        stats
    }

    /// Structural check of an order envelope. Handles both the CCU request
    /// shape and the FTS navigation order shape (`nodes`/`edges`).
    pub fn validate_order(&self, order: &Value) -> Vec<String> {
        if order.get("nodes").is_some() || order.get("edges").is_some() {
            return validate_navigation_order(order);
        }

        let mut errors = Vec::new();
        for field in ["orderId", "timestamp", "action", "type", "workpieceId", "orderUpdateId"] {
            if order.get(field).is_none() {
                errors.push(format!("missing required field '{field}'"));
            }
        }
        if let Some(action) = order.get("action") {
            if serde_json::from_value::<OrderAction>(action.clone()).is_err() {
                errors.push(format!("invalid action {action}"));
            }
        }
        if let Some(color) = order.get("type") {
            let known = color.as_str().map_or(false, |c| self.colors.iter().any(|k| k == c));
            if !known {
                errors.push(format!("invalid type {color}"));
            }
        }
        if let Some(update) = order.get("orderUpdateId") {
            if update.as_u64().is_none() {
                errors.push("orderUpdateId must be a non-negative integer".to_string());
            }
        }
        errors
    }

    /// Drop history entries completed more than `older_than_hours` ago
    pub fn clear_completed_orders(&self, older_than_hours: i64) -> usize {
        let cutoff = cutoff(self.clock.now(), span_hours(older_than_hours));
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|r| r.completed_at.unwrap_or(r.last_updated) >= cutoff);
        let removed = before - history.len();
        if removed > 0 {
            info!(target: "orders", removed, "Completed orders purged");
        }
        removed
    }

    /// Snapshot suitable for dashboards
    pub fn summary(&self) -> Value {
        json!({
            "statistics": self.statistics(),
            "active": self.active_orders(),
        })
    }
}

fn validate_navigation_order(order: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    for field in ["timestamp", "orderId", "orderUpdateId", "nodes", "edges", "serialNumber"] {
        if order.get(field).is_none() {
            errors.push(format!("missing required field '{field}'"));
        }
    }

    let nodes = order.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();
    let edges = order.get("edges").and_then(Value::as_array).cloned().unwrap_or_default();

    let node_ids: HashSet<&str> = nodes.iter().filter_map(|n| n.get("id")?.as_str()).collect();
    let edge_ids: HashSet<&str> = edges.iter().filter_map(|e| e.get("id")?.as_str()).collect();

    // node id -> edges that name it as an endpoint
    let mut incident: HashMap<&str, HashSet<&str>> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        let Some(edge_id) = edge.get("id").and_then(Value::as_str) else {
            errors.push(format!("edge {i} has no id"));
            continue;
        };
        let linked: Vec<&str> = edge
            .get("linkedNodes")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if linked.len() != 2 {
            errors.push(format!("edge '{edge_id}' must link exactly two nodes"));
        }
        for node in linked {
            if !node_ids.contains(node) {
                errors.push(format!("edge '{edge_id}' links unknown node '{node}'"));
            }
            incident.entry(node).or_default().insert(edge_id);
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        let Some(node_id) = node.get("id").and_then(Value::as_str) else {
            errors.push(format!("node {i} has no id"));
            continue;
        };
        let linked: HashSet<&str> = node
            .get("linkedEdges")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for edge in &linked {
            if !edge_ids.contains(edge) {
                errors.push(format!("node '{node_id}' links unknown edge '{edge}'"));
            }
        }
        let expected = incident.get(node_id).cloned().unwrap_or_default();
        if linked != expected {
            errors.push(format!("node '{node_id}' linkedEdges do not match its incident edges"));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn manager() -> (OrderManager, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc::now());
        (OrderManager::with_clock(clock.clone()), clock)
    }

    #[test]
    fn rejects_unknown_colors() {
        let (orders, _) = manager();
        assert!(orders.create_storage_order("GREEN", None, None).is_err());
        let request = orders.create_storage_order("blue", None, None).unwrap();
        assert_eq!(request.color, "BLUE");
        assert!(request.workpiece_id.starts_with("WP_BLUE_"));
    }

    #[test]
    fn state_message_derives_status() {
        let (orders, _) = manager();
        let request = orders.create_retrieval_order("WHITE", Some("WP9"), Some("HBW")).unwrap();

        let applied = orders.process_state_message(&json!({
            "orderId": request.order_id,
            "actionState": {"id": "a1", "state": "RUNNING"},
            "actionStates": [{"id": "a1", "state": "RUNNING"}],
            "errors": []
        }));
        assert!(applied);
        let record = orders.get_order(&request.order_id).unwrap();
        assert_eq!(record.status, OrderStatus::Running);
        assert_eq!(record.action_states.len(), 1);

        orders.process_state_message(&json!({
            "orderId": request.order_id,
            "actionState": {"state": "FAILED"},
            "errors": [{"errorType": "nfc"}]
        }));
        let record = orders.get_order(&request.order_id).unwrap();
        assert_eq!(record.status, OrderStatus::Failed);
        assert_eq!(record.errors.len(), 1);
    }

    #[test]
    fn cancel_keeps_the_record_active() {
        let (orders, _) = manager();
        let request = orders.create_storage_order("RED", None, None).unwrap();
        assert!(orders.cancel_order(&request.order_id, Some("operator")));
        assert!(orders.is_active(&request.order_id));
        assert_eq!(orders.orders_by_status(OrderStatus::Cancelled).len(), 1);
        assert!(!orders.cancel_order("missing", None));
    }

    #[test]
    fn purges_old_history_only() {
        let (orders, clock) = manager();
        let old = orders.create_storage_order("RED", None, None).unwrap();
        orders.complete_order(&old.order_id, None);
        clock.advance(Duration::hours(5));
        let recent = orders.create_storage_order("RED", None, None).unwrap();
        orders.complete_order(&recent.order_id, None);

        assert_eq!(orders.clear_completed_orders(2), 1);
        let history = orders.order_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_id, recent.order_id);

        // an absurd retention keeps everything instead of panicking
        assert_eq!(orders.clear_completed_orders(i64::MAX), 0);
        assert_eq!(orders.order_history().len(), 1);
    }

    #[test]
    fn validates_created_envelopes() {
        let (orders, _) = manager();
        let request = orders.create_storage_order("RED", Some("WP1"), Some("DPS")).unwrap();
        let value = serde_json::to_value(&request).unwrap();
        assert!(orders.validate_order(&value).is_empty());

        let errors = orders.validate_order(&json!({"orderId": "x", "action": "FLY"}));
        assert!(errors.iter().any(|e| e.contains("invalid action")));
        assert!(errors.iter().any(|e| e.contains("workpieceId")));
    }

    #[test]
    fn instant_action_targets_module_topic() {
        let (orders, _) = manager();
        let action = orders.send_instant_action("reset", None, Some("SVR4H73275"));
        assert_eq!(action.topic(), "module/v1/ff/SVR4H73275/instantAction");
        assert_eq!(action.actions[0].blocking_type, "NONE");
        assert!(orders.active_orders().is_empty());
    }
}
