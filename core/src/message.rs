// MQTT message envelope and topic filter matching
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid qos level {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// One message as seen on (or sent to) the bus.
///
/// Payloads are almost always UTF-8 JSON but are kept as raw bytes so binary
/// camera frames survive recording and replay untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub timestamp: DateTime<Utc>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
            timestamp: Utc::now(),
        }
    }

    /// Build a message whose payload is the serialized JSON value
    pub fn json(topic: impl Into<String>, payload: &Value) -> Self {
        Self::new(topic, payload.to_string().into_bytes())
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Payload as text, lossy for binary frames
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Parse the payload as JSON; `None` for binary or malformed payloads
    pub fn payload_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// ISO-8601 timestamp with explicit offset, at full precision
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, false)
    }
}

/// A publication-ready record built by a manager and handed to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Value, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain: false,
        }
    }

    pub fn to_message(&self) -> MqttMessage {
        MqttMessage::json(self.topic.clone(), &self.payload)
            .with_qos(self.qos)
            .with_retain(self.retain)
    }
}

/// Current time as `2025-01-01T12:00:00.000Z`
pub fn iso_timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp with offset (or a naive one, assumed UTC)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// MQTT 3.1.1 topic filter matching (`+` single level, `#` trailing multi level).
///
/// Topics starting with `$` are not matched by wildcards in the first level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether the filter contains MQTT wildcards
pub fn is_wildcard(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(topic_matches("ccu/order/request", "ccu/order/request"));
        assert!(topic_matches("module/v1/ff/+/state", "module/v1/ff/SVR3QA0022/state"));
        assert!(!topic_matches("module/v1/ff/+/state", "module/v1/ff/NodeRed/SVR3QA0022/state"));
        assert!(topic_matches("module/#", "module/v1/ff/NodeRed/SVR3QA0022/state"));
        assert!(topic_matches("#", "/j1/txt/1/i/cam"));
        assert!(topic_matches("/j1/txt/1/i/+", "/j1/txt/1/i/cam"));
        assert!(!topic_matches("ccu/set/+", "ccu/set"));
        assert!(topic_matches("ccu/set/#", "ccu/set"));
    }

    #[test]
    fn dollar_topics_are_not_matched_by_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn parses_offsets_and_naive_timestamps() {
        let a = parse_timestamp("2025-09-01T10:00:00+02:00").unwrap();
        let b = parse_timestamp("2025-09-01T08:00:00Z").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("2025-09-01 08:00:00.250").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn qos_serializes_as_number() {
        let json = serde_json::to_string(&QoS::ExactlyOnce).unwrap();
        assert_eq!(json, "2");
        let back: QoS = serde_json::from_str("0").unwrap();
        assert_eq!(back, QoS::AtMostOnce);
        assert!(serde_json::from_str::<QoS>("3").is_err());
    }
}
