// TXT controller registry
//
// Controllers are discovered from `module/v1/ff/<serial>/factsheet` and kept
// fresh by `.../state`. Keyed by serial number, which survives IP changes.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{cutoff, span_seconds, system_clock, SharedClock};

pub const ONLINE_WINDOW_SECS: i64 = 30;

/// Serial numbers whose role is fixed regardless of their factsheet
const KNOWN_SERIALS: &[(&str, &str, &str)] = &[
    ("SVR4H73275", "DPS", "CCU"),
    ("SVR4H76530", "AIQS", "quality_control"),
    ("5iO4", "FTS", "transport"),
];

const IP_PATHS: &[&str] = &[
    "ipAddress",
    "connection.ipAddress",
    "network.ipAddress",
    "system.ipAddress",
    "metadata.ipAddress",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerInfo {
    pub serial: String,
    pub module_type: String,
    pub role: String,
    pub version: Option<String>,
    pub capabilities: Vec<String>,
    pub functions: Vec<String>,
    pub ip: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub factsheet: Option<Value>,
}

impl ControllerInfo {
    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen < Duration::seconds(ONLINE_WINDOW_SECS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub by_role: BTreeMap<String, usize>,
    pub by_module_type: BTreeMap<String, usize>,
}

/// `module/v1/ff/<serial>/<kind>` or `fts/v1/ff/<serial>/<kind>`
fn serial_from_topic(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["module" | "fts", "v1", "ff", "NodeRed", serial, ..] => Some(*serial),
        ["module" | "fts", "v1", "ff", serial, ..] => Some(*serial),
        _ => None,
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn looks_like_ipv4(raw: &str) -> bool {
    raw.parse::<std::net::Ipv4Addr>().is_ok()
}

fn extract_ip(payload: &Value) -> Option<String> {
    IP_PATHS
        .iter()
        .filter_map(|path| lookup(payload, path).and_then(Value::as_str))
        .find(|ip| looks_like_ipv4(ip))
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => other
                        .get("actionType")
                        .or_else(|| other.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn module_type_of(factsheet: &Value) -> Option<String> {
    ["moduleType", "typeSpecification.moduleClass", "typeSpecification.seriesName"]
        .iter()
        .find_map(|path| lookup(factsheet, path).and_then(Value::as_str))
        .map(str::to_string)
}

/// Role from the factsheet when the serial is not in the known table
fn role_from_factsheet(module_type: &str, factsheet: &Value) -> &'static str {
    let description = lookup(factsheet, "typeSpecification.seriesDescription")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let haystack = format!("{module_type} {description}").to_ascii_lowercase();
    let words: Vec<&str> = haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |needles: &[&str]| needles.iter().any(|n| words.contains(n));

    if has(["warehouse", "hbw", "ccu"].as_slice()) {
        "CCU"
    } else if has(["quality", "aiqs", "ai"].as_slice()) {
        "quality_control"
    } else if has(["fts", "agv", "mobile"].as_slice()) {
        "transport"
    } else if has(["gateway", "cloud"].as_slice()) {
        "cloud_gateway"
    } else {
        "unknown"
    }
}

pub struct ControllerRegistry {
    controllers: Mutex<HashMap<String, ControllerInfo>>,
    clock: SharedClock,
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            controllers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Upsert a controller from its factsheet. Returns the serial on success.
    pub fn process_factsheet_message(&self, topic: &str, payload: &Value) -> Option<String> {
        let serial = serial_from_topic(topic)
            .or_else(|| payload.get("serialNumber").and_then(Value::as_str))?
            .to_string();
        let now = self.clock.now();

        let known = KNOWN_SERIALS.iter().find(|(s, _, _)| *s == serial);
        let module_type = module_type_of(payload)
            .or_else(|| known.map(|(_, t, _)| t.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let role = match known {
            Some((_, _, role)) => role.to_string(),
            None => role_from_factsheet(&module_type, payload).to_string(),
        };

        let mut capabilities = string_list(payload.get("capabilities"));
        if capabilities.is_empty() {
            capabilities = string_list(lookup(payload, "protocolFeatures.moduleActions"));
        }
        let functions = string_list(payload.get("functions"));
        let version = payload
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut controllers = self.controllers.lock();
        let first_seen = controllers.get(&serial).map_or(now, |c| c.first_seen);
        let ip = controllers.get(&serial).and_then(|c| c.ip.clone());
        let is_new = !controllers.contains_key(&serial);

        controllers.insert(
            serial.clone(),
            ControllerInfo {
                serial: serial.clone(),
                module_type,
                role,
                version,
                capabilities,
                functions,
                ip: extract_ip(payload).or(ip),
                first_seen,
                last_seen: now,
                factsheet: Some(payload.clone()),
            },
        );

        if is_new {
            info!(target: "controllers", serial = %serial, "Controller discovered");
        }
        Some(serial)
    }

    /// Refresh `last_seen` and IP from a state message. Unknown serials are
    /// registered with placeholder metadata until their factsheet arrives.
    pub fn process_state_message(&self, topic: &str, payload: &Value) -> Option<String> {
        let serial = serial_from_topic(topic)
            .or_else(|| payload.get("serialNumber").and_then(Value::as_str))?
            .to_string();
        let now = self.clock.now();
        let ip = extract_ip(payload);

        let mut controllers = self.controllers.lock();
        let entry = controllers.entry(serial.clone()).or_insert_with(|| {
            let known = KNOWN_SERIALS.iter().find(|(s, _, _)| *s == serial);
            ControllerInfo {
                serial: serial.clone(),
                module_type: known.map_or("unknown", |(_, t, _)| *t).to_string(),
                role: known.map_or("unknown", |(_, _, r)| *r).to_string(),
                version: None,
                capabilities: Vec::new(),
                functions: Vec::new(),
                ip: None,
                first_seen: now,
                last_seen: now,
                factsheet: None,
            }
        });

        entry.last_seen = now;
        if let Some(ip) = ip {
            if entry.ip.as_deref() != Some(ip.as_str()) {
                debug!(target: "controllers", serial = %serial, ip = %ip, "Controller IP updated");
                entry.ip = Some(ip);
            }
        }
        Some(serial)
    }

    pub fn get(&self, serial: &str) -> Option<ControllerInfo> {
        self.controllers.lock().get(serial).cloned()
    }

    pub fn is_online(&self, serial: &str) -> bool {
        let now = self.clock.now();
        self.controllers
            .lock()
            .get(serial)
            .map_or(false, |c| c.is_online_at(now))
    }

    fn filtered(&self, keep: impl Fn(&ControllerInfo) -> bool) -> Vec<ControllerInfo> {
        let mut found: Vec<_> = self
            .controllers
            .lock()
            .values()
            .filter(|c| keep(c))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.serial.cmp(&b.serial));
        found
    }

    pub fn all(&self) -> Vec<ControllerInfo> {
        self.filtered(|_| true)
    }

    pub fn by_ip(&self, ip: &str) -> Option<ControllerInfo> {
        self.filtered(|c| c.ip.as_deref() == Some(ip)).into_iter().next()
    }

    pub fn by_role(&self, role: &str) -> Vec<ControllerInfo> {
        self.filtered(|c| c.role == role)
    }

    pub fn by_module_type(&self, module_type: &str) -> Vec<ControllerInfo> {
        self.filtered(|c| c.module_type.eq_ignore_ascii_case(module_type))
    }

    pub fn online(&self) -> Vec<ControllerInfo> {
        let now = self.clock.now();
        self.filtered(|c| c.is_online_at(now))
    }

    pub fn offline(&self) -> Vec<ControllerInfo> {
        let now = self.clock.now();
        self.filtered(|c| !c.is_online_at(now))
    }

    /// Topics a controller with this role and serial is expected to publish
    pub fn expected_topics(role: &str, serial: &str) -> Vec<String> {
        match role {
            "transport" => ["state", "connection", "factsheet", "order", "instantAction"]
                .iter()
                .map(|kind| format!("fts/v1/ff/{serial}/{kind}"))
                .collect(),
            "CCU" => {
                let mut topics = vec![
                    "ccu/order/request".to_string(),
                    "ccu/order/response".to_string(),
                    "ccu/state/stock".to_string(),
                ];
                topics.extend(
                    ["state", "connection", "factsheet"]
                        .iter()
                        .map(|kind| format!("module/v1/ff/{serial}/{kind}")),
                );
                topics
            }
            "cloud_gateway" => vec!["ccu/state/#".to_string()],
            _ => ["state", "connection", "factsheet", "order", "instantAction"]
                .iter()
                .map(|kind| format!("module/v1/ff/{serial}/{kind}"))
                .collect(),
        }
    }

    pub fn summary(&self) -> ControllerSummary {
        let now = self.clock.now();
        let controllers = self.controllers.lock();
        let mut summary = ControllerSummary {
            total: controllers.len(),
            ..Default::default()
        };
        for c in controllers.values() {
            if c.is_online_at(now) {
                summary.online += 1;
            } else {
                summary.offline += 1;
            }
            *summary.by_role.entry(c.role.clone()).or_default() += 1;
            *summary.by_module_type.entry(c.module_type.clone()).or_default() += 1;
        }
        summary
    }

    /// Evict controllers not seen for more than `threshold_seconds`
    pub fn clear_offline_controllers(&self, threshold_seconds: i64) -> usize {
        let cutoff = cutoff(self.clock.now(), span_seconds(threshold_seconds));
        let mut controllers = self.controllers.lock();
        let before = controllers.len();
        controllers.retain(|_, c| c.last_seen >= cutoff);
        let removed = before - controllers.len();
        if removed > 0 {
            info!(target: "controllers", removed, "Offline controllers evicted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }
}
