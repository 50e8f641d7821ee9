// CCU system control commands (`ccu/set/<name>`)
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::message::{iso_timestamp_now, OutboundMessage, QoS};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlCommand {
    pub name: String,
    pub topic: String,
    pub description: String,
    pub default_params: Map<String, Value>,
    pub qos: QoS,
    pub retain: bool,
}

fn catalog() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        ("reset", "Reset the factory state", json!({"withStorage": false})),
        (
            "charge",
            "Send the AGV to the charging station",
            json!({"serialNumber": "5iO4", "charge": true}),
        ),
        (
            "layout",
            "Publish a shopfloor layout",
            json!({"modules": [], "intersections": [], "roads": []}),
        ),
        ("flows", "Select production flows", json!({"orderType": "PRODUCTION"})),
        ("calibration", "Start module calibration", json!({"serialNumber": "", "calibrate": true})),
        ("park", "Park the factory", json!({})),
        ("delete_module", "Remove a module from the layout", json!({"serialNumber": ""})),
        (
            "module_duration",
            "Set the simulated duration of a module",
            json!({"serialNumber": "", "duration": 0}),
        ),
        ("default_layout", "Restore the default layout", json!({})),
        (
            "config",
            "Update CCU configuration",
            json!({
                "productionSettings": {"maxParallelOrders": 4},
                "ftsSettings": {"chargeThresholdPercent": 10}
            }),
        ),
    ]
}

fn same_kind(expected: &Value, actual: &Value) -> bool {
    matches!(
        (expected, actual),
        (Value::Null, _)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

/// Static catalog of outbound control commands. Publishing is up to the caller.
#[derive(Debug, Clone)]
pub struct SystemControlManager {
    commands: BTreeMap<String, ControlCommand>,
}

impl Default for SystemControlManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemControlManager {
    pub fn new() -> Self {
        let commands = catalog()
            .into_iter()
            .map(|(name, description, defaults)| {
                let default_params = match defaults {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                (
                    name.to_string(),
                    ControlCommand {
                        name: name.to_string(),
                        topic: format!("ccu/set/{name}"),
                        description: description.to_string(),
                        default_params,
                        qos: QoS::ExactlyOnce,
                        retain: false,
                    },
                )
            })
            .collect();
        Self { commands }
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ControlCommand> {
        self.commands.get(name)
    }

    /// Compare caller parameters against the declared defaults
    pub fn validate_parameters(&self, name: &str, params: &Value) -> Vec<String> {
        let Some(command) = self.commands.get(name) else {
            return vec![format!("unknown command '{name}'")];
        };
        let Some(given) = params.as_object() else {
            return vec!["parameters must be a JSON object".to_string()];
        };

        let mut errors = Vec::new();
        for (key, default) in &command.default_params {
            match given.get(key) {
                None => errors.push(format!("missing parameter '{key}'")),
                Some(value) if !same_kind(default, value) => {
                    errors.push(format!("parameter '{key}' has wrong type"))
                }
                Some(_) => {}
            }
        }
        errors
    }

    /// Publication-ready message: defaults overlaid with `params`, plus a timestamp
    pub fn build_command(&self, name: &str, params: Option<&Value>) -> Option<OutboundMessage> {
        let Some(command) = self.commands.get(name) else {
            warn!(target: "control", command = %name, "Unknown control command");
            return None;
        };

        let mut payload = command.default_params.clone();
        if let Some(params) = params {
            let errors = self.validate_overrides(command, params);
            if !errors.is_empty() {
                warn!(
                    target: "control",
                    command = %name,
                    errors = ?errors,
                    "Invalid control parameters"
                );
                return None;
            }
            if let Some(overrides) = params.as_object() {
                payload.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        payload.insert("timestamp".to_string(), Value::String(iso_timestamp_now()));

        info!(target: "control", command = %name, topic = %command.topic, "Control command built");
        Some(OutboundMessage {
            topic: command.topic.clone(),
            payload: Value::Object(payload),
            qos: command.qos,
            retain: command.retain,
        })
    }

    // Overrides may be partial; only the keys they carry are type-checked
    fn validate_overrides(&self, command: &ControlCommand, params: &Value) -> Vec<String> {
        let Some(given) = params.as_object() else {
            return vec!["parameters must be a JSON object".to_string()];
        };
        given
            .iter()
            .filter_map(|(key, value)| {
                let default = command.default_params.get(key)?;
                (!same_kind(default, value)).then(|| format!("parameter '{key}' has wrong type"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_every_command_on_qos_two() {
        let control = SystemControlManager::new();
        assert_eq!(control.command_names().len(), 10);
        let park = control.get("park").unwrap();
        assert_eq!(park.topic, "ccu/set/park");
        assert_eq!(park.qos, QoS::ExactlyOnce);
        assert!(!park.retain);
    }

    #[test]
    fn build_merges_defaults() {
        let control = SystemControlManager::new();
        let params = json!({"serialNumber": "SVR3QA0022", "duration": 12});
        let message = control
            .build_command("module_duration", Some(&params))
            .unwrap();
        assert_eq!(message.topic, "ccu/set/module_duration");
        assert_eq!(message.payload["duration"], 12);
        assert!(message.payload.get("timestamp").is_some());

        assert!(control.build_command("charge", Some(&json!({"charge": "yes"}))).is_none());
        assert!(control.build_command("explode", None).is_none());
    }

    #[test]
    fn validation_reports_missing_and_mismatched() {
        let control = SystemControlManager::new();
        let errors = control.validate_parameters("charge", &json!({"charge": 1}));
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("serialNumber")));
        assert!(control.validate_parameters("park", &json!({})).is_empty());
    }
}
