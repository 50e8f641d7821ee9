//! Per-topic payload templates.
//!
//! Templates serve two purposes: validating outbound payloads before they are
//! published and describing observed traffic. [`TemplateManager::synthesize`]
//! derives template candidates from a recorded session.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::message::{is_wildcard, topic_matches, MqttMessage, QoS};
use crate::registry::Direction;
use crate::{OrbisError, Result};

const MAX_EXAMPLE_VALUES: usize = 5;
const MAX_USAGE_EXAMPLES: usize = 3;
const ARRAY_SAMPLE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "list")]
    Array,
    #[serde(alias = "dict")]
    Object,
    Null,
    Any,
}

impl FieldType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
            Value::Number(_) => FieldType::Number,
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => FieldType::Object,
        }
    }

    /// Integers satisfy `number`; `any` accepts everything
    pub fn accepts(self, value: &Value) -> bool {
        let actual = FieldType::of(value);
        match self {
            FieldType::Any => true,
            FieldType::Number => matches!(actual, FieldType::Number | FieldType::Integer),
            expected => expected == actual,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Null => "null",
            FieldType::Any => "any",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FieldValidation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

/// Cross-field rule, tagged by `rule` in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    OneOf {
        field: String,
        values: Vec<Value>,
    },
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// When `field` is present, every field in `requires` must be too
    Requires {
        field: String,
        requires: Vec<String>,
    },
    NonEmpty {
        field: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttBinding {
    pub topic_pattern: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optional_fields: Vec<String>,
    #[serde(default)]
    pub field_definitions: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default)]
    pub variable_fields: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub usage_examples: Vec<Value>,
    pub mqtt: MqttBinding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub template: Option<String>,
    pub template_missing: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn missing(topic: &str) -> Self {
        Self {
            valid: false,
            template: None,
            template_missing: true,
            errors: vec![format!("template_missing: no template for topic '{topic}'")],
        }
    }
}

/// Resolve a dotted path; `name[]` fans out over array elements
fn lookup<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![value];
    for segment in path.split('.') {
        let (key, fan_out) = match segment.strip_suffix("[]") {
            Some(key) => (key, true),
            None => (segment, false),
        };
        let mut next = Vec::new();
        for v in current {
            let Some(child) = v.get(key) else { continue };
            if fan_out {
                if let Some(items) = child.as_array() {
                    next.extend(items.iter());
                }
            } else {
                next.push(child);
            }
        }
        current = next;
    }
    current
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct TemplateManager {
    templates: BTreeMap<String, Template>,
    patterns: HashMap<String, Regex>,
}

impl TemplateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: Vec<Template>) -> Result<Self> {
        let mut manager = Self::new();
        for template in templates {
            manager.insert(template)?;
        }
        Ok(manager)
    }

    /// Load every `*.yml`/`*.yaml` file in `dir`. An absent directory yields an
    /// empty manager; a malformed template file is a config error.
    pub fn load_dir(dir: Option<&Path>) -> Result<Self> {
        let mut manager = Self::new();
        let Some(dir) = dir else {
            return Ok(manager);
        };
        if !dir.is_dir() {
            warn!(target: "templates", dir = %dir.display(), "Template directory not found");
            return Ok(manager);
        }

        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let raw = fs::read_to_string(&path)?;
            let mut template: Template = serde_yaml::from_str(&raw).map_err(|e| {
                OrbisError::Config(format!("invalid template {}: {e}", path.display()))
            })?;
            if template.name.is_empty() {
                template.name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
            }
            manager.insert(template)?;
        }

        info!(target: "templates", dir = %dir.display(), count = manager.len(), "Templates loaded");
        Ok(manager)
    }

    pub fn insert(&mut self, template: Template) -> Result<()> {
        for (field, def) in &template.field_definitions {
            if let Some(pattern) = &def.pattern {
                if !self.patterns.contains_key(pattern) {
                    let re = Regex::new(pattern).map_err(|e| {
                        OrbisError::Config(format!(
                            "template {}: bad pattern for {field}: {e}",
                            template.name
                        ))
                    })?;
                    self.patterns.insert(pattern.clone(), re);
                }
            }
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    /// Template bound to a topic. Exact patterns win over wildcard patterns.
    pub fn template_for(&self, topic: &str) -> Option<&Template> {
        self.templates
            .values()
            .find(|t| t.mqtt.topic_pattern == topic)
            .or_else(|| {
                self.templates.values().find(|t| {
                    let pattern = &t.mqtt.topic_pattern;
                    is_wildcard(pattern) && topic_matches(pattern, topic)
                })
            })
    }

    /// Validate a payload for a topic. Never fails; a missing template is
    /// reported in the result.
    pub fn validate(&self, topic: &str, payload: &Value) -> ValidationResult {
        match self.template_for(topic) {
            Some(template) => self.validate_against(template, payload),
            None => {
                debug!(target: "templates", topic = %topic, "No template for topic");
                ValidationResult::missing(topic)
            }
        }
    }

    /// Validate against a template by name (as referenced from the topic registry)
    pub fn validate_named(&self, name: &str, payload: &Value) -> ValidationResult {
        match self.templates.get(name) {
            Some(template) => self.validate_against(template, payload),
            None => ValidationResult::missing(name),
        }
    }

    pub fn validate_against(&self, template: &Template, payload: &Value) -> ValidationResult {
        let mut errors = Vec::new();

        for field in &template.required_fields {
            if lookup(payload, field).is_empty() {
                errors.push(format!("missing required field '{field}'"));
            }
        }

        for (field, def) in &template.field_definitions {
            for value in lookup(payload, field) {
                self.check_field(field, def, value, &mut errors);
            }
        }

        for rule in &template.validation_rules {
            check_rule(rule, payload, &mut errors);
        }

        ValidationResult {
            valid: errors.is_empty(),
            template: Some(template.name.clone()),
            template_missing: false,
            errors,
        }
    }

    fn check_field(
        &self,
        field: &str,
        def: &FieldDefinition,
        value: &Value,
        errors: &mut Vec<String>,
    ) {
        if !def.field_type.accepts(value) {
            errors.push(format!(
                "field '{field}' expected {} but got {}",
                def.field_type,
                FieldType::of(value)
            ));
            return;
        }

        if let (Some(pattern), Some(text)) = (&def.pattern, value.as_str()) {
            if let Some(re) = self.patterns.get(pattern) {
                if !re.is_match(text) {
                    errors.push(format!(
                        "field '{field}' value '{text}' does not match /{pattern}/"
                    ));
                }
            }
        }

        let Some(rules) = &def.validation else { return };
        if let Some(allowed) = &rules.allowed_values {
            if !allowed.contains(value) {
                errors.push(format!("field '{field}' value {value} not in allowed values"));
            }
        }
        if let Some(n) = value.as_f64() {
            if rules.min.map_or(false, |min| n < min) || rules.max.map_or(false, |max| n > max) {
                errors.push(format!("field '{field}' value {n} out of range"));
            }
        }
        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let Some(len) = length {
            if rules.min_length.map_or(false, |min| len < min)
                || rules.max_length.map_or(false, |max| len > max)
            {
                errors.push(format!("field '{field}' length {len} out of bounds"));
            }
        }
    }

    /// Derive one template candidate per topic from a session. The result only
    /// depends on the order of `messages`.
    pub fn synthesize(messages: &[MqttMessage]) -> BTreeMap<String, Template> {
        let mut by_topic: BTreeMap<&str, Vec<&MqttMessage>> = BTreeMap::new();
        for message in messages {
            by_topic.entry(message.topic.as_str()).or_default().push(message);
        }

        by_topic
            .into_iter()
            .map(|(topic, group)| (topic.to_string(), synthesize_topic(topic, &group)))
            .collect()
    }
}

fn check_rule(rule: &ValidationRule, payload: &Value, errors: &mut Vec<String>) {
    match rule {
        ValidationRule::OneOf { field, values } => {
            for value in lookup(payload, field) {
                if !values.contains(value) {
                    errors.push(format!("field '{field}' value {value} is not one of {values:?}"));
                }
            }
        }
        ValidationRule::Range { field, min, max } => {
            for value in lookup(payload, field) {
                match value.as_f64() {
                    Some(n) if min.map_or(false, |m| n < m) || max.map_or(false, |m| n > m) => {
                        errors.push(format!("field '{field}' value {n} out of range"));
                    }
                    Some(_) => {}
                    None => errors.push(format!("field '{field}' is not numeric")),
                }
            }
        }
        ValidationRule::Requires { field, requires } => {
            if !lookup(payload, field).is_empty() {
                for other in requires {
                    if lookup(payload, other).is_empty() {
                        errors.push(format!("field '{field}' requires '{other}'"));
                    }
                }
            }
        }
        ValidationRule::NonEmpty { field } => {
            let values = lookup(payload, field);
            if values.is_empty() || values.iter().any(|v| is_empty_value(v)) {
                errors.push(format!("field '{field}' must not be empty"));
            }
        }
    }
}

#[derive(Default)]
struct FieldStats {
    types: BTreeSet<FieldType>,
    examples: Vec<Value>,
    payloads: usize,
}

fn collect_paths(value: &Value, prefix: &str, seen: &mut BTreeMap<String, Vec<Value>>) {
    let Some(object) = value.as_object() else { return };
    for (key, child) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        seen.entry(path.clone()).or_default().push(child.clone());
        match child {
            Value::Object(_) => collect_paths(child, &path, seen),
            Value::Array(items) => {
                let element_path = format!("{path}[]");
                for item in items.iter().take(ARRAY_SAMPLE) {
                    if item.is_object() {
                        collect_paths(item, &element_path, seen);
                    }
                }
            }
            _ => {}
        }
    }
}

fn merged_type(types: &BTreeSet<FieldType>) -> FieldType {
    let non_null: Vec<FieldType> = types
        .iter()
        .copied()
        .filter(|t| *t != FieldType::Null)
        .collect();
    match non_null.as_slice() {
        [] => FieldType::Null,
        [single] => *single,
        [FieldType::Integer, FieldType::Number] => FieldType::Number,
        _ => FieldType::Any,
    }
}

fn synthesize_topic(topic: &str, group: &[&MqttMessage]) -> Template {
    let mut stats: BTreeMap<String, FieldStats> = BTreeMap::new();
    let mut object_payloads = 0usize;
    let mut usage_examples = Vec::new();

    for message in group {
        let payload = message
            .payload_json()
            .unwrap_or_else(|| Value::String(message.payload_str().into_owned()));
        if usage_examples.len() < MAX_USAGE_EXAMPLES {
            usage_examples.push(payload.clone());
        }
        if !payload.is_object() {
            continue;
        }
        object_payloads += 1;

        let mut seen = BTreeMap::new();
        collect_paths(&payload, "", &mut seen);
        for (path, values) in seen {
            let entry = stats.entry(path).or_default();
            entry.payloads += 1;
            for value in values {
                entry.types.insert(FieldType::of(&value));
                let scalar = !matches!(value, Value::Object(_) | Value::Array(_));
                if scalar
                    && entry.examples.len() < MAX_EXAMPLE_VALUES
                    && !entry.examples.contains(&value)
                {
                    entry.examples.push(value);
                }
            }
        }
    }

    let mut required_fields = Vec::new();
    let mut optional_fields = Vec::new();
    let mut field_definitions = BTreeMap::new();
    let mut variable_fields = BTreeMap::new();

    for (path, field) in stats {
        if field.payloads == object_payloads {
            required_fields.push(path.clone());
        } else {
            optional_fields.push(path.clone());
        }
        if field.examples.len() > 1 {
            variable_fields.insert(path.clone(), field.examples.clone());
        }
        let observed: Vec<String> = field.types.iter().map(ToString::to_string).collect();
        field_definitions.insert(
            path,
            FieldDefinition {
                field_type: merged_type(&field.types),
                pattern: None,
                description: format!("observed types: {}", observed.join(", ")),
                validation: None,
                examples: field.examples,
            },
        );
    }

    Template {
        name: topic.to_string(),
        description: format!("Synthesized from {} message(s)", group.len()),
        required_fields,
        optional_fields,
        field_definitions,
        validation_rules: Vec::new(),
        variable_fields,
        usage_examples,
        mqtt: MqttBinding {
            topic_pattern: topic.to_string(),
            direction: Direction::In,
            qos: group.first().map(|m| m.qos).unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_TEMPLATE: &str = r#"
name: ccu_order_request
required_fields: [orderId, type, action]
field_definitions:
  orderId:
    type: string
    pattern: "^[0-9a-f-]{36}$"
  type:
    type: string
    validation:
      allowed_values: [RED, BLUE, WHITE]
  orderUpdateId:
    type: integer
    validation:
      min: 0
validation_rules:
  - rule: one_of
    field: action
    values: [STORAGE, RETRIEVAL, TRANSPORT]
mqtt:
  topic_pattern: ccu/order/request
  direction: out
  qos: 1
"#;

    fn manager() -> TemplateManager {
        let template: Template = serde_yaml::from_str(ORDER_TEMPLATE).unwrap();
        TemplateManager::from_templates(vec![template]).unwrap()
    }

    #[test]
    fn accepts_a_valid_payload() {
        let result = manager().validate(
            "ccu/order/request",
            &json!({
                "orderId": "0e5f8f5c-1c2b-4c1e-9d1a-1234567890ab",
                "type": "RED",
                "action": "STORAGE",
                "orderUpdateId": 0
            }),
        );
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.template.as_deref(), Some("ccu_order_request"));
    }

    #[test]
    fn reports_every_violation() {
        let result = manager().validate(
            "ccu/order/request",
            &json!({"orderId": "nope", "type": "GREEN", "action": "FLY", "orderUpdateId": -1}),
        );
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 4, "{:?}", result.errors);
    }

    #[test]
    fn missing_template_is_reported_not_raised() {
        let result = manager().validate("ccu/unknown", &json!({}));
        assert!(!result.valid);
        assert!(result.template_missing);
        assert!(result.errors[0].starts_with("template_missing"));
    }

    #[test]
    fn synthesis_marks_required_and_recurses() {
        let messages = vec![
            MqttMessage::json("m/state", &json!({"a": 1, "loads": [{"loadId": "x"}], "w": {"id": "W1"}})),
            MqttMessage::json("m/state", &json!({"a": 2.5, "loads": [], "w": {"id": "W2"}})),
        ];
        let templates = TemplateManager::synthesize(&messages);
        let t = &templates["m/state"];
        assert!(t.required_fields.contains(&"a".to_string()));
        assert!(t.required_fields.contains(&"w.id".to_string()));
        assert!(t.optional_fields.contains(&"loads[].loadId".to_string()));
        assert_eq!(t.field_definitions["a"].field_type, FieldType::Number);
        assert_eq!(t.variable_fields["w.id"], vec![json!("W1"), json!("W2")]);
        assert_eq!(t.usage_examples.len(), 2);

        assert_eq!(TemplateManager::synthesize(&messages), templates);
    }
}
