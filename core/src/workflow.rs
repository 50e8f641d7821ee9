// Workflow sequences: named YAML step lists run one step at a time per order id
//
// ```yaml
// sequences:
//   aiqs_check:
//     description: Pick, check and drop a workpiece
//     steps:
//       - name: pick
//         topic: module/v1/ff/{module}/order
//         payload: { orderId: "{orderId}", action: { actionType: PICK } }
//         wait_secs: 2
// ```
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{system_clock, SharedClock};
use crate::message::{OutboundMessage, QoS};
use crate::{OrbisError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub wait_secs: f64,
    #[serde(default)]
    pub qos: QoS,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceDef {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    sequences: BTreeMap<String, SequenceDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    Active,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStatus {
    pub order_id: String,
    pub sequence: String,
    pub module: String,
    pub state: SequenceState,
    pub current_step: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
}

/// A step with placeholders filled in, ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStep {
    pub index: usize,
    pub name: String,
    pub message: OutboundMessage,
    /// Pause the caller should observe after publishing
    pub wait: Duration,
}

struct ActiveSequence {
    sequence: String,
    module: String,
    context: HashMap<String, String>,
    state: SequenceState,
    current_step: usize,
    started_at: DateTime<Utc>,
}

pub struct SequenceRunner {
    sequences: BTreeMap<String, SequenceDef>,
    active: Mutex<HashMap<String, ActiveSequence>>,
    clock: SharedClock,
}

impl Default for SequenceRunner {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl SequenceRunner {
    pub fn new(sequences: BTreeMap<String, SequenceDef>) -> Self {
        Self {
            sequences,
            active: Mutex::new(HashMap::new()),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: WorkflowFile = serde_yaml::from_str(raw)?;
        for (name, def) in &file.sequences {
            if def.steps.is_empty() {
                warn!(target: "workflow", sequence = %name, "Sequence has no steps");
            }
        }
        Ok(Self::new(file.sequences))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrbisError::Config(format!("cannot read workflows {}: {e}", path.display()))
        })?;
        let runner = Self::from_yaml_str(&raw)?;
        info!(
            target: "workflow",
            path = %path.display(),
            sequences = runner.sequences.len(),
            "Workflows loaded"
        );
        Ok(runner)
    }

    pub fn sequence_names(&self) -> Vec<String> {
        self.sequences.keys().cloned().collect()
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceDef> {
        self.sequences.get(name)
    }

    /// Start a sequence against a module. Returns the new order id, or `None`
    /// when the sequence is unknown.
    pub fn start(
        &self,
        name: &str,
        module: &str,
        ctx: Option<&HashMap<String, String>>,
    ) -> Option<String> {
        if !self.sequences.contains_key(name) {
            warn!(target: "workflow", sequence = %name, "Unknown sequence");
            return None;
        }
        let order_id = Uuid::new_v4().to_string();
        let entry = ActiveSequence {
            sequence: name.to_string(),
            module: module.to_string(),
            context: ctx.cloned().unwrap_or_default(),
            state: SequenceState::Active,
            current_step: 0,
            started_at: self.clock.now(),
        };
        self.active.lock().insert(order_id.clone(), entry);
        info!(
            target: "workflow",
            sequence = %name,
            module = %module,
            order_id = %order_id,
            "Sequence started"
        );
        Some(order_id)
    }

    /// Render the next step and advance the cursor. Past the last step the
    /// sequence is marked completed and `None` is returned.
    pub fn next_step(&self, order_id: &str) -> Option<RenderedStep> {
        let mut active = self.active.lock();
        let Some(entry) = active.get_mut(order_id) else {
            warn!(target: "workflow", order_id = %order_id, "Unknown sequence order");
            return None;
        };
        if entry.state != SequenceState::Active {
            warn!(
                target: "workflow",
                order_id = %order_id,
                state = ?entry.state,
                "Sequence is not active"
            );
            return None;
        }

        let steps = self.sequences.get(&entry.sequence).map(|d| d.steps.as_slice()).unwrap_or(&[]);
        let Some(step) = steps.get(entry.current_step) else {
            entry.state = SequenceState::Completed;
            info!(
                target: "workflow",
                order_id = %order_id,
                sequence = %entry.sequence,
                "Sequence completed"
            );
            return None;
        };

        let mut vars = entry.context.clone();
        vars.insert("module".to_string(), entry.module.clone());
        vars.insert("orderId".to_string(), order_id.to_string());

        let index = entry.current_step;
        entry.current_step += 1;
        debug!(target: "workflow", order_id = %order_id, step = %step.name, index, "Step rendered");

        Some(RenderedStep {
            index,
            name: step.name.clone(),
            message: OutboundMessage::new(
                substitute(&step.topic, &vars),
                render(&step.payload, &vars),
                step.qos,
            ),
            wait: Duration::from_secs_f64(step.wait_secs.max(0.0)),
        })
    }

    pub fn abort(&self, order_id: &str) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(order_id) {
            Some(entry) if entry.state == SequenceState::Active => {
                entry.state = SequenceState::Aborted;
                info!(
                    target: "workflow",
                    order_id = %order_id,
                    step = entry.current_step,
                    "Sequence aborted"
                );
                true
            }
            Some(_) => false,
            None => {
                warn!(target: "workflow", order_id = %order_id, "Unknown sequence order");
                false
            }
        }
    }

    pub fn get_status(&self, order_id: &str) -> Option<SequenceStatus> {
        let active = self.active.lock();
        let entry = active.get(order_id)?;
        Some(SequenceStatus {
            order_id: order_id.to_string(),
            sequence: entry.sequence.clone(),
            module: entry.module.clone(),
            state: entry.state,
            current_step: entry.current_step,
            total_steps: self.sequences.get(&entry.sequence).map_or(0, |d| d.steps.len()),
            started_at: entry.started_at,
        })
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .values()
            .filter(|e| e.state == SequenceState::Active)
            .count()
    }
}

fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    vars.iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(&format!("{{{key}}}"), value))
}

fn render(value: &Value, vars: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
