// Message-chain graph
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Write};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use super::analyzer::AnalyzedMessage;

/// Why two messages are linked, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    OrderId,
    WorkpieceId,
    NfcCode,
    ModuleId,
    Temporal,
}

impl Relation {
    pub fn weight(self) -> f64 {
        match self {
            Relation::OrderId => 4.0,
            Relation::WorkpieceId => 3.0,
            Relation::NfcCode => 2.0,
            Relation::ModuleId => 1.0,
            Relation::Temporal => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Relation::OrderId => "order_id",
            Relation::WorkpieceId => "workpiece_id",
            Relation::NfcCode => "nfc_code",
            Relation::ModuleId => "module_id",
            Relation::Temporal => "temporal",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation labels pulled out of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainLabels {
    pub order_id: Option<String>,
    pub workpiece_id: Option<String>,
    pub nfc_code: Option<String>,
    pub module_id: Option<String>,
    pub message_type: Option<String>,
}

const ORDER_PATHS: &[&str] = &["orderId", "order_id", "order.orderId", "order.id", "order"];
const WORKPIECE_PATHS: &[&str] = &[
    "workpieceId",
    "workpiece_id",
    "workpiece.id",
    "workpiece.workpieceId",
    "loads[].loadId",
    "loadId",
];
const NFC_PATHS: &[&str] = &["nfcCode", "nfc_code", "nfc", "workpiece.nfcCode"];
const MODULE_PATHS: &[&str] = &["serialNumber", "moduleId", "module_id", "module"];

/// First non-empty string (or number) at any of `paths`; `name[]` fans out over arrays
fn find_label(payload: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| {
        let mut current = vec![payload];
        for segment in path.split('.') {
            let (key, fan_out) = match segment.strip_suffix("[]") {
                Some(key) => (key, true),
                None => (segment, false),
            };
            current = current
                .into_iter()
                .filter_map(|v| v.get(key))
                .flat_map(|child| match (fan_out, child.as_array()) {
                    (true, Some(items)) => items.iter().collect::<Vec<_>>(),
                    (true, None) => Vec::new(),
                    (false, _) => vec![child],
                })
                .collect();
        }
        current.into_iter().find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    })
}

/// Serial of `module/v1/ff/<serial>/...` or `fts/v1/ff/<serial>/...`
pub fn module_from_topic(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["module" | "fts", "v1", "ff", "NodeRed", serial, ..] => Some(serial.to_string()),
        ["module" | "fts", "v1", "ff", serial, _, ..] => Some(serial.to_string()),
        _ => None,
    }
}

pub fn extract_labels(topic: &str, payload: Option<&Value>) -> ChainLabels {
    let message_type = topic
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string);
    let module_from_payload = payload.and_then(|p| find_label(p, MODULE_PATHS));

    match payload {
        Some(payload) => ChainLabels {
            order_id: find_label(payload, ORDER_PATHS),
            workpiece_id: find_label(payload, WORKPIECE_PATHS),
            nfc_code: find_label(payload, NFC_PATHS),
            module_id: module_from_topic(topic).or(module_from_payload),
            message_type,
        },
        None => ChainLabels {
            module_id: module_from_topic(topic),
            message_type,
            ..Default::default()
        },
    }
}

impl ChainLabels {
    /// Strongest shared identifier between two label sets
    pub fn strongest_shared(&self, other: &ChainLabels) -> Option<Relation> {
        let shared = |a: &Option<String>, b: &Option<String>| {
            matches!((a, b), (Some(x), Some(y)) if x == y)
        };
        if shared(&self.order_id, &other.order_id) {
            Some(Relation::OrderId)
        } else if shared(&self.workpiece_id, &other.workpiece_id) {
            Some(Relation::WorkpieceId)
        } else if shared(&self.nfc_code, &other.nfc_code) {
            Some(Relation::NfcCode)
        } else if shared(&self.module_id, &other.module_id) {
            Some(Relation::ModuleId)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Root,
    Order,
    Workpiece,
    Fts,
    Module,
    Other,
}

impl NodeClass {
    pub fn for_topic(topic: &str) -> Self {
        if topic.starts_with("fts/") {
            NodeClass::Fts
        } else if topic.starts_with("module/") {
            NodeClass::Module
        } else if topic.starts_with("ccu/order") {
            NodeClass::Order
        } else {
            NodeClass::Other
        }
    }

    fn color(self) -> &'static str {
        match self {
            NodeClass::Root => "red",
            NodeClass::Order => "orange",
            NodeClass::Workpiece => "gold",
            NodeClass::Fts => "lightblue",
            NodeClass::Module => "palegreen",
            NodeClass::Other => "lightgray",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainNode {
    /// Index of the message in the analyzed session
    pub message_index: usize,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub labels: ChainLabels,
    pub class: NodeClass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainEdge {
    pub source: usize,
    pub target: usize,
    pub relation: Relation,
    pub weight: f64,
}

/// Directed graph over messages; edges run from the earlier message to the later one
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainGraph {
    pub nodes: Vec<ChainNode>,
    pub edges: Vec<ChainEdge>,
    pub root: Option<usize>,
}

impl ChainGraph {
    /// Link every pair of messages by its strongest shared identifier, or by
    /// time proximity when `temporal_window` is given and nothing stronger applies.
    pub fn build(messages: &[&AnalyzedMessage], temporal_window: Option<Duration>) -> Self {
        let mut ordered: Vec<&AnalyzedMessage> = messages.to_vec();
        ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.index.cmp(&b.index)));

        let nodes: Vec<ChainNode> = ordered
            .iter()
            .map(|m| ChainNode {
                message_index: m.index,
                topic: m.topic.clone(),
                timestamp: m.timestamp,
                labels: m.labels.clone(),
                class: NodeClass::for_topic(&m.topic),
            })
            .collect();

        let mut edges = Vec::new();
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                let relation = nodes[i].labels.strongest_shared(&nodes[j].labels).or_else(|| {
                    let window = temporal_window?;
                    let gap = nodes[j].timestamp - nodes[i].timestamp;
                    (gap <= window).then_some(Relation::Temporal)
                });
                if let Some(relation) = relation {
                    edges.push(ChainEdge {
                        source: i,
                        target: j,
                        relation,
                        weight: relation.weight(),
                    });
                }
            }
        }

        Self {
            nodes,
            edges,
            root: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn outgoing(&self, node: usize) -> impl Iterator<Item = &ChainEdge> {
        self.edges.iter().filter(move |e| e.source == node)
    }

    pub fn edges_between(&self, a: usize, b: usize) -> Vec<&ChainEdge> {
        self.edges
            .iter()
            .filter(|e| (e.source == a && e.target == b) || (e.source == b && e.target == a))
            .collect()
    }

    /// Weakly connected components with at least two messages, largest first.
    /// Each chain lists node positions in time order.
    pub fn chains(&self) -> Vec<Vec<usize>> {
        let mut parent: Vec<usize> = (0..self.nodes.len()).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for edge in &self.edges {
            let (a, b) = (find(&mut parent, edge.source), find(&mut parent, edge.target));
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
        }

        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for node in 0..self.nodes.len() {
            let root = find(&mut parent, node);
            components.entry(root).or_default().push(node);
        }

        let mut chains: Vec<Vec<usize>> = components
            .into_values()
            .filter(|c| c.len() >= 2)
            .collect();
        chains.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
        chains
    }

    /// Relations present in the graph
    pub fn relations(&self) -> BTreeSet<Relation> {
        self.edges.iter().map(|e| e.relation).collect()
    }

    /// Graphviz rendering
    pub fn to_dot(&self) -> String {
        let mut dot =
            String::from("digraph chain {\n  rankdir=LR;\n  node [shape=box, style=filled];\n");
        for (i, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(
                dot,
                "  n{i} [label=\"{}\\n{}\", fillcolor={}];",
                node.topic.replace('"', "'"),
                node.timestamp.format("%H:%M:%S%.3f"),
                node.class.color()
            );
        }
        for edge in &self.edges {
            let _ = writeln!(
                dot,
                "  n{} -> n{} [label=\"{}\", penwidth={}];",
                edge.source, edge.target, edge.relation, edge.weight
            );
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_labels_from_nested_payloads() {
        let labels = extract_labels(
            "fts/v1/ff/5iO4/state",
            Some(&json!({"order_id": "O1", "loads": [{"loadId": "WP7"}], "workpiece": {"nfcCode": "04a1"}})),
        );
        assert_eq!(labels.order_id.as_deref(), Some("O1"));
        assert_eq!(labels.workpiece_id.as_deref(), Some("WP7"));
        assert_eq!(labels.nfc_code.as_deref(), Some("04a1"));
        assert_eq!(labels.module_id.as_deref(), Some("5iO4"));
        assert_eq!(labels.message_type.as_deref(), Some("state"));

        let empty = extract_labels("ccu/state/stock", Some(&json!([1, 2, 3])));
        assert_eq!(empty.order_id, None);
    }

    #[test]
    fn strongest_relation_wins() {
        let a = ChainLabels {
            order_id: Some("O".into()),
            module_id: Some("M".into()),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.strongest_shared(&b), Some(Relation::OrderId));
        assert_eq!(a.strongest_shared(&ChainLabels::default()), None);
    }
}
