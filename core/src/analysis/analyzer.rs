// Session analyzer: classification, filtering, statistics, chain graphs
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::chain::{
    extract_labels, ChainEdge, ChainGraph, ChainLabels, ChainNode, NodeClass, Relation,
};
use crate::clock::span_secs_u64;
use crate::config::AnalysisConfig;
use crate::message::{topic_matches, MqttMessage, QoS};
use crate::registry::{Category, TopicRegistry};
use crate::session::load_session;
use crate::Result;

/// Upper bound for rooted analysis windows
pub const MAX_ROOTED_WINDOW_SECS: i64 = 600;

const ORDER_REQUEST: &str = "ccu/order/request";
const ORDER_RESPONSE: &str = "ccu/order/response";

/// One session message with its registry classification and correlation labels
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedMessage {
    pub index: usize,
    pub topic: String,
    pub raw: String,
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub qos: QoS,
    pub retain: bool,
    pub category: Category,
    pub sub_category: String,
    pub friendly_name: String,
    pub module: Option<String>,
    pub labels: ChainLabels,
}

impl AnalyzedMessage {
    pub fn classify(index: usize, message: &MqttMessage, registry: &TopicRegistry) -> Self {
        let info = registry.topic_info(&message.topic);
        let payload = message.payload_json();
        let labels = extract_labels(&message.topic, payload.as_ref());
        Self {
            index,
            topic: message.topic.clone(),
            raw: message.payload_str().into_owned(),
            payload,
            timestamp: message.timestamp,
            qos: message.qos,
            retain: message.retain,
            category: info.category,
            sub_category: info.sub_category,
            friendly_name: info.friendly_name,
            module: info.module,
            labels,
        }
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

/// Selection criteria. Empty lists mean "no restriction".
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFilter {
    pub apply_prefilter: bool,
    pub categories: Vec<Category>,
    pub sub_categories: Vec<String>,
    pub friendly_names: Vec<String>,
    /// Exact topics or MQTT filters
    pub topics: Vec<String>,
    pub time_range: Option<TimeRange>,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            apply_prefilter: true,
            categories: Vec::new(),
            sub_categories: Vec::new(),
            friendly_names: Vec::new(),
            topics: Vec::new(),
            time_range: None,
        }
    }
}

impl MessageFilter {
    pub fn without_prefilter() -> Self {
        Self {
            apply_prefilter: false,
            ..Default::default()
        }
    }

    fn selects(&self, message: &AnalyzedMessage) -> bool {
        let topic_selected = self.topics.is_empty()
            || self.topics.iter().any(|f| topic_matches(f, &message.topic));
        (self.categories.is_empty() || self.categories.contains(&message.category))
            && (self.sub_categories.is_empty()
                || self.sub_categories.contains(&message.sub_category))
            && (self.friendly_names.is_empty()
                || self.friendly_names.contains(&message.friendly_name))
            && topic_selected
            && self.time_range.map_or(true, |r| r.contains(message.timestamp))
    }
}

/// Result of applying a [`MessageFilter`]
#[derive(Debug, Clone)]
pub struct FilteredView<'a> {
    pub messages: Vec<&'a AnalyzedMessage>,
    pub total: usize,
    /// Dropped by the pre-filter topic list
    pub prefiltered: usize,
    /// Dropped by the remaining criteria
    pub excluded: usize,
    pub visible_topics: usize,
}

impl FilteredView<'_> {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_messages: usize,
    pub unique_topics: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub per_topic: BTreeMap<String, usize>,
    pub per_category: BTreeMap<String, usize>,
}

impl SessionStats {
    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a AnalyzedMessage>) -> Self {
        let mut stats = SessionStats::default();
        for m in messages {
            stats.total_messages += 1;
            *stats.per_topic.entry(m.topic.clone()).or_default() += 1;
            *stats.per_category.entry(m.category.to_string()).or_default() += 1;
            stats.start = Some(stats.start.map_or(m.timestamp, |s| s.min(m.timestamp)));
            stats.end = Some(stats.end.map_or(m.timestamp, |e| e.max(m.timestamp)));
        }
        stats.unique_topics = stats.per_topic.len();
        if let (Some(start), Some(end)) = (stats.start, stats.end) {
            stats.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
        stats
    }
}

pub struct SessionAnalyzer {
    registry: Arc<TopicRegistry>,
    prefilter_topics: Vec<String>,
    chain_window: Duration,
    rooted_window: Duration,
    messages: Vec<AnalyzedMessage>,
}

impl SessionAnalyzer {
    pub fn new(registry: Arc<TopicRegistry>, config: &AnalysisConfig) -> Self {
        Self {
            registry,
            prefilter_topics: config.prefilter_topics.clone(),
            chain_window: span_secs_u64(config.chain_window_secs),
            rooted_window: clamp_window(span_secs_u64(config.rooted_window_secs)),
            messages: Vec::new(),
        }
    }

    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let session = load_session(path)?;
        let count = self.load_messages(&session.messages);
        info!(target: "analyzer", path = %path.display(), messages = count, "Session parsed");
        Ok(count)
    }

    pub fn load_messages(&mut self, messages: &[MqttMessage]) -> usize {
        self.messages = messages
            .iter()
            .enumerate()
            .map(|(i, m)| AnalyzedMessage::classify(i, m, &self.registry))
            .collect();
        self.messages.len()
    }

    pub fn messages(&self) -> &[AnalyzedMessage] {
        &self.messages
    }

    pub fn prefilter_topics(&self) -> &[String] {
        &self.prefilter_topics
    }

    pub fn set_prefilter_topics(&mut self, topics: Vec<String>) {
        self.prefilter_topics = topics;
    }

    pub fn is_prefiltered(&self, topic: &str) -> bool {
        self.prefilter_topics.iter().any(|f| topic_matches(f, topic))
    }

    pub fn filter(&self, filter: &MessageFilter) -> FilteredView<'_> {
        let mut prefiltered = 0;
        let mut excluded = 0;
        let mut messages = Vec::new();

        for message in &self.messages {
            if filter.apply_prefilter && self.is_prefiltered(&message.topic) {
                prefiltered += 1;
            } else if !filter.selects(message) {
                excluded += 1;
            } else {
                messages.push(message);
            }
        }

        let visible_topics = messages
            .iter()
            .map(|m| m.topic.as_str())
            .collect::<HashSet<_>>()
            .len();
        debug!(
            target: "analyzer",
            total = self.messages.len(),
            in_scope = messages.len(),
            prefiltered,
            excluded,
            "Filter applied"
        );
        FilteredView {
            messages,
            total: self.messages.len(),
            prefiltered,
            excluded,
            visible_topics,
        }
    }

    pub fn statistics(&self) -> SessionStats {
        SessionStats::from_messages(&self.messages)
    }

    /// Chain graph over the selected messages, with temporal edges optional
    pub fn chain_graph(&self, messages: &[&AnalyzedMessage], include_temporal: bool) -> ChainGraph {
        ChainGraph::build(messages, include_temporal.then_some(self.chain_window))
    }

    /// Candidate chains for the messages a filter selects, largest first
    pub fn find_chains(
        &self,
        filter: &MessageFilter,
        include_temporal: bool,
    ) -> (ChainGraph, Vec<Vec<usize>>) {
        let view = self.filter(filter);
        let graph = self.chain_graph(&view.messages, include_temporal);
        let chains = graph.chains();
        info!(target: "analyzer", nodes = graph.len(), chains = chains.len(), "Chains built");
        (graph, chains)
    }

    /// Indexes of production order requests, the usual roots for rooted analysis
    pub fn production_roots(&self) -> Vec<usize> {
        self.messages
            .iter()
            .filter(|m| m.topic == ORDER_REQUEST)
            .filter(|m| m.payload_str("orderType") == Some("PRODUCTION"))
            .map(|m| m.index)
            .collect()
    }

    /// Chain rooted at one message: everything in the window after the root that
    /// shares its order id, plus messages tied to the same workpieces.
    pub fn rooted_analysis(
        &self,
        root_index: usize,
        window: Option<Duration>,
    ) -> Option<ChainGraph> {
        let root = self.messages.get(root_index)?;
        let window = window.map(clamp_window).unwrap_or(self.rooted_window);
        let end = root.timestamp + window;

        let in_window: Vec<&AnalyzedMessage> = self
            .messages
            .iter()
            .filter(|m| m.index != root.index)
            .filter(|m| m.timestamp >= root.timestamp && m.timestamp <= end)
            .collect();

        let root_node = ChainNode {
            message_index: root.index,
            topic: root.topic.clone(),
            timestamp: root.timestamp,
            labels: root.labels.clone(),
            class: NodeClass::Root,
        };
        let mut graph = ChainGraph {
            nodes: vec![root_node],
            edges: Vec::new(),
            root: Some(0),
        };

        let order_id = root.labels.order_id.clone().or_else(|| adopt_order_id(root, &in_window));
        let Some(order_id) = order_id else {
            warn!(
                target: "analyzer",
                root = root_index,
                "Root carries no order id and none could be adopted"
            );
            return Some(graph);
        };

        let order_related: Vec<&AnalyzedMessage> = in_window
            .iter()
            .copied()
            .filter(|m| m.labels.order_id.as_deref() == Some(order_id.as_str()))
            .collect();

        let workpieces: BTreeSet<&str> = std::iter::once(root)
            .chain(order_related.iter().copied())
            .filter_map(|m| m.labels.workpiece_id.as_deref())
            .collect();
        let nfc_codes: BTreeSet<&str> = std::iter::once(root)
            .chain(order_related.iter().copied())
            .filter_map(|m| m.labels.nfc_code.as_deref())
            .collect();

        let mut attached: Vec<(&AnalyzedMessage, NodeClass, Relation)> = order_related
            .iter()
            .map(|m| {
                let class = match NodeClass::for_topic(&m.topic) {
                    NodeClass::Other => NodeClass::Order,
                    class => class,
                };
                (*m, class, Relation::OrderId)
            })
            .collect();

        for m in &in_window {
            if m.labels.order_id.as_deref() == Some(order_id.as_str()) {
                continue;
            }
            let labels = &m.labels;
            let same_workpiece =
                labels.workpiece_id.as_deref().map_or(false, |w| workpieces.contains(w));
            let relation = if same_workpiece {
                Relation::WorkpieceId
            } else if labels.nfc_code.as_deref().map_or(false, |n| nfc_codes.contains(n)) {
                Relation::NfcCode
            } else {
                continue;
            };
            attached.push((*m, NodeClass::Workpiece, relation));
        }

        attached.sort_by(|a, b| a.0.timestamp.cmp(&b.0.timestamp).then(a.0.index.cmp(&b.0.index)));
        for (message, class, relation) in attached {
            graph.nodes.push(ChainNode {
                message_index: message.index,
                topic: message.topic.clone(),
                timestamp: message.timestamp,
                labels: message.labels.clone(),
                class,
            });
            graph.edges.push(ChainEdge {
                source: 0,
                target: graph.nodes.len() - 1,
                relation,
                weight: relation.weight(),
            });
        }

        info!(
            target: "analyzer",
            root = root_index,
            order_id = %order_id,
            nodes = graph.len(),
            window_secs = window.num_seconds(),
            "Rooted chain built"
        );
        Some(graph)
    }
}

fn clamp_window(window: Duration) -> Duration {
    window.min(Duration::seconds(MAX_ROOTED_WINDOW_SECS)).max(Duration::zero())
}

/// Live order requests carry no id; the CCU assigns one in its response
fn adopt_order_id(root: &AnalyzedMessage, in_window: &[&AnalyzedMessage]) -> Option<String> {
    let wanted = root.payload_str("type");
    in_window
        .iter()
        .filter(|m| m.topic == ORDER_RESPONSE)
        .find(|m| wanted.is_none() || m.payload_str("type") == wanted)
        .and_then(|m| m.labels.order_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(secs)
    }

    fn analyzer(messages: Vec<MqttMessage>) -> SessionAnalyzer {
        let registry = Arc::new(TopicRegistry::empty());
        let mut analyzer = SessionAnalyzer::new(registry, &AnalysisConfig::default());
        analyzer.load_messages(&messages);
        analyzer
    }

    #[test]
    fn adopts_order_id_from_matching_response() {
        let a = analyzer(vec![
            MqttMessage::json("ccu/order/request", &json!({"type": "BLUE", "orderType": "PRODUCTION"})).with_timestamp(at(0)),
            MqttMessage::json("ccu/order/response", &json!({"type": "RED", "orderId": "other"})).with_timestamp(at(1)),
            MqttMessage::json("ccu/order/response", &json!({"type": "BLUE", "orderId": "O-42"})).with_timestamp(at(2)),
            MqttMessage::json("fts/v1/ff/5iO4/state", &json!({"orderId": "O-42", "loads": [{"loadId": "WP1"}]}))
                .with_timestamp(at(5)),
            MqttMessage::json("module/v1/ff/SVR3QA0022/state", &json!({"workpieceId": "WP1"})).with_timestamp(at(9)),
            MqttMessage::json("module/v1/ff/SVR3QA0022/state", &json!({"orderId": "O-42"})).with_timestamp(at(120)),
        ]);
        assert_eq!(a.production_roots(), vec![0]);

        let graph = a.rooted_analysis(0, None).unwrap();
        let classes: Vec<NodeClass> = graph.nodes.iter().map(|n| n.class).collect();
        assert_eq!(
            classes,
            vec![NodeClass::Root, NodeClass::Order, NodeClass::Fts, NodeClass::Workpiece]
        );
        assert_eq!(graph.edges[2].relation, Relation::WorkpieceId);
        assert!(graph.edges.iter().all(|e| e.source == 0));
    }

    #[test]
    fn window_is_clamped() {
        assert_eq!(clamp_window(Duration::seconds(3600)), Duration::seconds(600));
        assert_eq!(clamp_window(Duration::seconds(45)), Duration::seconds(45));
    }

    #[test]
    fn filter_by_category_and_time() {
        let a = analyzer(vec![
            MqttMessage::json("ccu/state/stock", &json!({})).with_timestamp(at(0)),
            MqttMessage::json("module/v1/ff/SVR3QA0022/state", &json!({})).with_timestamp(at(10)),
            MqttMessage::json("module/v1/ff/SVR3QA0022/state", &json!({})).with_timestamp(at(20)),
        ]);
        let view = a.filter(&MessageFilter {
            categories: vec![Category::Module],
            time_range: Some(TimeRange {
                start: Some(at(15)),
                end: None,
            }),
            ..Default::default()
        });
        assert_eq!(view.len(), 1);
        assert_eq!(view.excluded, 2);
        assert_eq!(a.statistics().duration_secs, 20.0);
    }
}
