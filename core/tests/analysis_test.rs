use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use orbis_core::analysis::{MessageFilter, NodeClass, Relation, SessionAnalyzer};
use orbis_core::config::AnalysisConfig;
use orbis_core::{MqttMessage, TemplateManager, TopicRegistry};

fn at(offset_ms: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::milliseconds(offset_ms)
}

fn analyzer(messages: &[MqttMessage]) -> SessionAnalyzer {
    let registry = Arc::new(TopicRegistry::empty());
    let mut analyzer = SessionAnalyzer::new(registry, &AnalysisConfig::default());
    analyzer.load_messages(messages);
    analyzer
}

fn sensor_heavy_session() -> Vec<MqttMessage> {
    let others = [
        "ccu/state/stock",
        "ccu/order/response",
        "module/v1/ff/SVR3QA0022/state",
        "module/v1/ff/SVR4H73275/state",
        "fts/v1/ff/5iO4/state",
        "/j1/txt/1/i/bme680",
    ];
    (0..1000)
        .map(|i| {
            let topic = if i % 5 < 2 { "/j1/txt/1/i/cam" } else { others[i % others.len()] };
            MqttMessage::json(topic, &json!({"seq": i})).with_timestamp(at(i as i64 * 10))
        })
        .collect()
}

#[test]
fn prefilter_drops_camera_stream() {
    let messages = sensor_heavy_session();
    assert_eq!(messages.iter().filter(|m| m.topic == "/j1/txt/1/i/cam").count(), 400);

    let analyzer = analyzer(&messages);
    let raw = analyzer.filter(&MessageFilter::without_prefilter());
    assert_eq!(raw.len(), 1000);
    assert_eq!(raw.prefiltered, 0);

    let view = analyzer.filter(&MessageFilter::default());
    assert_eq!(view.total, 1000);
    // bme680 is on the default list too
    let bme = messages.iter().filter(|m| m.topic == "/j1/txt/1/i/bme680").count();
    assert_eq!(view.prefiltered, 400 + bme);
    assert_eq!(view.len(), 600 - bme);
    assert_eq!(view.visible_topics, raw.visible_topics - 2);
}

#[test]
fn prefilter_with_camera_only() {
    let messages = sensor_heavy_session();
    let mut analyzer = analyzer(&messages);
    analyzer.set_prefilter_topics(vec!["/j1/txt/1/i/cam".to_string()]);

    let view = analyzer.filter(&MessageFilter::default());
    assert_eq!(view.len(), 600);
    assert_eq!(view.prefiltered, 400);
    assert_eq!(view.visible_topics, 6);
    assert_eq!(analyzer.filter(&MessageFilter::without_prefilter()).visible_topics, 7);
}

fn production_session() -> Vec<MqttMessage> {
    let mut messages = vec![MqttMessage::json(
        "ccu/order/request",
        &json!({"orderId": "ORD-1", "type": "RED", "orderType": "PRODUCTION"}),
    )
    .with_timestamp(at(0))];
    let downstream = [
        "ccu/order/response",
        "fts/v1/ff/5iO4/state",
        "module/v1/ff/SVR4H73275/state",
        "module/v1/ff/SVR3QA0022/state",
    ];
    for i in 0..12 {
        messages.push(
            MqttMessage::json(downstream[i % downstream.len()], &json!({"orderId": "ORD-1", "step": i}))
                .with_timestamp(at(1_000 + i as i64 * 4_000)),
        );
    }
    // unrelated traffic inside the window and a late message outside it
    messages.push(MqttMessage::json("ccu/state/stock", &json!({"stockItems": []})).with_timestamp(at(2_500)));
    messages.push(MqttMessage::json("fts/v1/ff/5iO4/state", &json!({"orderId": "ORD-1"})).with_timestamp(at(90_000)));
    messages
}

#[test]
fn rooted_chain_by_order_id() {
    let analyzer = analyzer(&production_session());
    assert_eq!(analyzer.production_roots(), vec![0]);

    let graph = analyzer
        .rooted_analysis(0, Some(Duration::seconds(60)))
        .expect("root exists");
    assert_eq!(graph.root, Some(0));
    assert_eq!(graph.nodes[0].class, NodeClass::Root);
    assert_eq!(graph.len(), 13);
    assert_eq!(graph.outgoing(0).count(), 12);
    assert!(graph.edges.iter().all(|e| e.source == 0 && e.relation == Relation::OrderId));
    assert!(!graph.relations().contains(&Relation::Temporal));
    assert!(graph.to_dot().contains("order_id"));
}

#[test]
fn temporal_edges_never_shadow_stronger_relations() {
    let messages = production_session();
    let analyzer = analyzer(&messages);
    let view = analyzer.filter(&MessageFilter::default());
    let graph = analyzer.chain_graph(&view.messages, true);

    for edge in &graph.edges {
        let (a, b) = (&graph.nodes[edge.source], &graph.nodes[edge.target]);
        if a.labels.order_id.is_some() && a.labels.order_id == b.labels.order_id {
            assert_eq!(edge.relation, Relation::OrderId);
        }
        assert!(a.timestamp <= b.timestamp);
        assert_eq!(graph.edges_between(edge.source, edge.target).len(), 1);
    }

    let chains = graph.chains();
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].len(), messages.len());
}

#[test]
fn template_synthesis_is_deterministic() {
    let messages = production_session();

    let first = TemplateManager::synthesize(&messages);
    let second = TemplateManager::synthesize(&messages);
    assert_eq!(first, second);

    let response = &first["ccu/order/response"];
    assert!(response.required_fields.contains(&"orderId".to_string()));
    assert!(response.variable_fields.contains_key("step"));
}
