use std::sync::Arc;

use serde_json::json;

use orbis_core::config::OrbisConfig;
use orbis_core::{MockTransport, MqttMessage, Orbis, OrbisError, QoS, Result};

const WORKFLOWS: &str = r#"
sequences:
  reset_and_check:
    description: Reset the factory, then ask the AIQS for its state
    steps:
      - name: reset
        topic: ccu/set/reset
        payload: { withStorage: false }
      - name: check
        topic: module/v1/ff/{module}/instantAction
        payload: { orderId: "{orderId}", actionType: factsheetRequest }
"#;

fn runtime() -> Result<(Arc<MockTransport>, Orbis, tempfile::TempDir)> {
    let dir = tempfile::tempdir()?;
    let workflows = dir.path().join("workflows.yml");
    std::fs::write(&workflows, WORKFLOWS)?;

    let mut config = OrbisConfig::default();
    config.registry.workflows = Some(workflows);
    config.session.directory = dir.path().join("sessions");

    let transport = Arc::new(MockTransport::new());
    let orbis = Orbis::with_transport(config, transport.clone())?;
    Ok((transport, orbis, dir))
}

#[tokio::test]
async fn facade_wires_managers_to_the_bus() -> Result<()> {
    let (transport, orbis, _dir) = runtime()?;
    assert!(orbis.routes.is_none());
    orbis.start().await?;

    let reset = orbis.control.build_command("reset", None).expect("reset command");
    assert_eq!(reset.qos, QoS::ExactlyOnce);
    assert!(orbis.client.publish_outbound(&reset).await);

    let order = orbis.orders.create_storage_order("BLUE", None, None)?;
    assert!(orbis.client.publish_outbound(&order.to_outbound()?).await);
    transport.inject(MqttMessage::json(
        "ccu/order/response",
        &json!({"orderId": order.order_id, "status": "RUNNING"}),
    ));
    transport.inject(MqttMessage::json(
        "ccu/state/stock",
        &json!({"stockItems": [{"location": "C3", "workpiece": {"id": "w1", "type": "BLUE", "state": "RAW"}}]}),
    ));

    let stats = orbis.pump.tick();
    assert_eq!(stats.orders_updated, 1);
    assert_eq!(orbis.inventory.counts_by_color()["BLUE"], 1);

    let published: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(published, ["ccu/set/reset", "ccu/order/request"]);

    orbis.shutdown().await?;
    assert!(!orbis.client.connected());
    Ok(())
}

#[tokio::test]
async fn workflow_steps_publish_rendered_messages() -> Result<()> {
    let (transport, orbis, _dir) = runtime()?;
    orbis.start().await?;

    let id = orbis
        .workflows
        .start("reset_and_check", "SVR4H76530", None)
        .expect("known sequence");
    while let Some(step) = orbis.workflows.next_step(&id) {
        assert!(orbis.client.publish_outbound(&step.message).await);
    }

    let published = transport.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].topic, "module/v1/ff/SVR4H76530/instantAction");
    assert_eq!(published[1].payload_json().unwrap()["orderId"], id.as_str());
    Ok(())
}

#[test]
fn model_version_mismatch_is_a_config_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = dir.path().join("topics.yml");
    std::fs::write(&registry, "version: \"1.0\"\ntopics: []\n")?;

    let mut config = OrbisConfig::default();
    config.registry.topics = Some(registry);
    config.registry.model_version = Some("2.0".into());

    let result = Orbis::with_transport(config, Arc::new(MockTransport::new()));
    assert!(matches!(result, Err(OrbisError::Config(_))));
    Ok(())
}
