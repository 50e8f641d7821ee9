use std::collections::HashSet;

use orbis_core::registry::{Layout, RouteCatalog};
use orbis_core::route::{RouteGenerator, RouteOptions, FTS_SERIAL};
use orbis_core::{OrbisError, OrderManager, Result, ShopfloorGraph};

const LAYOUT: &str = r#"
modules:
  - { id: DPS, type: DPS, position: [0, 0], serialNumber: SVR4H73275 }
  - { id: HBW, type: HBW, position: [0, 3], serialNumber: SVR3QA0022 }
intersections:
  - { id: "2", position: [0, 1] }
  - { id: "1", position: [0, 2] }
roads:
  - { from: DPS, to: "2" }
  - { from: "2", to: "1" }
  - { from: "1", to: HBW }
"#;

const ROUTES: &str = r#"
routes:
  - route_id: DPS_HBW
    from: DPS
    to: HBW
    mqtt_via: ["2", "1"]
    intersection_actions:
      - { mqtt_id: "2", action: PASS }
      - { mqtt_id: "1", action: PASS }
    tested: true
"#;

fn generator() -> Result<RouteGenerator> {
    Ok(RouteGenerator::new(
        Layout::from_yaml_str(LAYOUT)?,
        RouteCatalog::from_yaml_str(ROUTES)?,
    ))
}

#[test]
fn dps_to_hbw_route_order() -> Result<()> {
    let routes = generator()?;
    assert!(routes.validate_route("DPS_HBW"));

    let order = routes.generate("DPS_HBW", &RouteOptions::default())?;
    assert_eq!(order.serial_number, FTS_SERIAL);
    assert_eq!(order.topic(), "fts/v1/ff/5iO4/order");

    let node_ids: Vec<&str> = order.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(node_ids, ["SVR4H73275", "2", "1", "SVR3QA0022"]);

    let actions: Vec<Option<&str>> = order
        .nodes
        .iter()
        .map(|n| n.action.as_ref().map(|a| a.action_type.as_str()))
        .collect();
    assert_eq!(actions, [None, Some("PASS"), Some("PASS"), Some("DOCK")]);

    let edge_ids: Vec<&str> = order.edges.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(edge_ids, ["SVR4H73275-2", "2-1", "1-SVR3QA0022"]);
    let lengths: Vec<u32> = order.edges.iter().map(|e| e.length).collect();
    assert_eq!(lengths, [380, 360, 380]);
    Ok(())
}

#[test]
fn generated_order_is_structurally_valid() -> Result<()> {
    let routes = generator()?;
    let order = routes.generate("DPS_HBW", &RouteOptions::default())?;

    assert_eq!(order.nodes.len(), 2 + 2);
    assert_eq!(order.edges.len(), order.nodes.len() - 1);

    let graph = routes.graph();
    for edge in &order.edges {
        let [a, b] = &edge.linked_nodes;
        assert!(graph.are_adjacent(a, b), "{a} and {b} are not adjacent");
    }
    for node in &order.nodes {
        let incident: HashSet<&str> = order
            .edges
            .iter()
            .filter(|e| e.linked_nodes.contains(&node.id))
            .map(|e| e.id.as_str())
            .collect();
        let linked: HashSet<&str> = node.linked_edges.iter().map(String::as_str).collect();
        assert_eq!(linked, incident, "node {}", node.id);
    }

    let errors = OrderManager::new().validate_order(&serde_json::to_value(&order)?);
    assert!(errors.is_empty(), "{errors:?}");
    Ok(())
}

#[test]
fn unknown_route_is_not_found() -> Result<()> {
    let routes = generator()?;
    assert!(!routes.validate_route("HBW_DPS"));
    assert!(matches!(
        routes.generate("HBW_DPS", &RouteOptions::default()),
        Err(OrbisError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn bfs_routing() {
    let graph = ShopfloorGraph::from_edges(&[("A", "B"), ("B", "C"), ("C", "D")]);
    assert_eq!(graph.find_path("A", "D"), ["A", "B", "C", "D"]);
    assert_eq!(graph.find_path("A", "A"), ["A"]);
    assert!(graph.find_path("A", "X").is_empty());

    let mut split = ShopfloorGraph::from_edges(&[("A", "B")]);
    split.add_edge("C", "D");
    assert!(split.find_path("A", "D").is_empty());
}

#[test]
fn layout_graph_is_symmetric() -> Result<()> {
    let graph = ShopfloorGraph::from_layout(&Layout::from_yaml_str(LAYOUT)?);
    for node in graph.nodes() {
        let neighbors = graph.neighbors(node);
        let unique: HashSet<&String> = neighbors.iter().collect();
        assert_eq!(unique.len(), neighbors.len(), "duplicate neighbor of {node}");
        for next in neighbors {
            assert!(graph.are_adjacent(next, node));
            assert_ne!(next, node);
        }
    }

    let path = graph.find_path("DPS", "HBW");
    assert_eq!(path, ["DPS", "2", "1", "HBW"]);
    for pair in path.windows(2) {
        assert!(graph.are_adjacent(&pair[0], &pair[1]));
    }
    Ok(())
}
