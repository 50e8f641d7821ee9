// FTS route generator
//
// Renders a declarative route (module -> intersections -> module) into a VDA
// 5050 navigation order for the AGV.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{iso_timestamp_now, OutboundMessage, QoS};
use crate::registry::{Layout, RouteCatalog, RouteDef};
use crate::shopfloor::ShopfloorGraph;
use crate::{OrbisError, Result};

pub const FTS_SERIAL: &str = "5iO4";
pub const MODULE_EDGE_LENGTH: u32 = 380;
pub const INTERSECTION_EDGE_LENGTH: u32 = 360;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMetadata {
    pub load_id: String,
    pub load_type: String,
    pub load_position: String,
}

impl Default for LoadMetadata {
    fn default() -> Self {
        Self {
            load_id: "unknown".to_string(),
            load_type: "WHITE".to_string(),
            load_position: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<LoadMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteNode {
    pub id: String,
    pub linked_edges: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NodeAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEdge {
    pub id: String,
    pub length: u32,
    pub linked_nodes: [String; 2],
}

/// Navigation order published to `fts/v1/ff/<serial>/order`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtsOrder {
    pub timestamp: String,
    pub order_id: String,
    pub order_update_id: u64,
    pub nodes: Vec<RouteNode>,
    pub edges: Vec<RouteEdge>,
    pub serial_number: String,
}

impl FtsOrder {
    pub fn topic(&self) -> String {
        format!("fts/v1/ff/{}/order", self.serial_number)
    }

    pub fn to_outbound(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage::new(
            self.topic(),
            serde_json::to_value(self)?,
            QoS::AtLeastOnce,
        ))
    }
}

/// Caller overrides for a generated order
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub order_id: Option<String>,
    pub order_update_id: u64,
    pub load: Option<LoadMetadata>,
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct RouteGenerator {
    layout: Layout,
    catalog: RouteCatalog,
}

impl RouteGenerator {
    pub fn new(layout: Layout, catalog: RouteCatalog) -> Self {
        Self { layout, catalog }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn route_ids(&self) -> Vec<&str> {
        self.catalog.route_ids()
    }

    pub fn graph(&self) -> ShopfloorGraph {
        ShopfloorGraph::from_layout(&self.layout)
    }

    fn resolve(&self, route_id: &str) -> Result<(&RouteDef, String, String)> {
        let route = self
            .catalog
            .get(route_id)
            .ok_or_else(|| OrbisError::NotFound(format!("route '{route_id}'")))?;

        let missing = route.missing_fields();
        if !missing.is_empty() {
            return Err(OrbisError::Config(format!(
                "route '{route_id}' is missing {}",
                missing.join(", ")
            )));
        }

        let serial = |name: &Option<String>| -> Result<String> {
            let name = name.as_deref().unwrap_or_default();
            self.layout.serial_for(name).map(str::to_string).ok_or_else(|| {
                OrbisError::Config(format!(
                    "route '{route_id}': module '{name}' has no serial number in the layout"
                ))
            })
        };
        let from = serial(&route.from)?;
        let to = serial(&route.to)?;
        Ok((route, from, to))
    }

    /// Structural check plus resolvability of both endpoint serials
    pub fn validate_route(&self, route_id: &str) -> bool {
        match self.resolve(route_id) {
            Ok(_) => true,
            Err(e) => {
                warn!(target: "route", route_id, error = %e, "Route invalid");
                false
            }
        }
    }

    fn edge_length(&self, a: &str, b: &str) -> u32 {
        if self.layout.is_intersection(a) && self.layout.is_intersection(b) {
            INTERSECTION_EDGE_LENGTH
        } else {
            MODULE_EDGE_LENGTH
        }
    }

    pub fn generate(&self, route_id: &str, options: &RouteOptions) -> Result<FtsOrder> {
        let (route, from, to) = self.resolve(route_id)?;
        let via = route.mqtt_via.clone().unwrap_or_default();

        let mut ids = Vec::with_capacity(via.len() + 2);
        ids.push(from);
        ids.extend(via.iter().cloned());
        ids.push(to.clone());

        let edges: Vec<RouteEdge> = ids
            .windows(2)
            .map(|pair| RouteEdge {
                id: format!("{}-{}", pair[0], pair[1]),
                length: self.edge_length(&pair[0], &pair[1]),
                linked_nodes: [pair[0].clone(), pair[1].clone()],
            })
            .collect();

        let last = ids.len() - 1;
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut linked_edges = Vec::new();
                if i > 0 {
                    linked_edges.push(edges[i - 1].id.clone());
                }
                if i < last {
                    linked_edges.push(edges[i].id.clone());
                }

                let action = if i == last {
                    Some(NodeAction {
                        id: format!("dock-at-{to}-{}", short_id()),
                        action_type: "DOCK".to_string(),
                        metadata: Some(options.load.clone().unwrap_or_default()),
                    })
                } else if i > 0 {
                    let declared = route.action_for(id).unwrap_or("PASS").to_ascii_uppercase();
                    let prefix = if declared == "PASS" {
                        "pass-through".to_string()
                    } else {
                        declared.to_ascii_lowercase()
                    };
                    Some(NodeAction {
                        id: format!("{prefix}-{id}-{}", short_id()),
                        action_type: declared,
                        metadata: None,
                    })
                } else {
                    None
                };

                RouteNode {
                    id: id.clone(),
                    linked_edges,
                    action,
                }
            })
            .collect();

        let order = FtsOrder {
            timestamp: iso_timestamp_now(),
            order_id: options.order_id.clone().unwrap_or_else(|| {
                format!("fts-route-{route_id}-{}", Utc::now().format("%Y%m%d-%H%M%S"))
            }),
            order_update_id: options.order_update_id,
            nodes,
            edges,
            serial_number: FTS_SERIAL.to_string(),
        };

        info!(
            target: "route",
            route_id,
            order_id = %order.order_id,
            nodes = order.nodes.len(),
            "FTS order generated"
        );
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(routes: &str) -> RouteGenerator {
        let layout = Layout::from_yaml_str(
            r#"
modules:
  - { id: DPS, type: DPS, position: [0, 2], serialNumber: SVR4H73275 }
  - { id: MILL, type: MILL, position: [0, 0], serialNumber: SVR3QA2098 }
  - { id: AIQS, type: AIQS, position: [0, 1] }
intersections:
  - { id: "1", position: [1, 1] }
roads:
  - { from: DPS, to: "1" }
  - { from: "1", to: MILL }
"#,
        )
        .unwrap();
        RouteGenerator::new(layout, RouteCatalog::from_yaml_str(routes).unwrap())
    }

    #[test]
    fn declared_intersection_actions_are_used() {
        let routes = generator(
            r#"
routes:
  - route_id: DPS_MILL
    from: DPS
    to: MILL
    mqtt_via: ["1"]
    intersection_actions: [{ mqtt_id: "1", action: TURN_LEFT }]
"#,
        );
        let order = routes
            .generate(
                "DPS_MILL",
                &RouteOptions {
                    order_id: Some("fixed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(order.order_id, "fixed");
        let action = order.nodes[1].action.as_ref().unwrap();
        assert_eq!(action.action_type, "TURN_LEFT");
        assert!(action.id.starts_with("turn_left-1-"));
        assert!(order.nodes[0].action.is_none());
        assert_eq!(order.nodes[2].action.as_ref().unwrap().metadata, Some(LoadMetadata::default()));
    }

    #[test]
    fn unresolvable_routes_fail_validation() {
        let routes = generator(
            r#"
routes:
  - route_id: NO_SERIAL
    from: DPS
    to: AIQS
    mqtt_via: []
    intersection_actions: []
  - route_id: PARTIAL
    from: DPS
"#,
        );
        assert!(!routes.validate_route("NO_SERIAL"));
        assert!(!routes.validate_route("PARTIAL"));
        assert!(!routes.validate_route("MISSING"));
        assert!(matches!(
            routes.generate("MISSING", &RouteOptions::default()),
            Err(OrbisError::NotFound(_))
        ));
    }
}
