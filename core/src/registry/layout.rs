// Shopfloor layout and declarative FTS routes (YAML)
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{OrbisError, Result};

/// `[row, col]` in the shopfloor grid
pub type GridPosition = [u32; 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutModule {
    pub id: String,
    #[serde(rename = "type", default)]
    pub module_type: String,
    pub position: GridPosition,
    #[serde(rename = "serialNumber", alias = "serial_number", default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub cell_size: Option<[u32; 2]>,
    #[serde(default)]
    pub is_compound: bool,
    #[serde(default)]
    pub attached_assets: Vec<String>,
    #[serde(default)]
    pub compound_layout: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intersection {
    pub id: String,
    pub position: GridPosition,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPosition {
    pub id: String,
    pub position: GridPosition,
    #[serde(default)]
    pub cell_size: Option<[u32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Road {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub modules: Vec<LayoutModule>,
    #[serde(default)]
    pub intersections: Vec<Intersection>,
    #[serde(default)]
    pub fixed_positions: Vec<FixedPosition>,
    #[serde(default)]
    pub roads: Vec<Road>,
}

impl Layout {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| OrbisError::Config(format!("invalid layout: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            OrbisError::Config(format!("cannot read layout {}: {e}", path.display()))
        })?;
        let layout = Self::from_yaml_str(&raw)?;
        info!(
            target: "registry",
            path = %path.display(),
            modules = layout.modules.len(),
            intersections = layout.intersections.len(),
            roads = layout.roads.len(),
            "Layout loaded"
        );
        Ok(layout)
    }

    /// Find a module by id, serial number or module type (in that order)
    pub fn module(&self, name: &str) -> Option<&LayoutModule> {
        self.modules
            .iter()
            .find(|m| m.id == name)
            .or_else(|| {
                self.modules
                    .iter()
                    .find(|m| m.serial_number.as_deref() == Some(name))
            })
            .or_else(|| self.modules.iter().find(|m| m.module_type == name))
    }

    /// Serial number of a module referenced by id or type
    pub fn serial_for(&self, name: &str) -> Option<&str> {
        self.module(name)
            .and_then(|m| m.serial_number.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn intersection(&self, id: &str) -> Option<&Intersection> {
        self.intersections.iter().find(|i| i.id == id)
    }

    pub fn is_intersection(&self, id: &str) -> bool {
        self.intersection(id).is_some()
    }

    /// Grid position of any referenceable id
    pub fn position_of(&self, id: &str) -> Option<GridPosition> {
        self.module(id)
            .map(|m| m.position)
            .or_else(|| self.intersection(id).map(|i| i.position))
            .or_else(|| {
                self.fixed_positions
                    .iter()
                    .find(|f| f.id == id)
                    .map(|f| f.position)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionAction {
    pub mqtt_id: String,
    pub action: String,
}

/// Declarative path between two modules. Fields are optional so that
/// incomplete records can be reported rather than rejected at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDef {
    pub route_id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub mqtt_via: Option<Vec<String>>,
    #[serde(default)]
    pub intersection_actions: Option<Vec<IntersectionAction>>,
    #[serde(default)]
    pub tested: bool,
}

impl RouteDef {
    /// Names of required fields that are absent
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.from.as_deref().map_or(true, str::is_empty) {
            missing.push("from");
        }
        if self.to.as_deref().map_or(true, str::is_empty) {
            missing.push("to");
        }
        if self.mqtt_via.is_none() {
            missing.push("mqtt_via");
        }
        if self.intersection_actions.is_none() {
            missing.push("intersection_actions");
        }
        missing
    }

    pub fn action_for(&self, intersection: &str) -> Option<&str> {
        self.intersection_actions
            .as_ref()?
            .iter()
            .find(|a| a.mqtt_id == intersection)
            .map(|a| a.action.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteCatalog {
    #[serde(default)]
    pub routes: Vec<RouteDef>,
}

impl RouteCatalog {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| OrbisError::Config(format!("invalid routes: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            OrbisError::Config(format!("cannot read routes {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn get(&self, route_id: &str) -> Option<&RouteDef> {
        self.routes.iter().find(|r| r.route_id == route_id)
    }

    pub fn route_ids(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.route_id.as_str()).collect()
    }
}
