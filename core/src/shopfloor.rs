// Shopfloor adjacency graph and BFS routing
use std::collections::{HashMap, HashSet, VecDeque};

use crate::registry::Layout;

/// Undirected adjacency over intersection ids, module ids, module serials and
/// fixed-position ids. Neighbor lists keep road insertion order, which decides
/// ties between equally short paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShopfloorGraph {
    adjacency: HashMap<String, Vec<String>>,
}

impl ShopfloorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph from bare edges, mostly for tests and ad-hoc topologies
    pub fn from_edges<S: AsRef<str>>(edges: &[(S, S)]) -> Self {
        let mut graph = Self::new();
        for (a, b) in edges {
            graph.add_edge(a.as_ref(), b.as_ref());
        }
        graph
    }

    pub fn from_layout(layout: &Layout) -> Self {
        let mut graph = Self::new();

        for intersection in &layout.intersections {
            graph.add_node(&intersection.id);
        }
        for module in &layout.modules {
            graph.add_node(&module.id);
            if let Some(serial) = module.serial_number.as_deref().filter(|s| !s.is_empty()) {
                graph.add_node(serial);
            }
        }
        for fixed in &layout.fixed_positions {
            graph.add_node(&fixed.id);
        }

        for road in &layout.roads {
            let from = aliases(layout, &road.from);
            let to = aliases(layout, &road.to);
            for a in &from {
                for b in &to {
                    graph.add_edge(a, b);
                }
            }
        }
        graph
    }

    pub fn add_node(&mut self, id: &str) {
        self.adjacency.entry(id.to_string()).or_default();
    }

    /// Symmetric insert. A self-loop is stored once.
    pub fn add_edge(&mut self, a: &str, b: &str) {
        push_unique(self.adjacency.entry(a.to_string()).or_default(), b);
        if a != b {
            push_unique(self.adjacency.entry(b.to_string()).or_default(), a);
        }
    }

    pub fn neighbors(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adjacency.contains_key(id)
    }

    pub fn are_adjacent(&self, a: &str, b: &str) -> bool {
        self.neighbors(a).iter().any(|n| n == b)
    }

    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.adjacency.keys().map(String::as_str).collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Breadth-first shortest path. `[start]` when start equals goal, empty
    /// when the goal is unreachable or either endpoint is unknown.
    pub fn find_path(&self, start: &str, goal: &str) -> Vec<String> {
        if start == goal {
            return vec![start.to_string()];
        }
        if !self.contains(start) || !self.contains(goal) {
            return Vec::new();
        }

        let mut previous: HashMap<&str, &str> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<&str> = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for next in self.neighbors(current) {
                let next = next.as_str();
                if !visited.insert(next) {
                    continue;
                }
                previous.insert(next, current);
                if next == goal {
                    let mut path = vec![goal.to_string()];
                    let mut cursor = goal;
                    while let Some(&prev) = previous.get(cursor) {
                        path.push(prev.to_string());
                        cursor = prev;
                    }
                    path.reverse();
                    return path;
                }
                queue.push_back(next);
            }
        }
        Vec::new()
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|n| n == id) {
        list.push(id.to_string());
    }
}

/// A road endpoint naming a module also applies to the module's serial
fn aliases(layout: &Layout, id: &str) -> Vec<String> {
    let mut ids = vec![id.to_string()];
    if let Some(module) = layout
        .modules
        .iter()
        .find(|m| m.id == id || m.serial_number.as_deref() == Some(id))
    {
        for alias in std::iter::once(module.id.as_str()).chain(module.serial_number.as_deref()) {
            if !alias.is_empty() && !ids.iter().any(|i| i == alias) {
                ids.push(alias.to_string());
            }
        }
    }
    ids
}

/// Pixel coordinates of every referenceable id, at the center of its cell
pub fn id_to_position_map(
    layout: &Layout,
    cell_size: f64,
    padding: f64,
) -> HashMap<String, (f64, f64)> {
    let center = |position: [u32; 2]| {
        let [row, col] = position;
        (
            padding + col as f64 * cell_size + cell_size / 2.0,
            padding + row as f64 * cell_size + cell_size / 2.0,
        )
    };

    let mut positions = HashMap::new();
    for module in &layout.modules {
        positions.insert(module.id.clone(), center(module.position));
        if let Some(serial) = module.serial_number.as_deref().filter(|s| !s.is_empty()) {
            positions.insert(serial.to_string(), center(module.position));
        }
    }
    for intersection in &layout.intersections {
        positions.insert(intersection.id.clone(), center(intersection.position));
    }
    for fixed in &layout.fixed_positions {
        positions.insert(fixed.id.clone(), center(fixed.position));
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = r#"
modules:
  - { id: DPS, type: DPS, position: [0, 2], serialNumber: SVR4H73275 }
  - { id: HBW, type: HBW, position: [1, 0], serialNumber: SVR3QA0022 }
intersections:
  - { id: "1", position: [1, 1] }
  - { id: "2", position: [1, 2] }
fixed_positions:
  - { id: CHRG, position: [0, 0] }
roads:
  - { from: DPS, to: "2" }
  - { from: "2", to: "1" }
  - { from: "2", to: "1" }
  - { from: "1", to: HBW }
"#;

    #[test]
    fn layout_graph_is_symmetric_without_duplicates() {
        let layout = Layout::from_yaml_str(LAYOUT).unwrap();
        let graph = ShopfloorGraph::from_layout(&layout);

        for node in graph.nodes() {
            let neighbors = graph.neighbors(node);
            let unique: HashSet<_> = neighbors.iter().collect();
            assert_eq!(unique.len(), neighbors.len());
            for n in neighbors {
                assert!(graph.are_adjacent(n, node));
                assert_ne!(n, node);
            }
        }
        assert!(graph.contains("CHRG"));
        assert!(graph.neighbors("CHRG").is_empty());
        assert_eq!(graph.find_path("SVR4H73275", "HBW"), vec!["SVR4H73275", "2", "1", "HBW"]);
    }

    #[test]
    fn declared_self_loop_is_kept_once() {
        let graph = ShopfloorGraph::from_edges(&[("A", "A"), ("A", "A"), ("A", "B")]);
        assert_eq!(graph.neighbors("A"), ["A", "B"]);
        assert_eq!(graph.neighbors("B"), ["A"]);
    }

    #[test]
    fn positions_are_cell_centers() {
        let layout = Layout::from_yaml_str(LAYOUT).unwrap();
        let positions = id_to_position_map(&layout, 100.0, 10.0);
        assert_eq!(positions["DPS"], (260.0, 60.0));
        assert_eq!(positions["SVR3QA0022"], (60.0, 160.0));
        assert_eq!(positions["CHRG"], (60.0, 60.0));
    }
}
