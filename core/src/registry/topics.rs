//! Topic registry: resolves wire topics to category, sub-category, module and
//! friendly name.
//!
//! Exact entries win over wildcard patterns; patterns are tried in declaration
//! order. Topics absent from the registry get a best-effort classification from
//! their prefix, so callers always receive an answer (possibly `Unknown`).

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::message::{is_wildcard, topic_matches};
use crate::{OrbisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "CCU")]
    Ccu,
    #[serde(rename = "MODULE")]
    Module,
    #[serde(rename = "TXT")]
    Txt,
    #[serde(rename = "FTS")]
    Fts,
    #[serde(rename = "Node-RED")]
    NodeRed,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Ccu => "CCU",
            Category::Module => "MODULE",
            Category::Txt => "TXT",
            Category::Fts => "FTS",
            Category::NodeRed => "Node-RED",
            Category::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    Out,
}

/// Resolved description of a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: String,
    pub category: Category,
    #[serde(default)]
    pub sub_category: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    /// False when synthesized from prefix rules
    #[serde(skip, default = "default_true")]
    pub registered: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    modules: HashMap<String, String>,
    #[serde(default)]
    topics: Vec<TopicInfo>,
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    version: Option<String>,
    exact: HashMap<String, TopicInfo>,
    patterns: Vec<TopicInfo>,
    // serial number -> module name
    modules: HashMap<String, String>,
}

impl TopicRegistry {
    /// Registry with no entries; every lookup goes through the fallback rules
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(raw)
            .map_err(|e| OrbisError::Config(format!("invalid topic registry: {e}")))?;

        let mut registry = Self {
            version: file.version,
            modules: file.modules,
            ..Default::default()
        };
        for mut info in file.topics {
            info.registered = true;
            if info.friendly_name.is_empty() {
                info.friendly_name = info.topic.clone();
            }
            if is_wildcard(&info.topic) {
                registry.patterns.push(info);
            } else {
                registry.exact.insert(info.topic.clone(), info);
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            OrbisError::Config(format!("cannot read topic registry {}: {e}", path.display()))
        })?;
        let registry = Self::from_yaml_str(&raw)?;
        info!(
            target: "registry",
            path = %path.display(),
            topics = registry.exact.len(),
            patterns = registry.patterns.len(),
            "Topic registry loaded"
        );
        Ok(registry)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Fail with a `Config` error when the registry schema version differs
    pub fn check_version(&self, expected: &str) -> Result<()> {
        match self.version.as_deref() {
            Some(v) if v == expected => Ok(()),
            Some(v) => Err(OrbisError::Config(format!(
                "registry version {v} does not match expected {expected}"
            ))),
            None => Err(OrbisError::Config(format!(
                "registry has no version, expected {expected}"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full classification of a topic
    pub fn topic_info(&self, topic: &str) -> TopicInfo {
        if let Some(info) = self.exact.get(topic) {
            return info.clone();
        }
        if let Some(pattern) = self.patterns.iter().find(|p| topic_matches(&p.topic, topic)) {
            let mut info = pattern.clone();
            info.topic = topic.to_string();
            if info.module.is_none() {
                info.module = self.module_from_topic(topic);
            }
            return info;
        }
        self.synthesize(topic)
    }

    pub fn friendly_name(&self, topic: &str) -> String {
        self.topic_info(topic).friendly_name
    }

    pub fn category(&self, topic: &str) -> Category {
        self.topic_info(topic).category
    }

    pub fn sub_category(&self, topic: &str) -> String {
        self.topic_info(topic).sub_category
    }

    pub fn module(&self, topic: &str) -> Option<String> {
        self.topic_info(topic).module
    }

    pub fn template(&self, topic: &str) -> Option<String> {
        self.topic_info(topic).template
    }

    /// Module name for a serial number, if the registry knows it
    pub fn module_name(&self, serial: &str) -> Option<&str> {
        self.modules.get(serial).map(String::as_str)
    }

    fn all_entries(&self) -> impl Iterator<Item = &TopicInfo> {
        self.exact.values().chain(self.patterns.iter())
    }

    fn sorted_topics<'a>(entries: impl Iterator<Item = &'a TopicInfo>) -> Vec<String> {
        let mut topics: Vec<String> = entries.map(|i| i.topic.clone()).collect();
        topics.sort();
        topics
    }

    pub fn topics_by_category(&self, category: Category) -> Vec<String> {
        Self::sorted_topics(self.all_entries().filter(|i| i.category == category))
    }

    pub fn topics_by_sub_category(&self, sub_category: &str) -> Vec<String> {
        Self::sorted_topics(self.all_entries().filter(|i| i.sub_category == sub_category))
    }

    pub fn topics_by_module(&self, module: &str) -> Vec<String> {
        Self::sorted_topics(
            self.all_entries()
                .filter(|i| i.module.as_deref() == Some(module)),
        )
    }

    fn module_from_topic(&self, topic: &str) -> Option<String> {
        let segments: Vec<&str> = topic.split('/').collect();
        let serial = match segments.as_slice() {
            ["module", "v1", "ff", "NodeRed", serial, ..] => *serial,
            ["module", "v1", "ff", serial, ..] | ["fts", "v1", "ff", serial, ..] => *serial,
            _ => return None,
        };
        Some(
            self.module_name(serial)
                .map(str::to_string)
                .unwrap_or_else(|| serial.to_string()),
        )
    }

    /// Best-effort classification from topic prefixes
    fn synthesize(&self, topic: &str) -> TopicInfo {
        let segments: Vec<&str> = topic.split('/').collect();
        let mut info = TopicInfo {
            topic: topic.to_string(),
            category: Category::Unknown,
            sub_category: "Unknown".to_string(),
            module: None,
            friendly_name: topic.to_string(),
            description: String::new(),
            template: None,
            direction: Direction::In,
            registered: false,
        };

        match segments.as_slice() {
            ["ccu", kind, rest @ ..] => {
                info.category = Category::Ccu;
                info.sub_category = match *kind {
                    "set" => "Control",
                    "order" => "Order",
                    "state" => "State",
                    "pairing" => "Pairing",
                    "global" => "Global",
                    _ => "General",
                }
                .to_string();
                if *kind == "set" {
                    info.direction = Direction::Out;
                }
                let tail = std::iter::once(*kind).chain(rest.iter().copied()).collect::<Vec<_>>();
                info.friendly_name = format!("CCU : {}", tail.join("/"));
            }
            ["module", "v1", "ff", "NodeRed", serial, rest @ ..] => {
                let name = self.module_name(serial).unwrap_or(*serial).to_string();
                info.category = Category::NodeRed;
                info.sub_category = sub_category_for_kind(rest.last().copied());
                info.friendly_name = format!("NodeRed {} : {}", name, rest.join("/"));
                info.module = Some(name);
            }
            ["module", "v1", "ff", serial, rest @ ..] => {
                let name = self.module_name(serial).unwrap_or(*serial).to_string();
                let kind = rest.last().copied();
                info.category = Category::Module;
                info.sub_category = sub_category_for_kind(kind);
                info.direction = direction_for_kind(kind);
                info.friendly_name = format!("{} : {}", name, rest.join("/"));
                info.module = Some(name);
            }
            ["fts", "v1", "ff", serial, rest @ ..] => {
                let kind = rest.last().copied();
                info.category = Category::Fts;
                info.sub_category = sub_category_for_kind(kind);
                info.direction = direction_for_kind(kind);
                info.friendly_name = format!("FTS {} : {}", serial, rest.join("/"));
                info.module = Some(serial.to_string());
            }
            ["", "j1", "txt", _, io, rest @ ..] => {
                info.category = Category::Txt;
                info.sub_category = match *io {
                    "i" => "Input",
                    "o" => "Output",
                    "c" => "Control",
                    "f" => "Function",
                    _ => "General",
                }
                .to_string();
                info.friendly_name = format!("TXT : {}/{}", io, rest.join("/"));
            }
            _ => {}
        }
        info
    }
}

fn sub_category_for_kind(kind: Option<&str>) -> String {
    match kind {
        Some("state") => "State",
        Some("factsheet") => "Factsheet",
        Some("order") => "Order",
        Some("instantAction") => "InstantAction",
        Some("connection") => "Connection",
        Some(_) | None => "General",
    }
    .to_string()
}

fn direction_for_kind(kind: Option<&str>) -> Direction {
    match kind {
        Some("order") | Some("instantAction") => Direction::Out,
        _ => Direction::In,
    }
}

/// Process-wide registry handle with an explicit reload hook
#[derive(Clone)]
pub struct SharedRegistry {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<TopicRegistry>>>,
}

impl SharedRegistry {
    pub fn new(registry: TopicRegistry) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    /// Load from `path`, or start empty when no path is configured
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let registry = match path {
            Some(p) => TopicRegistry::load(p)?,
            None => TopicRegistry::empty(),
        };
        Ok(Self {
            path: path.map(Path::to_path_buf),
            current: Arc::new(RwLock::new(Arc::new(registry))),
        })
    }

    pub fn current(&self) -> Arc<TopicRegistry> {
        self.current.read().clone()
    }

    /// Re-read the backing file. On failure the previous registry stays active.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let registry = TopicRegistry::load(path)?;
        *self.current.write() = Arc::new(registry);
        info!(target: "registry", path = %path.display(), "Topic registry reloaded");
        Ok(())
    }
}

/// Polls registry files for modification and invokes a reload callback
pub struct RegistryWatcher;

impl RegistryWatcher {
    pub fn spawn<F>(files: Vec<PathBuf>, every: Duration, on_change: F) -> JoinHandle<()>
    where
        F: Fn(&Path) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen: HashMap<PathBuf, Option<SystemTime>> = files
                .iter()
                .map(|p| (p.clone(), modified(p)))
                .collect();
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                for file in &files {
                    let now = modified(file);
                    let previous = seen.insert(file.clone(), now).flatten();
                    if now.is_some() && now != previous {
                        on_change(file);
                    } else if now.is_none() && previous.is_some() {
                        warn!(
                            target: "registry",
                            path = %file.display(),
                            "Registry file disappeared"
                        );
                    }
                }
            }
        })
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
version: "1.2"
modules:
  SVR3QA0022: HBW
  SVR4H73275: DPS
topics:
  - topic: ccu/order/request
    category: CCU
    sub_category: Order
    friendly_name: "CCU : Order Request"
    template: ccu/order/request
    direction: out
  - topic: module/v1/ff/+/state
    category: MODULE
    sub_category: State
    friendly_name: "Module State"
"#;

    #[test]
    fn exact_entries_win() {
        let registry = TopicRegistry::from_yaml_str(REGISTRY).unwrap();
        let info = registry.topic_info("ccu/order/request");
        assert!(info.registered);
        assert_eq!(info.category, Category::Ccu);
        assert_eq!(info.friendly_name, "CCU : Order Request");
        assert_eq!(info.direction, Direction::Out);
    }

    #[test]
    fn wildcard_entries_resolve_module_names() {
        let registry = TopicRegistry::from_yaml_str(REGISTRY).unwrap();
        let info = registry.topic_info("module/v1/ff/SVR3QA0022/state");
        assert_eq!(info.category, Category::Module);
        assert_eq!(info.module.as_deref(), Some("HBW"));
        assert_eq!(info.topic, "module/v1/ff/SVR3QA0022/state");
        assert_eq!(
            registry.topics_by_category(Category::Module),
            vec!["module/v1/ff/+/state".to_string()]
        );
    }

    #[test]
    fn unknown_topics_are_synthesized() {
        let registry = TopicRegistry::empty();

        let set = registry.topic_info("ccu/set/reset");
        assert!(!set.registered);
        assert_eq!(set.category, Category::Ccu);
        assert_eq!(set.sub_category, "Control");
        assert_eq!(set.direction, Direction::Out);

        let module = registry.topic_info("module/v1/ff/SVR4H76449/factsheet");
        assert_eq!(module.category, Category::Module);
        assert_eq!(module.module.as_deref(), Some("SVR4H76449"));
        assert_eq!(module.sub_category, "Factsheet");

        let bridged = registry.topic_info("module/v1/ff/NodeRed/SVR4H76449/state");
        assert_eq!(bridged.category, Category::NodeRed);

        let txt = registry.topic_info("/j1/txt/1/i/cam");
        assert_eq!(txt.category, Category::Txt);
        assert_eq!(txt.sub_category, "Input");

        let fts = registry.topic_info("fts/v1/ff/5iO4/state");
        assert_eq!(fts.category, Category::Fts);
        assert_eq!(fts.module.as_deref(), Some("5iO4"));

        assert_eq!(registry.category("something/else"), Category::Unknown);
    }

    #[test]
    fn version_check() {
        let registry = TopicRegistry::from_yaml_str(REGISTRY).unwrap();
        assert!(registry.check_version("1.2").is_ok());
        assert!(matches!(registry.check_version("2.0"), Err(OrbisError::Config(_))));
    }
}
