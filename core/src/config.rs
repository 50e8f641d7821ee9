// Runtime configuration: TOML file overlaid by environment variables
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{OrbisError, Result};

/// Which broker the process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// The factory broker
    #[default]
    Live,
    /// A local broker fed by the session player
    Replay,
    /// In-process loopback, no network
    Mock,
}

impl FromStr for BrokerMode {
    type Err = OrbisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(BrokerMode::Live),
            "replay" => Ok(BrokerMode::Replay),
            "mock" => Ok(BrokerMode::Mock),
            other => Err(OrbisError::Config(format!("unknown broker mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    pub client_id: String,
    pub mode: BrokerMode,
    /// Per-call publish timeout
    pub publish_timeout_ms: u64,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
    /// Ring buffer capacity for every subscribed filter
    pub buffer_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.100".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive_secs: 60,
            client_id: format!("orbis-{}", std::process::id()),
            mode: BrokerMode::Live,
            publish_timeout_ms: 5_000,
            connect_retries: 5,
            connect_backoff_ms: 500,
            buffer_capacity: 1_000,
        }
    }
}

impl BrokerConfig {
    /// Host actually dialed; replay mode always talks to a local broker
    pub fn effective_host(&self) -> &str {
        match self.mode {
            BrokerMode::Replay => "localhost",
            _ => &self.host,
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub directory: PathBuf,
    pub auto_save_interval_secs: u64,
    pub max_file_size_mb: u64,
    pub default_replay_speed: f64,
    /// Recorder switches to degraded mode above this many buffered messages
    pub max_buffered_messages: usize,
    /// Replay interval used when timestamps cannot be parsed
    pub fallback_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/sessions"),
            auto_save_interval_secs: 60,
            max_file_size_mb: 50,
            default_replay_speed: 1.0,
            max_buffered_messages: 500_000,
            fallback_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// High-rate sensor/camera streams excluded from analysis by default
    pub prefilter_topics: Vec<String>,
    pub chain_window_secs: u64,
    pub rooted_window_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            prefilter_topics: vec![
                "/j1/txt/1/i/cam".to_string(),
                "/j1/txt/1/i/bme680".to_string(),
                "/j1/txt/1/i/ldr".to_string(),
                "/j1/txt/1/c/bme680".to_string(),
                "/j1/txt/1/c/ldr".to_string(),
                "/j1/txt/1/c/cam".to_string(),
            ],
            chain_window_secs: 30,
            rooted_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub topics: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
    pub layout: Option<PathBuf>,
    pub routes: Option<PathBuf>,
    pub workflows: Option<PathBuf>,
    /// Registry schema version the process expects
    pub model_version: Option<String>,
    pub watch: bool,
    pub watch_interval_secs: u64,
}

impl RegistryConfig {
    /// All configured registry files, for the reload watcher
    pub fn files(&self) -> Vec<PathBuf> {
        [&self.topics, &self.layout, &self.routes, &self.workflows]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: Option<PathBuf>,
    pub level: String,
    pub ring_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: Some(PathBuf::from("data/logs")),
            level: "info".to_string(),
            ring_capacity: 1_000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbisConfig {
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub analysis: AnalysisConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

impl OrbisConfig {
    /// Load configuration from a TOML file (path via ORBIS_CONFIG or ./orbis.toml),
    /// overlaying values onto defaults, then apply environment overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load() -> Result<Self> {
        let path = std::env::var("ORBIS_CONFIG").unwrap_or_else(|_| "orbis.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(
                target: "config",
                path = %path,
                "No TOML config found; using defaults/env"
            );
            let mut config = Self::default();
            config.apply_env();
            return Ok(config);
        }
        Self::load_from(p)
    }

    /// Strict load: the file must exist and parse
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            OrbisError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| OrbisError::Config(format!("invalid config: {e}")))
    }

    /// Apply `ORBIS_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ORBIS_MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("ORBIS_MQTT_PORT").and_then(|p| p.parse().ok()) {
            self.broker.port = port;
        }
        if let Some(user) = lookup("ORBIS_MQTT_USERNAME") {
            self.broker.username = Some(user);
        }
        if let Some(password) = lookup("ORBIS_MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(id) = lookup("ORBIS_MQTT_CLIENT_ID") {
            self.broker.client_id = id;
        }
        if let Some(mode) = lookup("ORBIS_BROKER_MODE") {
            match mode.parse() {
                Ok(mode) => self.broker.mode = mode,
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Ignoring ORBIS_BROKER_MODE")
                }
            }
        }
        if let Some(dir) = lookup("ORBIS_SESSION_DIR") {
            self.session.directory = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ORBIS_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("ORBIS_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_overlays_defaults() {
        let config = OrbisConfig::from_toml_str(
            r#"
            [broker]
            host = "10.0.0.5"
            mode = "mock"

            [analysis]
            rooted_window_secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.mode, BrokerMode::Mock);
        assert_eq!(config.analysis.rooted_window_secs, 120);
        assert_eq!(config.analysis.chain_window_secs, 30);
        assert_eq!(config.session.default_replay_speed, 1.0);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = OrbisConfig::from_toml_str("[broker\nport = ").unwrap_err();
        assert!(matches!(err, OrbisError::Config(_)));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("ORBIS_MQTT_HOST", "broker.local"),
            ("ORBIS_MQTT_PORT", "1884"),
            ("ORBIS_BROKER_MODE", "replay"),
            ("ORBIS_SESSION_DIR", "/tmp/sessions"),
        ]
        .into_iter()
        .collect();

        let mut config = OrbisConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.mode, BrokerMode::Replay);
        assert_eq!(config.broker.effective_host(), "localhost");
        assert_eq!(config.session.directory, PathBuf::from("/tmp/sessions"));
    }
}
