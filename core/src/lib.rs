// ORBIS Core Library
// MQTT control and observation plane for the ORBIS model factory

pub mod analysis;
pub mod clock;
pub mod config;
pub mod control;
pub mod controllers;
pub mod inventory;
pub mod logging;
pub mod message;
pub mod mqtt;
pub mod orders;
pub mod pump;
pub mod registry;
pub mod route;
pub mod session;
pub mod shopfloor;
pub mod templates;
pub mod workflow;

// Export core types
pub use analysis::{ChainGraph, SessionAnalyzer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BrokerMode, OrbisConfig};
pub use control::SystemControlManager;
pub use controllers::{ControllerInfo, ControllerRegistry};
pub use inventory::InventoryView;
pub use logging::{LogRecord, LogRingBuffer};
pub use message::{MqttMessage, OutboundMessage, QoS};
pub use mqtt::{FactoryClient, MockTransport, Transport};
pub use orders::{OrderManager, OrderRecord, OrderStatus};
pub use pump::ObservationPump;
pub use registry::{Layout, RouteCatalog, SharedRegistry, TopicRegistry};
pub use route::RouteGenerator;
pub use session::{SessionPlayer, SessionRecorder};
pub use shopfloor::ShopfloorGraph;
pub use templates::TemplateManager;
pub use workflow::SequenceRunner;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrbisError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error on {topic}: {reason}")]
    Protocol { topic: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl OrbisError {
    /// Process exit code for CLI entry points
    pub fn exit_code(&self) -> i32 {
        match self {
            OrbisError::Cancelled(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrbisError>;

/// Process-wide runtime: one instance per process, fresh instances in tests
pub struct Orbis {
    pub config: OrbisConfig,
    pub client: std::sync::Arc<FactoryClient>,
    pub registry: SharedRegistry,
    pub templates: std::sync::Arc<TemplateManager>,
    pub orders: std::sync::Arc<OrderManager>,
    pub controllers: std::sync::Arc<ControllerRegistry>,
    pub inventory: std::sync::Arc<InventoryView>,
    pub control: SystemControlManager,
    pub routes: Option<std::sync::Arc<RouteGenerator>>,
    pub workflows: std::sync::Arc<SequenceRunner>,
    pub pump: ObservationPump,
}

impl Orbis {
    /// Build every subsystem from configuration. Registry files that are
    /// configured but unreadable are fatal; absent optional files are not.
    pub fn new(config: OrbisConfig) -> Result<Self> {
        let transport = mqtt::transport_for(&config.broker);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: OrbisConfig,
        transport: std::sync::Arc<dyn Transport>,
    ) -> Result<Self> {
        use std::sync::Arc;

        let registry = SharedRegistry::load(config.registry.topics.as_deref())?;
        if let Some(expected) = &config.registry.model_version {
            registry.current().check_version(expected)?;
        }

        let templates = Arc::new(TemplateManager::load_dir(
            config.registry.templates_dir.as_deref(),
        )?);
        let client = Arc::new(FactoryClient::new(transport, config.broker.clone()));
        let orders = Arc::new(OrderManager::new());
        let controllers = Arc::new(ControllerRegistry::new());
        let inventory = Arc::new(InventoryView::new());

        let routes = match (&config.registry.layout, &config.registry.routes) {
            (Some(layout), Some(routes)) => Some(Arc::new(RouteGenerator::new(
                Layout::load(layout)?,
                RouteCatalog::load(routes)?,
            ))),
            _ => None,
        };

        let workflows = match &config.registry.workflows {
            Some(path) => Arc::new(SequenceRunner::load(path)?),
            None => Arc::new(SequenceRunner::default()),
        };

        let pump = ObservationPump::new(
            client.clone(),
            orders.clone(),
            controllers.clone(),
            inventory.clone(),
        );

        Ok(Self {
            config,
            client,
            registry,
            templates,
            orders,
            controllers,
            inventory,
            control: SystemControlManager::new(),
            routes,
            workflows,
            pump,
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting ORBIS control plane...");

        self.client.connect().await?;
        self.pump.subscribe().await?;

        tracing::info!("ORBIS control plane started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down ORBIS control plane...");

        self.client.disconnect().await?;

        tracing::info!("ORBIS control plane shut down");
        Ok(())
    }
}
