// MQTT client with per-topic ring buffers
//
// The broker I/O task only appends to buffers and taps; interpretation happens
// on the caller side when managers poll snapshots.

mod buffer;
mod client;
mod rumqtt;
mod transport;

use std::sync::Arc;

pub use buffer::{BufferEntry, BufferSet, BufferSnapshot, TopicBuffer};
pub use client::{ClientStats, FactoryClient, MessageTap};
pub use rumqtt::RumqttTransport;
pub use transport::{MessageSink, MockTransport, Transport};

use crate::config::{BrokerConfig, BrokerMode};

/// Pick the transport matching the configured broker mode
pub fn transport_for(config: &BrokerConfig) -> Arc<dyn Transport> {
    match config.mode {
        BrokerMode::Mock => Arc::new(MockTransport::new()),
        BrokerMode::Live | BrokerMode::Replay => Arc::new(RumqttTransport::new(config.clone())),
    }
}
