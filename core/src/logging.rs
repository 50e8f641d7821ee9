//! Logging setup and the in-memory log ring buffer.
//!
//! Every subsystem logs through `tracing`. `init_logging` wires an env filter,
//! a compact stderr formatter, an optional append-only file under the log
//! directory, and a [`LogRingLayer`] that keeps the most recent records in a
//! bounded buffer for operator views.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::{OrbisError, Result};

/// One formatted log record
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    pub fn format(&self) -> String {
        format!(
            "{} {:>5} {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.target,
            self.message
        )
    }
}

/// Bounded FIFO of log records; oldest evicted on overflow
#[derive(Debug, Clone)]
pub struct LogRingBuffer {
    capacity: usize,
    records: Arc<Mutex<VecDeque<LogRecord>>>,
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot of all records, oldest first
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Records of exactly one level
    pub fn records_at(&self, level: Level) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Records at `level` or more severe
    pub fn records_at_least(&self, level: Level) -> Vec<LogRecord> {
        // tracing orders levels by verbosity: ERROR < WARN < ... < TRACE
        self.records
            .lock()
            .iter()
            .filter(|r| r.level <= level)
            .cloned()
            .collect()
    }

    pub fn counts_by_level(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.lock().iter() {
            *counts.entry(record.level.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn layer(&self) -> LogRingLayer {
        LogRingLayer {
            buffer: self.clone(),
        }
    }
}

/// `tracing` layer that feeds a [`LogRingBuffer`]
pub struct LogRingLayer {
    buffer: LogRingBuffer,
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogRecord {
            timestamp: Utc::now(),
            level: *meta.level(),
            target: meta.target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
}

impl RecordVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the global subscriber. Returns the ring buffer fed by it.
pub fn init_logging(config: &LoggingConfig) -> Result<LogRingBuffer> {
    let ring = LogRingBuffer::new(config.ring_capacity);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("orbis.log"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(file_layer)
        .with(ring.layer())
        .try_init()
        .map_err(|e| OrbisError::Config(format!("logging already initialized: {e}")))?;

    Ok(ring)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let ring = LogRingBuffer::new(2);
        for i in 0..3 {
            ring.push(LogRecord {
                timestamp: Utc::now(),
                level: Level::INFO,
                target: "test".into(),
                message: format!("m{i}"),
            });
        }
        let records = ring.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "m1");
        assert_eq!(records[1].message, "m2");
    }

    #[test]
    fn layer_captures_events_with_level_views() {
        let ring = LogRingBuffer::new(16);
        let subscriber = tracing_subscriber::registry().with(ring.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "orders", order_id = "o-1", "Order created");
            tracing::warn!(target: "orders", "Unknown order");
            tracing::error!(target: "mqtt", "Publish failed");
        });

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.records_at(Level::WARN).len(), 1);
        assert_eq!(ring.records_at_least(Level::WARN).len(), 2);
        let first = &ring.records()[0];
        assert_eq!(first.target, "orders");
        assert!(first.message.contains("Order created"));
        assert!(first.message.contains("order_id=o-1"));
        assert_eq!(ring.counts_by_level().get("ERROR"), Some(&1));
    }
}
