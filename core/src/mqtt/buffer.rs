// Per-topic-filter ring buffers fed by the broker I/O task
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::message::{topic_matches, MqttMessage};

/// A buffered message with its per-buffer sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub seq: u64,
    pub message: MqttMessage,
}

/// Immutable copy of a ring buffer's contents at one point in time
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    pub filter: String,
    pub entries: Vec<BufferEntry>,
    /// Messages dropped at the head since the buffer was created
    pub evicted: u64,
}

impl BufferSnapshot {
    pub fn empty(filter: &str) -> Self {
        Self {
            filter: filter.to_string(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &MqttMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Entries newer than `seq`
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &BufferEntry> {
        self.entries.iter().filter(move |e| e.seq > seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.last().map(|e| e.seq)
    }

    pub fn latest(&self) -> Option<&MqttMessage> {
        self.entries.last().map(|e| &e.message)
    }
}

/// Bounded FIFO for one subscribed filter. Single writer, many readers.
#[derive(Debug)]
pub struct TopicBuffer {
    filter: String,
    capacity: usize,
    entries: RwLock<VecDeque<BufferEntry>>,
    next_seq: AtomicU64,
    evicted: AtomicU64,
}

impl TopicBuffer {
    pub fn new(filter: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            filter: filter.into(),
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            next_seq: AtomicU64::new(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append, evicting the oldest entry when full. Never blocks on readers
    /// for longer than a snapshot copy.
    pub fn push(&self, message: MqttMessage) {
        let mut entries = self.entries.write();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if entries.len() >= self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(BufferEntry { seq, message });
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        let entries = self.entries.read();
        BufferSnapshot {
            filter: self.filter.clone(),
            entries: entries.iter().cloned().collect(),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// All ring buffers of one client, keyed by filter
#[derive(Debug)]
pub struct BufferSet {
    capacity: usize,
    buffers: DashMap<String, Arc<TopicBuffer>>,
}

impl BufferSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: DashMap::new(),
        }
    }

    /// Create a buffer for `filter`; returns false when it already exists
    pub fn register(&self, filter: &str) -> bool {
        if self.buffers.contains_key(filter) {
            return false;
        }
        self.buffers
            .insert(filter.to_string(), Arc::new(TopicBuffer::new(filter, self.capacity)));
        true
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.buffers.contains_key(filter)
    }

    /// Deposit into every buffer whose filter matches; returns the number of buffers hit
    pub fn deposit(&self, message: &MqttMessage) -> usize {
        let mut hits = 0;
        for entry in self.buffers.iter() {
            if topic_matches(entry.key(), &message.topic) {
                entry.value().push(message.clone());
                hits += 1;
            }
        }
        hits
    }

    /// Snapshot for `filter`; empty for filters that were never registered
    pub fn snapshot(&self, filter: &str) -> BufferSnapshot {
        self.buffers
            .get(filter)
            .map(|b| b.snapshot())
            .unwrap_or_else(|| BufferSnapshot::empty(filter))
    }

    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        filters.sort();
        filters
    }

    pub fn clear(&self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, n: u32) -> MqttMessage {
        MqttMessage::new(topic, format!("{{\"n\":{n}}}"))
    }

    #[test]
    fn overflow_evicts_oldest_exactly_once() {
        let buffer = TopicBuffer::new("t", 3);
        for n in 0..3 {
            buffer.push(msg("t", n));
        }
        assert_eq!(buffer.snapshot().evicted, 0);

        buffer.push(msg("t", 3));
        let snap = buffer.snapshot();
        assert_eq!(snap.evicted, 1);
        assert_eq!(snap.len(), 3);
        let payloads: Vec<String> = snap.messages().map(|m| m.payload_str().into_owned()).collect();
        assert_eq!(payloads, vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]);
    }

    #[test]
    fn snapshots_extend_previous_ones() {
        let buffer = TopicBuffer::new("t", 4);
        buffer.push(msg("t", 0));
        buffer.push(msg("t", 1));
        let first = buffer.snapshot();

        for n in 2..5 {
            buffer.push(msg("t", n));
        }
        let second = buffer.snapshot();

        // Everything in the first snapshot that was not evicted is still in order
        let survivors: Vec<u64> = first
            .entries
            .iter()
            .map(|e| e.seq)
            .filter(|seq| second.entries.iter().any(|e| e.seq == *seq))
            .collect();
        let prefix: Vec<u64> = second.entries.iter().take(survivors.len()).map(|e| e.seq).collect();
        assert_eq!(survivors, prefix);
        assert_eq!(second.since(first.last_seq().unwrap()).count(), 3);
    }

    #[test]
    fn message_matching_several_filters_lands_in_each() {
        let set = BufferSet::new(10);
        assert!(set.register("module/v1/ff/+/state"));
        assert!(set.register("module/#"));
        assert!(!set.register("module/#"));

        let hits = set.deposit(&msg("module/v1/ff/SVR3QA0022/state", 1));
        assert_eq!(hits, 2);
        assert_eq!(set.snapshot("module/#").len(), 1);
        assert_eq!(set.snapshot("module/v1/ff/+/state").len(), 1);
    }

    #[test]
    fn unregistered_filter_snapshot_is_empty() {
        let set = BufferSet::new(10);
        let snap = set.snapshot("ccu/#");
        assert!(snap.is_empty());
        assert_eq!(snap.filter, "ccu/#");
    }
}
