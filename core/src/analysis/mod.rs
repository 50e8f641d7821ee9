// Offline session analysis
mod analyzer;
mod chain;

pub use analyzer::{
    AnalyzedMessage, FilteredView, MessageFilter, SessionAnalyzer, SessionStats, TimeRange,
    MAX_ROOTED_WINDOW_SECS,
};
pub use chain::{
    extract_labels, module_from_topic, ChainEdge, ChainGraph, ChainLabels, ChainNode, NodeClass,
    Relation,
};
