//! Progress event emission.
//!
//! Producers emit [`ProgressEvent`]s through a [`ProgressSink`]; a single
//! consumer renders them (terminal tree, log stream, or nothing). The
//! research service serializes emissions behind an async mutex so event
//! order reflects logical order even when phases fan out.

use async_trait::async_trait;
use serde::Serialize;

/// One progress event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Event type identifier (e.g. `"search_semantic"`, `"synthesis_start"`).
    pub event_type: String,
    /// Human-readable description.
    pub message: String,
    /// Node id, when the event belongs to a tree node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    /// Depth level, when the event belongs to a tree node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    /// Free-form metadata.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ProgressEvent {
    /// Creates an event with no node attribution or metadata.
    #[must_use]
    pub fn new(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: message.into(),
            node_id: None,
            depth: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attaches a node id.
    #[must_use]
    pub const fn with_node(mut self, node_id: u64) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Attaches a depth.
    #[must_use]
    pub const fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Consumer of progress events.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Handles one event. Implementations must not panic; emission failures
    /// are the producer's to log and ignore.
    async fn emit(&self, event: ProgressEvent);
}

/// Sink that drops everything (headless runs).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn emit(&self, _event: ProgressEvent) {}
}

/// Sink that forwards events to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    async fn emit(&self, event: ProgressEvent) {
        tracing::info!(
            event_type = %event.event_type,
            node_id = ?event.node_id,
            depth = ?event.depth,
            "{}",
            event.message
        );
    }
}

/// Sink wrapper that offsets node ids and depths, used by the code mapper to
/// nest per-PoI research trees under their PoI row.
pub struct OffsetSink<S: ProgressSink> {
    inner: S,
    depth_offset: usize,
    node_id_offset: u64,
}

impl<S: ProgressSink> OffsetSink<S> {
    /// Creates an offsetting wrapper.
    #[must_use]
    pub const fn new(inner: S, depth_offset: usize, node_id_offset: u64) -> Self {
        Self {
            inner,
            depth_offset,
            node_id_offset,
        }
    }
}

#[async_trait]
impl<S: ProgressSink> ProgressSink for OffsetSink<S> {
    async fn emit(&self, mut event: ProgressEvent) {
        event.depth = Some(event.depth.unwrap_or(0) + self.depth_offset);
        event.node_id = Some(self.node_id_offset + event.node_id.unwrap_or(0));
        self.inner.emit(event).await;
    }
}
