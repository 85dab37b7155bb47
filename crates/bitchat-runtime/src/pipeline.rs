//! Batched ordering and content dedup for the public timeline
//!
//! Inbound public messages from every transport collect in a short batch
//! window. Each flush sorts by timestamp (message ID breaking ties), drops
//! content-duplicates seen within the dedup window, and inserts survivors
//! into the timeline: appended in the local mesh view, chronologically
//! placed in a location channel. The relative order of a flushed batch is
//! preserved either way.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use bitchat_core::config::PipelineConfig;
use bitchat_core::event::PublicMessage;
use bitchat_core::types::{TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Channel Kinds
// ----------------------------------------------------------------------------

/// Which timeline the pipeline is feeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Local mesh view: recent-first UX, late messages append at the tail
    Mesh,
    /// Location channel: strict chronological placement
    Geohash,
}

// ----------------------------------------------------------------------------
// Sink
// ----------------------------------------------------------------------------

/// Receives messages the pipeline accepted, in insertion order
pub trait PipelineSink: Send + Sync {
    /// A message entered the timeline
    fn on_message(&self, message: &PublicMessage);
}

/// Sink that ignores everything, for tests and headless runs
pub struct NullSink;

impl PipelineSink for NullSink {
    fn on_message(&self, _message: &PublicMessage) {}
}

// ----------------------------------------------------------------------------
// Content Normalization
// ----------------------------------------------------------------------------

/// Canonical content key: lowercase, trimmed, inner whitespace collapsed
fn normalize(content: &str) -> String {
    content
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ----------------------------------------------------------------------------
// Public Pipeline
// ----------------------------------------------------------------------------

/// The batching, ordering and dedup stage in front of the timeline
///
/// Shared between the event fan-out task and the UI thread; the inner state
/// sits behind a reader-preferring lock and every write path is short.
pub struct PublicPipeline<T: TimeSource> {
    inner: RwLock<Inner>,
    sink: Arc<dyn PipelineSink>,
    config: PipelineConfig,
    time_source: T,
    channel: ChannelKind,
}

struct Inner {
    batch: Vec<PublicMessage>,
    /// Normalized content -> timestamp of the last accepted occurrence
    dedup: HashMap<String, Timestamp>,
    timeline: Vec<PublicMessage>,
}

impl<T: TimeSource> PublicPipeline<T> {
    /// Create a pipeline feeding `sink`
    pub fn new(
        config: PipelineConfig,
        channel: ChannelKind,
        sink: Arc<dyn PipelineSink>,
        time_source: T,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                batch: Vec::new(),
                dedup: HashMap::new(),
                timeline: Vec::new(),
            }),
            sink,
            config,
            time_source,
            channel,
        }
    }

    /// Queue one inbound public message for the next flush
    pub fn enqueue(&self, message: PublicMessage) {
        self.inner.write().expect("pipeline lock").batch.push(message);
    }

    /// Sort, dedup and insert the pending batch
    ///
    /// Driven by the runtime every batch window; tests call it directly.
    pub fn flush(&self) {
        let now = self.time_source.now();
        let dedup_window = self.config.dedup_window.as_millis() as u64;
        let mut inner = self.inner.write().expect("pipeline lock");

        if inner.batch.is_empty() {
            return;
        }

        let mut batch = std::mem::take(&mut inner.batch);
        batch.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        for message in batch {
            let key = normalize(&message.content);
            if let Some(&last_seen) = inner.dedup.get(&key) {
                let gap = message.timestamp.as_millis().abs_diff(last_seen.as_millis());
                if gap <= dedup_window {
                    debug!(message_id = %message.message_id, "duplicate content dropped");
                    continue;
                }
            }
            inner.dedup.insert(key, message.timestamp);
            self.insert(&mut inner.timeline, message.clone());
            self.sink.on_message(&message);
        }

        // Age the dedup index so it cannot grow without bound.
        inner
            .dedup
            .retain(|_, seen| now.millis_since(*seen) <= dedup_window * 2);
    }

    fn insert(&self, timeline: &mut Vec<PublicMessage>, message: PublicMessage) {
        match self.channel {
            // Mesh view: always append; stale timestamps still land at the
            // tail because arrival is what the local view orders by.
            ChannelKind::Mesh => timeline.push(message),
            // Location channel: place chronologically, after any messages
            // with the same timestamp to preserve batch order.
            ChannelKind::Geohash => {
                let position = timeline
                    .partition_point(|existing| existing.timestamp <= message.timestamp);
                timeline.insert(position, message);
            }
        }
    }

    /// Snapshot of the timeline
    pub fn timeline(&self) -> Vec<PublicMessage> {
        self.inner.read().expect("pipeline lock").timeline.clone()
    }

    /// Messages waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.read().expect("pipeline lock").batch.len()
    }

    /// Drop the batch, timeline and dedup index
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("pipeline lock");
        inner.batch.clear();
        inner.dedup.clear();
        inner.timeline.clear();
    }

    /// The configured batch window, for the runtime's flush timer
    pub fn batch_window(&self) -> std::time::Duration {
        self.config.batch_window
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
