//! In-process topic bus shared by the studio and canvas surfaces.
//!
//! The raw [`Bus`] moves opaque byte payloads per topic; [`sync`] layers the
//! typed cross-surface protocol on top of it.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod sync;

pub use sync::{
    GraphEdge, GraphNode, GraphSnapshot, SurfaceId, SyncChannel, SyncError, SyncMessage,
    SyncSubscriber, SYNC_TOPIC,
};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Delivers `payload` to current subscribers of `topic` and returns how many
    /// received it. Publishing with nobody listening is not an error.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
}

#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.sender_for(topic);
        if sender.receiver_count() == 0 {
            tracing::trace!(target = "surface.bus", topic, "publish without subscribers");
            return Ok(0);
        }
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }
}
