//! Typed studio <-> canvas synchronization over a [`Bus`].
//!
//! Only derived snapshots travel here. Each frame carries the id of the surface
//! that sent it so a surface never re-applies its own output.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{Bus, BusError, BusMessage};

pub const SYNC_TOPIC: &str = "storyloom.surface.sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("sync frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// Immutable node/edge snapshot. Both lists are kept sorted by id so equal
/// graphs compare equal regardless of the order they were collected in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSnapshot")]
pub struct GraphSnapshot {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    nodes: Vec<GraphNode>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
}

impl From<RawSnapshot> for GraphSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        GraphSnapshot::new(raw.nodes, raw.edges)
    }
}

impl GraphSnapshot {
    pub fn new(mut nodes: Vec<GraphNode>, mut edges: Vec<GraphEdge>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Self { nodes, edges }
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SyncMessage {
    WorkflowPlan { plan: Value },
    GraphSnapshot(GraphSnapshot),
    AutoApply { canvas_id: String, enabled: bool },
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncFrame {
    source: SurfaceId,
    message: SyncMessage,
}

/// Publishing half bound to one surface.
#[derive(Clone)]
pub struct SyncChannel {
    bus: Arc<dyn Bus>,
    source: SurfaceId,
}

impl SyncChannel {
    pub fn new(bus: Arc<dyn Bus>, source: SurfaceId) -> Self {
        Self { bus, source }
    }

    pub fn source(&self) -> &SurfaceId {
        &self.source
    }

    pub fn publish(&self, message: SyncMessage) -> Result<usize, SyncError> {
        let frame = SyncFrame {
            source: self.source.clone(),
            message,
        };
        let payload = serde_json::to_vec(&frame)?;
        Ok(self.bus.publish(SYNC_TOPIC, Bytes::from(payload))?)
    }

    /// Subscribes as this surface. `canvas_id` is the canvas currently shown, if any;
    /// auto-apply toggles for any other canvas are filtered out.
    pub fn subscribe(&self, canvas_id: Option<String>) -> SyncSubscriber {
        SyncSubscriber {
            rx: self.bus.subscribe(SYNC_TOPIC),
            source: self.source.clone(),
            canvas_id,
        }
    }
}

pub struct SyncSubscriber {
    rx: broadcast::Receiver<BusMessage>,
    source: SurfaceId,
    canvas_id: Option<String>,
}

impl SyncSubscriber {
    pub fn set_canvas(&mut self, canvas_id: Option<String>) {
        self.canvas_id = canvas_id;
    }

    /// Next message addressed to this surface. Lag is logged and skipped; only a
    /// closed bus ends the stream.
    pub async fn recv(&mut self) -> Result<(SurfaceId, SyncMessage), SyncError> {
        loop {
            let raw = match self.rx.recv().await {
                Ok(raw) => raw,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "surface.bus",
                        surface = %self.source,
                        skipped,
                        "sync subscriber lagged"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SyncError::Bus(BusError::Closed))
                }
            };
            let frame: SyncFrame = match serde_json::from_slice(&raw.payload) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(
                        target = "surface.bus",
                        error = %err,
                        "dropping malformed sync frame"
                    );
                    continue;
                }
            };
            if frame.source == self.source {
                continue;
            }
            if let SyncMessage::AutoApply { canvas_id, .. } = &frame.message {
                if self.canvas_id.as_deref() != Some(canvas_id.as_str()) {
                    tracing::trace!(
                        target = "surface.bus",
                        canvas_id = %canvas_id,
                        "auto-apply for another canvas"
                    );
                    continue;
                }
            }
            return Ok((frame.source, frame.message));
        }
    }
}
