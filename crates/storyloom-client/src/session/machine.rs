use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use storyloom_proto::{Envelope, Record};
use surface_bus::{GraphEdge, GraphNode, GraphSnapshot, SyncChannel, SyncError, SyncMessage};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use super::state::{SessionLimits, SessionState, SessionView, ToolResultNotice};
use crate::api::{ApiError, ReviewDecision, ReviewResponse, SendMessageRequest, SessionApi};
use crate::config::ClientConfig;
use crate::transport::{StreamControl, StreamHandler, Transport, TransportError};

const TOOL_RESULT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub model: Option<String>,
    pub metadata: Option<Record>,
}

/// State shared between the machine and its stream handlers.
struct Shared {
    state: Mutex<SessionState>,
    tool_results: broadcast::Sender<ToolResultNotice>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Drives one session: sends messages, owns the single outbound stream and
/// reconciles every envelope it delivers.
pub struct SessionMachine {
    shared: Arc<Shared>,
    api: Arc<dyn SessionApi>,
    transport: Arc<dyn Transport>,
    active: Mutex<Option<StreamControl>>,
}

impl SessionMachine {
    pub fn new(
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn Transport>,
        limits: SessionLimits,
        scene_types: HashSet<String>,
    ) -> Self {
        let (tool_results, _) = broadcast::channel(TOOL_RESULT_CAPACITY);
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::new(limits, scene_types)),
                tool_results,
                revision,
            }),
            api,
            transport,
            active: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::new(
            api,
            transport,
            SessionLimits {
                max_messages: config.max_messages,
                max_artifacts: config.max_artifacts,
            },
            config.scene_tool_set(),
        )
    }

    pub fn snapshot(&self) -> SessionView {
        self.shared.state.lock().view()
    }

    pub fn is_streaming(&self) -> bool {
        self.snapshot().is_streaming
    }

    pub fn subscribe_tool_results(&self) -> broadcast::Receiver<ToolResultNotice> {
        self.shared.tool_results.subscribe()
    }

    /// Ticks whenever the state changes.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Fetches a session and replaces local state with it. A run the server
    /// still reports as active is resumed. On failure the previous state stays.
    pub async fn load_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.stop();
        let ticket = self.shared.state.lock().generation();
        let loaded = match self.api.load_session(session_id).await {
            Ok(loaded) => loaded,
            Err(err) => return Err(self.request_failed(err)),
        };
        tracing::info!(
            target = "session.machine",
            session_id,
            messages = loaded.messages.len(),
            artifacts = loaded.artifacts.len(),
            resume = loaded.active_run_id.is_some(),
            "session loaded"
        );

        let mut active = self.active.lock();
        let resume = {
            let mut state = self.shared.state.lock();
            if state.generation() != ticket {
                tracing::debug!(target = "session.machine", session_id, "load superseded");
                return Ok(());
            }
            let resume = loaded.active_run_id.clone();
            state.replace(loaded);
            resume.map(|run_id| {
                let generation = state.begin_stream(&run_id);
                (run_id, generation)
            })
        };
        self.shared.notify();
        if let Some((run_id, generation)) = resume {
            self.install_stream(&mut active, &run_id, generation);
        }
        Ok(())
    }

    /// Appends the user's message optimistically, then starts a run for it.
    /// Returns the run id assigned by the server.
    pub async fn send_message(
        &self,
        text: &str,
        options: SendOptions,
    ) -> Result<String, SessionError> {
        self.stop();
        let client_message_id = format!("local-{}", uuid::Uuid::new_v4());
        let (session_id, ticket) = {
            let mut state = self.shared.state.lock();
            state.clear_error();
            state.push_local_user(&client_message_id, text);
            (state.session_id(), state.generation())
        };
        self.shared.notify();

        let request = SendMessageRequest {
            text: text.to_string(),
            model: options.model,
            metadata: options.metadata,
            client_message_id,
        };
        let response = match self.api.send_message(session_id.as_deref(), &request).await {
            Ok(response) => response,
            Err(err) => return Err(self.request_failed(err)),
        };

        let mut active = self.active.lock();
        let generation = {
            let mut state = self.shared.state.lock();
            state.ensure_session(&response.session_id);
            if state.generation() != ticket {
                tracing::debug!(
                    target = "session.machine",
                    run_id = %response.run_id,
                    "send superseded before stream opened"
                );
                None
            } else {
                Some(state.begin_stream(&response.run_id))
            }
        };
        self.shared.notify();
        if let Some(generation) = generation {
            self.install_stream(&mut active, &response.run_id, generation);
        }
        Ok(response.run_id)
    }

    /// Stops listening to the current stream. Merged state is kept as-is and
    /// partial messages stay `streaming`. Calling it while idle does nothing.
    pub fn stop(&self) {
        let control = self.active.lock().take();
        if let Some(control) = control {
            tracing::debug!(target = "session.machine", run_id = %control.run_id(), "stopping stream");
            control.close();
        }
        let changed = self.shared.state.lock().stop_stream();
        if changed {
            self.shared.notify();
        }
    }

    /// Asks the server to cancel the active run, then stops locally.
    pub async fn cancel_run(&self) -> Result<(), SessionError> {
        let control = self.active.lock().clone();
        let Some(control) = control else {
            return Ok(());
        };
        let result = control.cancel().await;
        self.stop();
        result.map_err(|err| {
            self.shared.state.lock().set_error(err.to_string());
            self.shared.notify();
            SessionError::Transport(err)
        })
    }

    pub async fn approve_session(
        &self,
        session_id: &str,
        note: Option<&str>,
    ) -> Result<ReviewResponse, SessionError> {
        self.review(session_id, ReviewDecision::Approve, note).await
    }

    pub async fn reject_session(
        &self,
        session_id: &str,
        note: Option<&str>,
    ) -> Result<ReviewResponse, SessionError> {
        self.review(session_id, ReviewDecision::Reject, note).await
    }

    async fn review(
        &self,
        session_id: &str,
        decision: ReviewDecision,
        note: Option<&str>,
    ) -> Result<ReviewResponse, SessionError> {
        match self.api.review(session_id, decision, note).await {
            Ok(response) => {
                self.shared
                    .state
                    .lock()
                    .apply_review(session_id, &response);
                self.shared.notify();
                Ok(response)
            }
            Err(err) => Err(self.request_failed(err)),
        }
    }

    /// Drops the stream and every piece of session state.
    pub fn reset(&self) {
        if let Some(control) = self.active.lock().take() {
            control.close();
        }
        self.shared.state.lock().reset();
        self.shared.notify();
    }

    /// Publishes the current scene projection to the canvas surface as a
    /// graph: one node per scene, chained in display order.
    pub fn publish_scenes(&self, channel: &SyncChannel) -> Result<usize, SyncError> {
        let scenes = self.snapshot().scenes;
        let nodes = scenes
            .iter()
            .map(|scene| GraphNode {
                id: scene.id.clone(),
                kind: "scene".to_string(),
                data: serde_json::to_value(&scene.fields).unwrap_or_default(),
            })
            .collect();
        let edges = scenes
            .windows(2)
            .map(|pair| GraphEdge {
                id: format!("{}->{}", pair[0].id, pair[1].id),
                source: pair[0].id.clone(),
                target: pair[1].id.clone(),
            })
            .collect();
        channel.publish(SyncMessage::GraphSnapshot(GraphSnapshot::new(nodes, edges)))
    }

    fn request_failed(&self, err: ApiError) -> SessionError {
        tracing::warn!(target = "session.machine", error = %err, "request failed");
        self.shared.state.lock().set_error(err.to_string());
        self.shared.notify();
        SessionError::Api(err)
    }

    /// Opens the transport for `generation` and makes it the active stream.
    /// Caller holds the `active` lock so a concurrent `stop` cannot interleave.
    fn install_stream(&self, active: &mut Option<StreamControl>, run_id: &str, generation: u64) {
        if let Some(previous) = active.take() {
            previous.close();
        }
        tracing::info!(target = "session.machine", run_id, generation, "opening stream");
        let handler = Arc::new(StreamBinding {
            shared: self.shared.clone(),
            generation,
        });
        *active = Some(self.transport.open(run_id, handler));
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        if let Some(control) = self.active.get_mut().take() {
            control.close();
        }
    }
}

/// Handler for one stream generation. Callbacks arriving after the machine
/// moved on to another generation are discarded.
struct StreamBinding {
    shared: Arc<Shared>,
    generation: u64,
}

impl StreamBinding {
    fn with_current<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = self.shared.state.lock();
        if state.generation() != self.generation {
            tracing::trace!(
                target = "session.machine",
                stale = self.generation,
                current = state.generation(),
                "discarding stale stream callback"
            );
            return None;
        }
        Some(f(&mut state))
    }
}

impl StreamHandler for StreamBinding {
    fn on_open(&self) {
        tracing::debug!(target = "session.machine", generation = self.generation, "stream open");
    }

    fn on_event(&self, envelope: Envelope) {
        let Some(outcome) = self.with_current(|state| state.apply(&envelope)) else {
            return;
        };
        if let Some(notice) = outcome.tool_result {
            // No subscribers is fine.
            let _ = self.shared.tool_results.send(notice);
        }
        if outcome.changed {
            self.shared.notify();
        }
    }

    fn on_error(&self, error: TransportError) {
        if self
            .with_current(|state| state.fail_stream(error.to_string()))
            .is_some()
        {
            self.shared.notify();
        }
    }

    fn on_close(&self) {
        if self.with_current(SessionState::stream_closed) == Some(true) {
            self.shared.notify();
        }
    }
}
