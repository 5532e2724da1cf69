//! Reconciled client-side model of one session.
//!
//! Every mutation is keyed by a stable id so re-applying an envelope leaves the
//! state unchanged. Lists are trimmed from the front right after each mutation.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use storyloom_proto::{
    Artifact, ArtifactPatch, Envelope, Event, FinalMessage, JobPhase, JobUpdate, Message,
    MessageStatus, Record, Role, Scene, Session, SessionPatch, ToolCall, ToolResult,
};

use super::scenes::derive_scenes;
use crate::api::{LoadedSession, ReviewResponse};

const REPLAY_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_messages: usize,
    pub max_artifacts: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_messages: 500,
            max_artifacts: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Idle,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

/// Payload handed to tool-result observers, once per distinct result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResultNotice {
    pub name: String,
    pub output: Record,
    pub status: MessageStatus,
    pub tool_call_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub changed: bool,
    pub tool_result: Option<ToolResultNotice>,
}

/// Read-only copy of the state for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session: Option<Session>,
    /// Display order: creation time, then insertion order.
    pub messages: Vec<Message>,
    pub artifacts: Vec<Artifact>,
    pub scenes: Vec<Scene>,
    pub is_streaming: bool,
    pub stream_status: StreamStatus,
    pub error: Option<String>,
}

/// Bounded set of `(stream, event_id)` pairs already applied.
#[derive(Debug, Default)]
struct ReplayGuard {
    seen: HashSet<(String, u64)>,
    order: VecDeque<(String, u64)>,
}

impl ReplayGuard {
    /// Records the key and returns `true` if it had not been seen before.
    fn first_sighting(&mut self, stream: &str, event_id: u64) -> bool {
        let key = (stream.to_string(), event_id);
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > REPLAY_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[derive(Debug)]
pub struct SessionState {
    session: Option<Session>,
    messages: Vec<Message>,
    artifacts: Vec<Artifact>,
    scenes: Vec<Scene>,
    stream_status: StreamStatus,
    error: Option<String>,
    generation: u64,
    active_run: Option<String>,
    limits: SessionLimits,
    scene_types: HashSet<String>,
    next_seq: u64,
    next_revision: u64,
    deltas: ReplayGuard,
}

impl SessionState {
    pub fn new(limits: SessionLimits, scene_types: HashSet<String>) -> Self {
        Self {
            session: None,
            messages: Vec::new(),
            artifacts: Vec::new(),
            scenes: Vec::new(),
            stream_status: StreamStatus::Idle,
            error: None,
            generation: 0,
            active_run: None,
            limits,
            scene_types,
            next_seq: 0,
            next_revision: 0,
            deltas: ReplayGuard::default(),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|session| session.id.clone())
    }

    /// Messages in insertion order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.stream_status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_run(&self) -> Option<&str> {
        self.active_run.as_deref()
    }

    pub fn view(&self) -> SessionView {
        let mut messages = self.messages.clone();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        SessionView {
            session: self.session.clone(),
            messages,
            artifacts: self.artifacts.clone(),
            scenes: self.scenes.clone(),
            is_streaming: self.stream_status == StreamStatus::Streaming,
            stream_status: self.stream_status,
            error: self.error.clone(),
        }
    }

    // ---- stream lifecycle -------------------------------------------------

    /// Starts a new stream generation for `run_id`; older handlers become stale.
    pub fn begin_stream(&mut self, run_id: &str) -> u64 {
        self.generation += 1;
        self.active_run = Some(run_id.to_string());
        self.stream_status = StreamStatus::Streaming;
        self.error = None;
        self.generation
    }

    /// Invalidates the current generation. Partial messages stay as they are.
    pub fn stop_stream(&mut self) -> bool {
        self.generation += 1;
        self.active_run = None;
        if self.stream_status == StreamStatus::Streaming {
            self.stream_status = StreamStatus::Cancelled;
            return true;
        }
        false
    }

    pub fn stream_closed(&mut self) -> bool {
        self.active_run = None;
        if self.stream_status == StreamStatus::Streaming {
            self.stream_status = StreamStatus::Complete;
            return true;
        }
        false
    }

    /// Records a failed request without touching the stream or merged data.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn fail_stream(&mut self, message: impl Into<String>) {
        self.active_run = None;
        self.stream_status = StreamStatus::Error;
        self.error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Empties the model; limits and the generation counter survive.
    pub fn reset(&mut self) {
        self.generation += 1;
        let limits = self.limits;
        let scene_types = std::mem::take(&mut self.scene_types);
        let generation = self.generation;
        *self = Self::new(limits, scene_types);
        self.generation = generation;
    }

    /// Replaces everything with a freshly loaded session.
    pub fn replace(&mut self, loaded: LoadedSession) {
        self.session = Some(loaded.session);
        self.messages.clear();
        self.artifacts.clear();
        self.deltas.clear();
        self.error = None;
        self.stream_status = StreamStatus::Idle;
        self.active_run = None;
        for mut message in loaded.messages {
            message.seq = self.bump_seq();
            self.messages.push(message);
        }
        for mut artifact in loaded.artifacts {
            let revision = self.bump_revision();
            let keys: Vec<String> = artifact.payload.keys().cloned().collect();
            artifact.stamp(&keys, revision);
            self.artifacts.push(artifact);
        }
        self.trim();
        self.rederive_scenes();
    }

    pub fn apply_review(&mut self, session_id: &str, review: &ReviewResponse) {
        let session = self
            .session
            .get_or_insert_with(|| Session::new(session_id));
        if session.id != session_id {
            return;
        }
        session.status = review.status.clone();
        if let Some(metadata) = &review.metadata {
            merge_record(&mut session.metadata, metadata);
        }
        self.error = None;
    }

    pub fn ensure_session(&mut self, session_id: &str) {
        if let Some(session) = self.session.as_mut() {
            if session.id.is_empty() {
                session.id = session_id.to_string();
            }
            return;
        }
        self.session = Some(Session::new(session_id));
    }

    /// Appends the optimistic copy of a message the user is about to send.
    pub fn push_local_user(&mut self, id: &str, text: &str) {
        let mut message = Message::chat(id, Role::User, Utc::now());
        message.content = text.to_string();
        message.status = MessageStatus::Complete;
        self.push_message(message);
    }

    // ---- envelope reconciliation ------------------------------------------

    pub fn apply(&mut self, envelope: &Envelope) -> ApplyOutcome {
        let ts = envelope.timestamp.unwrap_or_else(Utc::now);
        match &envelope.event {
            Event::Session(patch) => self.apply_session(envelope, patch),
            Event::MessageStarted { message_id, role } => self.start_message(message_id, *role, ts),
            Event::Delta { message_id, text } => self.append_delta(envelope, message_id, text, ts),
            Event::ToolCalls {
                message_id,
                tool_calls,
            } => self.merge_tool_calls(message_id, tool_calls, ts),
            Event::MessageFinalized(finished) => self.finalize_message(finished, ts),
            Event::ToolResult(result) => self.apply_tool_result(envelope, result, ts),
            Event::Job(job) => self.apply_job(envelope, job, ts),
            Event::ArtifactUpdate(patch) => self.apply_artifact(patch, ts),
            Event::Done => ApplyOutcome {
                changed: self.stream_closed(),
                tool_result: None,
            },
            Event::Error { message } => {
                self.fail_stream(message.clone());
                changed()
            }
        }
    }

    fn apply_session(&mut self, envelope: &Envelope, patch: &SessionPatch) -> ApplyOutcome {
        let Some(id) = patch.id.clone().or_else(|| envelope.session_id.clone()) else {
            if self.session.is_none() {
                return ApplyOutcome::default();
            }
            return self.patch_session(patch);
        };
        match &self.session {
            Some(session) if session.id != id && !session.id.is_empty() => {
                tracing::debug!(
                    target = "session.machine",
                    current = %session.id,
                    incoming = %id,
                    "ignoring patch for another session"
                );
                ApplyOutcome::default()
            }
            _ => {
                self.ensure_session(&id);
                self.patch_session(patch)
            }
        }
    }

    fn patch_session(&mut self, patch: &SessionPatch) -> ApplyOutcome {
        let Some(session) = self.session.as_mut() else {
            return ApplyOutcome::default();
        };
        if let Some(status) = &patch.status {
            session.status = status.clone();
        }
        if let Some(title) = &patch.title {
            session.title = Some(title.clone());
        }
        if let Some(model) = &patch.model {
            session.model = Some(model.clone());
        }
        if let Some(metadata) = &patch.metadata {
            merge_record(&mut session.metadata, metadata);
        }
        changed()
    }

    fn start_message(&mut self, id: &str, role: Option<Role>, ts: DateTime<Utc>) -> ApplyOutcome {
        if let Some(message) = self.message_mut(id) {
            if message.role == Role::Assistant && message.status != MessageStatus::Complete {
                message.status = MessageStatus::Streaming;
            }
            return changed();
        }
        let role = role.filter(|role| role.is_chat()).unwrap_or(Role::Assistant);
        self.push_message(Message::chat(id, role, ts));
        changed()
    }

    fn append_delta(
        &mut self,
        envelope: &Envelope,
        id: &str,
        text: &str,
        ts: DateTime<Utc>,
    ) -> ApplyOutcome {
        if text.is_empty() {
            return ApplyOutcome::default();
        }
        if let Some(message) = self.message(id) {
            if message.status.is_final() {
                tracing::trace!(target = "session.machine", message_id = id, "delta after final message");
                return ApplyOutcome::default();
            }
        }
        if let Some(event_id) = envelope.event_id {
            if !self.deltas.first_sighting(envelope.stream_key(), event_id) {
                tracing::trace!(target = "session.machine", event_id, "replayed delta skipped");
                return ApplyOutcome::default();
            }
        }
        match self.message_mut(id) {
            Some(message) => message.content.push_str(text),
            None => {
                let mut message = Message::chat(id, Role::Assistant, ts);
                message.content = text.to_string();
                self.push_message(message);
            }
        }
        changed()
    }

    fn merge_tool_calls(&mut self, id: &str, calls: &[ToolCall], ts: DateTime<Utc>) -> ApplyOutcome {
        match self.message_mut(id) {
            Some(message) => message.merge_tool_calls(calls),
            None => {
                let mut message = Message::chat(id, Role::Assistant, ts);
                message.merge_tool_calls(calls);
                self.push_message(message);
            }
        }
        changed()
    }

    fn finalize_message(&mut self, finished: &FinalMessage, ts: DateTime<Utc>) -> ApplyOutcome {
        if self.message(&finished.message_id).is_none() {
            if let Some(local_id) = &finished.client_message_id {
                if let Some(local) = self.message_mut(local_id) {
                    tracing::debug!(
                        target = "session.machine",
                        local_id = %local_id,
                        message_id = %finished.message_id,
                        "confirmed optimistic message"
                    );
                    local.id = finished.message_id.clone();
                }
            }
        }
        if self.message(&finished.message_id).is_none() {
            let role = finished
                .role
                .filter(|role| role.is_chat())
                .unwrap_or(Role::Assistant);
            let created_at = finished.created_at.unwrap_or(ts);
            self.push_message(Message::chat(finished.message_id.clone(), role, created_at));
        }
        if let Some(message) = self.message_mut(&finished.message_id) {
            if !finished.content.is_empty() || message.content.is_empty() {
                message.content = finished.content.clone();
            }
            if let Some(calls) = &finished.tool_calls {
                message.replace_tool_calls(calls);
            }
            if let Some(created_at) = finished.created_at {
                message.created_at = created_at;
            }
            message.status = MessageStatus::Complete;
        }
        changed()
    }

    fn apply_tool_result(
        &mut self,
        envelope: &Envelope,
        result: &ToolResult,
        ts: DateTime<Utc>,
    ) -> ApplyOutcome {
        let id = match (envelope.event_id, &result.tool_call_id) {
            (Some(event_id), _) => format!("tool_result:{}:{event_id}", envelope.stream_key()),
            (None, Some(call_id)) => format!("tool_result:{call_id}"),
            (None, None) => format!("tool_result:{}:{}", result.name, self.next_seq),
        };
        let is_new = self.message(&id).is_none();
        if is_new {
            self.push_message(Message::tool(id.clone(), result.name.clone(), ts));
        }
        if let Some(message) = self.message_mut(&id) {
            message.status = result.status;
            message.output = result.output.clone();
            message.error = result.error.clone();
            message.correlation_id = result.tool_call_id.clone();
        }

        if let Some(call_id) = &result.tool_call_id {
            let status = status_label(result.status);
            for message in &mut self.messages {
                if let Some(call) = message.tool_call_mut(call_id) {
                    call.status = status.to_string();
                }
            }
        }

        if self.scene_types.contains(&result.name) {
            let artifact_id = fields_artifact_id(&result.output).unwrap_or_else(|| id.clone());
            self.upsert_artifact(&artifact_id, Some(&result.name), &result.output, None, ts);
            self.rederive_scenes();
        }

        ApplyOutcome {
            changed: true,
            tool_result: is_new.then(|| ToolResultNotice {
                name: result.name.clone(),
                output: result.output.clone(),
                status: result.status,
                tool_call_id: result.tool_call_id.clone(),
                session_id: envelope
                    .session_id
                    .clone()
                    .or_else(|| self.session_id()),
            }),
        }
    }

    fn apply_job(&mut self, envelope: &Envelope, job: &JobUpdate, ts: DateTime<Utc>) -> ApplyOutcome {
        let id = match (&job.correlation_id, envelope.event_id) {
            (Some(cid), _) => format!("job:{cid}"),
            (None, Some(event_id)) => format!("job:{}:{event_id}", envelope.stream_key()),
            (None, None) => {
                tracing::debug!(target = "session.machine", "job update without any id");
                return ApplyOutcome::default();
            }
        };
        if self.message(&id).is_none() {
            let name = job.name.clone().unwrap_or_else(|| "job".to_string());
            let mut message = Message::tool(id.clone(), name, ts);
            message.correlation_id = job.correlation_id.clone();
            self.push_message(message);
        }
        let Some(message) = self.message_mut(&id) else {
            return ApplyOutcome::default();
        };
        if let Some(name) = &job.name {
            message.tool_name = Some(name.clone());
        }
        merge_record(&mut message.output, &job.output);
        if let Some(progress) = job.progress {
            message
                .output
                .insert("progress".into(), Value::from(progress.clamp(0.0, 100.0)));
        }
        if let Some(text) = &job.message {
            message.content = text.clone();
        }
        match job.phase {
            JobPhase::Started | JobPhase::Progress => {
                if !message.status.is_final() {
                    message.status = MessageStatus::Running;
                }
            }
            JobPhase::Completed => {
                message.status = MessageStatus::Complete;
                message.error = None;
            }
            JobPhase::Failed => {
                message.status = MessageStatus::Error;
                message.error = job
                    .error
                    .clone()
                    .or_else(|| job.message.clone())
                    .or_else(|| Some("job failed".to_string()));
            }
        }
        changed()
    }

    fn apply_artifact(&mut self, patch: &ArtifactPatch, ts: DateTime<Utc>) -> ApplyOutcome {
        let artifact_type = patch.artifact_type.clone().unwrap_or_else(|| {
            if patch.payload.contains_key("scene_id") {
                "scene".to_string()
            } else {
                "artifact".to_string()
            }
        });
        self.upsert_artifact(
            &patch.artifact_id,
            Some(&artifact_type),
            &patch.payload,
            patch.version,
            ts,
        );

        let merged = self
            .artifacts
            .iter()
            .find(|artifact| artifact.id == patch.artifact_id)
            .map(|artifact| artifact.payload.clone())
            .unwrap_or_default();
        let message_id = format!("artifact:{}", patch.artifact_id);
        if self.message(&message_id).is_none() {
            let mut message = Message::tool(message_id.clone(), artifact_type.clone(), ts);
            message.correlation_id = Some(patch.artifact_id.clone());
            self.push_message(message);
        }
        if let Some(message) = self.message_mut(&message_id) {
            message.tool_name = Some(artifact_type);
            message.status = MessageStatus::Complete;
            message.output = merged;
        }
        self.rederive_scenes();
        changed()
    }

    // ---- storage helpers --------------------------------------------------

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn push_message(&mut self, mut message: Message) {
        message.seq = self.bump_seq();
        self.messages.push(message);
        self.trim();
    }

    /// Merges payload keys into an existing artifact or inserts a new one. The
    /// write counter only moves when something actually changed, and only the
    /// keys present in `payload` are stamped with it.
    fn upsert_artifact(
        &mut self,
        id: &str,
        artifact_type: Option<&str>,
        payload: &Record,
        version: Option<u64>,
        ts: DateTime<Utc>,
    ) {
        if let Some(index) = self.artifacts.iter().position(|artifact| artifact.id == id) {
            let mut next = self.artifacts[index].payload.clone();
            merge_record(&mut next, payload);
            let current = &self.artifacts[index];
            let type_changed = artifact_type.is_some_and(|t| t != current.artifact_type);
            let version_changed = version.is_some() && version != current.version;
            if next == current.payload && !type_changed && !version_changed {
                return;
            }
            let revision = self.bump_revision();
            let artifact = &mut self.artifacts[index];
            artifact.payload = next;
            if let Some(artifact_type) = artifact_type {
                artifact.artifact_type = artifact_type.to_string();
            }
            if version.is_some() {
                artifact.version = version;
            }
            artifact.updated_at = ts;
            artifact.stamp(payload.keys(), revision);
            return;
        }
        let revision = self.bump_revision();
        let mut artifact = Artifact {
            id: id.to_string(),
            artifact_type: artifact_type.unwrap_or("artifact").to_string(),
            payload: payload.clone(),
            version,
            created_at: ts,
            updated_at: ts,
            revision,
            field_revisions: Default::default(),
        };
        artifact.stamp(payload.keys(), revision);
        self.artifacts.push(artifact);
        self.trim();
    }

    fn rederive_scenes(&mut self) {
        self.scenes = derive_scenes(&self.artifacts, &self.scene_types);
    }

    fn trim(&mut self) {
        if self.messages.len() > self.limits.max_messages {
            let excess = self.messages.len() - self.limits.max_messages;
            self.messages.drain(..excess);
        }
        if self.artifacts.len() > self.limits.max_artifacts {
            let excess = self.artifacts.len() - self.limits.max_artifacts;
            self.artifacts.drain(..excess);
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn bump_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }
}

fn changed() -> ApplyOutcome {
    ApplyOutcome {
        changed: true,
        tool_result: None,
    }
}

fn merge_record(target: &mut Record, incoming: &Record) {
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
}

fn status_label(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Streaming => "streaming",
        MessageStatus::Complete => "complete",
        MessageStatus::Running => "running",
        MessageStatus::Error => "error",
    }
}

fn fields_artifact_id(output: &Record) -> Option<String> {
    storyloom_proto::fields::get_id(output, &["artifact_id"])
}
