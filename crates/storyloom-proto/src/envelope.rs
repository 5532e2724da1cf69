use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::fields::{self, Record};
use crate::model::{MessageStatus, Role, SessionStatus, ToolCall};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Json(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("payload for `{kind}` is malformed: {reason}")]
    Payload {
        kind: EventKind,
        reason: &'static str,
    },
}

/// The fixed event vocabulary of the stream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Session,
    Thinking,
    Delta,
    ToolCalls,
    Message,
    ToolResult,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    ArtifactUpdate,
    Done,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Session,
        EventKind::Thinking,
        EventKind::Delta,
        EventKind::ToolCalls,
        EventKind::Message,
        EventKind::ToolResult,
        EventKind::JobStarted,
        EventKind::JobProgress,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::ArtifactUpdate,
        EventKind::Done,
        EventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Session => "session",
            EventKind::Thinking => "thinking",
            EventKind::Delta => "delta",
            EventKind::ToolCalls => "tool_calls",
            EventKind::Message => "message",
            EventKind::ToolResult => "tool_result",
            EventKind::JobStarted => "job_started",
            EventKind::JobProgress => "job_progress",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::ArtifactUpdate => "artifact_update",
            EventKind::Done => "done",
            EventKind::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial session update. Only fields present on the wire are `Some`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionPatch {
    pub id: Option<String>,
    pub status: Option<SessionStatus>,
    pub title: Option<String>,
    pub model: Option<String>,
    pub metadata: Option<Record>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalMessage {
    pub message_id: String,
    pub role: Option<Role>,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the optimistic local message this server message confirms.
    pub client_message_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: Option<String>,
    pub name: String,
    pub status: MessageStatus,
    pub output: Record,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Started,
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub phase: JobPhase,
    /// `None` when the backend sent no job id; the receiver then keys the update
    /// on the envelope's event id.
    pub correlation_id: Option<String>,
    pub name: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub output: Record,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPatch {
    pub artifact_id: String,
    pub artifact_type: Option<String>,
    pub payload: Record,
    pub version: Option<u64>,
}

/// Typed payload, one variant per event type.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Session(SessionPatch),
    MessageStarted {
        message_id: String,
        role: Option<Role>,
    },
    Delta {
        message_id: String,
        text: String,
    },
    ToolCalls {
        message_id: String,
        tool_calls: Vec<ToolCall>,
    },
    MessageFinalized(FinalMessage),
    ToolResult(ToolResult),
    Job(JobUpdate),
    ArtifactUpdate(ArtifactPatch),
    Done,
    Error {
        message: String,
    },
}

/// A decoded unit of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub event_id: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub event: Event,
}

impl Envelope {
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| DecodeError::Json(err.to_string()))?;
        Self::from_value(&value)
    }

    /// Validates and narrows a raw `{type, session_id|run_id, event_id, timestamp, payload}`
    /// document into a typed envelope.
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let root = fields::as_record(value).ok_or(DecodeError::NotAnObject)?;
        let raw_type = fields::get_text(root, "type").ok_or(DecodeError::MissingField("type"))?;
        let kind =
            EventKind::parse(raw_type).ok_or_else(|| DecodeError::UnknownType(raw_type.into()))?;
        let session_id = fields::get_id(root, &["session_id"]);
        let run_id = fields::get_id(root, &["run_id"]);
        if session_id.is_none() && run_id.is_none() {
            return Err(DecodeError::MissingField("session_id"));
        }
        let empty = Record::new();
        let payload = match root.get("payload") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(DecodeError::Payload {
                    kind,
                    reason: "payload must be an object",
                })
            }
        };
        Ok(Self {
            kind,
            session_id,
            run_id,
            event_id: fields::get_u64(root, "event_id"),
            timestamp: fields::get_timestamp(root, "timestamp"),
            event: Event::parse(kind, payload)?,
        })
    }

    /// Key that identifies the connection this envelope belongs to; event ids are
    /// only unique within it.
    pub fn stream_key(&self) -> &str {
        self.run_id
            .as_deref()
            .or(self.session_id.as_deref())
            .unwrap_or_default()
    }
}

impl Event {
    pub fn parse(kind: EventKind, payload: &Record) -> Result<Self, DecodeError> {
        let missing = |reason| DecodeError::Payload { kind, reason };
        let message_id = || fields::get_id(payload, &["message_id", "id"]);

        let event = match kind {
            EventKind::Session => Event::Session(SessionPatch {
                id: fields::get_id(payload, &["id", "session_id"]),
                status: fields::get_text(payload, "status").map(|s| SessionStatus::from(s.to_string())),
                title: fields::get_text(payload, "title").map(str::to_string),
                model: fields::get_text(payload, "model").map(str::to_string),
                metadata: fields::get_record(payload, "metadata").cloned(),
            }),
            EventKind::Thinking => Event::MessageStarted {
                message_id: message_id().ok_or_else(|| missing("message_id is required"))?,
                role: fields::get_text(payload, "role").and_then(Role::parse),
            },
            EventKind::Delta => Event::Delta {
                message_id: message_id().ok_or_else(|| missing("message_id is required"))?,
                text: fields::first_text(payload, &["delta", "text", "content"])
                    .unwrap_or_default()
                    .to_string(),
            },
            EventKind::ToolCalls => Event::ToolCalls {
                message_id: message_id().ok_or_else(|| missing("message_id is required"))?,
                tool_calls: parse_tool_calls(payload.get("tool_calls"))
                    .ok_or_else(|| missing("tool_calls must be a list"))?,
            },
            EventKind::Message => Event::MessageFinalized(FinalMessage {
                message_id: message_id().ok_or_else(|| missing("message_id is required"))?,
                role: fields::get_text(payload, "role").and_then(Role::parse),
                content: fields::get_text(payload, "content")
                    .unwrap_or_default()
                    .to_string(),
                tool_calls: match payload.get("tool_calls") {
                    None | Some(Value::Null) => None,
                    value => Some(
                        parse_tool_calls(value)
                            .ok_or_else(|| missing("tool_calls must be a list"))?,
                    ),
                },
                client_message_id: fields::get_id(payload, &["client_message_id"]),
                created_at: fields::get_timestamp(payload, "created_at"),
            }),
            EventKind::ToolResult => {
                let name = fields::first_text(payload, &["name", "tool_name"])
                    .ok_or_else(|| missing("tool name is required"))?;
                let error = fields::get_text(payload, "error").map(str::to_string);
                let status = fields::get_text(payload, "status")
                    .and_then(MessageStatus::parse)
                    .unwrap_or(if error.is_some() {
                        MessageStatus::Error
                    } else {
                        MessageStatus::Complete
                    });
                Event::ToolResult(ToolResult {
                    tool_call_id: fields::get_id(payload, &["tool_call_id", "call_id"]),
                    name: name.to_string(),
                    status,
                    output: output_record(payload, TOOL_RESULT_KEYS),
                    error,
                })
            }
            EventKind::JobStarted
            | EventKind::JobProgress
            | EventKind::JobCompleted
            | EventKind::JobFailed => Event::Job(JobUpdate {
                phase: match kind {
                    EventKind::JobStarted => JobPhase::Started,
                    EventKind::JobCompleted => JobPhase::Completed,
                    EventKind::JobFailed => JobPhase::Failed,
                    _ => JobPhase::Progress,
                },
                correlation_id: fields::get_id(payload, &["job_id", "correlation_id", "task_id"]),
                name: fields::first_text(payload, &["name", "tool_name"]).map(str::to_string),
                progress: fields::get_number(payload, "progress"),
                message: fields::get_text(payload, "message").map(str::to_string),
                output: output_record(payload, JOB_KEYS),
                error: fields::get_text(payload, "error").map(str::to_string),
            }),
            EventKind::ArtifactUpdate => Event::ArtifactUpdate(ArtifactPatch {
                artifact_id: fields::get_id(payload, &["artifact_id", "id", "scene_id"])
                    .ok_or_else(|| missing("artifact_id is required"))?,
                artifact_type: fields::first_text(payload, &["artifact_type", "type"])
                    .map(str::to_string),
                payload: fields::get_record(payload, "data")
                    .or_else(|| fields::get_record(payload, "payload"))
                    .cloned()
                    .unwrap_or_else(|| without_keys(payload, ARTIFACT_KEYS)),
                version: fields::get_u64(payload, "version"),
            }),
            EventKind::Done => Event::Done,
            EventKind::Error => Event::Error {
                message: fields::first_text(payload, &["message", "error"])
                    .unwrap_or("stream reported an error")
                    .to_string(),
            },
        };
        Ok(event)
    }
}

fn parse_tool_calls(value: Option<&Value>) -> Option<Vec<ToolCall>> {
    let entries = value?.as_array()?;
    Some(
        entries
            .iter()
            .filter_map(fields::as_record)
            .filter_map(ToolCall::from_record)
            .collect(),
    )
}

const TOOL_RESULT_KEYS: &[&str] = &[
    "name",
    "tool_name",
    "tool_call_id",
    "call_id",
    "status",
    "error",
    "message_id",
];
const JOB_KEYS: &[&str] = &[
    "job_id",
    "correlation_id",
    "task_id",
    "name",
    "tool_name",
    "progress",
    "message",
    "status",
    "error",
];
const ARTIFACT_KEYS: &[&str] = &["artifact_id", "artifact_type", "type", "version"];

fn without_keys(payload: &Record, envelope_keys: &[&str]) -> Record {
    payload
        .iter()
        .filter(|(key, _)| !envelope_keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Structured result of a tool or job. Flat payloads (no `output`/`result` key)
/// contribute everything that is not an envelope-level field.
fn output_record(payload: &Record, envelope_keys: &[&str]) -> Record {
    match payload.get("output").or_else(|| payload.get("result")) {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) => Record::new(),
        None => without_keys(payload, envelope_keys),
        Some(other) => {
            let mut wrapped = Record::new();
            wrapped.insert("value".into(), other.clone());
            wrapped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_delta_envelope() {
        let envelope = Envelope::from_value(&json!({
            "type": "delta",
            "run_id": "r1",
            "event_id": 7,
            "payload": {"message_id": "m1", "delta": "Hel"}
        }))
        .expect("decode");
        assert_eq!(envelope.kind, EventKind::Delta);
        assert_eq!(envelope.event_id, Some(7));
        assert_eq!(envelope.stream_key(), "r1");
        assert_eq!(
            envelope.event,
            Event::Delta {
                message_id: "m1".into(),
                text: "Hel".into()
            }
        );
    }

    #[test]
    fn rejects_missing_identifiers() {
        let err = Envelope::from_value(&json!({"type": "done", "payload": {}})).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("session_id"));
    }

    #[test]
    fn rejects_unknown_types_and_bad_payloads() {
        assert!(matches!(
            Envelope::from_value(&json!({"type": "mystery", "run_id": "r"})),
            Err(DecodeError::UnknownType(_))
        ));
        assert!(matches!(
            Envelope::from_value(&json!({"type": "delta", "run_id": "r", "payload": []})),
            Err(DecodeError::Payload { .. })
        ));
        assert!(matches!(
            Envelope::from_value(&json!({"type": "delta", "run_id": "r", "payload": {"delta": "x"}})),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn session_patch_only_carries_present_fields() {
        let envelope = Envelope::from_value(&json!({
            "type": "session",
            "session_id": "s1",
            "payload": {"title": "Draft"}
        }))
        .unwrap();
        let Event::Session(patch) = envelope.event else {
            panic!("expected session patch");
        };
        assert_eq!(patch.title.as_deref(), Some("Draft"));
        assert!(patch.status.is_none());
        assert!(patch.metadata.is_none());
    }

    #[test]
    fn tool_result_status_defaults_from_error() {
        let event = Event::parse(
            EventKind::ToolResult,
            json!({"name": "render", "error": "boom"}).as_object().unwrap(),
        )
        .unwrap();
        let Event::ToolResult(result) = event else {
            panic!("expected tool result");
        };
        assert_eq!(result.status, MessageStatus::Error);
        assert!(result.output.is_empty());
    }

    #[test]
    fn job_events_share_one_shape() {
        let event = Event::parse(
            EventKind::JobCompleted,
            json!({"job_id": "j1", "progress": 100, "output": {"url": "x"}})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        let Event::Job(job) = event else {
            panic!("expected job update");
        };
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.correlation_id.as_deref(), Some("j1"));
        assert_eq!(job.progress, Some(100.0));
        assert_eq!(job.output.get("url"), Some(&serde_json::json!("x")));
    }

    #[test]
    fn flat_payloads_become_outputs() {
        let event = Event::parse(
            EventKind::ToolResult,
            json!({"name": "create_scene", "tool_call_id": "c1", "scene_id": "s1", "title": "Opening"})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        let Event::ToolResult(result) = event else {
            panic!("expected tool result");
        };
        assert_eq!(result.output.len(), 2);
        assert_eq!(result.output.get("title"), Some(&json!("Opening")));

        let event = Event::parse(
            EventKind::ArtifactUpdate,
            json!({"scene_id": "s1", "type": "scene", "duration": 12})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        let Event::ArtifactUpdate(patch) = event else {
            panic!("expected artifact patch");
        };
        assert_eq!(patch.artifact_id, "s1");
        assert_eq!(patch.payload.get("scene_id"), Some(&json!("s1")));
        assert!(patch.payload.get("type").is_none());
    }
}
