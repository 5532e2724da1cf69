use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields::{self, Record};

/// Fields a scene snapshot may carry. Anything else in a scene artifact is ignored.
pub const KNOWN_SCENE_FIELDS: &[&str] = &[
    "title",
    "description",
    "style",
    "duration",
    "prompt",
    "shot_type",
    "camera",
    "mood",
    "image_url",
    "video_url",
    "order",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionStatus {
    Active,
    PendingReview,
    Approved,
    Rejected,
    Other(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::PendingReview => "pending_review",
            SessionStatus::Approved => "approved",
            SessionStatus::Rejected => "rejected",
            SessionStatus::Other(raw) => raw,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Active
    }
}

impl From<String> for SessionStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "active" => SessionStatus::Active,
            "pending_review" | "pending-review" => SessionStatus::PendingReview,
            "approved" => SessionStatus::Approved,
            "rejected" => SessionStatus::Rejected,
            _ => SessionStatus::Other(value),
        }
    }
}

impl From<SessionStatus> for String {
    fn from(value: SessionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Record,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Active,
            title: None,
            model: None,
            metadata: Record::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }

    pub fn is_chat(self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

/// Chat messages move `streaming -> complete`; tool messages `running -> complete | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Running,
    Error,
}

impl MessageStatus {
    pub fn is_final(self) -> bool {
        matches!(self, MessageStatus::Complete | MessageStatus::Error)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "streaming" => Some(MessageStatus::Streaming),
            "complete" | "completed" | "success" | "ok" => Some(MessageStatus::Complete),
            "running" | "pending" | "in_progress" => Some(MessageStatus::Running),
            "error" | "failed" => Some(MessageStatus::Error),
            _ => None,
        }
    }
}

impl TryFrom<String> for MessageStatus {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, <MessageStatus as TryFrom<String>>::Error> {
        Self::parse(&raw).ok_or_else(|| format!("unknown message status `{raw}`"))
    }
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "fields::de_arguments")]
    pub arguments: String,
    #[serde(default)]
    pub status: String,
}

impl ToolCall {
    /// Parses one entry of a `tool_calls` list. Entries without an id are unusable
    /// for id-keyed merging and are dropped.
    pub fn from_record(record: &Record) -> Option<Self> {
        let id = fields::get_id(record, &["id", "tool_call_id"])?;
        let function = fields::get_record(record, "function");
        let name = fields::first_text(record, &["name", "tool_name"])
            .or_else(|| function.and_then(|f| fields::get_text(f, "name")))
            .unwrap_or_default()
            .to_string();
        let arguments = record
            .get("arguments")
            .or_else(|| function.and_then(|f| f.get("arguments")));
        Some(Self {
            id,
            name,
            arguments: fields::arguments_text(arguments),
            status: fields::get_text(record, "status")
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Additive merge: a non-empty incoming field overwrites, an empty one never
    /// blanks what is already known.
    pub fn merge_from(&mut self, incoming: &ToolCall) {
        if !incoming.name.is_empty() {
            self.name.clone_from(&incoming.name);
        }
        if !incoming.arguments.is_empty() {
            self.arguments.clone_from(&incoming.arguments);
        }
        if !incoming.status.is_empty() {
            self.status.clone_from(&incoming.status);
        }
    }
}

/// One entry of the conversation. Chat roles use `content` and `tool_calls`;
/// tool messages use `tool_name`, `output`, `error` and `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, alias = "name")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub output: Record,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "tool_call_id")]
    pub correlation_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Local insertion order, used to break creation-time ties.
    #[serde(skip)]
    pub seq: u64,
}

impl Message {
    pub fn chat(id: impl Into<String>, role: Role, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            role,
            content: String::new(),
            status: MessageStatus::Streaming,
            tool_calls: Vec::new(),
            tool_name: None,
            output: Record::new(),
            error: None,
            correlation_id: None,
            created_at,
            seq: 0,
        }
    }

    pub fn tool(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::Tool,
            content: String::new(),
            status: MessageStatus::Running,
            tool_calls: Vec::new(),
            tool_name: Some(tool_name.into()),
            output: Record::new(),
            error: None,
            correlation_id: None,
            created_at,
            seq: 0,
        }
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        self.tool_calls.iter_mut().find(|call| call.id == id)
    }

    /// Merges a batch of partial tool calls by id.
    pub fn merge_tool_calls(&mut self, incoming: &[ToolCall]) {
        for call in incoming {
            match self.tool_call_mut(&call.id) {
                Some(existing) => existing.merge_from(call),
                None => self.tool_calls.push(call.clone()),
            }
        }
    }

    /// Takes `calls` as the authoritative list. Calls dropped from it go away;
    /// calls already known keep any field the final copy leaves empty.
    pub fn replace_tool_calls(&mut self, calls: &[ToolCall]) {
        let replaced = calls
            .iter()
            .map(|call| match self.tool_calls.iter().find(|known| known.id == call.id) {
                Some(known) => {
                    let mut merged = known.clone();
                    merged.merge_from(call);
                    merged
                }
                None => call.clone(),
            })
            .collect::<Vec<_>>();
        self.tool_calls = replaced;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type", alias = "artifact_type")]
    pub artifact_type: String,
    #[serde(default, alias = "data")]
    pub payload: Record,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Local write counter of the last change to this artifact.
    #[serde(skip)]
    pub revision: u64,
    /// Write counter per payload key, for field-wise last-write-wins.
    #[serde(skip)]
    pub field_revisions: BTreeMap<String, u64>,
}

impl Artifact {
    /// Marks `keys` as written at `revision`.
    pub fn stamp<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>, revision: u64) {
        for key in keys {
            self.field_revisions.insert(key.clone(), revision);
        }
        self.revision = revision;
    }

    /// Revision of the last write to `key`.
    pub fn field_revision(&self, key: &str) -> u64 {
        self.field_revisions
            .get(key)
            .copied()
            .unwrap_or(self.revision)
    }
}

/// Derived, non-authoritative view of one scene assembled from artifacts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Scene {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn title(&self) -> Option<&str> {
        self.get("title").and_then(Value::as_str)
    }

    pub fn duration(&self) -> Option<f64> {
        self.get("duration").and_then(Value::as_f64)
    }

    /// Field-wise last-write-wins over the known scene fields. Absent and null
    /// values are skipped so a sparser contribution cannot erase known data.
    pub fn absorb(&mut self, record: &Record) {
        for field in KNOWN_SCENE_FIELDS {
            match record.get(*field) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    self.fields.insert((*field).to_string(), value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_merge_never_regresses() {
        let mut call = ToolCall {
            id: "t1".into(),
            name: "search".into(),
            arguments: "{\"q\":".into(),
            status: String::new(),
        };
        call.merge_from(&ToolCall {
            id: "t1".into(),
            ..Default::default()
        });
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, "{\"q\":");

        call.merge_from(&ToolCall {
            id: "t1".into(),
            arguments: "{\"q\":\"x\"}".into(),
            ..Default::default()
        });
        assert_eq!(call.arguments, "{\"q\":\"x\"}");
        assert_eq!(call.name, "search");
    }

    #[test]
    fn message_status_accepts_server_aliases() {
        let statuses: Vec<MessageStatus> =
            serde_json::from_value(json!(["completed", "success", "failed", "in_progress"]))
                .expect("aliases parse");
        assert_eq!(
            statuses,
            [
                MessageStatus::Complete,
                MessageStatus::Complete,
                MessageStatus::Error,
                MessageStatus::Running
            ]
        );
        assert_eq!(json!(MessageStatus::Complete), json!("complete"));
        assert!(serde_json::from_value::<MessageStatus>(json!("exploded")).is_err());
    }

    #[test]
    fn final_tool_calls_replace_streamed_ones() {
        let mut message = Message::chat("m1", Role::Assistant, Utc::now());
        message.merge_tool_calls(&[
            ToolCall {
                id: "t1".into(),
                name: "search".into(),
                ..Default::default()
            },
            ToolCall {
                id: "t2".into(),
                name: "draft".into(),
                ..Default::default()
            },
        ]);
        message.replace_tool_calls(&[ToolCall {
            id: "t1".into(),
            arguments: "{}".into(),
            ..Default::default()
        }]);
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].name, "search");
        assert_eq!(message.tool_calls[0].arguments, "{}");
    }

    #[test]
    fn tool_call_reads_function_shape() {
        let record = json!({"id": "c1", "function": {"name": "render", "arguments": {"w": 1}}});
        let call = ToolCall::from_record(record.as_object().unwrap()).expect("call");
        assert_eq!(call.name, "render");
        assert_eq!(call.arguments, "{\"w\":1}");
    }

    #[test]
    fn session_status_preserves_unknown_values() {
        let session: Session =
            serde_json::from_value(json!({"id": "s", "status": "archived"})).unwrap();
        assert_eq!(session.status, SessionStatus::Other("archived".into()));
        assert_eq!(serde_json::to_value(&session.status).unwrap(), json!("archived"));
    }

    #[test]
    fn loaded_messages_accept_flat_wire_shape() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "role": "tool",
            "name": "create_scene",
            "status": "error",
            "tool_call_id": "c9",
            "output": {"scene_id": "s1"}
        }))
        .unwrap();
        assert_eq!(message.tool_name.as_deref(), Some("create_scene"));
        assert_eq!(message.correlation_id.as_deref(), Some("c9"));
        assert_eq!(message.status, MessageStatus::Error);
    }

    #[test]
    fn scene_absorb_skips_nulls() {
        let mut scene = Scene::new("s1");
        scene.absorb(json!({"title": "Opening", "junk": 1}).as_object().unwrap());
        scene.absorb(json!({"title": null, "duration": 12}).as_object().unwrap());
        assert_eq!(scene.title(), Some("Opening"));
        assert_eq!(scene.duration(), Some(12.0));
        assert!(scene.get("junk").is_none());
    }
}
