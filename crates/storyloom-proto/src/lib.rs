//! Shared wire vocabulary for the storyloom streaming protocol.
//!
//! Responsibilities:
//! - the typed [`Envelope`] every transport frame decodes into
//! - one payload variant per event type ([`Event`]), validated on decode
//! - the domain records the client reconciles (sessions, messages, artifacts, scenes)
//! - total extraction helpers over untyped JSON records ([`fields`])
//!
//! Kept free of runtime dependencies so it can be shared by the CLI, tests and
//! any future bindings.

pub mod envelope;
pub mod fields;
pub mod model;

pub use envelope::{
    ArtifactPatch, DecodeError, Envelope, Event, EventKind, FinalMessage, JobPhase, JobUpdate,
    SessionPatch, ToolResult,
};
pub use fields::Record;
pub use model::{
    Artifact, Message, MessageStatus, Role, Scene, Session, SessionStatus, ToolCall,
    KNOWN_SCENE_FIELDS,
};
