//! Streaming session reconciliation.

mod machine;
mod scenes;
mod state;

pub use machine::{SendOptions, SessionError, SessionMachine};
pub use scenes::derive_scenes;
pub use state::{
    ApplyOutcome, SessionLimits, SessionState, SessionView, StreamStatus, ToolResultNotice,
};
