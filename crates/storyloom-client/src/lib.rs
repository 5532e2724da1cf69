//! Client side of the storyloom streaming protocol.
//!
//! Responsibilities:
//! - opening run streams over a websocket or a one-way event stream ([`transport`])
//! - decoding raw frames into typed envelopes ([`decoder`])
//! - reconciling envelopes into a consistent session model ([`session`])
//! - driving per-node execution lifecycles ([`node`])
//! - the REST calls the session depends on ([`api`])

pub mod api;
pub mod backoff;
pub mod config;
pub mod decoder;
pub mod node;
pub mod session;
pub mod transport;

pub use api::{HttpSessionApi, SessionApi};
pub use backoff::ReconnectPolicy;
pub use config::{ClientConfig, ConfigError, TransportPreference};
pub use session::{SendOptions, SessionError, SessionMachine, SessionView, StreamStatus};
pub use transport::{select_transport, StreamControl, StreamHandler, Transport, TransportError};
