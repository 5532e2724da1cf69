//! Run-scoped event transports.
//!
//! Both transports push decoded envelopes into a [`StreamHandler`] from a
//! spawned read loop and hand back a [`StreamControl`] to stop or cancel it.
//! Neither retries on its own; callers own reconnect policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use storyloom_proto::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ConfigError, TransportPreference};

pub mod endpoint;
pub mod event_stream;
pub mod mock;
pub mod websocket;

pub use endpoint::SocketEndpoint;
pub use event_stream::EventStreamTransport;
pub use mock::{ScriptStep, ScriptedStream, ScriptedTransport};
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("unexpected status {status} opening stream: {body}")]
    Status { status: u16, body: String },
    #[error("websocket error: {0}")]
    Socket(String),
    #[error("event stream read failed: {0}")]
    Read(String),
    #[error("cancel request failed: {0}")]
    Cancel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    EventStream,
    Scripted,
}

/// Callbacks for one stream. `on_close` is the last callback a stream makes
/// unless it was closed through its [`StreamControl`], in which case nothing
/// further is delivered at all.
pub trait StreamHandler: Send + Sync {
    fn on_open(&self) {}
    fn on_event(&self, envelope: Envelope);
    fn on_error(&self, error: TransportError);
    fn on_close(&self) {}
}

/// Out-of-band run cancellation, implemented by the REST client.
#[async_trait]
pub trait RunCanceller: Send + Sync {
    async fn cancel_run(&self, run_id: &str) -> Result<(), TransportError>;
}

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Starts streaming `run_id` in the background. Connection failures are
    /// reported through `handler.on_error`, never returned.
    fn open(&self, run_id: &str, handler: Arc<dyn StreamHandler>) -> StreamControl;
}

struct ControlInner {
    run_id: String,
    shutdown: CancellationToken,
    upstream: Option<mpsc::UnboundedSender<String>>,
    socket_open: AtomicBool,
    canceller: Arc<dyn RunCanceller>,
}

/// Handle to an open stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct StreamControl {
    inner: Arc<ControlInner>,
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamControl")
            .field("run_id", &self.inner.run_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamControl {
    pub fn new(
        run_id: impl Into<String>,
        canceller: Arc<dyn RunCanceller>,
        upstream: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                run_id: run_id.into(),
                shutdown: CancellationToken::new(),
                upstream,
                socket_open: AtomicBool::new(false),
                canceller,
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Stops listening. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::debug!(target = "stream.transport", run_id = %self.inner.run_id, "closing stream");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Asks the server to cancel the run: in-band while a socket is open,
    /// otherwise through the REST fallback.
    pub async fn cancel(&self) -> Result<(), TransportError> {
        if self.inner.socket_open.load(Ordering::Acquire) {
            if let Some(upstream) = &self.inner.upstream {
                let frame = serde_json::json!({"type": "cancel", "run_id": self.inner.run_id});
                if upstream.send(frame.to_string()).is_ok() {
                    tracing::debug!(target = "stream.transport", run_id = %self.inner.run_id, "sent in-band cancel");
                    return Ok(());
                }
            }
        }
        self.inner.canceller.cancel_run(&self.inner.run_id).await
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn set_socket_open(&self, open: bool) {
        self.inner.socket_open.store(open, Ordering::Release);
    }
}

/// Handler wrapper used by read loops: swallows every callback once the
/// stream has been closed.
pub(crate) struct Callbacks {
    handler: Arc<dyn StreamHandler>,
    shutdown: CancellationToken,
}

impl Callbacks {
    pub(crate) fn new(handler: Arc<dyn StreamHandler>, control: &StreamControl) -> Self {
        Self {
            handler,
            shutdown: control.shutdown_token(),
        }
    }

    fn live(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub(crate) fn open(&self) {
        if self.live() {
            self.handler.on_open();
        }
    }

    pub(crate) fn event(&self, envelope: Envelope) {
        if self.live() {
            self.handler.on_event(envelope);
        }
    }

    pub(crate) fn error(&self, error: TransportError) {
        if self.live() {
            tracing::warn!(target = "stream.transport", error = %error, "stream error");
            self.handler.on_error(error);
        }
    }

    pub(crate) fn close(&self) {
        if self.live() {
            self.handler.on_close();
        }
    }
}

/// Picks the transport for this process. `auto` prefers the socket whenever a
/// socket base URL is configured.
pub fn select_transport(
    config: &ClientConfig,
    canceller: Arc<dyn RunCanceller>,
) -> Result<Arc<dyn Transport>, TransportSelectError> {
    let socket = match (config.transport, &config.ws_base_url) {
        (TransportPreference::EventStream, _) => None,
        (TransportPreference::Auto, None) => None,
        (TransportPreference::Websocket, None) => {
            return Err(TransportSelectError::MissingSocketBase)
        }
        (_, Some(base)) => Some(base.clone()),
    };
    let transport: Arc<dyn Transport> = match socket {
        Some(base) => {
            tracing::debug!(target = "stream.transport", base = %base, "using websocket transport");
            Arc::new(WebSocketTransport::new(SocketEndpoint::new(base), canceller))
        }
        None => {
            tracing::debug!(target = "stream.transport", "using event-stream transport");
            Arc::new(EventStreamTransport::from_config(config, canceller)?)
        }
    };
    Ok(transport)
}

#[derive(Debug, Error)]
pub enum TransportSelectError {
    #[error("websocket transport requested but no ws_base_url configured")]
    MissingSocketBase,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCanceller {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RunCanceller for RecordingCanceller {
        async fn cancel_run(&self, run_id: &str) -> Result<(), TransportError> {
            self.calls.lock().push(run_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_prefers_open_socket() {
        let canceller = Arc::new(RecordingCanceller::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = StreamControl::new("r1", canceller.clone(), Some(tx));

        control.cancel().await.expect("fallback cancel");
        assert_eq!(canceller.calls.lock().as_slice(), ["r1".to_string()]);
        assert!(rx.try_recv().is_err());

        control.set_socket_open(true);
        control.cancel().await.expect("in-band cancel");
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame, serde_json::json!({"type": "cancel", "run_id": "r1"}));
        assert_eq!(canceller.calls.lock().len(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let control = StreamControl::new("r1", Arc::new(RecordingCanceller::default()), None);
        assert!(!control.is_closed());
        control.close();
        control.close();
        assert!(control.is_closed());
    }

    #[test]
    fn selection_is_deterministic() {
        let canceller: Arc<dyn RunCanceller> = Arc::new(RecordingCanceller::default());
        let mut config = ClientConfig::default();
        let transport = select_transport(&config, canceller.clone()).unwrap();
        assert_eq!(transport.kind(), TransportKind::EventStream);

        config.ws_base_url = Some("ws://127.0.0.1:9000".into());
        let transport = select_transport(&config, canceller.clone()).unwrap();
        assert_eq!(transport.kind(), TransportKind::WebSocket);

        config.transport = TransportPreference::EventStream;
        let transport = select_transport(&config, canceller.clone()).unwrap();
        assert_eq!(transport.kind(), TransportKind::EventStream);

        config.transport = TransportPreference::Websocket;
        config.ws_base_url = None;
        assert!(matches!(
            select_transport(&config, canceller),
            Err(TransportSelectError::MissingSocketBase)
        ));
    }
}
