use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use url::Url;

use super::{
    Callbacks, RunCanceller, StreamControl, StreamHandler, Transport, TransportError,
    TransportKind, TransportSelectError,
};
use crate::api::endpoint;
use crate::config::ClientConfig;
use crate::decoder::{Decoder, FrameDecoder};

/// One-way run stream over `GET {api_base}/runs/{run_id}/events`. It cannot
/// send upstream, so cancellation always goes through the REST fallback.
pub struct EventStreamTransport {
    http: Client,
    api_base: Url,
    token: Option<String>,
    canceller: Arc<dyn RunCanceller>,
}

impl EventStreamTransport {
    pub fn new(
        http: Client,
        api_base: Url,
        token: Option<String>,
        canceller: Arc<dyn RunCanceller>,
    ) -> Self {
        Self {
            http,
            api_base,
            token,
            canceller,
        }
    }

    /// Streams stay open until the server ends them, so only the connect phase
    /// is bounded.
    pub fn from_config(
        config: &ClientConfig,
        canceller: Arc<dyn RunCanceller>,
    ) -> Result<Self, TransportSelectError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::new(
            http,
            config.api_base()?,
            config.auth_token.clone(),
            canceller,
        ))
    }
}

impl Transport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    fn open(&self, run_id: &str, handler: Arc<dyn StreamHandler>) -> StreamControl {
        let control = StreamControl::new(run_id, self.canceller.clone(), None);
        let callbacks = Callbacks::new(handler, &control);
        let mut request = self
            .http
            .get(endpoint(&self.api_base, &["runs", run_id, "events"]))
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let frames = FrameDecoder::new(Decoder::new(Some(run_id.to_string())));
        let task_control = control.clone();
        tokio::spawn(async move {
            run_event_stream(request, task_control, callbacks, frames).await;
        });
        control
    }
}

async fn run_event_stream(
    request: reqwest::RequestBuilder,
    control: StreamControl,
    callbacks: Callbacks,
    mut frames: FrameDecoder,
) {
    let shutdown = control.shutdown_token();
    let response = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = request.send() => result,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            callbacks.error(TransportError::Connect(err.to_string()));
            callbacks.close();
            return;
        }
    };
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        callbacks.error(TransportError::Status {
            status: status.as_u16(),
            body,
        });
        callbacks.close();
        return;
    }

    callbacks.open();
    let mut body = response.bytes_stream();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    for envelope in frames.push(&bytes) {
                        callbacks.event(envelope);
                    }
                }
                Some(Err(err)) => {
                    callbacks.error(TransportError::Read(err.to_string()));
                    break;
                }
                None => {
                    if let Some(envelope) = frames.finish() {
                        callbacks.event(envelope);
                    }
                    break;
                }
            },
        }
    }
    callbacks.close();
}
