use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{
    Callbacks, RunCanceller, SocketEndpoint, StreamControl, StreamHandler, Transport,
    TransportError, TransportKind,
};
use crate::decoder::{Decoder, RawFrame};

/// Bidirectional run stream over `{ws_base}/runs/{run_id}/ws`.
pub struct WebSocketTransport {
    endpoint: SocketEndpoint,
    canceller: Arc<dyn RunCanceller>,
}

impl WebSocketTransport {
    pub fn new(endpoint: SocketEndpoint, canceller: Arc<dyn RunCanceller>) -> Self {
        Self {
            endpoint,
            canceller,
        }
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn open(&self, run_id: &str, handler: Arc<dyn StreamHandler>) -> StreamControl {
        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let control = StreamControl::new(run_id, self.canceller.clone(), Some(tx_out));
        let callbacks = Callbacks::new(handler, &control);
        let url = self.endpoint.run_url(run_id);
        let decoder = Decoder::new(Some(run_id.to_string()));
        let task_control = control.clone();

        tokio::spawn(async move {
            let url = match url {
                Ok(url) => url,
                Err(err) => {
                    callbacks.error(TransportError::Connect(format!("invalid socket url: {err}")));
                    callbacks.close();
                    return;
                }
            };
            run_socket(url, task_control, rx_out, callbacks, decoder).await;
        });
        control
    }
}

async fn run_socket(
    url: Url,
    control: StreamControl,
    rx_out: mpsc::UnboundedReceiver<String>,
    callbacks: Callbacks,
    decoder: Decoder,
) {
    let shutdown = control.shutdown_token();
    tracing::debug!(target = "stream.transport", url = %url, "connecting websocket");

    let connected = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = connect_async(url.as_str()) => result,
    };
    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(err) => {
            callbacks.error(TransportError::Connect(err.to_string()));
            callbacks.close();
            return;
        }
    };

    control.set_socket_open(true);
    callbacks.open();
    handle_websocket(ws_stream, rx_out, &control, &callbacks, &decoder).await;
    control.set_socket_open(false);
    callbacks.close();
}

/// Pumps upstream frames out and decoded envelopes in until either side ends
/// or the control is closed. Upstream frames queued before a close are still
/// flushed so an in-band cancel is not lost.
async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    control: &StreamControl,
    callbacks: &Callbacks,
    decoder: &Decoder,
) {
    let shutdown = control.shutdown_token();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                control.set_socket_open(false);
                while let Ok(frame) = rx_out.try_recv() {
                    if ws_sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            Some(frame) = rx_out.recv() => {
                if let Err(err) = ws_sender.send(Message::Text(frame)).await {
                    callbacks.error(TransportError::Socket(err.to_string()));
                    break;
                }
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(envelope) = decoder.decode(RawFrame::Socket(&text)) {
                        callbacks.event(envelope);
                    }
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if let Some(envelope) = decoder.decode(RawFrame::Socket(text)) {
                            callbacks.event(envelope);
                        }
                    }
                    Err(_) => {
                        tracing::debug!(target = "stream.decoder", len = data.len(), "binary frame is not utf-8");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                Some(Err(err)) => {
                    callbacks.error(TransportError::Socket(err.to_string()));
                    break;
                }
            },
        }
    }
}
