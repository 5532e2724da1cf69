//! In-memory transport for driving the session machine without a server.
//!
//! Streams either replay a fixed script or are driven by hand through
//! [`ScriptedStream`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use storyloom_proto::Envelope;

use super::{
    Callbacks, RunCanceller, StreamControl, StreamHandler, Transport, TransportError,
    TransportKind,
};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Open,
    Event(Envelope),
    Error(TransportError),
    Sleep(Duration),
    Close,
}

#[derive(Default)]
struct CancelLog {
    runs: Mutex<Vec<String>>,
}

#[async_trait]
impl RunCanceller for CancelLog {
    async fn cancel_run(&self, run_id: &str) -> Result<(), TransportError> {
        self.runs.lock().push(run_id.to_string());
        Ok(())
    }
}

/// One stream opened through a [`ScriptedTransport`].
#[derive(Clone)]
pub struct ScriptedStream {
    control: StreamControl,
    callbacks: Arc<Callbacks>,
}

impl ScriptedStream {
    pub fn run_id(&self) -> &str {
        self.control.run_id()
    }

    pub fn control(&self) -> &StreamControl {
        &self.control
    }

    pub fn open(&self) {
        self.callbacks.open();
    }

    pub fn emit(&self, envelope: Envelope) {
        self.callbacks.event(envelope);
    }

    pub fn fail(&self, error: TransportError) {
        self.callbacks.error(error);
    }

    pub fn finish(&self) {
        self.callbacks.close();
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Vec<ScriptStep>,
    streams: Mutex<Vec<ScriptedStream>>,
    cancels: Arc<CancelLog>,
}

impl ScriptedTransport {
    /// Streams stay idle until driven through [`ScriptedTransport::stream`].
    pub fn manual() -> Self {
        Self::default()
    }

    /// Every opened stream replays `script` on a spawned task.
    pub fn with_script(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn stream(&self, index: usize) -> Option<ScriptedStream> {
        self.streams.lock().get(index).cloned()
    }

    pub fn last_stream(&self) -> Option<ScriptedStream> {
        self.streams.lock().last().cloned()
    }

    /// Runs cancelled through the REST fallback, in call order.
    pub fn cancelled_runs(&self) -> Vec<String> {
        self.cancels.runs.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Scripted
    }

    fn open(&self, run_id: &str, handler: Arc<dyn StreamHandler>) -> StreamControl {
        let control = StreamControl::new(run_id, self.cancels.clone(), None);
        let stream = ScriptedStream {
            callbacks: Arc::new(Callbacks::new(handler, &control)),
            control: control.clone(),
        };
        self.streams.lock().push(stream.clone());

        if !self.script.is_empty() {
            let script = self.script.clone();
            tokio::spawn(async move {
                for step in script {
                    match step {
                        ScriptStep::Open => stream.open(),
                        ScriptStep::Event(envelope) => stream.emit(envelope),
                        ScriptStep::Error(error) => stream.fail(error),
                        ScriptStep::Sleep(delay) => tokio::time::sleep(delay).await,
                        ScriptStep::Close => stream.finish(),
                    }
                }
            });
        }
        control
    }
}
