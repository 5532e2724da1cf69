use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::fsm::{NodeAction, NodeContext, NodeMachine, NodeState};

pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// Work behind a node. Progress is reported through the hooks; returning `Ok`
/// while the node is still running completes it with the returned value.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        input: Value,
        hooks: ExecutionHooks,
    ) -> Result<Option<Value>, ExecutorError>;
}

/// Callbacks handed to a running executor. Once the run is cancelled every
/// hook becomes a no-op.
#[derive(Clone)]
pub struct ExecutionHooks {
    machine: Arc<Mutex<NodeMachine>>,
    cancel: CancellationToken,
}

impl ExecutionHooks {
    /// Reports streamed text. The first chunk of a run moves the node from
    /// loading to streaming.
    pub fn chunk(&self, text: impl Into<String>, progress: Option<f64>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let text = text.into();
        let mut machine = self.machine.lock();
        let action = if machine.state() == NodeState::Loading {
            NodeAction::FirstChunk(text)
        } else {
            NodeAction::StreamChunk { text, progress }
        };
        machine.dispatch(action)
    }

    pub fn complete(&self, result: Option<Value>) -> bool {
        !self.cancel.is_cancelled() && self.machine.lock().dispatch(NodeAction::StreamEnd(result))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        !self.cancel.is_cancelled() && self.machine.lock().dispatch(NodeAction::Error(message.into()))
    }

    /// Cancels the run from inside the executor.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            self.machine.lock().dispatch(NodeAction::Cancel);
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled; executors can `select!` on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Drives a [`NodeMachine`] through one executor run at a time.
pub struct NodeRunner {
    machine: Arc<Mutex<NodeMachine>>,
    current: Mutex<CancellationToken>,
}

impl NodeRunner {
    pub fn new(machine: NodeMachine) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn context(&self) -> NodeContext {
        self.machine.lock().context().clone()
    }

    pub fn state(&self) -> NodeState {
        self.machine.lock().state()
    }

    /// Runs `executor` to completion and returns the final state. Executor
    /// errors and panics end in `error`; a cancelled run stays `cancelled`.
    pub async fn run(&self, executor: &dyn NodeExecutor, input: Value) -> NodeState {
        let token = CancellationToken::new();
        {
            let mut machine = self.machine.lock();
            if !machine.dispatch(NodeAction::Run) {
                return machine.state();
            }
            *self.current.lock() = token.clone();
        }
        let hooks = ExecutionHooks {
            machine: self.machine.clone(),
            cancel: token.clone(),
        };

        let outcome = AssertUnwindSafe(executor.execute(input, hooks))
            .catch_unwind()
            .await;

        let mut machine = self.machine.lock();
        if token.is_cancelled() {
            return machine.state();
        }
        match outcome {
            Ok(Ok(result)) => {
                if machine.state().is_active() {
                    machine.dispatch(NodeAction::StreamEnd(result));
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(target = "node.fsm", node_id = %machine.node_id(), error = %err, "executor failed");
                machine.dispatch(NodeAction::Error(err.to_string()));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(target = "node.fsm", node_id = %machine.node_id(), panic = %message, "executor panicked");
                machine.dispatch(NodeAction::Error(message));
            }
        }
        machine.state()
    }

    /// Moves the node to `cancelled` from any state and fires the run's token.
    pub fn cancel(&self) {
        self.machine.lock().dispatch(NodeAction::Cancel);
        self.current.lock().cancel();
    }

    pub fn retry(&self) {
        self.current.lock().cancel();
        self.machine.lock().dispatch(NodeAction::Retry);
    }

    pub fn reset(&self) {
        self.current.lock().cancel();
        self.machine.lock().dispatch(NodeAction::Reset);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("executor panicked: {text}")
    } else {
        "executor panicked".to_string()
    }
}
