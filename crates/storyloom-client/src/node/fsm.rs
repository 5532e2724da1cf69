use std::fmt;

use serde::Serialize;
use serde_json::Value;

pub const CANCELLED_MESSAGE: &str = "Execution cancelled";

const FIRST_CHUNK_PROGRESS: u8 = 5;
const NUDGE: u8 = 5;
const NUDGE_CEILING: u8 = 95;
const SUPPLIED_CEILING: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Idle,
    Loading,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl NodeState {
    pub const ALL: [NodeState; 6] = [
        NodeState::Idle,
        NodeState::Loading,
        NodeState::Streaming,
        NodeState::Complete,
        NodeState::Error,
        NodeState::Cancelled,
    ];

    pub fn is_active(self) -> bool {
        matches!(self, NodeState::Loading | NodeState::Streaming)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Idle => "idle",
            NodeState::Loading => "loading",
            NodeState::Streaming => "streaming",
            NodeState::Complete => "complete",
            NodeState::Error => "error",
            NodeState::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    Run,
    FirstChunk(String),
    StreamChunk { text: String, progress: Option<f64> },
    StreamEnd(Option<Value>),
    Error(String),
    Cancel,
    Retry,
    Reset,
}

impl NodeAction {
    fn name(&self) -> &'static str {
        match self {
            NodeAction::Run => "run",
            NodeAction::FirstChunk(_) => "first_chunk",
            NodeAction::StreamChunk { .. } => "stream_chunk",
            NodeAction::StreamEnd(_) => "stream_end",
            NodeAction::Error(_) => "error",
            NodeAction::Cancel => "cancel",
            NodeAction::Retry => "retry",
            NodeAction::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NodeContext {
    pub state: NodeState,
    pub partial_text: String,
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<Value>,
}

/// What a node card shows: status badge, streaming preview and progress bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDisplay {
    pub status: NodeState,
    pub preview: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
}

impl From<&NodeContext> for NodeDisplay {
    fn from(context: &NodeContext) -> Self {
        Self {
            status: context.state,
            preview: (!context.partial_text.is_empty()).then(|| context.partial_text.clone()),
            progress: context.progress,
            error: context.error.clone(),
        }
    }
}

/// Receives the display projection after every accepted transition.
pub trait NodeDisplaySink: Send + Sync {
    fn render(&self, node_id: &str, display: &NodeDisplay);
}

/// Sink for nodes that are not bound to anything visible.
pub struct NullSink;

impl NodeDisplaySink for NullSink {
    fn render(&self, _node_id: &str, _display: &NodeDisplay) {}
}

/// Lifecycle of one visual node's execution.
pub struct NodeMachine {
    node_id: String,
    context: NodeContext,
    sink: Box<dyn NodeDisplaySink>,
}

impl NodeMachine {
    pub fn new(node_id: impl Into<String>, sink: Box<dyn NodeDisplaySink>) -> Self {
        Self {
            node_id: node_id.into(),
            context: NodeContext::default(),
            sink,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn state(&self) -> NodeState {
        self.context.state
    }

    /// Applies `action` if it is legal in the current state and returns whether
    /// it was. Illegal actions leave the context untouched.
    pub fn dispatch(&mut self, action: NodeAction) -> bool {
        let from = self.context.state;
        let Some(next) = transition(&self.context, &action) else {
            tracing::trace!(
                target = "node.fsm",
                node_id = %self.node_id,
                state = %from,
                action = action.name(),
                "ignoring illegal action"
            );
            return false;
        };
        self.context = next;
        tracing::debug!(
            target = "node.fsm",
            node_id = %self.node_id,
            from = %from,
            to = %self.context.state,
            action = action.name(),
            "node transition"
        );
        self.sink
            .render(&self.node_id, &NodeDisplay::from(&self.context));
        true
    }
}

fn transition(current: &NodeContext, action: &NodeAction) -> Option<NodeContext> {
    use NodeState::*;

    let next = match (current.state, action) {
        (Idle | Error | Cancelled, NodeAction::Run) => NodeContext {
            state: Loading,
            ..NodeContext::default()
        },
        (Loading, NodeAction::FirstChunk(text)) => NodeContext {
            state: Streaming,
            partial_text: text.clone(),
            progress: FIRST_CHUNK_PROGRESS,
            ..current.clone()
        },
        (Streaming, NodeAction::StreamChunk { text, progress }) => NodeContext {
            partial_text: text.clone(),
            progress: advance(current.progress, *progress),
            ..current.clone()
        },
        (Loading | Streaming, NodeAction::StreamEnd(result)) => NodeContext {
            state: Complete,
            partial_text: String::new(),
            progress: 100,
            error: None,
            result: result.clone(),
        },
        (_, NodeAction::Error(message)) => NodeContext {
            state: Error,
            progress: 0,
            error: Some(message.clone()),
            ..current.clone()
        },
        (_, NodeAction::Cancel) => NodeContext {
            state: Cancelled,
            partial_text: String::new(),
            progress: 0,
            error: Some(CANCELLED_MESSAGE.to_string()),
            result: current.result.clone(),
        },
        (_, NodeAction::Retry | NodeAction::Reset) => NodeContext::default(),
        _ => return None,
    };
    Some(next)
}

/// Supplied progress never moves backwards and stays below 100 until the end;
/// without one the bar is nudged forward.
fn advance(current: u8, supplied: Option<f64>) -> u8 {
    match supplied {
        Some(value) if value.is_finite() => {
            let supplied = value.clamp(0.0, SUPPLIED_CEILING as f64) as u8;
            current.max(supplied)
        }
        _ => current.saturating_add(NUDGE).min(NUDGE_CEILING).max(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<NodeDisplay>>,
    }

    impl NodeDisplaySink for Arc<Recorder> {
        fn render(&self, _node_id: &str, display: &NodeDisplay) {
            self.frames.lock().push(display.clone());
        }
    }

    fn machine_in(state: NodeState) -> NodeMachine {
        let mut machine = NodeMachine::new("n1", Box::new(NullSink));
        let path: &[NodeAction] = match state {
            NodeState::Idle => &[],
            NodeState::Loading => &[NodeAction::Run],
            NodeState::Streaming => &[NodeAction::Run, NodeAction::FirstChunk("a".into())],
            NodeState::Complete => &[NodeAction::Run, NodeAction::StreamEnd(None)],
            NodeState::Error => &[NodeAction::Error("x".into())],
            NodeState::Cancelled => &[NodeAction::Cancel],
        };
        for action in path {
            assert!(machine.dispatch(action.clone()));
        }
        assert_eq!(machine.state(), state);
        machine
    }

    #[test]
    fn illegal_actions_are_no_ops() {
        let mut idle = machine_in(NodeState::Idle);
        let before = idle.context().clone();
        assert!(!idle.dispatch(NodeAction::StreamChunk {
            text: "x".into(),
            progress: Some(50.0)
        }));
        assert_eq!(idle.context(), &before);

        let mut streaming = machine_in(NodeState::Streaming);
        let before = streaming.context().clone();
        assert!(!streaming.dispatch(NodeAction::Run));
        assert_eq!(streaming.context(), &before);

        let mut complete = machine_in(NodeState::Complete);
        assert!(!complete.dispatch(NodeAction::FirstChunk("late".into())));
        assert!(!complete.dispatch(NodeAction::Run));
    }

    #[test]
    fn cancel_lands_in_cancelled_from_every_state() {
        for state in NodeState::ALL {
            let mut machine = machine_in(state);
            assert!(machine.dispatch(NodeAction::Cancel));
            assert_eq!(machine.state(), NodeState::Cancelled);
            assert!(machine.context().partial_text.is_empty());
            assert_eq!(machine.context().progress, 0);
            assert_eq!(machine.context().error.as_deref(), Some(CANCELLED_MESSAGE));
        }
    }

    #[test]
    fn progress_follows_stream() {
        let recorder = Arc::new(Recorder::default());
        let mut machine = NodeMachine::new("n1", Box::new(recorder.clone()));
        machine.dispatch(NodeAction::Run);
        machine.dispatch(NodeAction::FirstChunk("He".into()));
        assert_eq!(machine.context().progress, 5);
        machine.dispatch(NodeAction::StreamChunk {
            text: "Hel".into(),
            progress: None,
        });
        assert_eq!(machine.context().progress, 10);
        machine.dispatch(NodeAction::StreamChunk {
            text: "Hell".into(),
            progress: Some(250.0),
        });
        assert_eq!(machine.context().progress, 99);
        machine.dispatch(NodeAction::StreamChunk {
            text: "Hello".into(),
            progress: Some(40.0),
        });
        assert_eq!(machine.context().progress, 99);
        machine.dispatch(NodeAction::StreamEnd(Some(serde_json::json!({"text": "Hello"}))));
        assert_eq!(machine.context().progress, 100);
        assert!(machine.context().partial_text.is_empty());

        let frames = recorder.frames.lock();
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[1].preview.as_deref(), Some("He"));
        assert_eq!(frames[5].status, NodeState::Complete);
        assert!(frames[5].preview.is_none());
    }

    #[test]
    fn nudges_stop_below_completion() {
        assert_eq!(advance(93, None), 95);
        assert_eq!(advance(95, None), 95);
        assert_eq!(advance(99, None), 99);
        assert_eq!(advance(10, Some(f64::NAN)), 15);
    }

    #[test]
    fn error_then_retry_restores_defaults() {
        let mut machine = machine_in(NodeState::Streaming);
        assert!(machine.dispatch(NodeAction::Error("boom".into())));
        assert_eq!(machine.context().progress, 0);
        assert_eq!(machine.context().error.as_deref(), Some("boom"));
        assert!(machine.dispatch(NodeAction::Retry));
        assert_eq!(machine.context(), &NodeContext::default());
        assert!(machine.dispatch(NodeAction::Run));
    }
}
