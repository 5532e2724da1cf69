//! Per-node execution lifecycle for long-running generation jobs.

mod fsm;
mod runner;

pub use fsm::{
    NodeAction, NodeContext, NodeDisplay, NodeDisplaySink, NodeMachine, NodeState, NullSink,
    CANCELLED_MESSAGE,
};
pub use runner::{ExecutionHooks, ExecutorError, NodeExecutor, NodeRunner};
