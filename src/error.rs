use crate::types::{FunctionId, TaskId};
use derive_more::Display;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = OrchestrationError> = core::result::Result<T, E>;

/// Fixed-capacity resource that ran out.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Capacity {
    /// The scoped arena has no room for the requested allocation.
    #[display("arena")]
    Arena,
    /// The task-window slot for the next task is still occupied.
    #[display("task window")]
    TaskWindow,
    /// More dependency edges than the edge pool holds.
    #[display("edge pool")]
    EdgePool,
    /// Scopes are nested deeper than allowed.
    #[display("scope depth")]
    ScopeDepth,
}

/// Errors surfaced by the orchestration context.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum OrchestrationError {
    /// `begin` received a different number of arguments than expected.
    #[error("expected {expected} orchestration arguments, got {actual}")]
    ArgCountMismatch {
        /// Count the orchestration entry declared.
        expected: usize,
        /// Count actually supplied by the host.
        actual: usize,
    },
    /// A fixed-capacity resource is exhausted.
    #[error("{capacity} capacity exceeded: requested {requested}, available {available}")]
    CapacityExceeded {
        /// The exhausted resource.
        capacity: Capacity,
        /// Units requested by the failing operation.
        requested: u64,
        /// Units still available.
        available: u64,
    },
    /// A parameter descriptor violates its factory contract.
    #[error("parameter {index} of `{kernel}` is invalid: {reason}")]
    InvalidParameter {
        /// Position of the parameter in the submission.
        index: usize,
        /// Kernel the parameter was submitted to.
        kernel: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// Scope open/close calls are unbalanced.
    #[error("scope imbalance: {0}")]
    ScopeImbalance(&'static str),
    /// An execution backend reported failure for a running task.
    #[error("task {task} (`{kernel}`, function {function_id}) failed: {cause}")]
    TaskExecutionFailure {
        /// The failed task.
        task: TaskId,
        /// Kernel name of the failed task.
        kernel: String,
        /// Function id of the failed task.
        function_id: FunctionId,
        /// Backend-provided failure description.
        cause: String,
    },
    /// The session was aborted by an earlier task failure.
    #[error("session aborted by an earlier failure of task {0}")]
    SessionAborted(TaskId),
    /// The scheduler agent threads could not be started.
    #[error("failed to start scheduler agents: {0}")]
    AgentSpawn(String),
}

/// Failure reported by an execution backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KernelError {
    /// No kernel is registered under the function id.
    #[error("no kernel registered for function {0}")]
    UnknownFunction(FunctionId),
    /// The kernel ran and reported failure.
    #[error("{0}")]
    Failed(String),
}
