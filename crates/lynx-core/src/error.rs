use crate::{Capability, TaskState};
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

/// Top-level error type for the fleet.
///
/// Structural errors (`DuplicateAgent`, `InvalidTransition`,
/// `TaskAlreadyRunning`) are caller mistakes and are never retried.
/// `Execution` and `Timeout` come from the executor and feed the retry policy.
#[derive(Error, Debug)]
pub enum FleetError {
    /// An agent with this id is already registered.
    #[error("agent {0} is already registered")]
    DuplicateAgent(Uuid),

    /// The agent still has tasks in flight.
    #[error("agent {id} is busy with {load} task(s)")]
    AgentBusy {
        /// Agent id.
        id: Uuid,
        /// Tasks currently in flight.
        load: u32,
    },

    /// The agent has no spare capacity.
    #[error("agent {0} is at capacity")]
    AgentAtCapacity(Uuid),

    /// No registered agent advertises this capability.
    #[error("no registered agent advertises capability '{0}'")]
    InvalidCapability(Capability),

    /// The task is already executing and cannot be withdrawn synchronously.
    #[error("task {0} is already running")]
    TaskAlreadyRunning(Uuid),

    /// The requested state change is not an edge of the lifecycle.
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Task id.
        task_id: Uuid,
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },

    /// The execution attempt exceeded its deadline.
    #[error("task {task_id} timed out after {after_ms}ms")]
    Timeout {
        /// Task id.
        task_id: Uuid,
        /// The deadline that elapsed.
        after_ms: u64,
    },

    /// The task failed on every allowed attempt.
    #[error("task {task_id} failed after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Task id.
        task_id: Uuid,
        /// Attempts consumed.
        attempts: u32,
    },

    /// No agent with this id.
    #[error("unknown agent {0}")]
    UnknownAgent(Uuid),

    /// No task with this id.
    #[error("unknown task {0}")]
    UnknownTask(Uuid),

    /// A release was requested for an agent with no reservation.
    #[error("agent {0} has no reservation to release")]
    NoReservation(Uuid),

    /// The executor reported a failure.
    #[error("execution error: {0}")]
    Execution(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Returns `true` for caller mistakes that must surface immediately.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateAgent(_) | Self::InvalidTransition { .. } | Self::TaskAlreadyRunning(_)
        )
    }
}
