use chrono::{DateTime, Utc};
use lynx_core::{AgentStatus, Capability, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A worker able to execute tasks for one or more capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable identifier.
    pub id: Uuid,
    /// Display name, if one was given.
    #[serde(default)]
    pub name: Option<String>,
    /// Normalized capability tags.
    pub capabilities: BTreeSet<Capability>,
    /// Attempts the agent may run at once.
    pub max_concurrency: u32,
    /// Attempts currently assigned or running.
    pub current_load: u32,
    /// Derived from load unless the agent is offline.
    pub status: AgentStatus,
    /// Successful attempts.
    pub tasks_completed: u64,
    /// Failed attempts, not failed tasks.
    pub tasks_failed: u64,
    /// Rolling success rate in `[0, 1]`, updated as an EMA.
    pub success_rate: f64,
    /// When the agent joined.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat, or the registration time.
    pub last_heartbeat: DateTime<Utc>,
    /// Registration order, the last tie-break when ranking agents.
    #[serde(skip)]
    pub(crate) seq: u64,
    /// Set when the heartbeat sweep (not an operator) took the agent offline.
    #[serde(skip)]
    pub(crate) stale: bool,
}

impl Agent {
    /// A fresh idle agent with a random id.
    pub fn new<I, C>(capabilities: I, max_concurrency: u32) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: None,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrency,
            current_load: 0,
            status: AgentStatus::Idle,
            tasks_completed: 0,
            tasks_failed: 0,
            success_rate: 1.0,
            registered_at: now,
            last_heartbeat: now,
            seq: 0,
            stale: false,
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether the agent advertises `capability`.
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Anything but [`AgentStatus::Offline`].
    pub fn is_online(&self) -> bool {
        self.status != AgentStatus::Offline
    }

    /// Whether one more attempt fits under `max_concurrency`.
    pub fn has_headroom(&self) -> bool {
        self.current_load < self.max_concurrency
    }

    pub(crate) fn refresh_status(&mut self) {
        if self.is_online() {
            self.status = AgentStatus::from_load(self.current_load, self.max_concurrency);
        }
    }
}

/// Registration request for an agent, as accepted by the API and config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Explicit id; a fresh one is generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Capability tags; at least one is required.
    pub capabilities: Vec<Capability>,
    /// Must be at least 1.
    pub max_concurrency: u32,
}

impl AgentRequest {
    /// A request with a generated id and no name.
    pub fn new<I, C>(capabilities: I, max_concurrency: u32) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        Self {
            id: None,
            name: None,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrency,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn into_agent(self) -> Agent {
        let mut agent = Agent::new(self.capabilities, self.max_concurrency);
        if let Some(id) = self.id {
            agent.id = id;
        }
        agent.name = self.name;
        agent
    }
}

/// A unit of work tracked through the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier.
    pub id: Uuid,
    /// Only agents advertising this tag may take the task.
    pub capability_required: Capability,
    /// Opaque to the scheduler.
    pub payload: serde_json::Value,
    /// Higher runs sooner.
    pub priority: i32,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Set while assigned or running.
    pub assigned_agent_id: Option<Uuid>,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Attempts allowed before the task fails for good.
    pub max_attempts: u32,
    /// Budget for a single execution attempt.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the latest accepted transition.
    pub last_transition_at: DateTime<Utc>,
    /// Executor output of the successful attempt.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error of the most recent failed attempt.
    #[serde(default)]
    pub error: Option<String>,
    /// Set when a running task was asked to stop.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(skip)]
    pub(crate) enqueue_seq: u64,
    /// Earliest instant a retrying task may return to the queue.
    #[serde(skip)]
    pub(crate) ready_at: Option<Instant>,
}

impl Task {
    /// A queued task with priority 0 and three attempts.
    pub fn new(capability: impl Into<Capability>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            capability_required: capability.into(),
            payload,
            priority: 0,
            state: TaskState::Queued,
            assigned_agent_id: None,
            attempt: 0,
            max_attempts: 3,
            deadline_ms: None,
            created_at: now,
            last_transition_at: now,
            result: None,
            error: None,
            cancel_requested: false,
            enqueue_seq: 0,
            ready_at: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Bound every attempt by `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Whether no further transition will ever be accepted.
    pub fn is_finished(&self) -> bool {
        self.state.can_end_lifecycle()
            && (self.state != TaskState::Failed || self.attempt >= self.max_attempts)
    }

    /// The per-attempt budget, if any.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.state == TaskState::Queued && self.ready_at.map_or(true, |at| at <= now)
    }
}

/// Submission request for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Capability the task requires.
    pub capability: Capability,
    /// Opaque payload handed to the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to 0.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Defaults to the fleet's `default_max_attempts`.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-attempt budget in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl TaskRequest {
    /// A request with fleet defaults for everything optional.
    pub fn new(capability: impl Into<Capability>, payload: serde_json::Value) -> Self {
        Self {
            capability: capability.into(),
            payload,
            priority: None,
            max_attempts: None,
            deadline_ms: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the fleet's default attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Bound every attempt by `deadline_ms`.
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}

/// One accepted state change, as retained in the transition log.
///
/// `from` is `None` for the record written at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Task that changed state.
    pub task_id: Uuid,
    /// Previous state.
    pub from: Option<TaskState>,
    /// New state.
    pub to: TaskState,
    /// Failed attempts at the time of the change.
    pub attempt: u32,
    /// Agent involved, when there is one.
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    /// When the change was accepted.
    pub at: DateTime<Utc>,
    /// Error text or cancellation reason.
    #[serde(default)]
    pub detail: Option<String>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was withdrawn immediately.
    Cancelled,
    /// The task is running; the executor was signalled and the task is
    /// finalized on its next report.
    Requested,
}

/// Events published to fleet subscribers (dashboards, the WebSocket feed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A task changed state.
    Transition(TransitionRecord),
    /// An agent joined the fleet.
    AgentRegistered {
        /// The new agent.
        agent_id: Uuid,
        /// Its normalized capabilities.
        capabilities: Vec<Capability>,
    },
    /// An agent left the fleet.
    AgentDeregistered {
        /// The departed agent.
        agent_id: Uuid,
    },
    /// Taken offline, brought back, or its load band moved.
    AgentStatusChanged {
        /// The agent.
        agent_id: Uuid,
        /// Its new status.
        status: AgentStatus,
    },
    /// Assignment stopped.
    Paused,
    /// Assignment restarted.
    Resumed,
}
