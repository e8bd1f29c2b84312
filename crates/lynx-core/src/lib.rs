//! Core types and error definitions for the Lynx agent fleet.
//!
//! This crate provides the vocabulary shared by every Lynx crate: the
//! capability tags used to match work to agents, the canonical task state
//! machine, agent status, and the unified error type.
//!
//! # Main types
//!
//! - [`FleetError`]: Unified error enum for all fleet subsystems.
//! - [`FleetResult`]: Convenience alias for `Result<T, FleetError>`.
//! - [`Capability`]: A normalized capability tag (e.g. `testing`).
//! - [`TaskState`]: The lifecycle state of a unit of work.
//! - [`AgentStatus`]: The externally visible status of an agent.

/// Error types shared across the fleet.
pub mod error;

pub use error::{FleetError, FleetResult};

use serde::{Deserialize, Serialize};
use std::fmt;

// --- Capability tags ---

/// A label used to match tasks to the agents able to execute them.
///
/// Tags are trimmed and lowercased on construction so `"Testing "` and
/// `"testing"` name the same lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    /// Creates a normalized capability tag.
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the tag is empty after normalization.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.0
    }
}

// --- Task lifecycle ---

/// Lifecycle state of a task.
///
/// ```text
/// queued -> assigned -> running -> completed
///                          |
///                          +-> failed -> retrying -> queued
/// queued | retrying | assigned -> cancelled
/// running -> cancelled            (failure after a cancel request)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue for an eligible agent.
    Queued,
    /// Claimed by the distributor and bound to an agent.
    Assigned,
    /// Handed to the executor.
    Running,
    /// Finished successfully.
    Completed,
    /// The last attempt failed and no attempts remain.
    Failed,
    /// An attempt failed; waiting out the backoff before re-queueing.
    Retrying,
    /// Withdrawn before it could finish.
    Cancelled,
}

impl TaskState {
    /// Returns `true` for states a lifecycle can end in.
    ///
    /// `Completed` and `Cancelled` always end it. `Failed` ends it only once
    /// the task's attempts are exhausted, which the state alone cannot tell;
    /// use `Task::is_finished` for the per-task answer.
    pub fn can_end_lifecycle(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if the task counts toward queue depth.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    /// Returns `true` while the task holds an agent reservation.
    pub fn holds_agent(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    ///
    /// `failed -> retrying` is only taken while attempts remain; the caller
    /// enforces that bound.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Agent status ---

/// Externally visible status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// No tasks in flight.
    Idle,
    /// Some tasks in flight, spare capacity left.
    Working,
    /// Load equals capacity.
    Overloaded,
    /// Excluded from scheduling until brought back online.
    Offline,
}

impl AgentStatus {
    /// Derives the status of an online agent from its load counters.
    pub fn from_load(current_load: u32, max_concurrency: u32) -> Self {
        if current_load == 0 {
            Self::Idle
        } else if current_load >= max_concurrency {
            Self::Overloaded
        } else {
            Self::Working
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_is_normalized() {
        assert_eq!(Capability::new("  Testing "), Capability::new("testing"));
        assert_eq!(Capability::from("DataBase").as_str(), "database");
        assert!(Capability::new("   ").is_empty());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use TaskState::*;
        let all = [Queued, Assigned, Running, Completed, Failed, Retrying, Cancelled];
        for from in [Completed, Cancelled] {
            assert!(from.can_end_lifecycle());
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        // failed only leaves through a retry, which the tracker bounds
        for to in all {
            assert_eq!(Failed.can_transition_to(to), to == Retrying);
        }
    }

    #[test]
    fn running_cannot_go_back_to_queued() {
        assert!(!TaskState::Running.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Queued.can_transition_to(TaskState::Running));
        assert!(TaskState::Assigned.can_transition_to(TaskState::Running));
    }

    #[test]
    fn agent_status_from_load() {
        assert_eq!(AgentStatus::from_load(0, 2), AgentStatus::Idle);
        assert_eq!(AgentStatus::from_load(1, 2), AgentStatus::Working);
        assert_eq!(AgentStatus::from_load(2, 2), AgentStatus::Overloaded);
    }

    #[test]
    fn task_state_serializes_snake_case() {
        let json = serde_json::to_string(&TaskState::Retrying).unwrap_or_default();
        assert_eq!(json, "\"retrying\"");
        assert_eq!(TaskState::Cancelled.to_string(), "cancelled");
    }
}
