//! Task distribution and load balancing for a fleet of capability-tagged agents.
//!
//! Tasks are queued per capability, matched to the least-loaded eligible
//! agent, executed through a caller-supplied [`TaskExecutor`], and tracked
//! through a strict lifecycle with bounded retries and exponential backoff.
//!
//! # Main types
//!
//! - [`Fleet`]: Facade owning all fleet state behind one lock, plus the distribution loop.
//! - [`AgentRegistry`]: Known agents, their capacity, load counters, and success rates.
//! - [`TaskQueue`]: Capability-tagged, priority-ordered backlog with an atomic `claim`.
//! - [`DistributionEngine`]: Least-loaded matching of queued tasks to agents.
//! - [`LifecycleTracker`]: Task state machine, retry policy, and transition log.
//! - [`TelemetryAggregator`]: Incremental counters and [`FleetSnapshot`]s for dashboards.

/// Fleet tunables and retry policy.
pub mod config;
/// Least-loaded task distribution.
pub mod engine;
/// Executor contract and stock executors.
pub mod executor;
/// The fleet facade and distribution loop.
pub mod fleet;
/// Task lifecycle, retry handling, and the transition log.
pub mod lifecycle;
/// Agent registry and load accounting.
pub mod registry;
/// Capability-tagged task backlog.
pub mod task_queue;
/// Fleet counters, snapshots, and capability health.
pub mod telemetry;
/// Shared fleet types (Agent, Task, TransitionRecord, FleetEvent, etc.).
pub mod types;

pub use config::{FleetConfig, RetryPolicy};
pub use engine::{Assignment, CycleReport, DistributionEngine};
pub use executor::{ExecutionContext, FnExecutor, SimulatedExecutor, TaskExecutor};
pub use fleet::Fleet;
pub use lifecycle::{FailureOutcome, LifecycleTracker, TransitionLog};
pub use registry::AgentRegistry;
pub use task_queue::TaskQueue;
pub use telemetry::{CapabilityHealth, FleetSnapshot, StateCounts, TelemetryAggregator};
pub use types::{
    Agent, AgentRequest, CancelOutcome, FleetEvent, Task, TaskRequest, TransitionRecord,
};
