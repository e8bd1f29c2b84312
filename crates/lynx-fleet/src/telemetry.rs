use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::types::{Task, TransitionRecord};
use chrono::{DateTime, Utc};
use lynx_core::{Capability, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Number of tasks in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Waiting for an agent.
    pub queued: u64,
    /// Reserved an agent, not yet started.
    pub assigned: u64,
    /// Executing an attempt.
    pub running: u64,
    /// Backing off before requeue.
    pub retrying: u64,
    /// Finished successfully.
    pub completed: u64,
    /// Terminal failures only.
    pub failed: u64,
    /// Withdrawn by a caller.
    pub cancelled: u64,
}

impl StateCounts {
    fn slot(&mut self, state: TaskState) -> &mut u64 {
        match state {
            TaskState::Queued => &mut self.queued,
            TaskState::Assigned => &mut self.assigned,
            TaskState::Running => &mut self.running,
            TaskState::Retrying => &mut self.retrying,
            TaskState::Completed => &mut self.completed,
            TaskState::Failed => &mut self.failed,
            TaskState::Cancelled => &mut self.cancelled,
        }
    }

    /// Count for one state.
    pub fn get(&self, state: TaskState) -> u64 {
        match state {
            TaskState::Queued => self.queued,
            TaskState::Assigned => self.assigned,
            TaskState::Running => self.running,
            TaskState::Retrying => self.retrying,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::Cancelled => self.cancelled,
        }
    }

    fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            *counts.slot(task.state) += 1;
        }
        counts
    }
}

/// Point-in-time view of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Registered agents.
    pub total_agents: usize,
    /// Agents with at least one task in flight.
    pub active_agents: usize,
    /// Agents not accepting work.
    pub offline_agents: usize,
    /// Tasks waiting for an agent, including those backing off.
    pub queue_depth: u64,
    /// Tasks holding a reservation.
    pub assigned: u64,
    /// Tasks executing.
    pub running: u64,
    /// Tasks in backoff.
    pub retrying: u64,
    /// Tasks completed since start.
    pub completed: u64,
    /// Tasks that exhausted their attempts.
    pub failed: u64,
    /// Tasks cancelled since start.
    pub cancelled: u64,
    /// Mean of the agents' success rates; `0.0` for an empty fleet.
    pub average_success_rate: f64,
    /// Completions within the trailing window, scaled to one minute.
    pub throughput_per_minute: f64,
    /// Sum of agent loads.
    pub total_load: u32,
    /// Sum of `max_concurrency` over online agents.
    pub total_capacity: u32,
    /// Configured cap on in-flight tasks.
    pub global_concurrency_cap: u32,
    /// Whether assignment is paused.
    pub paused: bool,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Per-capability view used to spot lanes nobody can serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityHealth {
    /// The lane.
    pub capability: Capability,
    /// Registered agents advertising the capability.
    pub agents: usize,
    /// Of those, the ones online with spare capacity.
    pub eligible_agents: usize,
    /// Tasks waiting for the capability.
    pub queued: usize,
    /// `false` when work is waiting and no online agent advertises it.
    pub healthy: bool,
}

/// Keeps running state counts from the transition stream, so a snapshot
/// never has to walk the queue.
pub struct TelemetryAggregator {
    counts: StateCounts,
    completions: VecDeque<Instant>,
    window: Duration,
}

impl TelemetryAggregator {
    /// `window` is the trailing span used for throughput.
    pub fn new(window: Duration) -> Self {
        Self {
            counts: StateCounts::default(),
            completions: VecDeque::new(),
            window,
        }
    }

    /// Fold one accepted transition into the counters.
    pub fn on_transition(&mut self, record: &TransitionRecord, now: Instant) {
        if let Some(from) = record.from {
            let slot = self.counts.slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.counts.slot(record.to) += 1;
        if record.to == TaskState::Completed {
            self.completions.push_back(now);
        }
        self.prune(now);
    }

    /// Current per-state counts.
    pub fn counts(&self) -> StateCounts {
        self.counts
    }

    /// Completions within the trailing window, scaled to one minute.
    pub fn throughput_per_minute(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.completions.len() as f64 * 60.0 / secs
    }

    /// Assemble a [`FleetSnapshot`] from the counters and the registry.
    pub fn snapshot(
        &mut self,
        registry: &AgentRegistry,
        global_concurrency_cap: u32,
        paused: bool,
        now: Instant,
    ) -> FleetSnapshot {
        let agents = registry.agents();
        let total_agents = agents.len();
        let average_success_rate = if total_agents == 0 {
            0.0
        } else {
            agents.iter().map(|a| a.success_rate).sum::<f64>() / total_agents as f64
        };
        let counts = self.counts;

        FleetSnapshot {
            total_agents,
            active_agents: agents.iter().filter(|a| a.current_load > 0).count(),
            offline_agents: agents.iter().filter(|a| !a.is_online()).count(),
            queue_depth: counts.queued + counts.retrying,
            assigned: counts.assigned,
            running: counts.running,
            retrying: counts.retrying,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            average_success_rate,
            throughput_per_minute: self.throughput_per_minute(now),
            total_load: registry.total_load(),
            total_capacity: registry.total_capacity(),
            global_concurrency_cap,
            paused,
            taken_at: Utc::now(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.completions.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Count live and archived tasks from scratch.
///
/// Agrees with [`TelemetryAggregator::counts`] as long as nothing has been
/// evicted from the archive.
pub fn recount(queue: &TaskQueue) -> StateCounts {
    StateCounts::tally(queue.live_tasks().into_iter().chain(queue.archived_tasks()))
}

/// Health of every capability that is advertised or has work waiting.
pub fn capability_health(registry: &AgentRegistry, queue: &TaskQueue) -> Vec<CapabilityHealth> {
    let mut capabilities: BTreeSet<Capability> = registry.capabilities();
    capabilities.extend(
        queue
            .live_tasks()
            .into_iter()
            .filter(|t| t.state.is_pending())
            .map(|t| t.capability_required.clone()),
    );

    let agents = registry.agents();
    capabilities
        .into_iter()
        .map(|capability| {
            let advertising: Vec<_> = agents
                .iter()
                .filter(|a| a.has_capability(&capability))
                .collect();
            let online = advertising.iter().filter(|a| a.is_online()).count();
            let eligible = registry.find_eligible(&capability).len();
            let queued = queue.depth_for(&capability);
            CapabilityHealth {
                agents: advertising.len(),
                eligible_agents: eligible,
                queued,
                healthy: queued == 0 || online > 0,
                capability,
            }
        })
        .collect()
}
