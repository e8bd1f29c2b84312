use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use lynx_core::Capability;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// A task bound to an agent, ready to be handed to the executor.
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    /// The claimed task.
    pub task_id: Uuid,
    /// The agent reserved for it.
    pub agent_id: Uuid,
    /// Lane the task was taken from.
    pub capability: Capability,
    /// Opaque task input, passed through to the executor.
    pub payload: serde_json::Value,
    /// Failed attempts before this one.
    pub attempt: u32,
    /// Execution budget for this attempt, if any.
    pub deadline: Option<Duration>,
}

/// What one distribution cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Tasks claimed this cycle, in assignment order.
    pub assignments: Vec<Assignment>,
    /// The cycle stopped early at the global concurrency cap.
    pub capped: bool,
    /// Lanes abandoned because of an unexpected registry or queue error.
    pub errors: usize,
}

/// Outcome of trying to place one task from a lane.
enum LaneStep {
    Assigned(Assignment),
    /// Nothing more to do for this lane this cycle.
    Exhausted,
    Failed,
}

/// Matches ready tasks to the least-loaded eligible agent.
///
/// Lanes are served round-robin, one assignment per lane per pass, so a
/// shared agent or the global cap cannot be monopolised by one capability.
/// The lane that leads a cycle rotates from one cycle to the next. A lane
/// with no agent is left queued (backpressure) and never dropped.
pub struct DistributionEngine {
    global_cap: u32,
    /// Lane that went first in the previous cycle.
    last_lead: Mutex<Option<Capability>>,
}

impl DistributionEngine {
    /// An engine that never lets the summed agent load exceed `global_cap`.
    pub fn new(global_cap: u32) -> Self {
        Self {
            global_cap,
            last_lead: Mutex::new(None),
        }
    }

    /// The fleet-wide concurrency ceiling.
    pub fn global_cap(&self) -> u32 {
        self.global_cap
    }

    /// Promote due retries, then assign as much ready work as capacity allows.
    pub fn run_cycle(
        &self,
        queue: &mut TaskQueue,
        registry: &mut AgentRegistry,
        now: Instant,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        let promoted = queue.promote_ready(now);
        if promoted > 0 {
            debug!(promoted, "Retrying tasks returned to queue");
        }

        let mut active = self.lane_order(queue.ready_capabilities(now));
        while !active.is_empty() {
            let mut still_active = Vec::with_capacity(active.len());
            for capability in active {
                if registry.total_load() >= self.global_cap {
                    report.capped = true;
                    debug!(cap = self.global_cap, "Global concurrency cap reached");
                    return report;
                }
                match self.place_one(&capability, queue, registry, now) {
                    LaneStep::Assigned(assignment) => {
                        report.assignments.push(assignment);
                        still_active.push(capability);
                    }
                    LaneStep::Exhausted => {}
                    LaneStep::Failed => report.errors += 1,
                }
            }
            active = still_active;
        }
        report
    }

    /// Sorted lanes, rotated to start just after last cycle's leader.
    fn lane_order(&self, lanes: BTreeSet<Capability>) -> Vec<Capability> {
        let mut order: Vec<Capability> = lanes.into_iter().collect();
        let mut last_lead = self.last_lead.lock();
        if let Some(previous) = last_lead.as_ref() {
            let start = order.partition_point(|c| c <= previous);
            let len = order.len().max(1);
            order.rotate_left(start % len);
        }
        if let Some(first) = order.first() {
            *last_lead = Some(first.clone());
        }
        order
    }

    fn place_one(
        &self,
        capability: &Capability,
        queue: &mut TaskQueue,
        registry: &mut AgentRegistry,
        now: Instant,
    ) -> LaneStep {
        let Some(task) = queue.next_for(capability, now) else {
            return LaneStep::Exhausted;
        };
        let (task_id, payload, attempt, deadline) =
            (task.id, task.payload.clone(), task.attempt, task.deadline());

        let Some(agent_id) = registry.find_eligible(capability).first().map(|a| a.id) else {
            debug!(
                capability = %capability,
                waiting = queue.depth_for(capability),
                "No eligible agent, leaving tasks queued"
            );
            return LaneStep::Exhausted;
        };

        if let Err(e) = registry.reserve(agent_id) {
            warn!(agent_id = %agent_id, error = %e, "Reservation failed");
            return LaneStep::Failed;
        }
        if !queue.claim(task_id, agent_id) {
            if let Err(e) = registry.release(agent_id) {
                warn!(agent_id = %agent_id, error = %e, "Failed to undo reservation");
            }
            return LaneStep::Failed;
        }

        debug!(
            task_id = %task_id,
            agent_id = %agent_id,
            capability = %capability,
            "Task assigned"
        );
        LaneStep::Assigned(Assignment {
            task_id,
            agent_id,
            capability: capability.clone(),
            payload,
            attempt,
            deadline,
        })
    }
}
