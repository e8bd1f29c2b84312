use crate::types::{Task, TransitionRecord};
use chrono::Utc;
use lynx_core::{Capability, FleetError, FleetResult, TaskState};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::time::Instant;
use uuid::Uuid;

/// Capability-tagged backlog and owner of every live task record.
///
/// Every accepted state change is journaled; the lifecycle tracker drains
/// the journal with [`drain_transitions`](Self::drain_transitions).
/// Finished tasks move to a bounded archive so they stay queryable.
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    archive: HashMap<Uuid, Task>,
    archive_order: VecDeque<Uuid>,
    archive_capacity: usize,
    next_seq: u64,
    journal: Vec<TransitionRecord>,
}

impl TaskQueue {
    /// Empty queue keeping up to 1000 finished tasks.
    pub fn new() -> Self {
        Self::with_archive_capacity(1_000)
    }

    /// Empty queue keeping up to `archive_capacity` finished tasks.
    pub fn with_archive_capacity(archive_capacity: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            archive: HashMap::new(),
            archive_order: VecDeque::new(),
            archive_capacity,
            next_seq: 0,
            journal: Vec::new(),
        }
    }

    /// Accept a task in the `queued` state with no attempts consumed.
    pub fn submit(&mut self, mut task: Task) -> Uuid {
        let now = Utc::now();
        task.state = TaskState::Queued;
        task.attempt = 0;
        task.assigned_agent_id = None;
        task.result = None;
        task.error = None;
        task.cancel_requested = false;
        task.ready_at = None;
        task.created_at = now;
        task.last_transition_at = now;
        task.enqueue_seq = self.bump_seq();

        let id = task.id;
        self.journal.push(TransitionRecord {
            task_id: id,
            from: None,
            to: TaskState::Queued,
            attempt: 0,
            agent_id: None,
            at: now,
            detail: None,
        });
        self.tasks.insert(id, task);
        id
    }

    /// The task that should run next for `capability`: highest priority,
    /// then earliest enqueued. Does not change any state.
    pub fn next_for(&self, capability: &Capability, now: Instant) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.capability_required == *capability && t.is_ready(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.enqueue_seq.cmp(&b.enqueue_seq))
            })
    }

    /// Capabilities that currently have a ready task.
    pub fn ready_capabilities(&self, now: Instant) -> BTreeSet<Capability> {
        self.tasks
            .values()
            .filter(|t| t.is_ready(now))
            .map(|t| t.capability_required.clone())
            .collect()
    }

    /// Move `queued -> assigned`, binding `agent_id` in the same step.
    ///
    /// Returns `false` if the task is not (or no longer) queued, so at most
    /// one caller ever wins a given task.
    pub fn claim(&mut self, task_id: Uuid, agent_id: Uuid) -> bool {
        match self.tasks.get(&task_id) {
            Some(task) if task.state == TaskState::Queued => {}
            _ => return false,
        }
        self.apply(task_id, TaskState::Assigned, None, |task| {
            task.assigned_agent_id = Some(agent_id);
        })
        .is_ok()
    }

    /// Withdraw a task that has not started running.
    ///
    /// Returns the agent whose reservation the caller must release, if the
    /// task was already assigned.
    pub fn cancel(&mut self, task_id: Uuid) -> FleetResult<Option<Uuid>> {
        let (state, agent) = {
            let task = self.lookup(task_id)?;
            (task.state, task.assigned_agent_id)
        };
        match state {
            TaskState::Queued | TaskState::Retrying | TaskState::Assigned => {
                self.apply(task_id, TaskState::Cancelled, Some("cancelled".into()), |_| {})?;
                self.archive_if_finished(task_id);
                Ok(agent)
            }
            TaskState::Running => Err(FleetError::TaskAlreadyRunning(task_id)),
            from => Err(FleetError::InvalidTransition {
                task_id,
                from,
                to: TaskState::Cancelled,
            }),
        }
    }

    /// Flag a running task so its next failure report finalizes it as
    /// cancelled instead of retrying.
    pub fn request_cancel(&mut self, task_id: Uuid) -> FleetResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(FleetError::UnknownTask(task_id))?;
        if task.state != TaskState::Running {
            return Err(FleetError::InvalidTransition {
                task_id,
                from: task.state,
                to: TaskState::Cancelled,
            });
        }
        task.cancel_requested = true;
        Ok(())
    }

    /// Return retrying tasks whose backoff has elapsed to the queue, behind
    /// everything already queued at their priority.
    pub fn promote_ready(&mut self, now: Instant) -> usize {
        let due: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Retrying && t.ready_at.map_or(true, |at| at <= now))
            .map(|t| t.id)
            .collect();

        let mut promoted = 0;
        for id in due {
            let seq = self.bump_seq();
            if self
                .apply(id, TaskState::Queued, None, |task| {
                    task.enqueue_seq = seq;
                    task.ready_at = None;
                })
                .is_ok()
            {
                promoted += 1;
            }
        }
        promoted
    }

    /// Validate and apply one lifecycle edge.
    ///
    /// `mutate` runs only after the edge is accepted, so a rejected
    /// transition leaves the task untouched. Leaving `assigned`/`running`
    /// clears the agent binding.
    pub(crate) fn apply<F>(
        &mut self,
        task_id: Uuid,
        to: TaskState,
        detail: Option<String>,
        mutate: F,
    ) -> FleetResult<TransitionRecord>
    where
        F: FnOnce(&mut Task),
    {
        let task = match self.tasks.get_mut(&task_id) {
            Some(task) => task,
            None => {
                return Err(match self.archive.get(&task_id) {
                    Some(done) => FleetError::InvalidTransition {
                        task_id,
                        from: done.state,
                        to,
                    },
                    None => FleetError::UnknownTask(task_id),
                })
            }
        };

        let from = task.state;
        let exhausted = from == TaskState::Failed && task.attempt >= task.max_attempts;
        if !from.can_transition_to(to) || exhausted {
            return Err(FleetError::InvalidTransition { task_id, from, to });
        }

        mutate(task);
        let now = Utc::now();
        task.state = to;
        task.last_transition_at = now;
        let record = TransitionRecord {
            task_id,
            from: Some(from),
            to,
            attempt: task.attempt,
            agent_id: task.assigned_agent_id,
            at: now,
            detail,
        };
        if !to.holds_agent() {
            task.assigned_agent_id = None;
        }
        self.journal.push(record.clone());
        Ok(record)
    }

    /// Move a finished task into the archive, evicting the oldest entry when
    /// the archive is full. Unfinished tasks are left alone.
    pub(crate) fn archive_if_finished(&mut self, task_id: Uuid) {
        if !self.tasks.get(&task_id).is_some_and(Task::is_finished) {
            return;
        }
        let Some(task) = self.tasks.remove(&task_id) else {
            return;
        };
        self.archive.insert(task_id, task);
        self.archive_order.push_back(task_id);
        while self.archive_order.len() > self.archive_capacity {
            if let Some(evicted) = self.archive_order.pop_front() {
                self.archive.remove(&evicted);
            }
        }
    }

    /// Hand the journaled transitions to the caller.
    pub fn drain_transitions(&mut self) -> Vec<TransitionRecord> {
        std::mem::take(&mut self.journal)
    }

    /// Look up a live or archived task.
    pub fn get(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks
            .get(&task_id)
            .or_else(|| self.archive.get(&task_id))
    }

    fn lookup(&self, task_id: Uuid) -> FleetResult<&Task> {
        self.get(task_id).ok_or(FleetError::UnknownTask(task_id))
    }

    /// Live tasks (not yet archived), oldest first.
    pub fn live_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.enqueue_seq);
        tasks
    }

    /// Archived tasks, oldest first.
    pub fn archived_tasks(&self) -> Vec<&Task> {
        self.archive_order
            .iter()
            .filter_map(|id| self.archive.get(id))
            .collect()
    }

    /// Tasks waiting for an agent, including those backing off.
    pub fn depth(&self) -> usize {
        self.tasks.values().filter(|t| t.state.is_pending()).count()
    }

    /// Pending tasks for one capability.
    pub fn depth_for(&self, capability: &Capability) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state.is_pending() && t.capability_required == *capability)
            .count()
    }

    /// Tasks not yet archived.
    pub fn live_count(&self) -> usize {
        self.tasks.len()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
