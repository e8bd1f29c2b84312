use crate::config::RetryPolicy;
use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::telemetry::TelemetryAggregator;
use crate::types::TransitionRecord;
use lynx_core::{FleetError, FleetResult, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// The task backs off and returns to the queue after `delay`.
    Retrying {
        /// Failed attempts so far.
        attempt: u32,
        /// Backoff before the task is queued again.
        delay: Duration,
    },
    /// No attempts remain; the task is `failed` for good.
    Exhausted {
        /// Attempts consumed.
        attempts: u32,
    },
    /// A cancel request was pending; the task is `cancelled`.
    Cancelled,
}

/// Bounded, append-only record of accepted transitions.
pub struct TransitionLog {
    records: VecDeque<TransitionRecord>,
    capacity: usize,
}

impl TransitionLog {
    /// Retains at most `capacity` records, dropping the oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
        }
    }

    /// Append a record, evicting the oldest past capacity.
    pub fn push(&mut self, record: TransitionRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Every retained transition of one task, oldest first.
    pub fn history(&self, task_id: Uuid) -> Vec<TransitionRecord> {
        self.records
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    /// The `n` most recent transitions, oldest first.
    pub fn recent(&self, n: usize) -> Vec<TransitionRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Records retained.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Drives tasks through `assigned -> running -> {completed, failed}` and
/// owns the retry policy and the transition log.
///
/// Every `mark_*` either applies its whole effect or returns an error with
/// nothing changed.
pub struct LifecycleTracker {
    policy: RetryPolicy,
    log: TransitionLog,
}

impl LifecycleTracker {
    /// A tracker retaining up to `log_capacity` transitions.
    pub fn new(policy: RetryPolicy, log_capacity: usize) -> Self {
        Self {
            policy,
            log: TransitionLog::new(log_capacity),
        }
    }

    /// The retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The retained transition log.
    pub fn log(&self) -> &TransitionLog {
        &self.log
    }

    /// `assigned -> running`.
    pub fn mark_running(&mut self, queue: &mut TaskQueue, task_id: Uuid) -> FleetResult<()> {
        queue.apply(task_id, TaskState::Running, None, |_| {})?;
        Ok(())
    }

    /// `running -> completed`; frees the agent and credits its success rate.
    pub fn mark_completed(
        &mut self,
        queue: &mut TaskQueue,
        registry: &mut AgentRegistry,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> FleetResult<()> {
        let agent = queue
            .get(task_id)
            .ok_or(FleetError::UnknownTask(task_id))?
            .assigned_agent_id;

        let record = queue.apply(task_id, TaskState::Completed, None, |task| {
            task.result = Some(result);
            task.error = None;
        })?;
        settle_agent(registry, agent, Some(true));
        queue.archive_if_finished(task_id);

        info!(
            task_id = %task_id,
            agent_id = ?agent,
            attempt = record.attempt,
            "Task completed"
        );
        Ok(())
    }

    /// `running -> failed`, then either `retrying` with exponential backoff
    /// or terminal `failed` once attempts are exhausted. A pending cancel
    /// request turns the failure into `cancelled`.
    pub fn mark_failed(
        &mut self,
        queue: &mut TaskQueue,
        registry: &mut AgentRegistry,
        task_id: Uuid,
        error: &FleetError,
        now: Instant,
    ) -> FleetResult<FailureOutcome> {
        let (state, agent, cancel_requested) = {
            let task = queue.get(task_id).ok_or(FleetError::UnknownTask(task_id))?;
            (task.state, task.assigned_agent_id, task.cancel_requested)
        };
        if state != TaskState::Running {
            return Err(FleetError::InvalidTransition {
                task_id,
                from: state,
                to: if cancel_requested {
                    TaskState::Cancelled
                } else {
                    TaskState::Failed
                },
            });
        }

        let message = error.to_string();

        if cancel_requested {
            let detail = message.clone();
            queue.apply(task_id, TaskState::Cancelled, Some(detail), |task| {
                task.error = Some(message);
            })?;
            settle_agent(registry, agent, None);
            queue.archive_if_finished(task_id);
            info!(task_id = %task_id, "Running task cancelled on executor report");
            return Ok(FailureOutcome::Cancelled);
        }

        let detail = message.clone();
        let record = queue.apply(task_id, TaskState::Failed, Some(detail), |task| {
            task.attempt += 1;
            task.error = Some(message);
            task.result = None;
        })?;
        settle_agent(registry, agent, Some(false));

        let (attempt, max_attempts) = queue
            .get(task_id)
            .map(|t| (t.attempt, t.max_attempts))
            .unwrap_or((record.attempt, record.attempt));

        if attempt < max_attempts {
            let delay = self.policy.delay_for(attempt);
            queue.apply(
                task_id,
                TaskState::Retrying,
                Some(format!("retry in {}ms", delay.as_millis())),
                |task| task.ready_at = Some(now + delay),
            )?;
            warn!(
                task_id = %task_id,
                agent_id = ?agent,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Task attempt failed, retrying"
            );
            Ok(FailureOutcome::Retrying { attempt, delay })
        } else {
            queue.archive_if_finished(task_id);
            let exhausted = FleetError::RetriesExhausted {
                task_id,
                attempts: attempt,
            };
            warn!(
                task_id = %task_id,
                agent_id = ?agent,
                last_error = %error,
                "{exhausted}"
            );
            Ok(FailureOutcome::Exhausted { attempts: attempt })
        }
    }

    /// Append journaled transitions to the log and forward each to telemetry.
    pub fn commit(
        &mut self,
        records: &[TransitionRecord],
        telemetry: &mut TelemetryAggregator,
        now: Instant,
    ) {
        for record in records {
            telemetry.on_transition(record, now);
            self.log.push(record.clone());
        }
    }
}

/// Release the agent's slot and, when the attempt ran to an outcome, fold it
/// into the agent's success rate.
fn settle_agent(registry: &mut AgentRegistry, agent: Option<Uuid>, success: Option<bool>) {
    let Some(agent_id) = agent else {
        return;
    };
    if let Err(e) = registry.release(agent_id) {
        warn!(agent_id = %agent_id, error = %e, "Failed to release agent");
    }
    if let Some(success) = success {
        if let Err(e) = registry.record_outcome(agent_id, success) {
            warn!(agent_id = %agent_id, error = %e, "Failed to record agent outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Agent, Task};
    use serde_json::json;

    struct Harness {
        queue: TaskQueue,
        registry: AgentRegistry,
        tracker: LifecycleTracker,
        agent: Uuid,
    }

    impl Harness {
        fn new() -> Self {
            let mut registry = AgentRegistry::new();
            let agent = registry.register(Agent::new(["testing"], 2)).unwrap();
            let policy = RetryPolicy {
                backoff_base_ms: 100,
                backoff_max_ms: 1_000,
            };
            Self {
                queue: TaskQueue::new(),
                registry,
                tracker: LifecycleTracker::new(policy, 100),
                agent,
            }
        }

        fn start(&mut self, task: Task) -> Uuid {
            let id = self.queue.submit(task);
            self.registry.reserve(self.agent).unwrap();
            assert!(self.queue.claim(id, self.agent));
            self.tracker.mark_running(&mut self.queue, id).unwrap();
            id
        }

        fn fail(&mut self, id: Uuid) -> FleetResult<FailureOutcome> {
            self.tracker.mark_failed(
                &mut self.queue,
                &mut self.registry,
                id,
                &FleetError::Execution("boom".into()),
                Instant::now(),
            )
        }
    }

    #[test]
    fn test_mark_running_requires_assigned() {
        let mut h = Harness::new();
        let id = h.queue.submit(Task::new("testing", json!(null)));
        assert!(matches!(
            h.tracker.mark_running(&mut h.queue, id),
            Err(FleetError::InvalidTransition {
                from: TaskState::Queued,
                to: TaskState::Running,
                ..
            })
        ));
    }

    #[test]
    fn test_completion_releases_agent_and_updates_rate() {
        let mut h = Harness::new();
        let id = h.start(Task::new("testing", json!(null)));
        assert_eq!(h.registry.get(h.agent).unwrap().current_load, 1);

        h.tracker
            .mark_completed(&mut h.queue, &mut h.registry, id, json!({"ok": true}))
            .unwrap();

        let task = h.queue.get(id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.assigned_agent_id.is_none());

        let agent = h.registry.get(h.agent).unwrap();
        assert_eq!(agent.current_load, 0);
        assert_eq!(agent.tasks_completed, 1);
        assert!((agent.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_schedules_backoff() {
        let mut h = Harness::new();
        let id = h.start(Task::new("testing", json!(null)).with_max_attempts(3));

        let outcome = h.fail(id).unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        let task = h.queue.get(id).unwrap();
        assert_eq!(task.state, TaskState::Retrying);
        assert_eq!(task.error.as_deref(), Some("execution error: boom"));
        assert!(task.assigned_agent_id.is_none());

        let agent = h.registry.get(h.agent).unwrap();
        assert_eq!(agent.current_load, 0);
        assert!((agent.success_rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_retry_bound() {
        let mut h = Harness::new();
        let id = h.start(Task::new("testing", json!(null)).with_max_attempts(3));

        for expected in 1..=2u32 {
            let outcome = h.fail(id).unwrap();
            assert!(matches!(outcome, FailureOutcome::Retrying { attempt, .. } if attempt == expected));
            h.queue.promote_ready(Instant::now() + Duration::from_secs(60));
            h.registry.reserve(h.agent).unwrap();
            assert!(h.queue.claim(id, h.agent));
            h.tracker.mark_running(&mut h.queue, id).unwrap();
        }

        assert_eq!(h.fail(id).unwrap(), FailureOutcome::Exhausted { attempts: 3 });
        let task = h.queue.get(id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.is_finished());

        let records = h.queue.drain_transitions();
        let failures = records
            .iter()
            .filter(|r| r.from == Some(TaskState::Running) && r.to == TaskState::Failed)
            .count();
        assert_eq!(failures, 3);
    }

    #[test]
    fn test_terminal_task_accepts_nothing() {
        let mut h = Harness::new();
        let id = h.start(Task::new("testing", json!(null)));
        h.tracker
            .mark_completed(&mut h.queue, &mut h.registry, id, json!(1))
            .unwrap();

        assert!(h.fail(id).is_err());
        assert!(h.tracker.mark_running(&mut h.queue, id).is_err());
        assert!(h
            .tracker
            .mark_completed(&mut h.queue, &mut h.registry, id, json!(2))
            .is_err());
        assert_eq!(h.queue.get(id).unwrap().result, Some(json!(1)));
        assert_eq!(h.registry.get(h.agent).unwrap().current_load, 0);
    }

    #[test]
    fn test_cancel_request_wins_over_retry() {
        let mut h = Harness::new();
        let id = h.start(Task::new("testing", json!(null)).with_max_attempts(5));
        h.queue.request_cancel(id).unwrap();

        assert_eq!(h.fail(id).unwrap(), FailureOutcome::Cancelled);
        assert_eq!(h.queue.get(id).unwrap().state, TaskState::Cancelled);
        let agent = h.registry.get(h.agent).unwrap();
        assert_eq!(agent.current_load, 0);
        assert_eq!(agent.tasks_failed, 0);
    }

    #[test]
    fn test_commit_fills_log() {
        let mut h = Harness::new();
        let mut telemetry = TelemetryAggregator::new(Duration::from_secs(60));
        let id = h.start(Task::new("testing", json!(null)));
        let records = h.queue.drain_transitions();
        h.tracker.commit(&records, &mut telemetry, Instant::now());

        let history = h.tracker.log().history(id);
        let states: Vec<TaskState> = history.iter().map(|r| r.to).collect();
        assert_eq!(
            states,
            vec![TaskState::Queued, TaskState::Assigned, TaskState::Running]
        );
        assert_eq!(h.tracker.log().recent(1)[0].to, TaskState::Running);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut log = TransitionLog::new(2);
        for _ in 0..5 {
            log.push(TransitionRecord {
                task_id: Uuid::new_v4(),
                from: None,
                to: TaskState::Queued,
                attempt: 0,
                agent_id: None,
                at: chrono::Utc::now(),
                detail: None,
            });
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.recent(10).len(), 2);
    }
}
