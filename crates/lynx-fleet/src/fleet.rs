use crate::config::FleetConfig;
use crate::engine::{Assignment, DistributionEngine};
use crate::executor::{ExecutionContext, TaskExecutor};
use crate::lifecycle::LifecycleTracker;
use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::telemetry::{self, CapabilityHealth, FleetSnapshot, StateCounts, TelemetryAggregator};
use crate::types::{
    Agent, AgentRequest, CancelOutcome, FleetEvent, Task, TaskRequest, TransitionRecord,
};
use chrono::Utc;
use lynx_core::{AgentStatus, Capability, FleetError, FleetResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the fleet mutates, guarded by one lock.
struct FleetState {
    registry: AgentRegistry,
    queue: TaskQueue,
    tracker: LifecycleTracker,
    telemetry: TelemetryAggregator,
    paused: bool,
}

impl FleetState {
    /// Move journaled transitions into the log and telemetry, returning the
    /// events to publish once the lock is released.
    fn flush(&mut self, now: Instant) -> Vec<FleetEvent> {
        let records = self.queue.drain_transitions();
        if records.is_empty() {
            return Vec::new();
        }
        self.tracker.commit(&records, &mut self.telemetry, now);
        records.into_iter().map(FleetEvent::Transition).collect()
    }
}

struct FleetInner {
    state: Mutex<FleetState>,
    config: FleetConfig,
    engine: DistributionEngine,
    executor: Arc<dyn TaskExecutor>,
    events: broadcast::Sender<FleetEvent>,
    wake: Notify,
    shutdown: CancellationToken,
    /// Cancellation handles of attempts currently executing.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// The fleet facade: registry, queue, lifecycle and telemetry behind one
/// lock, a distribution loop, and the executor that runs attempts.
///
/// Cheap to clone; all clones share the same fleet.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl Fleet {
    /// Build a fleet. Nothing is distributed until [`start`](Self::start)
    /// is called or [`tick`](Self::tick) is driven by hand.
    pub fn new(config: FleetConfig, executor: Arc<dyn TaskExecutor>) -> FleetResult<Self> {
        config.validate()?;
        let state = FleetState {
            registry: AgentRegistry::with_smoothing(config.success_rate_smoothing),
            queue: TaskQueue::with_archive_capacity(config.archive_capacity),
            tracker: LifecycleTracker::new(config.retry.clone(), config.transition_log_capacity),
            telemetry: TelemetryAggregator::new(config.throughput_window()),
            paused: false,
        };
        let (events, _) = broadcast::channel(config.event_buffer);
        Ok(Self {
            inner: Arc::new(FleetInner {
                state: Mutex::new(state),
                engine: DistributionEngine::new(config.global_concurrency_cap),
                executor,
                events,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                running: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    /// The validated configuration the fleet was built with.
    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    /// Spawn the distribution loop. It runs a cycle on every tick and
    /// whenever something frees capacity or adds work, until
    /// [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let fleet = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(fleet.inner.config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                tick_ms = fleet.inner.config.tick_interval_ms,
                global_cap = fleet.inner.engine.global_cap(),
                "Distribution loop started"
            );
            loop {
                tokio::select! {
                    _ = fleet.inner.shutdown.cancelled() => break,
                    _ = fleet.inner.wake.notified() => {}
                    _ = ticker.tick() => {
                        fleet.sweep_stale_agents();
                    }
                }
                fleet.tick();
            }
            info!("Distribution loop stopped");
        })
    }

    /// Stop the distribution loop and signal every executing attempt.
    pub fn shutdown(&self) {
        info!("Fleet shutting down");
        self.inner.shutdown.cancel();
        for token in self.inner.running.lock().values() {
            token.cancel();
        }
    }

    /// Whether shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run one distribution cycle and dispatch what it assigned.
    /// Returns the number of tasks dispatched.
    pub fn tick(&self) -> usize {
        if self.is_shut_down() {
            return 0;
        }
        let now = Instant::now();
        let (assignments, events) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let assignments = if state.paused {
                state.queue.promote_ready(now);
                Vec::new()
            } else {
                let report =
                    self.inner
                        .engine
                        .run_cycle(&mut state.queue, &mut state.registry, now);
                if report.errors > 0 {
                    warn!(errors = report.errors, "Distribution cycle skipped lanes");
                }
                report.assignments
            };
            (assignments, state.flush(now))
        };
        self.publish(events);

        let dispatched = assignments.len();
        for assignment in assignments {
            self.dispatch(assignment);
        }
        dispatched
    }

    fn dispatch(&self, assignment: Assignment) {
        let token = self.inner.shutdown.child_token();
        self.inner
            .running
            .lock()
            .insert(assignment.task_id, token.clone());
        let fleet = self.clone();
        tokio::spawn(async move {
            fleet.run_attempt(assignment, token).await;
        });
    }

    async fn run_attempt(&self, assignment: Assignment, token: CancellationToken) {
        let task_id = assignment.task_id;
        let now = Instant::now();
        let (started, events) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let started = state.tracker.mark_running(&mut state.queue, task_id);
            (started, state.flush(now))
        };
        self.publish(events);
        if let Err(e) = started {
            // cancelled between assignment and start
            debug!(task_id = %task_id, error = %e, "Attempt not started");
            self.inner.running.lock().remove(&task_id);
            return;
        }

        debug!(
            task_id = %task_id,
            agent_id = %assignment.agent_id,
            attempt = assignment.attempt,
            "Executing task"
        );
        let ctx = ExecutionContext {
            task_id,
            agent_id: assignment.agent_id,
            capability: assignment.capability,
            payload: assignment.payload,
            attempt: assignment.attempt,
            cancel: token.clone(),
        };
        let executor = Arc::clone(&self.inner.executor);
        let mut handle = tokio::spawn(async move { executor.execute(ctx).await });

        let outcome = match assignment.deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    handle.abort();
                    token.cancel();
                    Err(FleetError::Timeout {
                        task_id,
                        after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
            None => flatten(handle.await),
        };

        self.inner.running.lock().remove(&task_id);
        self.finish(task_id, outcome);
        self.inner.wake.notify_one();
    }

    fn finish(&self, task_id: Uuid, outcome: FleetResult<serde_json::Value>) {
        let now = Instant::now();
        let events = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let applied = match outcome {
                Ok(value) => state.tracker.mark_completed(
                    &mut state.queue,
                    &mut state.registry,
                    task_id,
                    value,
                ),
                Err(e) => state
                    .tracker
                    .mark_failed(&mut state.queue, &mut state.registry, task_id, &e, now)
                    .map(|_| ()),
            };
            if let Err(e) = applied {
                warn!(task_id = %task_id, error = %e, "Discarding attempt report");
            }
            state.flush(now)
        };
        self.publish(events);
    }

    // --- agents ---

    /// Add an agent to the registry and announce it.
    pub fn register_agent(&self, request: AgentRequest) -> FleetResult<Uuid> {
        let agent = request.into_agent();
        let capabilities: Vec<Capability> = agent.capabilities.iter().cloned().collect();
        let agent_id = self.inner.state.lock().registry.register(agent)?;
        self.publish([FleetEvent::AgentRegistered {
            agent_id,
            capabilities,
        }]);
        self.inner.wake.notify_one();
        Ok(agent_id)
    }

    /// Remove an idle agent.
    pub fn deregister_agent(&self, agent_id: Uuid) -> FleetResult<Agent> {
        let agent = self.inner.state.lock().registry.deregister(agent_id)?;
        self.publish([FleetEvent::AgentDeregistered { agent_id }]);
        Ok(agent)
    }

    /// Record a heartbeat. An agent the sweep took offline comes back online.
    pub fn heartbeat(&self, agent_id: Uuid) -> FleetResult<()> {
        let changed = self
            .inner
            .state
            .lock()
            .registry
            .heartbeat(agent_id, Utc::now())?;
        if changed {
            self.status_changed(agent_id);
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Stop scheduling onto the agent; its in-flight work finishes normally.
    pub fn set_agent_offline(&self, agent_id: Uuid) -> FleetResult<()> {
        if self.inner.state.lock().registry.set_offline(agent_id)? {
            self.status_changed(agent_id);
        }
        Ok(())
    }

    /// Return an offline agent to service.
    pub fn set_agent_online(&self, agent_id: Uuid) -> FleetResult<()> {
        if self.inner.state.lock().registry.set_online(agent_id)? {
            self.status_changed(agent_id);
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Take agents with stale heartbeats offline. A no-op unless
    /// `heartbeat_timeout_ms` is configured.
    pub fn sweep_stale_agents(&self) -> Vec<Uuid> {
        let Some(timeout) = self.inner.config.heartbeat_timeout() else {
            return Vec::new();
        };
        let swept = self
            .inner
            .state
            .lock()
            .registry
            .sweep_stale(Utc::now(), timeout);
        self.publish(swept.iter().map(|&agent_id| FleetEvent::AgentStatusChanged {
            agent_id,
            status: AgentStatus::Offline,
        }));
        swept
    }

    /// All registered agents.
    pub fn agents(&self) -> Vec<Agent> {
        self.inner
            .state
            .lock()
            .registry
            .agents()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Look up one agent.
    pub fn get_agent(&self, agent_id: Uuid) -> Option<Agent> {
        self.inner.state.lock().registry.get(agent_id).cloned()
    }

    fn status_changed(&self, agent_id: Uuid) {
        if let Some(agent) = self.get_agent(agent_id) {
            self.publish([FleetEvent::AgentStatusChanged {
                agent_id,
                status: agent.status,
            }]);
        }
    }

    // --- tasks ---

    /// Queue a task. Unset limits fall back to the configured defaults.
    ///
    /// A capability no agent advertises is accepted and waits; it is only
    /// logged, since agents may register later.
    pub fn submit_task(&self, request: TaskRequest) -> FleetResult<Uuid> {
        if request.capability.is_empty() {
            return Err(FleetError::InvalidCapability(request.capability));
        }
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.inner.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(FleetError::Config("max_attempts must be at least 1".into()));
        }

        let mut task = Task::new(request.capability, request.payload)
            .with_priority(request.priority.unwrap_or(0))
            .with_max_attempts(max_attempts);
        task.deadline_ms = request.deadline_ms.or(self.inner.config.default_deadline_ms);

        let now = Instant::now();
        let (task_id, events) = {
            let mut state = self.inner.state.lock();
            if !state.registry.has_capability(&task.capability_required) {
                let unserved = FleetError::InvalidCapability(task.capability_required.clone());
                warn!(error = %unserved, "Task accepted without a matching agent");
            }
            let task_id = state.queue.submit(task);
            (task_id, state.flush(now))
        };
        self.publish(events);
        self.inner.wake.notify_one();
        Ok(task_id)
    }

    /// A live or archived task.
    pub fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.state.lock().queue.get(task_id).cloned()
    }

    /// Live tasks followed by retained finished ones.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock();
        state
            .queue
            .live_tasks()
            .into_iter()
            .chain(state.queue.archived_tasks())
            .cloned()
            .collect()
    }

    /// Cancel a task. Pending and assigned tasks are withdrawn at once; a
    /// running task has its executor signalled and is finalized as cancelled
    /// when the attempt reports back.
    pub fn cancel_task(&self, task_id: Uuid) -> FleetResult<CancelOutcome> {
        let now = Instant::now();
        let (outcome, events) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.queue.cancel(task_id) {
                Ok(agent) => {
                    if let Some(agent_id) = agent {
                        if let Err(e) = state.registry.release(agent_id) {
                            warn!(agent_id = %agent_id, error = %e, "Failed to release agent");
                        }
                    }
                    (CancelOutcome::Cancelled, state.flush(now))
                }
                Err(FleetError::TaskAlreadyRunning(_)) => {
                    state.queue.request_cancel(task_id)?;
                    (CancelOutcome::Requested, Vec::new())
                }
                Err(e) => return Err(e),
            }
        };
        self.publish(events);

        match outcome {
            CancelOutcome::Cancelled => {
                info!(task_id = %task_id, "Task cancelled");
                self.inner.wake.notify_one();
            }
            CancelOutcome::Requested => {
                info!(task_id = %task_id, "Cancellation requested for running task");
                if let Some(token) = self.inner.running.lock().get(&task_id) {
                    token.cancel();
                }
            }
        }
        Ok(outcome)
    }

    /// Retained transitions of one task, oldest first.
    pub fn task_history(&self, task_id: Uuid) -> Vec<TransitionRecord> {
        self.inner.state.lock().tracker.log().history(task_id)
    }

    /// The `n` most recent transitions across all tasks.
    pub fn recent_transitions(&self, n: usize) -> Vec<TransitionRecord> {
        self.inner.state.lock().tracker.log().recent(n)
    }

    // --- telemetry ---

    /// Point-in-time telemetry.
    pub fn snapshot(&self) -> FleetSnapshot {
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.telemetry.snapshot(
            &state.registry,
            self.inner.engine.global_cap(),
            state.paused,
            now,
        )
    }

    /// Counters maintained from the transition stream.
    pub fn counts(&self) -> StateCounts {
        self.inner.state.lock().telemetry.counts()
    }

    /// Counters rebuilt by scanning every retained task.
    pub fn recount(&self) -> StateCounts {
        telemetry::recount(&self.inner.state.lock().queue)
    }

    /// Health of the given capabilities, or of every known capability when
    /// `capabilities` is empty.
    pub fn capability_health(&self, capabilities: &[Capability]) -> Vec<CapabilityHealth> {
        let state = self.inner.state.lock();
        let mut report = telemetry::capability_health(&state.registry, &state.queue);
        if !capabilities.is_empty() {
            report.retain(|h| capabilities.contains(&h.capability));
            for capability in capabilities {
                if !report.iter().any(|h| h.capability == *capability) {
                    report.push(CapabilityHealth {
                        capability: capability.clone(),
                        agents: 0,
                        eligible_agents: 0,
                        queued: 0,
                        healthy: true,
                    });
                }
            }
        }
        report
    }

    // --- control ---

    /// Stop assigning new work. Executing attempts run to completion.
    pub fn pause(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.paused, true)
        };
        if changed {
            info!("Fleet paused");
            self.publish([FleetEvent::Paused]);
        }
    }

    /// Restart assignment after a pause.
    pub fn resume(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.paused, false)
        };
        if changed {
            info!("Fleet resumed");
            self.publish([FleetEvent::Resumed]);
            self.inner.wake.notify_one();
        }
    }

    /// Whether assignment is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, events: impl IntoIterator<Item = FleetEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.inner.events.send(event);
        }
    }
}

fn flatten(
    joined: Result<FleetResult<serde_json::Value>, JoinError>,
) -> FleetResult<serde_json::Value> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(FleetError::Execution("executor panicked".into())),
        Err(_) => Err(FleetError::Execution("executor aborted".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use futures_util::FutureExt;
    use lynx_core::TaskState;
    use serde_json::json;

    fn echo_fleet(config: FleetConfig) -> Fleet {
        let executor = FnExecutor::new(|ctx| async move { Ok(ctx.payload) }.boxed());
        Fleet::new(config, Arc::new(executor)).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = FleetConfig {
            tick_interval_ms: 0,
            ..FleetConfig::default()
        };
        let executor = FnExecutor::new(|_| async { Ok(json!(null)) }.boxed());
        assert!(matches!(
            Fleet::new(config, Arc::new(executor)),
            Err(FleetError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_applies_defaults() {
        let fleet = echo_fleet(FleetConfig {
            default_max_attempts: 5,
            default_deadline_ms: Some(1_000),
            ..FleetConfig::default()
        });
        let id = fleet
            .submit_task(TaskRequest::new("testing", json!(null)))
            .unwrap();
        let task = fleet.get_task(id).unwrap();
        assert_eq!(task.max_attempts, 5);
        assert_eq!(task.deadline_ms, Some(1_000));
        assert_eq!(task.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_capability() {
        let fleet = echo_fleet(FleetConfig::default());
        let result = fleet.submit_task(TaskRequest::new("  ", json!(null)));
        assert!(matches!(result, Err(FleetError::InvalidCapability(_))));
        let result = fleet.submit_task(TaskRequest::new("x", json!(null)).with_max_attempts(0));
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[tokio::test]
    async fn test_paused_tick_assigns_nothing() {
        let fleet = echo_fleet(FleetConfig::default());
        fleet
            .register_agent(AgentRequest::new(["testing"], 2))
            .unwrap();
        fleet
            .submit_task(TaskRequest::new("testing", json!(1)))
            .unwrap();
        fleet.pause();
        assert!(fleet.is_paused());
        assert_eq!(fleet.tick(), 0);
        assert_eq!(fleet.snapshot().queue_depth, 1);
        fleet.resume();
        assert_eq!(fleet.tick(), 1);
    }

    #[tokio::test]
    async fn test_cancel_assigned_releases_agent() {
        let fleet = echo_fleet(FleetConfig::default());
        let agent = fleet
            .register_agent(AgentRequest::new(["testing"], 1))
            .unwrap();
        let task = fleet
            .submit_task(TaskRequest::new("testing", json!(null)))
            .unwrap();
        {
            let mut guard = fleet.inner.state.lock();
            let state = &mut *guard;
            let report = fleet
                .inner
                .engine
                .run_cycle(&mut state.queue, &mut state.registry, Instant::now());
            assert_eq!(report.assignments.len(), 1);
        }
        assert_eq!(fleet.cancel_task(task).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(fleet.get_agent(agent).unwrap().current_load, 0);
        assert_eq!(fleet.get_task(task).unwrap().state, TaskState::Cancelled);
        assert!(fleet.cancel_task(task).is_err());
    }

    #[tokio::test]
    async fn test_events_published() {
        let fleet = echo_fleet(FleetConfig::default());
        let mut rx = fleet.subscribe();
        let agent_id = fleet
            .register_agent(AgentRequest::new(["testing"], 1))
            .unwrap();
        fleet
            .submit_task(TaskRequest::new("testing", json!(null)))
            .unwrap();

        match rx.recv().await.unwrap() {
            FleetEvent::AgentRegistered { agent_id: got, .. } => assert_eq!(got, agent_id),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            FleetEvent::Transition(record) => assert_eq!(record.to, TaskState::Queued),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capability_health_filter() {
        let fleet = echo_fleet(FleetConfig::default());
        fleet
            .register_agent(AgentRequest::new(["testing", "docs"], 1))
            .unwrap();
        let report = fleet.capability_health(&[Capability::new("docs"), Capability::new("gpu")]);
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|h| h.healthy));
        assert!(report.iter().any(|h| h.capability.as_str() == "gpu" && h.agents == 0));
    }
}
