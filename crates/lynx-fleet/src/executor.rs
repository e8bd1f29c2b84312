use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lynx_core::{Capability, FleetError, FleetResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Task being executed.
    pub task_id: Uuid,
    /// Agent the attempt runs on.
    pub agent_id: Uuid,
    /// Capability the task required.
    pub capability: Capability,
    /// The task payload, untouched.
    pub payload: serde_json::Value,
    /// Failed attempts before this one.
    pub attempt: u32,
    /// Cancelled on deadline expiry, task cancellation or fleet shutdown.
    pub cancel: CancellationToken,
}

/// Runs one attempt of a task on behalf of an agent.
///
/// The fleet does not interpret the payload or the result. An `Err` is
/// treated as a failed attempt and fed to the retry policy; a panic is
/// reported the same way.
///
/// Implementations should watch `ctx.cancel` and return promptly once it
/// fires; the fleet aborts the attempt on deadline expiry regardless.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt.
    async fn execute(&self, ctx: ExecutionContext) -> FleetResult<serde_json::Value>;
}

type ExecFn = dyn Fn(ExecutionContext) -> BoxFuture<'static, FleetResult<serde_json::Value>>
    + Send
    + Sync;

/// Adapts a closure returning a boxed future into a [`TaskExecutor`].
pub struct FnExecutor {
    f: Box<ExecFn>,
}

impl FnExecutor {
    /// Wrap `f`; it is called once per attempt.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ExecutionContext) -> BoxFuture<'static, FleetResult<serde_json::Value>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> FleetResult<serde_json::Value> {
        (self.f)(ctx).await
    }
}

/// Stand-in executor for demos and load runs: sleeps for a fixed time and
/// fails every `fail_every`-th call.
pub struct SimulatedExecutor {
    work: Duration,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl SimulatedExecutor {
    /// Every call sleeps for `work` and succeeds.
    pub fn new(work: Duration) -> Self {
        Self {
            work,
            fail_every: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Fail every `n`-th call; `0` disables failures.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// Attempts started so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> FleetResult<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(FleetError::Execution("cancelled".into()));
            }
            _ = tokio::time::sleep(self.work) => {}
        }

        if self.fail_every.is_some_and(|n| call % n == 0) {
            return Err(FleetError::Execution(format!(
                "simulated failure on call {call}"
            )));
        }
        Ok(serde_json::json!({
            "agent_id": ctx.agent_id,
            "capability": ctx.capability,
            "attempt": ctx.attempt,
            "echo": ctx.payload,
        }))
    }
}
