use lynx_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff applied between failed attempts of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows the `failures`-th failed attempt.
    ///
    /// `base * 2^(failures - 1)`, capped at `backoff_max_ms`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Tunables for the fleet core. Every field has a default so a partial
/// `[fleet]` table is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// How often the distribution loop wakes up when nothing notifies it.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Ceiling on the summed load of every agent.
    #[serde(default = "default_global_cap")]
    pub global_concurrency_cap: u32,
    /// Attempt bound for tasks submitted without one.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Per-attempt execution budget for tasks that carry none.
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,
    /// Agents silent for longer than this are taken offline.
    #[serde(default)]
    pub heartbeat_timeout_ms: Option<u64>,
    /// Transitions retained for history queries.
    #[serde(default = "default_log_capacity")]
    pub transition_log_capacity: usize,
    /// Finished tasks kept for status queries.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
    /// Broadcast channel depth; slow subscribers lag past it.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Trailing window, in seconds, for the throughput figure.
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
    /// Weight of the newest outcome in the success-rate EMA.
    #[serde(default = "default_smoothing")]
    pub success_rate_smoothing: f64,
    /// Backoff between failed attempts.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            global_concurrency_cap: default_global_cap(),
            default_max_attempts: default_max_attempts(),
            default_deadline_ms: None,
            heartbeat_timeout_ms: None,
            transition_log_capacity: default_log_capacity(),
            archive_capacity: default_archive_capacity(),
            event_buffer: default_event_buffer(),
            throughput_window_secs: default_throughput_window_secs(),
            success_rate_smoothing: default_smoothing(),
            retry: RetryPolicy::default(),
        }
    }
}

impl FleetConfig {
    /// Parse a `FleetConfig` from a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> FleetResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| FleetError::Config(format!("invalid fleet config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> FleetResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(FleetError::Config("tick_interval_ms must be positive".into()));
        }
        if self.global_concurrency_cap == 0 {
            return Err(FleetError::Config(
                "global_concurrency_cap must be at least 1".into(),
            ));
        }
        if self.default_max_attempts == 0 {
            return Err(FleetError::Config(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.event_buffer == 0 || self.transition_log_capacity == 0 {
            return Err(FleetError::Config(
                "event_buffer and transition_log_capacity must be positive".into(),
            ));
        }
        if self.throughput_window_secs == 0 {
            return Err(FleetError::Config(
                "throughput_window_secs must be positive".into(),
            ));
        }
        if !(self.success_rate_smoothing > 0.0 && self.success_rate_smoothing <= 1.0) {
            return Err(FleetError::Config(format!(
                "success_rate_smoothing must be in (0, 1], got {}",
                self.success_rate_smoothing
            )));
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(FleetError::Config(
                "retry.backoff_max_ms must not be below retry.backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Period of the distribution loop.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `None` disables the stale-agent sweep.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }

    /// Trailing window for the throughput figure.
    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }
}

fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_tick_interval_ms() -> u64 {
    250
}
fn default_global_cap() -> u32 {
    64
}
fn default_max_attempts() -> u32 {
    3
}
fn default_log_capacity() -> usize {
    10_000
}
fn default_archive_capacity() -> usize {
    1_000
}
fn default_event_buffer() -> usize {
    1_024
}
fn default_throughput_window_secs() -> u64 {
    60
}
fn default_smoothing() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = FleetConfig::from_toml_str(
            r#"
            global_concurrency_cap = 8

            [retry]
            backoff_base_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.global_concurrency_cap, 8);
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.retry.backoff_base_ms, 50);
        assert_eq!(config.retry.backoff_max_ms, 30_000);
        assert!(config.heartbeat_timeout().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let config = FleetConfig {
            global_concurrency_cap: 0,
            ..FleetConfig::default()
        };
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_smoothing() {
        let result = FleetConfig::from_toml_str("success_rate_smoothing = 1.5");
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let result = FleetConfig::from_toml_str("tick_interval_ms = \"fast\"");
        assert!(matches!(result, Err(FleetError::Config(_))));
    }
}
