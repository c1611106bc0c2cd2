//! Configuration for the agent.

use std::time::Duration;

use anyhow::Result;
use fog_reconcile::RetryPolicy;
use uuid::Uuid;

use crate::reconciler::ReconcilerConfig;

/// Agent configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this agent instance.
    pub agent_id: Uuid,

    /// Reconciler idle poll interval in milliseconds.
    pub idle_interval_ms: u64,

    /// Usage sampling interval in seconds.
    pub stats_interval_secs: u64,

    /// Status reporting interval in seconds.
    pub report_interval_secs: u64,

    /// Graceful stop window in seconds before a container is killed.
    pub stop_timeout_secs: u64,

    /// Transient failures tolerated per task before giving up.
    pub max_task_attempts: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            idle_interval_ms: 1000,
            stats_interval_secs: 5,
            report_interval_secs: 10,
            stop_timeout_secs: 10,
            max_task_attempts: 3,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        // Agent ID can be provided or auto-generated
        let agent_id = std::env::var("FOG_AGENT_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.agent_id);

        let idle_interval_ms = std::env::var("FOG_IDLE_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.idle_interval_ms);

        let stats_interval_secs = std::env::var("FOG_STATS_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.stats_interval_secs);

        let report_interval_secs = std::env::var("FOG_REPORT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.report_interval_secs);

        let stop_timeout_secs = std::env::var("FOG_STOP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.stop_timeout_secs);

        let max_task_attempts = std::env::var("FOG_MAX_TASK_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_task_attempts);

        let log_level = std::env::var("FOG_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            agent_id,
            idle_interval_ms,
            stats_interval_secs,
            report_interval_secs,
            stop_timeout_secs,
            max_task_attempts,
            log_level,
        })
    }

    /// Reconciler settings implied by this configuration.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            retry: RetryPolicy::with_max_attempts(self.max_task_attempts),
        }
    }
}
