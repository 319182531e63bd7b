use crate::core::errors::{FanoutError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for a coordination session.
///
/// Every interval and limit the engine consults lives here; components
/// receive a clone at construction and never read configuration through
/// a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum number of concurrently running workers
    pub max_concurrency: usize,
    /// Base timeout for one worker attempt (scaled by task complexity)
    pub worker_timeout: Duration,
    /// Base budget units before multipliers are applied
    pub base_units: u64,
    /// One-time budget extension, as a fraction of the original allocation
    pub budget_extension_ratio: f64,
    /// Interval between background registry consolidation runs
    pub consolidation_interval: Duration,
    /// Retention window before fully-merged session registries are archived
    pub registry_retention: Duration,
    /// Interval between automatic checkpoints during active work
    pub checkpoint_interval: Duration,
    /// A running worker with no progress marker update for this long is stuck
    pub stuck_threshold: Duration,
    /// Interval between health monitor polls
    pub health_poll_interval: Duration,
    /// Retries per worker group after the first failed attempt
    pub max_worker_retries: u32,
    /// Capacity of the session event channel
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            worker_timeout: Duration::from_secs(300), // 5 minutes
            base_units: 10_000,
            budget_extension_ratio: 0.2,
            consolidation_interval: Duration::from_secs(300),
            registry_retention: Duration::from_secs(24 * 3600), // 24 hours
            checkpoint_interval: Duration::from_secs(600),
            stuck_threshold: Duration::from_secs(900), // 15 minutes
            health_poll_interval: Duration::from_secs(30),
            max_worker_retries: 1,
            event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(FanoutError::configuration(
                "max_concurrency must be greater than 0",
            ));
        }
        if self.base_units == 0 {
            return Err(FanoutError::configuration(
                "base_units must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.budget_extension_ratio) {
            return Err(FanoutError::configuration(
                "budget_extension_ratio must be between 0.0 and 1.0",
            ));
        }
        if self.worker_timeout.is_zero() {
            return Err(FanoutError::configuration(
                "worker_timeout must be greater than 0",
            ));
        }
        if self.consolidation_interval.is_zero() {
            return Err(FanoutError::configuration(
                "consolidation_interval must be greater than 0",
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(FanoutError::configuration(
                "checkpoint_interval must be greater than 0",
            ));
        }
        if self.health_poll_interval.is_zero() {
            return Err(FanoutError::configuration(
                "health_poll_interval must be greater than 0",
            ));
        }
        if self.stuck_threshold < self.health_poll_interval {
            return Err(FanoutError::configuration(
                "stuck_threshold must be at least the health_poll_interval",
            ));
        }
        if self.event_capacity == 0 {
            return Err(FanoutError::configuration(
                "event_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Create conservative limits for testing
    pub fn conservative() -> Self {
        Self {
            max_concurrency: 2,
            worker_timeout: Duration::from_secs(5),
            base_units: 1_000,
            budget_extension_ratio: 0.2,
            consolidation_interval: Duration::from_millis(200),
            registry_retention: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(1),
            stuck_threshold: Duration::from_millis(500),
            health_poll_interval: Duration::from_millis(50),
            max_worker_retries: 1,
            event_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
        assert!(CoordinatorConfig::conservative().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = CoordinatorConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FanoutError::Configuration { .. })
        ));
    }

    #[test]
    fn test_extension_ratio_bounds() {
        let config = CoordinatorConfig {
            budget_extension_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stuck_threshold_must_cover_poll_interval() {
        let config = CoordinatorConfig {
            stuck_threshold: Duration::from_millis(10),
            health_poll_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
