//! Configuration for the flow engine
//!
//! Values come from defaults, an optional YAML document and `STEPWISE_*`
//! environment variables, in that order of precedence (lowest first).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// Upper bound for step timeouts, wait timeouts and retry delays (one year)
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Backoff policy applied between failed step attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry as soon as the failure is recorded
    Immediate,

    /// Retry after a constant delay
    Fixed {
        /// Delay between attempts
        delay_ms: u64,
    },

    /// Retry after an exponentially growing delay
    Exponential {
        /// Delay after the first failed attempt
        initial_delay_ms: u64,
        /// Growth factor per failed attempt
        multiplier: f64,
        /// Upper bound on the delay
        max_delay_ms: u64,
        /// Fraction of the delay used as random jitter (0 disables it)
        #[serde(default)]
        jitter_factor: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed { delay_ms } => {
                Duration::from_millis((*delay_ms).min(MAX_DURATION_MS))
            }
            RetryPolicy::Exponential {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
                jitter_factor,
            } => {
                let exponent = failed_attempt.saturating_sub(1) as f64;
                let base_delay_ms = (*initial_delay_ms as f64 * multiplier.powf(exponent))
                    .min(*max_delay_ms as f64)
                    .min(MAX_DURATION_MS as f64) as u64;

                let jitter_range = (base_delay_ms as f64 * jitter_factor) as u64;
                let jitter = if jitter_range > 0 {
                    // Spread between -jitter_range/2 and +jitter_range/2
                    let rand_value = (uuid::Uuid::new_v4().as_u128() % jitter_range as u128) as i64;
                    rand_value - (jitter_range as i64 / 2)
                } else {
                    0
                };

                Duration::from_millis((base_delay_ms as i64 + jitter).max(0) as u64)
            }
        }
    }

    /// Check the policy parameters
    pub fn validate(&self) -> Result<(), CoreError> {
        if let RetryPolicy::Fixed { delay_ms } = self {
            if *delay_ms > MAX_DURATION_MS {
                return Err(CoreError::ConfigurationError(format!(
                    "retry delay_ms must not exceed {}, got {}",
                    MAX_DURATION_MS, delay_ms
                )));
            }
        }
        if let RetryPolicy::Exponential {
            multiplier,
            jitter_factor,
            initial_delay_ms,
            max_delay_ms,
        } = self
        {
            if *max_delay_ms > MAX_DURATION_MS {
                return Err(CoreError::ConfigurationError(format!(
                    "retry max_delay_ms must not exceed {}, got {}",
                    MAX_DURATION_MS, max_delay_ms
                )));
            }
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(CoreError::ConfigurationError(format!(
                    "retry multiplier must be >= 1.0, got {}",
                    multiplier
                )));
            }
            if !(0.0..=1.0).contains(jitter_factor) {
                return Err(CoreError::ConfigurationError(format!(
                    "retry jitter_factor must be within [0, 1], got {}",
                    jitter_factor
                )));
            }
            if initial_delay_ms > max_delay_ms {
                return Err(CoreError::ConfigurationError(
                    "retry initial_delay_ms exceeds max_delay_ms".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Bounded retry for transient storage failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_persistence_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles afterwards
    #[serde(default = "default_persistence_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for PersistenceRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_persistence_attempts(),
            backoff_ms: default_persistence_backoff_ms(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers pulling from the work queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// How long an operation waits for a per-instance lock
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// How long a handler gets to acknowledge cancellation
    #[serde(default = "default_grace_period_ms")]
    pub handler_grace_period_ms: u64,

    /// Interval of the timer loop
    #[serde(default = "default_timer_poll_interval_ms")]
    pub timer_poll_interval_ms: u64,

    /// Upper bound on step instances recorded for one flow
    #[serde(default = "default_max_step_instances")]
    pub max_step_instances: usize,

    /// Collection holding flow instance checkpoints
    #[serde(default = "default_instances_collection")]
    pub instances_collection: String,

    /// Collection holding published flow definitions
    #[serde(default = "default_definitions_collection")]
    pub definitions_collection: String,

    /// Engine-wide retry policy; steps may override it
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Retry policy for transient persistence failures
    #[serde(default)]
    pub persistence_retry: PersistenceRetryConfig,
}

fn default_worker_count() -> usize {
    4
}

fn default_lock_wait_ms() -> u64 {
    5_000
}

fn default_grace_period_ms() -> u64 {
    1_000
}

fn default_timer_poll_interval_ms() -> u64 {
    250
}

fn default_max_step_instances() -> usize {
    256
}

fn default_instances_collection() -> String {
    "flow_instances".to_string()
}

fn default_definitions_collection() -> String {
    "flow_definitions".to_string()
}

fn default_persistence_attempts() -> u32 {
    3
}

fn default_persistence_backoff_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            lock_wait_ms: default_lock_wait_ms(),
            handler_grace_period_ms: default_grace_period_ms(),
            timer_poll_interval_ms: default_timer_poll_interval_ms(),
            max_step_instances: default_max_step_instances(),
            instances_collection: default_instances_collection(),
            definitions_collection: default_definitions_collection(),
            retry: RetryPolicy::default(),
            persistence_retry: PersistenceRetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults overridden by environment variables
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match env::var("STEPWISE_CONFIG_FILE") {
            Ok(path) => Self::from_yaml_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CoreError::ConfigurationError(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Override fields from `STEPWISE_*` environment variables
    pub fn apply_env(&mut self) {
        override_parsed("STEPWISE_WORKER_COUNT", &mut self.worker_count);
        override_parsed("STEPWISE_LOCK_WAIT_MS", &mut self.lock_wait_ms);
        override_parsed(
            "STEPWISE_HANDLER_GRACE_PERIOD_MS",
            &mut self.handler_grace_period_ms,
        );
        override_parsed(
            "STEPWISE_TIMER_POLL_INTERVAL_MS",
            &mut self.timer_poll_interval_ms,
        );
        override_parsed("STEPWISE_MAX_STEP_INSTANCES", &mut self.max_step_instances);
        override_parsed(
            "STEPWISE_PERSISTENCE_MAX_ATTEMPTS",
            &mut self.persistence_retry.max_attempts,
        );
        override_parsed(
            "STEPWISE_PERSISTENCE_BACKOFF_MS",
            &mut self.persistence_retry.backoff_ms,
        );

        if let Ok(collection) = env::var("STEPWISE_INSTANCES_COLLECTION") {
            self.instances_collection = collection;
        }
        if let Ok(collection) = env::var("STEPWISE_DEFINITIONS_COLLECTION") {
            self.definitions_collection = collection;
        }

        if let Ok(retry) = env::var("STEPWISE_RETRY_POLICY") {
            match serde_json::from_str::<RetryPolicy>(&retry) {
                Ok(policy) => self.retry = policy,
                Err(e) => warn!("Invalid STEPWISE_RETRY_POLICY value: {} ({})", retry, e),
            }
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_count == 0 {
            return Err(CoreError::ConfigurationError(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.lock_wait_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "lock_wait_ms must be greater than 0".to_string(),
            ));
        }
        if self.timer_poll_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "timer_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.persistence_retry.max_attempts == 0 {
            return Err(CoreError::ConfigurationError(
                "persistence_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_step_instances == 0 {
            return Err(CoreError::ConfigurationError(
                "max_step_instances must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }

    /// Lock wait as a duration
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Handler grace period as a duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.handler_grace_period_ms)
    }

    /// Timer loop interval as a duration
    pub fn timer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timer_poll_interval_ms)
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}
