//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SpindleError;
use crate::queue::{DEFAULT_BACKOFF_MS, RetryPolicy};

/// Manager configuration. Every field has a default; zero or empty values
/// are replaced with the defaults by [`ManagerConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Delay before each worker's first poll.
    #[serde(default = "default_init_interval")]
    pub init_interval_ms: u64,

    /// Idle poll interval when a type has no pending task. Also the delay
    /// before the first timeout sweep.
    #[serde(default = "default_query_interval")]
    pub query_interval_ms: u64,

    /// Back-off after a storage error.
    #[serde(default = "default_err_sleep_interval")]
    pub err_sleep_interval_ms: u64,

    /// Retry delays indexed by retry count, clamped at the last entry.
    #[serde(default = "default_backoff_intervals")]
    pub backoff_intervals_ms: Vec<u64>,

    /// Random extra added to a retry delay, as a fraction of the gap to the
    /// next table entry. Must be within `[0, 1]`.
    #[serde(default)]
    pub backoff_jitter_ratio: f64,

    #[serde(default = "default_timeout_check_interval")]
    pub timeout_check_interval_ms: u64,

    /// Handler deadline, and the age after which a Processing row counts as
    /// abandoned.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,
}

fn default_init_interval() -> u64 {
    10_000
}

fn default_query_interval() -> u64 {
    30_000
}

fn default_err_sleep_interval() -> u64 {
    3_000
}

fn default_backoff_intervals() -> Vec<u64> {
    DEFAULT_BACKOFF_MS.to_vec()
}

fn default_timeout_check_interval() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_task_timeout() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            init_interval_ms: default_init_interval(),
            query_interval_ms: default_query_interval(),
            err_sleep_interval_ms: default_err_sleep_interval(),
            backoff_intervals_ms: default_backoff_intervals(),
            backoff_jitter_ratio: 0.0,
            timeout_check_interval_ms: default_timeout_check_interval(),
            task_timeout_ms: default_task_timeout(),
        }
    }
}

fn or_default(value: &mut u64, default: fn() -> u64) {
    if *value == 0 {
        *value = default();
    }
}

impl ManagerConfig {
    /// Fill zero/empty fields with defaults and reject values that cannot be
    /// repaired.
    pub fn validate(mut self) -> Result<Self, SpindleError> {
        or_default(&mut self.init_interval_ms, default_init_interval);
        or_default(&mut self.query_interval_ms, default_query_interval);
        or_default(&mut self.err_sleep_interval_ms, default_err_sleep_interval);
        or_default(
            &mut self.timeout_check_interval_ms,
            default_timeout_check_interval,
        );
        or_default(&mut self.task_timeout_ms, default_task_timeout);

        if self.backoff_intervals_ms.is_empty() {
            self.backoff_intervals_ms = default_backoff_intervals();
        }
        if self.backoff_intervals_ms.contains(&0) {
            return Err(SpindleError::InvalidConfig(
                "backoff_intervals_ms entries must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter_ratio) {
            return Err(SpindleError::InvalidConfig(format!(
                "backoff_jitter_ratio must be within [0, 1], got {}",
                self.backoff_jitter_ratio
            )));
        }
        Ok(self)
    }

    pub fn init_interval(&self) -> Duration {
        Duration::from_millis(self.init_interval_ms)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms)
    }

    pub fn err_sleep_interval(&self) -> Duration {
        Duration::from_millis(self.err_sleep_interval_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_intervals_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            self.backoff_jitter_ratio,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ManagerConfig::default();
        assert_eq!(config.init_interval(), Duration::from_secs(10));
        assert_eq!(config.query_interval(), Duration::from_secs(30));
        assert_eq!(config.err_sleep_interval(), Duration::from_secs(3));
        assert_eq!(config.timeout_check_interval(), Duration::from_secs(86_400));
        assert_eq!(config.task_timeout(), Duration::from_secs(86_400));
        assert_eq!(config.retry_policy().delay(0), Duration::from_secs(2));
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{ "query_interval_ms": 500 }"#).unwrap();
        assert_eq!(config.query_interval_ms, 500);
        assert_eq!(config.init_interval_ms, 10_000);
        assert_eq!(config.backoff_intervals_ms, DEFAULT_BACKOFF_MS.to_vec());
        assert_eq!(config.backoff_jitter_ratio, 0.0);
    }

    #[test]
    fn validate_replaces_zero_and_empty_values() {
        let config = ManagerConfig {
            init_interval_ms: 0,
            query_interval_ms: 0,
            err_sleep_interval_ms: 0,
            backoff_intervals_ms: Vec::new(),
            backoff_jitter_ratio: 0.0,
            timeout_check_interval_ms: 0,
            task_timeout_ms: 0,
        }
        .validate()
        .unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn validate_rejects_bad_jitter() {
        let config = ManagerConfig {
            backoff_jitter_ratio: 1.5,
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(SpindleError::InvalidConfig(_))));

        let config = ManagerConfig {
            backoff_jitter_ratio: f64::NAN,
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(SpindleError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_zero_backoff_entry() {
        let config = ManagerConfig {
            backoff_intervals_ms: vec![1_000, 0],
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(SpindleError::InvalidConfig(_))));
    }
}
