//! Blacklist append/remove strategies and their configuration checkers

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::HostStateInfo;
use crate::error::ConfigError;

/// Seconds a blacklist entry lives before `TimeoutRecover` drops it
pub const TIMEOUT: &str = "TIMEOUT";
/// Failures within `DURATION` needed before `RetryDuration` blacklists
pub const RETRY_TIMES: &str = "RETRYTIMES";
/// `RetryDuration` window in milliseconds
pub const DURATION: &str = "DURATION";

pub const DEFAULT_TIMEOUT_SECS: u64 = 50;
pub const DEFAULT_RETRY_TIMES: u64 = 1;
pub const DEFAULT_DURATION_MILLIS: u64 = 1000;

/// How hosts leave the blacklist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStrategy {
    /// Entries older than `timeout` are eligible again
    TimeoutRecover { timeout: Duration },
}

impl RemoveStrategy {
    pub fn from_config(name: &str, params: &HashMap<String, String>) -> Result<Self, ConfigError> {
        match name {
            "TimeoutRecover" => {
                let secs = optional_positive(params, TIMEOUT, DEFAULT_TIMEOUT_SECS)?;
                Ok(RemoveStrategy::TimeoutRecover {
                    timeout: Duration::from_secs(secs),
                })
            }
            other => Err(ConfigError::ValidationError(format!(
                "unknown blacklist remove strategy '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoveStrategy::TimeoutRecover { .. } => "TimeoutRecover",
        }
    }

    /// Whether `info` should leave the blacklist at `now`
    pub fn should_remove(&self, info: &HostStateInfo, now: Instant) -> bool {
        match self {
            RemoveStrategy::TimeoutRecover { timeout } => {
                now.saturating_duration_since(info.timestamp) > *timeout
            }
        }
    }
}

impl Default for RemoveStrategy {
    fn default() -> Self {
        RemoveStrategy::TimeoutRecover {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// How and when failing hosts enter the blacklist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendStrategy {
    /// Blacklist on the first failure
    #[default]
    Normal,
    /// Blacklist once `retry_times` failures fall within `duration`
    RetryDuration { retry_times: usize, duration: Duration },
}

impl AppendStrategy {
    pub fn from_config(name: &str, params: &HashMap<String, String>) -> Result<Self, ConfigError> {
        match name {
            "Normal" => Ok(AppendStrategy::Normal),
            "RetryDuration" => {
                let retry_times = optional_positive(params, RETRY_TIMES, DEFAULT_RETRY_TIMES)?;
                let millis = optional_positive(params, DURATION, DEFAULT_DURATION_MILLIS)?;
                Ok(AppendStrategy::RetryDuration {
                    retry_times: usize::try_from(retry_times).map_err(|_| {
                        ConfigError::ValidationError(format!("{RETRY_TIMES} is too large"))
                    })?,
                    duration: Duration::from_millis(millis),
                })
            }
            other => Err(ConfigError::ValidationError(format!(
                "unknown blacklist append strategy '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AppendStrategy::Normal => "Normal",
            AppendStrategy::RetryDuration { .. } => "RetryDuration",
        }
    }
}

/// Parameter checker: key absent gives `default`, present must be a positive integer
fn optional_positive(
    params: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => check_positive_integer(key, raw),
    }
}

pub fn check_positive_integer(key: &str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::ValidationError(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

/// Blacklist strategy names with their free-form parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackListConfig {
    #[serde(default = "default_remove_strategy", alias = "removeStrategy")]
    pub remove_strategy: String,
    #[serde(default, alias = "removeParams")]
    pub remove_params: HashMap<String, String>,
    #[serde(default = "default_append_strategy", alias = "appendStrategy")]
    pub append_strategy: String,
    #[serde(default, alias = "appendParams")]
    pub append_params: HashMap<String, String>,
}

fn default_remove_strategy() -> String {
    "TimeoutRecover".to_string()
}

fn default_append_strategy() -> String {
    "Normal".to_string()
}

impl Default for BlackListConfig {
    fn default() -> Self {
        Self {
            remove_strategy: default_remove_strategy(),
            remove_params: HashMap::new(),
            append_strategy: default_append_strategy(),
            append_params: HashMap::new(),
        }
    }
}

impl BlackListConfig {
    /// Resolve the named strategies, checking every parameter
    pub fn build(&self) -> Result<(AppendStrategy, RemoveStrategy), ConfigError> {
        let append = AppendStrategy::from_config(&self.append_strategy, &self.append_params)?;
        let remove = RemoveStrategy::from_config(&self.remove_strategy, &self.remove_params)?;
        Ok((append, remove))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build().map(|_| ())
    }
}

impl fmt::Display for BlackListConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "append={} {:?}, remove={} {:?}",
            self.append_strategy, self.append_params, self.remove_strategy, self.remove_params
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HostState;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config_builds() {
        let (append, remove) = BlackListConfig::default().build().unwrap();
        assert_eq!(append, AppendStrategy::Normal);
        assert_eq!(
            remove,
            RemoveStrategy::TimeoutRecover {
                timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS)
            }
        );
    }

    #[test]
    fn test_retry_duration_from_config() {
        let strategy = AppendStrategy::from_config(
            "RetryDuration",
            &params(&[(RETRY_TIMES, "3"), (DURATION, "5000")]),
        )
        .unwrap();
        assert_eq!(
            strategy,
            AppendStrategy::RetryDuration {
                retry_times: 3,
                duration: Duration::from_millis(5000)
            }
        );
        assert_eq!(strategy.name(), "RetryDuration");
    }

    #[test]
    fn test_checkers_reject_bad_parameters() {
        assert!(RemoveStrategy::from_config("TimeoutRecover", &params(&[(TIMEOUT, "0")])).is_err());
        assert!(RemoveStrategy::from_config("TimeoutRecover", &params(&[(TIMEOUT, "-5")])).is_err());
        assert!(
            AppendStrategy::from_config("RetryDuration", &params(&[(RETRY_TIMES, "many")]))
                .is_err()
        );
        assert!(AppendStrategy::from_config("Sometimes", &HashMap::new()).is_err());
        assert!(RemoveStrategy::from_config("Never", &HashMap::new()).is_err());

        let config = BlackListConfig {
            append_strategy: "Bogus".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_recover() {
        let strategy = RemoveStrategy::TimeoutRecover {
            timeout: Duration::from_secs(10),
        };
        let start = Instant::now();
        let info = HostStateInfo {
            state: HostState::Black,
            timestamp: start,
        };
        assert!(!strategy.should_remove(&info, start + Duration::from_secs(10)));
        assert!(strategy.should_remove(&info, start + Duration::from_secs(11)));
    }
}
