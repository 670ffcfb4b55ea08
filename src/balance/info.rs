//! Load balancing configuration for one named service

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::group::GroupBalanceStrategy;
use super::strategy::BalanceStrategy;
use crate::core::{parse_weighted_hosts, LoadBalanceHostAddress};
use crate::error::ConfigError;
use crate::health::BlackListConfig;

/// Whether a successful fall-through connection clears the host's blacklist entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallThroughPolicy {
    /// Host stays blacklisted until its entry times out
    #[default]
    Keep,
    /// Host is removed from the blacklist as soon as it accepts a connection
    Reset,
}

impl fmt::Display for FallThroughPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallThroughPolicy::Keep => write!(f, "keep"),
            FallThroughPolicy::Reset => write!(f, "reset"),
        }
    }
}

impl FromStr for FallThroughPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(FallThroughPolicy::Keep),
            "reset" => Ok(FallThroughPolicy::Reset),
            other => Err(ConfigError::ValidationError(format!(
                "unknown fall-through policy '{other}'"
            ))),
        }
    }
}

/// One group of hosts (e.g. one data center) with its balance strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalanceAddressList {
    pub hosts: Vec<LoadBalanceHostAddress>,
    #[serde(default, alias = "loadBalanceStrategy")]
    pub strategy: BalanceStrategy,
}

impl LoadBalanceAddressList {
    pub fn new(hosts: Vec<LoadBalanceHostAddress>, strategy: BalanceStrategy) -> Self {
        Self { hosts, strategy }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "address group must contain at least one host".to_string(),
            ));
        }
        if self.strategy == BalanceStrategy::ServerAffinity
            && self.hosts.iter().all(|h| h.weight == 0)
        {
            return Err(ConfigError::ValidationError(
                "ServerAffinity group needs a positive total weight".to_string(),
            ));
        }
        Ok(())
    }
}

/// Root load balancing configuration, built once per service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalanceInfo {
    #[serde(alias = "serviceName")]
    pub service_name: String,
    pub groups: Vec<LoadBalanceAddressList>,
    #[serde(default, alias = "groupStrategy")]
    pub group_strategy: GroupBalanceStrategy,
    #[serde(default, alias = "retryAllDowns")]
    pub retry_all_downs: u32,
    #[serde(default, alias = "blackList")]
    pub blacklist: BlackListConfig,
    #[serde(default, alias = "fallThroughPolicy")]
    pub fall_through: FallThroughPolicy,
}

impl LoadBalanceInfo {
    /// Single-group service
    pub fn single(
        service_name: impl Into<String>,
        hosts: Vec<LoadBalanceHostAddress>,
        strategy: BalanceStrategy,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            groups: vec![LoadBalanceAddressList::new(hosts, strategy)],
            group_strategy: GroupBalanceStrategy::default(),
            retry_all_downs: 0,
            blacklist: BlackListConfig::default(),
            fall_through: FallThroughPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service name cannot be empty".to_string(),
            ));
        }
        if self.groups.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "service '{}' has no address groups",
                self.service_name
            )));
        }
        for group in &self.groups {
            group.validate().map_err(|e| {
                ConfigError::ValidationError(format!("service '{}': {e}", self.service_name))
            })?;
        }
        self.blacklist.validate()
    }

    /// Apply a `host:port[:weight],...` list, overriding weights of matching hosts.
    /// Returns how many configured hosts were updated.
    pub fn apply_server_affinity_order(&mut self, order: &str) -> Result<usize, ConfigError> {
        let overrides = parse_weighted_hosts(order)?;
        let mut updated = 0;
        for group in &mut self.groups {
            for host in &mut group.hosts {
                let matching = overrides.iter().find(|o| {
                    o.address.host == host.address.host && o.address.port == host.address.port
                });
                if let Some(entry) = matching {
                    host.weight = entry.weight;
                    updated += 1;
                }
            }
        }
        debug!(
            "Applied server affinity order to {} hosts of service {}",
            updated, self.service_name
        );
        Ok(updated)
    }

    pub fn host_count(&self) -> usize {
        self.groups.iter().map(|g| g.hosts.len()).sum()
    }
}

/// `LoadBalanceInfo` instances keyed by service name
#[derive(Debug, Default)]
pub struct LoadBalanceInfoCache {
    entries: DashMap<String, Arc<LoadBalanceInfo>>,
}

impl LoadBalanceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service_name: &str) -> Option<Arc<LoadBalanceInfo>> {
        self.entries.get(service_name).map(|e| Arc::clone(e.value()))
    }

    /// Cached entry for `service_name`, building and validating it on first use
    pub fn get_or_try_insert<F>(
        &self,
        service_name: &str,
        build: F,
    ) -> Result<Arc<LoadBalanceInfo>, ConfigError>
    where
        F: FnOnce() -> Result<LoadBalanceInfo, ConfigError>,
    {
        if let Some(info) = self.get(service_name) {
            return Ok(info);
        }
        let info = build()?;
        info.validate()?;
        let entry = self
            .entries
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(info));
        Ok(Arc::clone(entry.value()))
    }

    pub fn invalidate(&self, service_name: &str) -> bool {
        self.entries.remove(service_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
