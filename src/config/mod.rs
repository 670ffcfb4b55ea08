/// Configuration management for harbor
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthOptions, Credentials};
use crate::balance::{
    BalanceStrategy, FallThroughPolicy, GroupBalanceStrategy, LoadBalanceAddressList,
    LoadBalanceInfo, LoadBalanceInfoCache,
};
use crate::core::connection::ConnectionOptions;
use crate::core::execute::LoggingOptions;
use crate::core::LoadBalanceHostAddress;
pub use crate::error::ConfigError;
use crate::health::BlackListConfig;
use crate::pool::PoolOptions;

/// Main harbor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection and authentication settings
    pub driver: DriverConfig,
    /// Pool sizing and timing
    pub pool: PoolConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Named services with their host groups
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Connection and authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms", alias = "connectTimeout")]
    pub connect_timeout_ms: u64,
    /// Socket read/write timeout in milliseconds
    #[serde(default, alias = "socketTimeout")]
    pub socket_timeout_ms: Option<u64>,
    #[serde(default = "default_true", alias = "tcpKeepAlive")]
    pub tcp_keep_alive: bool,
    /// PEM file path or inline PEM of the server RSA public key
    #[serde(default, alias = "serverRsaPublicKeyFile")]
    pub server_rsa_public_key_file: Option<String>,
    #[serde(default, alias = "allowPublicKeyRetrieval")]
    pub allow_public_key_retrieval: bool,
    /// Log every statement with its duration
    #[serde(default, alias = "profileSql")]
    pub profile_sql: bool,
    #[serde(default, alias = "slowQueryThresholdMillis")]
    pub slow_query_threshold_ms: Option<u64>,
    #[serde(default = "default_max_query_size_to_log", alias = "maxQuerySizeToLog")]
    pub max_query_size_to_log: usize,
}

/// Pool sizing and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_pool_size", alias = "maxPoolSize")]
    pub max_pool_size: usize,
    /// Defaults to `max_pool_size`
    #[serde(default, alias = "minPoolSize")]
    pub min_pool_size: Option<usize>,
    /// Idle time in seconds before a connection may be evicted
    #[serde(default = "default_max_idle_time_sec", alias = "maxIdleTime")]
    pub max_idle_time_sec: u64,
    /// Idle connections used within this many milliseconds skip validation
    #[serde(default = "default_pool_valid_min_delay_ms", alias = "poolValidMinDelay")]
    pub pool_valid_min_delay_ms: u64,
    /// Grace period in seconds for busy connections at shutdown
    #[serde(default = "default_shutdown_grace_sec")]
    pub shutdown_grace_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

/// One named service: host groups and the strategies used across them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default, alias = "groupStrategy")]
    pub group_strategy: GroupBalanceStrategy,
    #[serde(default, alias = "retryAllDowns")]
    pub retry_all_downs: u32,
    #[serde(default, alias = "fallThroughPolicy")]
    pub fall_through: FallThroughPolicy,
    /// `host:port[:weight],...` overriding weights of matching hosts
    #[serde(default, alias = "serverAffinityOrder")]
    pub server_affinity_order: Option<String>,
    pub groups: Vec<GroupConfig>,
    #[serde(default, alias = "blackList")]
    pub blacklist: BlackListConfig,
}

/// Hosts of one group as `host:port[:weight]` strings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default, alias = "loadBalanceStrategy")]
    pub strategy: BalanceStrategy,
    pub hosts: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_max_query_size_to_log() -> usize {
    1024
}

fn default_max_pool_size() -> usize {
    8
}

fn default_max_idle_time_sec() -> u64 {
    600
}

fn default_pool_valid_min_delay_ms() -> u64 {
    1000
}

fn default_shutdown_grace_sec() -> u64 {
    10
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: None,
            database: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: None,
            tcp_keep_alive: true,
            server_rsa_public_key_file: None,
            allow_public_key_retrieval: false,
            profile_sql: false,
            slow_query_threshold_ms: None,
            max_query_size_to_log: default_max_query_size_to_log(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            min_pool_size: None,
            max_idle_time_sec: default_max_idle_time_sec(),
            pool_valid_min_delay_ms: default_pool_valid_min_delay_ms(),
            shutdown_grace_sec: default_shutdown_grace_sec(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            stdout: true,
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
            services: vec![ServiceConfig {
                name: "default".to_string(),
                group_strategy: GroupBalanceStrategy::default(),
                retry_all_downs: 0,
                fall_through: FallThroughPolicy::default(),
                server_affinity_order: None,
                groups: vec![GroupConfig {
                    strategy: BalanceStrategy::Random,
                    hosts: vec!["127.0.0.1:3306".to_string()],
                }],
                blacklist: BlackListConfig::default(),
            }],
        }
    }
}

impl ServiceConfig {
    /// Parse the host strings into a validated `LoadBalanceInfo`
    pub fn to_load_balance_info(&self) -> Result<LoadBalanceInfo, ConfigError> {
        let groups = self
            .groups
            .iter()
            .map(|group| {
                let hosts = group
                    .hosts
                    .iter()
                    .map(|h| h.parse::<LoadBalanceHostAddress>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(LoadBalanceAddressList::new(hosts, group.strategy))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let mut info = LoadBalanceInfo {
            service_name: self.name.clone(),
            groups,
            group_strategy: self.group_strategy,
            retry_all_downs: self.retry_all_downs,
            blacklist: self.blacklist.clone(),
            fall_through: self.fall_through,
        };
        if let Some(order) = &self.server_affinity_order {
            info.apply_server_affinity_order(order)?;
        }
        info.validate()?;
        Ok(info)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver.user.is_empty() {
            return Err(ConfigError::ValidationError(
                "user cannot be empty".to_string(),
            ));
        }

        if self.driver.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.driver.socket_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "socket_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }

        self.pool_options().validate()?;

        if self.services.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one service must be configured".to_string(),
            ));
        }

        for (i, service) in self.services.iter().enumerate() {
            if self.services[..i].iter().any(|s| s.name == service.name) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            service.to_load_balance_info()?;
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// `LoadBalanceInfo` for `name`, built once and kept in `cache`
    pub fn load_balance_info(
        &self,
        name: &str,
        cache: &LoadBalanceInfoCache,
    ) -> Result<Arc<LoadBalanceInfo>, ConfigError> {
        cache.get_or_try_insert(name, || {
            self.service(name)
                .ok_or_else(|| ConfigError::ValidationError(format!("unknown service: {name}")))?
                .to_load_balance_info()
        })
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let driver = &self.driver;
        ConnectionOptions {
            credentials: Credentials {
                user: driver.user.clone(),
                password: driver.password.clone(),
                database: driver.database.clone(),
            },
            auth: AuthOptions {
                server_rsa_public_key: driver.server_rsa_public_key_file.clone(),
                allow_public_key_retrieval: driver.allow_public_key_retrieval,
            },
            connect_timeout: Duration::from_millis(driver.connect_timeout_ms),
            socket_timeout: driver.socket_timeout_ms.map(Duration::from_millis),
            tcp_keep_alive: driver.tcp_keep_alive,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        let pool = &self.pool;
        PoolOptions {
            max_pool_size: pool.max_pool_size,
            min_pool_size: pool.min_pool_size.unwrap_or(pool.max_pool_size),
            max_idle_time: Duration::from_secs(pool.max_idle_time_sec),
            pool_valid_min_delay: Duration::from_millis(pool.pool_valid_min_delay_ms),
            connect_timeout: Duration::from_millis(self.driver.connect_timeout_ms),
            shutdown_grace: Duration::from_secs(pool.shutdown_grace_sec),
        }
    }

    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            profile_sql: self.driver.profile_sql,
            slow_query_threshold: self.driver.slow_query_threshold_ms.map(Duration::from_millis),
            max_query_size_to_log: self.driver.max_query_size_to_log,
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut blacklist = BlackListConfig {
            append_strategy: "RetryDuration".to_string(),
            ..Default::default()
        };
        blacklist
            .append_params
            .insert(crate::health::strategy::RETRY_TIMES.to_string(), "3".to_string());
        blacklist
            .append_params
            .insert(crate::health::strategy::DURATION.to_string(), "5000".to_string());
        blacklist
            .remove_params
            .insert(crate::health::strategy::TIMEOUT.to_string(), "30".to_string());

        let config = Config {
            driver: DriverConfig {
                user: "app".to_string(),
                password: Some("change-me".to_string()),
                database: Some("orders".to_string()),
                ..Default::default()
            },
            pool: PoolConfig {
                max_pool_size: 16,
                min_pool_size: Some(4),
                ..Default::default()
            },
            logging: LoggingConfig::default(),
            services: vec![ServiceConfig {
                name: "orders".to_string(),
                group_strategy: GroupBalanceStrategy::GroupRotation,
                retry_all_downs: 1,
                fall_through: FallThroughPolicy::Keep,
                server_affinity_order: None,
                groups: vec![
                    GroupConfig {
                        strategy: BalanceStrategy::Rotation,
                        hosts: vec![
                            "10.0.1.10:3306".to_string(),
                            "10.0.1.11:3306".to_string(),
                        ],
                    },
                    GroupConfig {
                        strategy: BalanceStrategy::ServerAffinity,
                        hosts: vec![
                            "10.0.2.10:3306:3".to_string(),
                            "10.0.2.11:3306:1".to_string(),
                        ],
                    },
                ],
                blacklist,
            }],
        };

        config.save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::AppendStrategy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_options().min_pool_size, 8);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.pool.max_pool_size = 0;
        assert!(config.validate().is_err());

        config.pool.max_pool_size = 4;
        config.pool.min_pool_size = Some(5);
        assert!(config.validate().is_err());

        config.pool.min_pool_size = Some(2);
        assert!(config.validate().is_ok());

        config.services[0].groups[0].hosts.push("db:notaport".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_services_rejected() {
        let mut config = Config::default();
        config.services.push(config.services[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        let info = loaded.service("orders").unwrap().to_load_balance_info().unwrap();
        assert_eq!(info.groups.len(), 2);
        assert_eq!(info.groups[1].hosts[0].weight, 3);
        assert_eq!(info.retry_all_downs, 1);

        let (append, _) = info.blacklist.build().unwrap();
        assert_eq!(
            append,
            AppendStrategy::RetryDuration {
                retry_times: 3,
                duration: Duration::from_millis(5000)
            }
        );
    }

    #[test]
    fn test_camel_case_aliases() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[driver]
user = "app"
connectTimeout = 2500
allowPublicKeyRetrieval = true

[pool]
maxPoolSize = 10
minPoolSize = 2
maxIdleTime = 120
poolValidMinDelay = 250

[logging]
level = "debug"
format = "json"
stdout = true

[[services]]
name = "billing"
retryAllDowns = 2
fallThroughPolicy = "reset"
serverAffinityOrder = "b:3306:5"

[[services.groups]]
loadBalanceStrategy = "ServerAffinity"
hosts = ["a:3306", "b:3306"]

[services.blackList]
appendStrategy = "RetryDuration"
removeStrategy = "TimeoutRecover"

[services.blackList.appendParams]
RETRYTIMES = "2"
DURATION = "1000"
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        let options = config.pool_options();
        assert_eq!(options.max_pool_size, 10);
        assert_eq!(options.min_pool_size, 2);
        assert_eq!(options.max_idle_time, Duration::from_secs(120));
        assert_eq!(options.pool_valid_min_delay, Duration::from_millis(250));
        assert_eq!(options.connect_timeout, Duration::from_millis(2500));
        assert!(config.connection_options().auth.allow_public_key_retrieval);

        let cache = LoadBalanceInfoCache::new();
        let info = config.load_balance_info("billing", &cache).unwrap();
        assert_eq!(info.fall_through, FallThroughPolicy::Reset);
        assert_eq!(info.retry_all_downs, 2);
        assert_eq!(info.groups[0].hosts[1].weight, 5);
        assert!(Arc::ptr_eq(
            &info,
            &config.load_balance_info("billing", &cache).unwrap()
        ));
        assert!(config.load_balance_info("missing", &cache).is_err());
    }

    #[test]
    fn test_invalid_blacklist_parameters_rejected() {
        let mut config = Config::default();
        config.services[0]
            .blacklist
            .remove_params
            .insert("TIMEOUT".to_string(), "0".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_logging_options() {
        let mut config = Config::default();
        config.driver.slow_query_threshold_ms = Some(200);
        let options = config.logging_options();
        assert_eq!(options.slow_query_threshold, Some(Duration::from_millis(200)));
        assert!(options.is_enabled());
    }
}
