/// Harbor - MySQL/MariaDB protocol client driver with load-balanced pooling
///
/// Connections are opened through a per-service load balancer that orders
/// hosts by a configurable strategy and steers around failing hosts using a
/// blacklist. Pools keep authenticated connections ready for reuse.
pub mod auth;
pub mod balance;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod utils;

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

pub use crate::config::Config;
pub use crate::core::execute::{Execute, LoggingConnection, LoggingOptions};
pub use crate::error::{DriverError, DriverResult};
pub use crate::pool::{Pool, PoolOptions, PoolStats, PooledConnection};

use crate::balance::{LoadBalanceInfoCache, LoadBalancer};
use crate::pool::{MySqlConnector, MySqlManager};

/// How often expired blacklist entries are swept
pub const BLACKLIST_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A checked-out connection with query logging applied
pub type Session = LoggingConnection<PooledConnection<MySqlManager>>;

/// Entry point: one pool per configured service, created on first use
pub struct Driver {
    config: Config,
    infos: LoadBalanceInfoCache,
    pools: DashMap<String, Pool<MySqlManager>>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl Driver {
    /// Create a driver from a validated configuration
    pub fn new(config: Config) -> Result<Self, config::ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            infos: LoadBalanceInfoCache::new(),
            pools: DashMap::new(),
            sweepers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pool of `service`, built on first call
    pub fn pool(&self, service: &str) -> DriverResult<Pool<MySqlManager>> {
        if let Some(pool) = self.pools.get(service) {
            return Ok(pool.value().clone());
        }

        let entry = self.pools.entry(service.to_string()).or_try_insert_with(|| {
            let info = self.config.load_balance_info(service, &self.infos)?;
            let connector = MySqlConnector::new(self.config.connection_options());
            let balancer = LoadBalancer::new(info, connector)?;
            self.sweepers
                .lock()
                .push(balancer.blacklist().spawn_sweeper(BLACKLIST_SWEEP_INTERVAL));
            info!("Creating pool for service {}", service);
            Pool::new(MySqlManager::new(balancer), self.config.pool_options())
        })?;
        Ok(entry.value().clone())
    }

    /// Check out a connection of `service`
    pub async fn get_connection(&self, service: &str) -> DriverResult<Session> {
        let pool = self.pool(service)?;
        let conn = pool.get_connection().await?;
        Ok(LoggingConnection::new(conn, self.config.logging_options()))
    }

    /// Close every pool and stop background tasks
    pub async fn close(&self) {
        for task in self.sweepers.lock().drain(..) {
            task.abort();
        }
        let pools: Vec<_> = self.pools.iter().map(|p| p.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
        self.pools.clear();
    }
}
