/// Physical connection lifecycle hooks used by the pool
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::balance::{Connector, LoadBalancer};
use crate::core::connection::{Connection, ConnectionOptions};
use crate::core::{GlobalStateInfo, HostAddress};
use crate::error::DriverResult;

/// Creates, validates and closes the connections a `Pool` holds
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new physical connection
    async fn connect(&self) -> DriverResult<Self::Connection>;

    /// Round trip proving the connection still works
    async fn is_valid(&self, conn: &mut Self::Connection) -> DriverResult<()>;

    /// Whether a returned connection must be discarded instead of pooled
    fn has_broken(&self, conn: &Self::Connection) -> bool;

    /// Server side idle timeout, once known
    fn wait_timeout(&self) -> Option<Duration> {
        None
    }

    /// Close a connection leaving the pool
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Opens authenticated TCP connections with fixed options
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: ConnectionOptions,
}

impl MySqlConnector {
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Connection = Connection<TcpStream>;

    async fn connect(&self, host: &HostAddress) -> DriverResult<Self::Connection> {
        Connection::connect(host, &self.options).await
    }
}

/// Pool manager selecting hosts through a load balancer
pub struct MySqlManager {
    balancer: LoadBalancer<MySqlConnector>,
    global_state: OnceLock<GlobalStateInfo>,
}

impl MySqlManager {
    pub fn new(balancer: LoadBalancer<MySqlConnector>) -> Self {
        Self {
            balancer,
            global_state: OnceLock::new(),
        }
    }

    pub fn balancer(&self) -> &LoadBalancer<MySqlConnector> {
        &self.balancer
    }

    /// Server session defaults, fetched by the first connection
    pub fn global_state(&self) -> Option<&GlobalStateInfo> {
        self.global_state.get()
    }
}

#[async_trait]
impl ManageConnection for MySqlManager {
    type Connection = Connection<TcpStream>;

    async fn connect(&self) -> DriverResult<Self::Connection> {
        let (host, mut conn) = self.balancer.connect().await?;

        let state = match self.global_state.get() {
            Some(state) => state.clone(),
            None => {
                let fetched = conn.fetch_global_state().await?;
                info!(
                    "Server {} global state: max_allowed_packet={}, wait_timeout={}s, isolation={}",
                    host,
                    fetched.max_allowed_packet,
                    fetched.wait_timeout.as_secs(),
                    fetched.isolation_level
                );
                self.global_state.get_or_init(|| fetched).clone()
            }
        };
        conn.set_max_allowed_packet(state.max_allowed_packet);

        debug!(
            "Opened connection {} to {} (server {})",
            conn.connection_id(),
            host,
            conn.server_version()
        );
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> DriverResult<()> {
        conn.ping().await
    }

    fn has_broken(&self, conn: &Self::Connection) -> bool {
        conn.is_broken()
    }

    fn wait_timeout(&self) -> Option<Duration> {
        self.global_state.get().map(|state| state.wait_timeout)
    }

    async fn close(&self, conn: Self::Connection) {
        let id = conn.connection_id();
        if let Err(e) = conn.quit().await {
            debug!("Error closing connection {}: {}", id, e);
        }
    }
}
