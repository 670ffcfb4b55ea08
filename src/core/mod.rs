/// Core value types shared by the balancer, the pool and physical connections
pub mod connection;
pub mod execute;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DriverError, DriverResult};
use crate::protocol::message::Value;

pub const DEFAULT_PORT: u16 = 3306;

/// Role tag of a host in a replicated topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    Master,
    Slave,
}

/// A database endpoint. Immutable and hashable, used as the blacklist key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub host_type: Option<HostType>,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            host_type: None,
        }
    }

    pub fn with_type(mut self, host_type: HostType) -> Self {
        self.host_type = Some(host_type);
        self
    }

    /// `host:port` string suitable for `TcpStream::connect`
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr_string())
    }
}

/// Split `host[:port][:rest]`, honouring `[ipv6]` brackets
fn split_host(input: &str) -> Result<(String, Option<&str>), ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::ValidationError(
            "host address cannot be empty".to_string(),
        ));
    }
    if let Some(rest) = input.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| {
            ConfigError::ValidationError(format!("unterminated IPv6 address '{input}'"))
        })?;
        let host = rest[..end].to_string();
        let tail = rest[end + 1..].strip_prefix(':');
        return Ok((host, tail));
    }
    match input.split_once(':') {
        Some((host, tail)) => Ok((host.to_string(), Some(tail))),
        None => Ok((input.to_string(), None)),
    }
}

fn parse_number<T: FromStr>(value: &str, what: &str, input: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("invalid {what} in '{input}'")))
}

impl FromStr for HostAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, tail) = split_host(s)?;
        let port = match tail {
            Some(port) => parse_number(port, "port", s)?,
            None => DEFAULT_PORT,
        };
        Ok(HostAddress::new(host, port))
    }
}

/// Host with its selection weight inside a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadBalanceHostAddress {
    #[serde(flatten)]
    pub address: HostAddress,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl LoadBalanceHostAddress {
    pub fn new(address: HostAddress, weight: u32) -> Self {
        Self { address, weight }
    }
}

impl From<HostAddress> for LoadBalanceHostAddress {
    fn from(address: HostAddress) -> Self {
        Self::new(address, default_weight())
    }
}

impl fmt::Display for LoadBalanceHostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.weight)
    }
}

/// Parses `host:port[:weight]`
impl FromStr for LoadBalanceHostAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, tail) = split_host(s)?;
        let (port, weight) = match tail {
            None => (DEFAULT_PORT, default_weight()),
            Some(tail) => match tail.split_once(':') {
                Some((port, weight)) => (
                    parse_number(port, "port", s)?,
                    parse_number(weight, "weight", s)?,
                ),
                None => (parse_number(tail, "port", s)?, default_weight()),
            },
        };
        Ok(Self::new(HostAddress::new(host, port), weight))
    }
}

/// Parse a comma separated `host:port[:weight]` list
pub fn parse_weighted_hosts(list: &str) -> Result<Vec<LoadBalanceHostAddress>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// Server session defaults, fetched once per pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalStateInfo {
    pub max_allowed_packet: u64,
    pub wait_timeout: Duration,
    pub autocommit: bool,
    pub auto_increment_increment: u64,
    pub time_zone: String,
    pub system_time_zone: String,
    pub isolation_level: String,
}

impl Default for GlobalStateInfo {
    fn default() -> Self {
        Self {
            max_allowed_packet: 16 * 1024 * 1024,
            wait_timeout: Duration::from_secs(28_800),
            autocommit: true,
            auto_increment_increment: 1,
            time_zone: "+00:00".to_string(),
            system_time_zone: "+00:00".to_string(),
            isolation_level: "REPEATABLE-READ".to_string(),
        }
    }
}

impl GlobalStateInfo {
    /// Statement selecting the session defaults, in `from_row` order
    pub fn query(use_transaction_isolation: bool) -> String {
        let isolation = if use_transaction_isolation {
            "@@transaction_isolation"
        } else {
            "@@tx_isolation"
        };
        format!(
            "SELECT @@max_allowed_packet,@@wait_timeout,@@autocommit,\
             @@auto_increment_increment,@@time_zone,@@system_time_zone,{isolation}"
        )
    }

    pub fn from_row(row: &[Value]) -> DriverResult<Self> {
        if row.len() < 7 {
            return Err(DriverError::protocol(format!(
                "global state row has {} columns, expected 7",
                row.len()
            )));
        }
        let number = |index: usize, name: &str| {
            row[index]
                .as_u64()
                .ok_or_else(|| DriverError::protocol(format!("invalid value for @@{name}")))
        };
        let text = |index: usize| match &row[index] {
            Value::Null => String::new(),
            value => value.to_string(),
        };

        Ok(Self {
            max_allowed_packet: number(0, "max_allowed_packet")?,
            wait_timeout: Duration::from_secs(number(1, "wait_timeout")?),
            autocommit: row[2].as_bool().unwrap_or(true),
            auto_increment_increment: number(3, "auto_increment_increment")?,
            time_zone: text(4),
            system_time_zone: text(5),
            isolation_level: text(6),
        })
    }
}
