/// Statement execution interface and the query-logging decorator
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::connection::Connection;
use crate::error::DriverResult;
use crate::protocol::message::QueryResult;
use crate::protocol::Transport;

/// Operations callers run against a connection
#[async_trait]
pub trait Execute: Send {
    async fn query(&mut self, sql: &str) -> DriverResult<QueryResult>;

    async fn ping(&mut self) -> DriverResult<()>;

    async fn set_autocommit(&mut self, autocommit: bool) -> DriverResult<()>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;
}

#[async_trait]
impl<T: Transport> Execute for Connection<T> {
    async fn query(&mut self, sql: &str) -> DriverResult<QueryResult> {
        Connection::query(self, sql).await
    }

    async fn ping(&mut self) -> DriverResult<()> {
        Connection::ping(self).await
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DriverResult<()> {
        Connection::set_autocommit(self, autocommit).await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        Connection::commit(self).await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        Connection::rollback(self).await
    }
}

/// Query logging settings
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Log every statement with its duration
    pub profile_sql: bool,
    /// Statements slower than this are logged at WARN
    pub slow_query_threshold: Option<Duration>,
    /// Logged SQL is truncated to this many bytes
    pub max_query_size_to_log: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            profile_sql: false,
            slow_query_threshold: None,
            max_query_size_to_log: 1024,
        }
    }
}

impl LoggingOptions {
    pub fn is_enabled(&self) -> bool {
        self.profile_sql || self.slow_query_threshold.is_some()
    }
}

/// Wraps any `Execute` implementation and logs each operation
pub struct LoggingConnection<E> {
    inner: E,
    options: LoggingOptions,
}

impl<E: Execute> LoggingConnection<E> {
    pub fn new(inner: E, options: LoggingOptions) -> Self {
        Self { inner, options }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut E {
        &mut self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    fn log(&self, operation: &str, sql: &str, elapsed: Duration, ok: bool) {
        let sql = truncate_sql(sql, self.options.max_query_size_to_log);
        let millis = elapsed.as_millis() as u64;

        if let Some(threshold) = self.options.slow_query_threshold {
            if elapsed >= threshold {
                warn!(operation, elapsed_ms = millis, sql = %sql, "slow query");
                return;
            }
        }
        if self.options.profile_sql {
            if ok {
                info!(operation, elapsed_ms = millis, sql = %sql, "query executed");
            } else {
                debug!(operation, elapsed_ms = millis, sql = %sql, "query failed");
            }
        }
    }
}

/// Cut `sql` to at most `max` bytes on a char boundary, marking the cut
pub fn truncate_sql(sql: &str, max: usize) -> String {
    if sql.len() <= max {
        return sql.to_string();
    }
    let mut end = max;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}

#[async_trait]
impl<E: Execute> Execute for LoggingConnection<E> {
    async fn query(&mut self, sql: &str) -> DriverResult<QueryResult> {
        let start = Instant::now();
        let result = self.inner.query(sql).await;
        self.log("query", sql, start.elapsed(), result.is_ok());
        result
    }

    async fn ping(&mut self) -> DriverResult<()> {
        let start = Instant::now();
        let result = self.inner.ping().await;
        self.log("ping", "", start.elapsed(), result.is_ok());
        result
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DriverResult<()> {
        let start = Instant::now();
        let result = self.inner.set_autocommit(autocommit).await;
        let sql = if autocommit {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        };
        self.log("set_autocommit", sql, start.elapsed(), result.is_ok());
        result
    }

    async fn commit(&mut self) -> DriverResult<()> {
        let start = Instant::now();
        let result = self.inner.commit().await;
        self.log("commit", "COMMIT", start.elapsed(), result.is_ok());
        result
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        let start = Instant::now();
        let result = self.inner.rollback().await;
        self.log("rollback", "ROLLBACK", start.elapsed(), result.is_ok());
        result
    }
}
