//! Bounded connection pool
//!
//! Idle connections sit in a LIFO deque so the most recently used one is handed
//! out first. Physical connections are created by a single appender task fed
//! through a bounded request queue, which keeps `total <= max_pool_size`. A
//! reaper task evicts connections idle for too long while the pool is above
//! its minimum size.

pub mod manager;

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::execute::Execute;
use crate::error::{ConfigError, DriverError, DriverResult};
use crate::protocol::message::QueryResult;
pub use manager::{ManageConnection, MySqlConnector, MySqlManager};

/// Connections idle longer than the server's `wait_timeout` minus this are evicted
pub const WAIT_TIMEOUT_MARGIN: Duration = Duration::from_secs(45);
/// Upper bound of the reaper interval
pub const MAX_REAPER_INTERVAL: Duration = Duration::from_secs(30);
/// How often a waiting caller re-requests a connection
const WAIT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    /// Idle connections older than this are evicted down to `min_pool_size`
    pub max_idle_time: Duration,
    /// Idle connections used more recently than this skip validation
    pub pool_valid_min_delay: Duration,
    /// Longest a caller waits in `get_connection`
    pub connect_timeout: Duration,
    /// Time busy connections get to come back during shutdown
    pub shutdown_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 8,
            min_pool_size: 8,
            max_idle_time: Duration::from_secs(600),
            pool_valid_min_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::ValidationError(format!(
                "min_pool_size ({}) cannot exceed max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.max_idle_time.is_zero() {
            return Err(ConfigError::ValidationError(
                "max_idle_time must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Duration {
        (self.max_idle_time / 2).clamp(Duration::from_millis(1), MAX_REAPER_INTERVAL)
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
}

/// Whether a connection idle for `idle_for` has outlived its usefulness
pub fn is_expired(
    idle_for: Duration,
    max_idle_time: Duration,
    wait_timeout: Option<Duration>,
) -> bool {
    if idle_for > max_idle_time {
        return true;
    }
    match wait_timeout {
        Some(wait) if wait > WAIT_TIMEOUT_MARGIN => idle_for > wait - WAIT_TIMEOUT_MARGIN,
        _ => false,
    }
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
    last_used: Instant,
}

struct SharedPool<M: ManageConnection> {
    manager: M,
    options: PoolOptions,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    notify: Notify,
    total: AtomicUsize,
    pending: AtomicUsize,
    closing: AtomicBool,
    next_id: AtomicU64,
    busy: DashMap<u64, Arc<AtomicBool>>,
    last_error: Mutex<Option<DriverError>>,
    requests: mpsc::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<M: ManageConnection> SharedPool<M> {
    /// Claim a slot below `max_pool_size`
    fn try_reserve(&self) -> bool {
        let max = self.options.max_pool_size;
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| total.checked_sub(1));
    }

    /// Ask the appender for one more connection. Dropped when the queue is full.
    fn request_connection(&self) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if self.total.load(Ordering::Acquire) < self.options.max_pool_size {
            let _ = self.requests.try_send(());
        }
    }

    /// Waiters not already covered by an idle connection, or a pool below its minimum
    fn needs_connection(&self) -> bool {
        self.pending.load(Ordering::Acquire) > self.idle.lock().len()
            || self.total.load(Ordering::Acquire) < self.options.min_pool_size
    }

    fn pop_idle(&self) -> Option<IdleConnection<M::Connection>> {
        self.idle.lock().pop_back()
    }

    fn push_idle(&self, id: u64, conn: M::Connection) {
        self.idle.lock().push_back(IdleConnection {
            id,
            conn,
            last_used: Instant::now(),
        });
        self.notify.notify_one();
    }

    /// Drop a connection from the pool's accounting and close it in the background
    fn discard(self: &Arc<Self>, conn: M::Connection) {
        self.release_slot();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.manager.close(conn).await });
            }
            Err(_) => drop(conn),
        }
    }

    fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let total = self.total.load(Ordering::Acquire);
        PoolStats {
            total,
            active: total.saturating_sub(idle),
            idle,
            pending: self.pending.load(Ordering::Acquire),
        }
    }

    /// Create one connection if still wanted and a slot is free
    async fn add_connection(self: &Arc<Self>) {
        if self.closing.load(Ordering::Acquire) || !self.needs_connection() || !self.try_reserve()
        {
            return;
        }
        let slot = SlotGuard::new(self);

        let result =
            tokio::time::timeout(self.options.connect_timeout, self.manager.connect()).await;
        let result = match result {
            Ok(result) => result,
            Err(_) => Err(DriverError::timeout("connection creation")),
        };

        match result {
            Ok(conn) => {
                slot.disarm();
                if self.closing.load(Ordering::Acquire) {
                    self.discard(conn);
                    return;
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Pool created connection {} (total {})",
                    id,
                    self.total.load(Ordering::Acquire)
                );
                self.push_idle(id, conn);
            }
            Err(e) => {
                drop(slot);
                warn!("Pool failed to create connection: {}", e);
                *self.last_error.lock() = Some(e);
            }
        }
    }

    /// Evict expired idle connections while the pool is above its minimum size
    fn reap(self: &Arc<Self>, now: Instant) -> usize {
        let wait_timeout = self.manager.wait_timeout();
        let mut evicted = Vec::new();
        {
            let mut idle = self.idle.lock();
            let mut index = 0;
            // oldest connections sit at the front
            while index < idle.len() {
                let remaining = self.total.load(Ordering::Acquire).saturating_sub(evicted.len());
                if remaining <= self.options.min_pool_size {
                    break;
                }
                let idle_for = now.saturating_duration_since(idle[index].last_used);
                if is_expired(idle_for, self.options.max_idle_time, wait_timeout) {
                    if let Some(entry) = idle.remove(index) {
                        evicted.push(entry);
                    }
                } else {
                    index += 1;
                }
            }
        }

        let count = evicted.len();
        for entry in evicted {
            debug!("Evicting idle connection {}", entry.id);
            self.discard(entry.conn);
            self.request_connection();
        }
        if self.total.load(Ordering::Acquire) < self.options.min_pool_size {
            self.request_connection();
        }
        count
    }
}

/// Pool of connections produced by a `ManageConnection`
pub struct Pool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Build the pool, start its appender and reaper tasks and request
    /// `min_pool_size` connections. Must be called inside a tokio runtime.
    pub fn new(manager: M, options: PoolOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let (requests, receiver) = mpsc::channel(options.max_pool_size);
        let shared = Arc::new(SharedPool {
            manager,
            idle: Mutex::new(VecDeque::with_capacity(options.max_pool_size)),
            notify: Notify::new(),
            total: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            busy: DashMap::new(),
            last_error: Mutex::new(None),
            requests,
            tasks: Mutex::new(Vec::new()),
            options,
        });

        let appender = spawn_appender(Arc::downgrade(&shared), receiver);
        let reaper = spawn_reaper(Arc::downgrade(&shared), shared.options.reaper_interval());
        shared.tasks.lock().extend([appender, reaper]);

        for _ in 0..shared.options.min_pool_size {
            shared.request_connection();
        }
        info!(
            "Connection pool started (min {}, max {})",
            shared.options.min_pool_size, shared.options.max_pool_size
        );
        Ok(Self { shared })
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Check out a connection, waiting up to `connect_timeout`
    pub async fn get_connection(&self) -> DriverResult<PooledConnection<M>> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::Acquire) {
            return Err(DriverError::PoolClosed);
        }

        shared.pending.fetch_add(1, Ordering::AcqRel);
        let _pending = PendingGuard(&shared.pending);
        let deadline = tokio::time::Instant::now() + shared.options.connect_timeout;

        loop {
            if shared.closing.load(Ordering::Acquire) {
                return Err(DriverError::PoolClosed);
            }

            if let Some(mut entry) = shared.pop_idle() {
                if entry.last_used.elapsed() > shared.options.pool_valid_min_delay {
                    let valid = tokio::time::timeout(
                        shared.options.connect_timeout,
                        shared.manager.is_valid(&mut entry.conn),
                    )
                    .await;
                    if !matches!(valid, Ok(Ok(()))) {
                        debug!("Idle connection {} failed validation", entry.id);
                        shared.discard(entry.conn);
                        continue;
                    }
                }
                return Ok(self.checkout(entry));
            }

            shared.request_connection();

            let now = tokio::time::Instant::now();
            if now >= deadline {
                let last_error = shared.last_error.lock().take();
                return Err(DriverError::NoConnectionAvailable {
                    timeout: shared.options.connect_timeout,
                    last_error: last_error.map(Box::new),
                });
            }
            let wait = (deadline - now).min(WAIT_RETRY_INTERVAL);
            let _ = tokio::time::timeout(wait, shared.notify.notified()).await;
        }
    }

    fn checkout(&self, entry: IdleConnection<M::Connection>) -> PooledConnection<M> {
        let aborted = Arc::new(AtomicBool::new(false));
        self.shared.busy.insert(entry.id, Arc::clone(&aborted));
        PooledConnection {
            conn: Some(entry.conn),
            id: entry.id,
            pool: Arc::clone(&self.shared),
            aborted,
        }
    }

    /// Evict expired idle connections now, returning how many were removed
    pub fn reap_idle(&self) -> usize {
        self.shared.reap(Instant::now())
    }

    /// Stop accepting work, close idle connections and abort connections
    /// still checked out after the grace period
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing connection pool");

        for task in shared.tasks.lock().drain(..) {
            task.abort();
        }
        shared.notify.notify_waiters();

        let idle: Vec<_> = shared.idle.lock().drain(..).collect();
        let closed = idle.len();
        for entry in idle {
            shared.release_slot();
            shared.manager.close(entry.conn).await;
        }
        debug!("Closed {} idle connections", closed);

        let deadline = Instant::now() + shared.options.shutdown_grace;
        while !shared.busy.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut aborted = 0;
        for entry in shared.busy.iter() {
            entry.value().store(true, Ordering::Release);
            aborted += 1;
        }
        if aborted > 0 {
            warn!("Aborted {} connections still in use after grace period", aborted);
        }
    }
}

fn spawn_appender<M: ManageConnection>(
    pool: Weak<SharedPool<M>>,
    mut receiver: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while receiver.recv().await.is_some() {
            let Some(shared) = pool.upgrade() else {
                break;
            };
            shared.add_connection().await;
        }
    })
}

fn spawn_reaper<M: ManageConnection>(
    pool: Weak<SharedPool<M>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(shared) = pool.upgrade() else {
                break;
            };
            let evicted = shared.reap(Instant::now());
            if evicted > 0 {
                debug!("Reaper evicted {} idle connections", evicted);
            }
        }
    })
}

/// A reserved slot not yet backed by a connection. Released on drop, which
/// also covers the appender being aborted mid-connect.
struct SlotGuard<'a, M: ManageConnection> {
    pool: &'a SharedPool<M>,
    armed: bool,
}

impl<'a, M: ManageConnection> SlotGuard<'a, M> {
    fn new(pool: &'a SharedPool<M>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: ManageConnection> Drop for SlotGuard<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    id: u64,
    pool: Arc<SharedPool<M>>,
    aborted: Arc<AtomicBool>,
}

impl<M: ManageConnection> PooledConnection<M> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Set when the pool shut down while this connection was checked out
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn check_aborted(&self) -> DriverResult<()> {
        if self.is_aborted() {
            Err(DriverError::ConnectionAborted)
        } else {
            Ok(())
        }
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let pool = &self.pool;
        pool.busy.remove(&self.id);
        let Some(conn) = self.conn.take() else {
            return;
        };

        let closing = pool.closing.load(Ordering::Acquire);
        if closing || self.is_aborted() || pool.manager.has_broken(&conn) {
            debug!("Discarding connection {}", self.id);
            pool.discard(conn);
            if !closing {
                pool.request_connection();
            }
        } else {
            pool.push_idle(self.id, conn);
        }
    }
}

#[async_trait]
impl<M> Execute for PooledConnection<M>
where
    M: ManageConnection,
    M::Connection: Execute,
{
    async fn query(&mut self, sql: &str) -> DriverResult<QueryResult> {
        self.check_aborted()?;
        self.deref_mut().query(sql).await
    }

    async fn ping(&mut self) -> DriverResult<()> {
        self.check_aborted()?;
        self.deref_mut().ping().await
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DriverResult<()> {
        self.check_aborted()?;
        self.deref_mut().set_autocommit(autocommit).await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.check_aborted()?;
        self.deref_mut().commit().await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.check_aborted()?;
        self.deref_mut().rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct MockConnection {
        broken: bool,
        live: Arc<AtomicUsize>,
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Execute for MockConnection {
        async fn query(&mut self, _sql: &str) -> DriverResult<QueryResult> {
            Ok(QueryResult::default())
        }

        async fn ping(&mut self) -> DriverResult<()> {
            Ok(())
        }

        async fn set_autocommit(&mut self, _autocommit: bool) -> DriverResult<()> {
            Ok(())
        }

        async fn commit(&mut self) -> DriverResult<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> DriverResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockManager {
        created: AtomicUsize,
        live: Arc<AtomicUsize>,
        max_live: AtomicUsize,
        closed: AtomicUsize,
        validations: AtomicUsize,
        invalid: AtomicBool,
        fail: AtomicBool,
        delay: Duration,
        wait_timeout: Option<Duration>,
    }

    #[async_trait]
    impl ManageConnection for MockManager {
        type Connection = MockConnection;

        async fn connect(&self) -> DriverResult<MockConnection> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(MockConnection {
                broken: false,
                live: Arc::clone(&self.live),
            })
        }

        async fn is_valid(&self, _conn: &mut MockConnection) -> DriverResult<()> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            if self.invalid.load(Ordering::SeqCst) {
                Err(DriverError::ConnectionAborted)
            } else {
                Ok(())
            }
        }

        fn has_broken(&self, conn: &MockConnection) -> bool {
            conn.broken
        }

        fn wait_timeout(&self) -> Option<Duration> {
            self.wait_timeout
        }

        async fn close(&self, conn: MockConnection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }
    }

    fn options(min: usize, max: usize) -> PoolOptions {
        PoolOptions {
            max_pool_size: max,
            min_pool_size: min,
            max_idle_time: Duration::from_secs(600),
            pool_valid_min_delay: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(50),
        }
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let pool = Pool::new(MockManager::default(), options(0, 4)).unwrap();

        let first = pool.get_connection().await.unwrap();
        let id = first.id();
        assert!(format!("{first:?}").contains(&format!("id: {id}")));
        drop(first);

        let second = pool.get_connection().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(pool.manager().created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_most_recently_idle_first() {
        let pool = Pool::new(MockManager::default(), options(0, 4)).unwrap();

        let a = pool.get_connection().await.unwrap();
        let b = pool.get_connection().await.unwrap();
        let (id_a, id_b) = (a.id(), b.id());
        assert_ne!(id_a, id_b);

        drop(a);
        drop(b);
        let next = pool.get_connection().await.unwrap();
        assert_eq!(next.id(), id_b);
    }

    #[tokio::test]
    async fn test_warm_up_to_min_size() {
        let pool = Pool::new(MockManager::default(), options(3, 5)).unwrap();
        eventually(|| pool.stats().idle == 3).await;
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_total_never_exceeds_max_under_concurrency() {
        let manager = MockManager {
            delay: Duration::from_millis(5),
            ..Default::default()
        };
        let pool = Pool::new(manager, options(0, 4)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let mut conn = pool.get_connection().await.unwrap();
                    let stats = pool.stats();
                    assert!(stats.total <= 4, "total {} above max", stats.total);
                    assert!(stats.idle <= stats.total);
                    conn.query("SELECT 1").await.unwrap();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(pool.manager().max_live.load(Ordering::SeqCst) <= 4);
        assert!(pool.stats().total <= 4);
    }

    #[tokio::test]
    async fn test_timeout_reports_configured_value() {
        let mut opts = options(0, 1);
        opts.connect_timeout = Duration::from_millis(150);
        let pool = Pool::new(MockManager::default(), opts).unwrap();

        let _held = pool.get_connection().await.unwrap();
        let start = Instant::now();
        let err = pool.get_connection().await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(matches!(err, DriverError::NoConnectionAvailable { .. }));
        assert!(err.to_string().contains("150 ms"));
    }

    #[tokio::test]
    async fn test_creation_failure_is_reported() {
        let manager = MockManager::default();
        manager.fail.store(true, Ordering::SeqCst);
        let mut opts = options(0, 2);
        opts.connect_timeout = Duration::from_millis(200);
        let pool = Pool::new(manager, opts).unwrap();

        match pool.get_connection().await {
            Err(DriverError::NoConnectionAvailable { last_error, .. }) => {
                assert!(matches!(last_error.as_deref(), Some(DriverError::Network(_))));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connection should not be available"),
        }
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_idle_connection_validated_after_delay() {
        let mut opts = options(0, 2);
        opts.pool_valid_min_delay = Duration::from_millis(20);
        let pool = Pool::new(MockManager::default(), opts).unwrap();

        let first = pool.get_connection().await.unwrap();
        let id = first.id();
        drop(first);

        // reused right away: no validation
        drop(pool.get_connection().await.unwrap());
        assert_eq!(pool.manager().validations.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.manager().invalid.store(true, Ordering::SeqCst);
        let replacement = pool.get_connection().await.unwrap();
        assert_ne!(replacement.id(), id);
        assert_eq!(pool.manager().validations.load(Ordering::SeqCst), 1);
        eventually(|| pool.manager().closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(pool.stats().total, 1);

        // one replacement for one failed validation, nothing extra
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pool.manager().created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.manager().live.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_discarded_on_return() {
        let pool = Pool::new(MockManager::default(), options(0, 2)).unwrap();

        let mut conn = pool.get_connection().await.unwrap();
        let id = conn.id();
        conn.broken = true;
        drop(conn);

        eventually(|| pool.manager().closed.load(Ordering::SeqCst) == 1).await;
        let next = pool.get_connection().await.unwrap();
        assert_ne!(next.id(), id);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_reaper_evicts_down_to_min() {
        let mut opts = options(1, 4);
        opts.max_idle_time = Duration::from_secs(60);
        let pool = Pool::new(MockManager::default(), opts).unwrap();

        let held: Vec<_> = futures::future::join_all((0..3).map(|_| pool.get_connection()))
            .await
            .into_iter()
            .map(|c| c.unwrap())
            .collect();
        drop(held);
        assert_eq!(pool.stats().idle, pool.stats().total);
        let total = pool.stats().total;
        assert!(total >= 3);

        // nothing has been idle long enough yet
        assert_eq!(pool.shared.reap(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(pool.shared.reap(later), total - 1);
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_expiry_uses_server_wait_timeout() {
        let max_idle = Duration::from_secs(600);
        assert!(!is_expired(Duration::from_secs(100), max_idle, None));
        assert!(is_expired(Duration::from_secs(601), max_idle, None));
        // wait_timeout 120s leaves 75s before the server drops the session
        assert!(is_expired(Duration::from_secs(80), max_idle, Some(Duration::from_secs(120))));
        assert!(!is_expired(Duration::from_secs(70), max_idle, Some(Duration::from_secs(120))));
        // tiny server timeouts are ignored
        assert!(!is_expired(Duration::from_secs(70), max_idle, Some(Duration::from_secs(30))));
    }

    #[test]
    fn test_reaper_interval() {
        let mut opts = options(0, 1);
        assert_eq!(opts.reaper_interval(), MAX_REAPER_INTERVAL);
        opts.max_idle_time = Duration::from_secs(10);
        assert_eq!(opts.reaper_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_options_validation() {
        assert!(PoolOptions::default().validate().is_ok());
        assert!(options(2, 1).validate().is_err());
        assert!(options(0, 0).validate().is_err());
    }

    #[tokio::test]
    async fn test_close_aborts_busy_connections() {
        let pool = Pool::new(MockManager::default(), options(2, 4)).unwrap();
        eventually(|| pool.stats().idle == 2).await;

        let mut busy = pool.get_connection().await.unwrap();
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
        assert!(busy.is_aborted());
        assert!(matches!(
            busy.query("SELECT 1").await,
            Err(DriverError::ConnectionAborted)
        ));
        assert!(matches!(pool.get_connection().await, Err(DriverError::PoolClosed)));

        drop(busy);
        eventually(|| pool.stats().total == 0).await;
    }

    #[tokio::test]
    async fn test_close_during_connect_releases_slot() {
        let manager = MockManager {
            delay: Duration::from_millis(500),
            ..Default::default()
        };
        let pool = Pool::new(manager, options(1, 2)).unwrap();

        // warm-up holds a reserved slot while connecting
        eventually(|| pool.stats().total == 1).await;
        assert_eq!(pool.stats().idle, 0);

        pool.close().await;
        eventually(|| pool.stats().total == 0).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.manager().created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_returned_connections() {
        let mut opts = options(0, 2);
        opts.shutdown_grace = Duration::from_secs(5);
        let pool = Pool::new(MockManager::default(), opts).unwrap();

        let busy = pool.get_connection().await.unwrap();
        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!busy.is_aborted());
        drop(busy);

        closer.await.unwrap();
        eventually(|| pool.manager().closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(pool.stats().total, 0);
    }
}
