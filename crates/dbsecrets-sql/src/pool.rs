//! Connection pool for SQL backends
//!
//! A bounded pool sized from the plugin configuration:
//! - `max_open_connections` caps concurrent sessions
//! - `max_idle_connections` caps sessions kept between operations
//! - `max_connection_lifetime` recycles sessions by age (zero means never)
//!
//! # Example
//!
//! ```rust,ignore
//! use dbsecrets_sql::pool::{PoolConfig, SimpleConnectionPool};
//!
//! let pool = SimpleConnectionPool::new(PoolConfig::default(), factory);
//! let conn = pool.get().await?;
//! conn.execute("SELECT 1", &[]).await?;
//! // Connection is returned to pool when dropped
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::debug;

use dbsecrets_plugin::config::ConnectionConfig;
use dbsecrets_plugin::{Error, Result};

use crate::connection::{Connection, ConnectionFactory};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open connections
    pub max_open: usize,
    /// Maximum idle connections kept for reuse
    pub max_idle: usize,
    /// Maximum connection lifetime; zero means unlimited
    pub max_lifetime: Duration,
    /// Timeout to acquire a connection
    pub acquire_timeout: Duration,
    /// Whether to test connections on return
    pub test_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 4,
            max_idle: 4,
            max_lifetime: Duration::ZERO,
            acquire_timeout: Duration::from_secs(30),
            test_on_return: true,
        }
    }
}

impl PoolConfig {
    /// Pool limits from the shared connection keys
    pub fn from_connection(config: &ConnectionConfig) -> Self {
        Self {
            max_open: config.max_open_connections.max(1) as usize,
            max_idle: config.max_idle_connections as usize,
            max_lifetime: config.max_connection_lifetime,
            ..Default::default()
        }
    }

    /// Set maximum open connections
    pub fn with_max_open(mut self, size: usize) -> Self {
        self.max_open = size.max(1);
        self
    }

    /// Set maximum idle connections
    pub fn with_max_idle(mut self, size: usize) -> Self {
        self.max_idle = size;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<SimpleConnectionPool>,
}

impl PooledConnection {
    /// Get the underlying connection
    pub fn connection(&self) -> &(dyn Connection + 'static) {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }

    /// Return the connection to the pool now rather than on drop
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.created_at).await;
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .field("returned", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let created_at = self.created_at;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.return_connection(conn, created_at).await;
                    });
                }
                Err(_) => pool.discard(),
            }
        }
    }
}

/// Idle connection with its metadata
struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
}

/// Bounded connection pool.
///
/// A semaphore limits open sessions; idle sessions are reused LIFO.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Semaphore,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
    self_ref: OnceCell<Weak<Self>>,
}

impl SimpleConnectionPool {
    /// Create a new, empty pool. Sessions are opened on demand.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let pool = Arc::new(Self {
            semaphore: Semaphore::new(config.max_open.max(1)),
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            shutdown: AtomicBool::new(false),
            self_ref: OnceCell::new(),
        });
        let _ = pool.self_ref.set(Arc::downgrade(&pool));
        pool
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn is_expired(&self, created_at: Instant) -> bool {
        !self.config.max_lifetime.is_zero() && created_at.elapsed() > self.config.max_lifetime
    }

    fn record_closed(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Borrow a connection, opening a new session when no idle one is usable
    pub async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::reachability("connection pool is closed"));
        }

        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                Error::reachability(format!(
                    "timed out after {}ms waiting for a connection",
                    self.config.acquire_timeout.as_millis()
                ))
            })?
            .map_err(|_| Error::reachability("connection pool is closed"))?;

        let reused = {
            let mut idle = self.idle.lock().await;
            let mut found = None;
            while let Some(entry) = idle.pop() {
                if self.is_expired(entry.created_at) {
                    debug!("recycling connection past its maximum lifetime");
                    let _ = entry.conn.close().await;
                    self.record_closed();
                    continue;
                }
                found = Some(entry);
                break;
            }
            found
        };

        let entry = match reused {
            Some(entry) => entry,
            None => {
                let conn = self.factory.connect().await?;
                self.total_connections.fetch_add(1, Ordering::AcqRel);
                self.stats.connections_created.fetch_add(1, Ordering::Relaxed);
                PoolEntry {
                    conn,
                    created_at: Instant::now(),
                }
            }
        };

        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        let pool = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::internal("connection pool has been dropped"))?;

        // Released again in return_connection
        permit.forget();
        Ok(PooledConnection {
            conn: Some(entry.conn),
            created_at: entry.created_at,
            pool,
        })
    }

    // The permit goes back only once the session is idle or closed, so a
    // waiter never opens a session while this one is still counted.
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        let keep = !self.shutdown.load(Ordering::Acquire)
            && !self.is_expired(created_at)
            && (!self.config.test_on_return || conn.is_valid().await);

        if keep {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.config.max_idle {
                idle.push(PoolEntry { conn, created_at });
                self.semaphore.add_permits(1);
                return;
            }
        } else if self.config.test_on_return && !self.shutdown.load(Ordering::Acquire) {
            self.stats
                .health_check_failures
                .fetch_add(1, Ordering::Relaxed);
        }

        let _ = conn.close().await;
        self.record_closed();
        self.semaphore.add_permits(1);
    }

    fn discard(&self) {
        self.record_closed();
        self.semaphore.add_permits(1);
    }

    /// Current number of open sessions
    pub fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Close idle sessions and refuse further borrows.
    ///
    /// Borrowed sessions are closed as they come back.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            if let Err(e) = entry.conn.close().await {
                debug!(error = %e, "error closing pooled connection");
            }
            self.record_closed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DatabaseType, Transaction};
    use crate::types::{Row, Value};
    use async_trait::async_trait;

    struct NullConnection {
        valid: Arc<AtomicBool>,
        check_delay: Duration,
    }

    #[async_trait]
    impl Connection for NullConnection {
        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }

        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Err(Error::unsupported("transactions"))
        }

        async fn is_valid(&self) -> bool {
            if !self.check_delay.is_zero() {
                tokio::time::sleep(self.check_delay).await;
            }
            self.valid.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        valid: Arc<AtomicBool>,
        check_delay: Duration,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullConnection {
                valid: self.valid.clone(),
                check_delay: self.check_delay,
            }))
        }

        fn database_type(&self) -> DatabaseType {
            DatabaseType::PostgreSQL
        }
    }

    fn factory() -> Arc<CountingFactory> {
        let factory = CountingFactory::default();
        factory.valid.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    fn slow_check_factory(delay: Duration) -> Arc<CountingFactory> {
        let factory = CountingFactory {
            check_delay: delay,
            ..Default::default()
        };
        factory.valid.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::default()
            .with_max_open(0)
            .with_max_idle(2)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_max_lifetime(Duration::from_secs(60));

        assert_eq!(config.max_open, 1);
        assert_eq!(config.max_idle, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.max_lifetime, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_connection_reused_after_return() {
        let factory = factory();
        let pool = SimpleConnectionPool::new(PoolConfig::default(), factory.clone());

        drop(pool.get().await.unwrap());
        settle().await;
        drop(pool.get().await.unwrap());
        settle().await;

        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().acquisitions, 2);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_reuses_connection_still_being_returned() {
        let factory = slow_check_factory(Duration::from_millis(50));
        let pool = SimpleConnectionPool::new(PoolConfig::default().with_max_open(1), factory.clone());

        let conn = pool.get().await.unwrap();
        let returning = tokio::spawn(conn.release());
        settle().await;

        let second = pool.get().await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);

        returning.await.unwrap();
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sessions_never_exceed_limit_while_closing() {
        let factory = slow_check_factory(Duration::from_millis(50));
        let pool = SimpleConnectionPool::new(
            PoolConfig::default().with_max_open(1).with_max_idle(0),
            factory.clone(),
        );

        let conn = pool.get().await.unwrap();
        let returning = tokio::spawn(conn.release());
        settle().await;

        let second = pool.get().await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.stats().connections_closed, 1);

        returning.await.unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_pooled_connection_debug() {
        let pool = SimpleConnectionPool::new(PoolConfig::default(), factory());
        let conn = pool.get().await.unwrap();
        assert!(format!("{conn:?}").contains("PooledConnection"));
    }

    #[tokio::test]
    async fn test_invalid_connection_discarded_on_return() {
        let factory = factory();
        let pool = SimpleConnectionPool::new(PoolConfig::default(), factory.clone());

        let conn = pool.get().await.unwrap();
        factory.valid.store(false, Ordering::SeqCst);
        drop(conn);
        settle().await;

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().health_check_failures, 1);
    }

    #[tokio::test]
    async fn test_idle_limit() {
        let factory = factory();
        let pool = SimpleConnectionPool::new(
            PoolConfig::default().with_max_open(3).with_max_idle(1),
            factory.clone(),
        );

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        drop(a);
        drop(b);
        settle().await;

        assert_eq!(pool.size(), 1);
        assert_eq!(pool.stats().connections_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let pool = SimpleConnectionPool::new(
            PoolConfig::default()
                .with_max_open(1)
                .with_acquire_timeout(Duration::from_millis(50)),
            factory(),
        );

        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let pool = SimpleConnectionPool::new(PoolConfig::default(), factory());
        drop(pool.get().await.unwrap());
        settle().await;

        pool.close().await.unwrap();
        assert_eq!(pool.size(), 0);
        assert!(pool.get().await.is_err());
    }
}
