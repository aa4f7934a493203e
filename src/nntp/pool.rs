use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::config::Provider;
use crate::nntp::ArticleSource;
use crate::nntp::connection::NntpConnection;
use crate::nntp::error::NntpError;
use crate::nntp::speed::SpeedMeter;

/// Bounded pool of authenticated connections to a single provider.
///
/// The semaphore enforces the hard `max_connections` cap and queues waiters
/// FIFO; dropping a waiting future is prompt cancellation. Checked-out
/// connections return through the RAII guard: healthy ones go back to the
/// idle set, broken ones are closed and replaced lazily on a later
/// checkout.
pub struct ConnectionPool {
    provider: Provider,
    semaphore: Arc<Semaphore>,
    idle: std::sync::Mutex<Vec<NntpConnection>>,
    meter: SpeedMeter,
    active: AtomicUsize,
    articles_served: AtomicU64,
    shut_down: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub host: String,
    pub active: usize,
    pub idle: usize,
    pub max_connections: usize,
    pub speed_mbps: f64,
    pub articles_served: u64,
}

impl ConnectionPool {
    pub fn new(provider: Provider) -> Arc<Self> {
        let max = provider.max_connections.max(1);
        Arc::new(Self {
            provider,
            semaphore: Arc::new(Semaphore::new(max)),
            idle: std::sync::Mutex::new(Vec::new()),
            meter: SpeedMeter::new(),
            active: AtomicUsize::new(0),
            articles_served: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Single authenticated handshake probe. Failure means the pool is not
    /// registered at bootstrap (or reload).
    pub async fn validate(&self) -> Result<(), NntpError> {
        let conn = NntpConnection::connect(&self.provider, self.meter.clone()).await?;
        conn.quit().await;
        info!(host = %self.provider.host, "provider validated");
        Ok(())
    }

    pub async fn checkout(&self) -> Result<PooledConnection<'_>, NntpError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(NntpError::Shutdown);
        }

        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| NntpError::Shutdown)?;

        let reused = self.idle.lock().unwrap().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => NntpConnection::connect(&self.provider, self.meter.clone()).await?,
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
            healthy: true,
        })
    }

    pub fn speed_mbps(&self) -> f64 {
        self.meter.mbps()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            host: self.provider.host.clone(),
            active: self.active.load(Ordering::Relaxed),
            idle: self.idle.lock().unwrap().len(),
            max_connections: self.provider.max_connections,
            speed_mbps: self.meter.mbps(),
            articles_served: self.articles_served.load(Ordering::Relaxed),
        }
    }

    /// Stop handing out connections and drop the idle set. Outstanding
    /// guards drain as they are returned.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.semaphore.close();
        let drained = {
            let mut idle = self.idle.lock().unwrap();
            std::mem::take(&mut *idle)
        };
        debug!(host = %self.provider.host, idle = drained.len(), "pool shut down");
    }

    fn give_back(&self, conn: NntpConnection, healthy: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if healthy && !self.shut_down.load(Ordering::Acquire) {
            self.idle.lock().unwrap().push(conn);
        }
        // An unhealthy connection just drops; the socket closes with it.
    }
}

/// RAII checkout guard. Dereferences to the underlying connection; call
/// [`PooledConnection::mark_broken`] before dropping on any protocol or
/// transport failure.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<NntpConnection>,
    _permit: SemaphorePermit<'a>,
    healthy: bool,
}

impl PooledConnection<'_> {
    pub fn mark_broken(&mut self) {
        self.healthy = false;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = NntpConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.healthy);
        }
    }
}

#[async_trait]
impl ArticleSource for ConnectionPool {
    fn host(&self) -> &str {
        &self.provider.host
    }

    fn priority(&self) -> u8 {
        self.provider.priority
    }

    fn enabled(&self) -> bool {
        self.provider.enabled
    }

    async fn stat(&self, message_id: &str) -> Result<bool, NntpError> {
        let mut conn = self.checkout().await?;
        match conn.stat(message_id).await {
            Ok(found) => Ok(found),
            Err(e) => {
                conn.mark_broken();
                Err(e)
            }
        }
    }

    async fn body(&self, message_id: &str) -> Result<Bytes, NntpError> {
        let mut conn = self.checkout().await?;
        match conn.body(message_id).await {
            Ok(bytes) => {
                self.articles_served.fetch_add(1, Ordering::Relaxed);
                Ok(bytes)
            }
            Err(e) => self.fail_fetch(&mut conn, message_id, e),
        }
    }

    async fn article(&self, message_id: &str) -> Result<Bytes, NntpError> {
        let mut conn = self.checkout().await?;
        match conn.article(message_id).await {
            Ok(bytes) => {
                self.articles_served.fetch_add(1, Ordering::Relaxed);
                Ok(bytes)
            }
            Err(e) => self.fail_fetch(&mut conn, message_id, e),
        }
    }

    async fn head(&self, message_id: &str) -> Result<Bytes, NntpError> {
        let mut conn = self.checkout().await?;
        match conn.head(message_id).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => self.fail_fetch(&mut conn, message_id, e),
        }
    }

    async fn group(&self, name: &str) -> Result<String, NntpError> {
        let mut conn = self.checkout().await?;
        match conn.group(name).await {
            Ok(line) => Ok(line),
            Err(e) if e.is_missing() => Err(e),
            Err(e) => {
                conn.mark_broken();
                Err(e)
            }
        }
    }
}

impl ConnectionPool {
    fn fail_fetch(
        &self,
        conn: &mut PooledConnection<'_>,
        message_id: &str,
        e: NntpError,
    ) -> Result<Bytes, NntpError> {
        // A miss leaves the connection at the prompt; anything else is a
        // transport or protocol fault and the connection is closed.
        if !e.is_missing() {
            warn!(host = %self.provider.host, %message_id, error = %e, "fetch failed, closing connection");
            conn.mark_broken();
        }
        Err(e)
    }
}
