//! Bounded connection pool.
//!
//! Idle connections are kept most-recently-used first. All pool state lives
//! behind one mutex; blocked leases wait on a [`Notify`] registered before
//! the state is checked, so a release between the check and the wait is
//! never missed.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    future::Future,
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

use crate::{
    client::{Client, ResponseSink},
    config::PoolConfig,
    error::{GremlinError, GremlinResult},
    metrics::Metrics,
    protocol::{Bindings, Request, Response},
    status,
};

/// Creates new connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Dial and set up one connection.
    async fn connect(&self) -> GremlinResult<Client>;
}

#[async_trait]
impl<F, Fut> ConnectionFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GremlinResult<Client>> + Send,
{
    async fn connect(&self) -> GremlinResult<Client> {
        (self)().await
    }
}

struct IdleConnection {
    client: Arc<Client>,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    active: usize,
    closed: bool,
}

struct PoolInner {
    factory: Box<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    metrics: Metrics,
}

/// Pool of correlator connections; cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("max_active", &self.inner.config.max_active)
            .field("active", &state.active)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}

enum Lease {
    Reuse(Arc<Client>),
    Dial,
    Wait,
}

impl Pool {
    /// Create a pool.
    pub fn new<F>(factory: F, config: PoolConfig, metrics: Metrics) -> GremlinResult<Self>
    where
        F: ConnectionFactory,
    {
        config.validate().map_err(GremlinError::config)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory: Box::new(factory),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                    closed: false,
                }),
                available: Notify::new(),
                metrics,
            }),
        })
    }

    /// Lease a connection, waiting while the pool is at capacity.
    ///
    /// Reuses the most recently idled healthy connection, otherwise dials a
    /// new one if below `max_active`.
    pub async fn lease(&self) -> GremlinResult<PooledConnection> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.reserve()? {
                Lease::Reuse(client) => return Ok(self.reuse(client)),
                Lease::Dial => return self.dial().await,
                Lease::Wait => notified.await,
            }
        }
    }

    /// Lease a connection without waiting.
    ///
    /// Returns `None` when every connection is leased and the pool is at
    /// capacity. May still dial a new connection.
    pub async fn try_lease(&self) -> GremlinResult<Option<PooledConnection>> {
        match self.reserve()? {
            Lease::Reuse(client) => Ok(Some(self.reuse(client))),
            Lease::Dial => self.dial().await.map(Some),
            Lease::Wait => Ok(None),
        }
    }

    fn reserve(&self) -> GremlinResult<Lease> {
        let (lease, evicted) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(GremlinError::PoolClosed);
            }

            let evicted = purge_locked(&mut state, self.inner.config.idle_timeout);
            let lease = if let Some(idle) = state.idle.pop_front() {
                state.active += 1;
                Lease::Reuse(idle.client)
            } else if state.active < self.inner.config.max_active {
                state.active += 1;
                Lease::Dial
            } else {
                Lease::Wait
            };
            (lease, evicted)
        };
        self.discard(evicted);
        Ok(lease)
    }

    fn reuse(&self, client: Arc<Client>) -> PooledConnection {
        self.inner.metrics.pool_idle_delta(-1);
        self.inner.metrics.pool_active_delta(1);
        PooledConnection::new(client, Arc::clone(&self.inner))
    }

    async fn dial(&self) -> GremlinResult<PooledConnection> {
        let inner = &self.inner;
        let mut slot = DialSlot {
            inner,
            armed: true,
        };
        let client = inner.factory.connect().await.inspect_err(|e| {
            warn!(error = %e, "Failed to open pooled connection");
            inner.metrics.record_connection_error(e);
        })?;
        slot.armed = false;

        debug!("Opened pooled connection");
        inner.metrics.pool_active_delta(1);
        Ok(PooledConnection::new(Arc::new(client), Arc::clone(inner)))
    }

    /// Drop idle connections that are unhealthy or idle past the timeout.
    pub fn purge(&self) {
        let evicted = {
            let mut state = self.inner.state.lock();
            purge_locked(&mut state, self.inner.config.idle_timeout)
        };
        self.discard(evicted);
    }

    fn discard(&self, evicted: Vec<Arc<Client>>) {
        if evicted.is_empty() {
            return;
        }
        debug!(count = evicted.len(), "Evicting idle connections");
        self.inner.metrics.pool_idle_delta(-(evicted.len() as i64));
        close_in_background(evicted);
    }

    /// Run a query on a leased connection.
    ///
    /// Error statuses are turned into [`GremlinError::Status`] by the
    /// retry/status policy.
    pub async fn execute(&self, query: impl Into<String>) -> GremlinResult<Vec<Response>> {
        self.execute_request(Request::eval(query)).await
    }

    /// Run a parameterized query on a leased connection.
    pub async fn execute_with_bindings(
        &self,
        query: impl Into<String>,
        bindings: Bindings,
        rebindings: BTreeMap<String, String>,
    ) -> GremlinResult<Vec<Response>> {
        let request = Request::eval(query)
            .with_bindings(bindings)
            .with_rebindings(rebindings);
        self.execute_request(request).await
    }

    /// Send a prepared request on a leased connection.
    pub async fn execute_request(&self, request: Request) -> GremlinResult<Vec<Response>> {
        let connection = self.lease().await?;
        let result = connection
            .execute_request(request)
            .await
            .and_then(status::into_result);

        if let Err(e) = &result
            && e.is_network_error()
        {
            connection.mark_errored();
        }
        result
    }

    /// Stream a request's envelopes into `sink`.
    ///
    /// The connection is released once the terminal envelope was delivered
    /// or the receiver was dropped.
    pub async fn execute_async(&self, request: Request, sink: ResponseSink) -> GremlinResult<()> {
        let connection = self.lease().await?;
        let delivery = match connection.dispatch_stream(request, sink).await {
            Ok(delivery) => delivery,
            Err(e) => {
                if e.is_network_error() {
                    connection.mark_errored();
                }
                return Err(e);
            }
        };
        tokio::spawn(async move {
            if let Err(e) = delivery.await {
                warn!(error = %e, "Streaming delivery task failed");
                connection.mark_errored();
            }
            drop(connection);
        });
        Ok(())
    }

    /// Close every idle connection and refuse further leases.
    ///
    /// Leased connections are closed when they are released.
    pub async fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_waiters();
        self.inner.metrics.pool_idle_delta(-(idle.len() as i64));

        for connection in idle {
            if let Err(e) = connection.client.close().await {
                debug!(error = %e, "Error closing idle connection");
            }
        }
        debug!("Connection pool closed");
    }

    /// Connections currently leased.
    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Connections currently idle.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Capacity bound.
    pub fn max_active(&self) -> usize {
        self.inner.config.max_active
    }

    /// Idle timeout; zero means idle connections never expire.
    pub fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl PoolInner {
    fn release(&self, client: Arc<Client>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        self.metrics.pool_active_delta(-1);

        if state.closed {
            drop(state);
            close_in_background(vec![client]);
        } else {
            state.idle.push_front(IdleConnection {
                client,
                since: Instant::now(),
            });
            self.metrics.pool_idle_delta(1);
            drop(state);
        }
        self.available.notify_one();
    }
}

fn purge_locked(state: &mut PoolState, idle_timeout: Duration) -> Vec<Arc<Client>> {
    let now = Instant::now();
    let mut evicted = Vec::new();

    state.idle.retain(|idle| {
        let expired = !idle_timeout.is_zero() && now.duration_since(idle.since) > idle_timeout;
        if expired || !idle.client.is_healthy() {
            evicted.push(Arc::clone(&idle.client));
            false
        } else {
            true
        }
    });
    evicted
}

fn close_in_background(clients: Vec<Arc<Client>>) {
    // Without a runtime, dropping the clients still stops their loops.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        for client in clients {
            if let Err(e) = client.close().await
                && !matches!(e, GremlinError::AlreadyClosed)
            {
                debug!(error = %e, "Error closing evicted connection");
            }
        }
    });
}

/// Gives the capacity slot back if dialing fails or is cancelled.
struct DialSlot<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);
            drop(state);
            self.inner.available.notify_one();
        }
    }
}

/// A leased connection, returned to the pool when dropped.
pub struct PooledConnection {
    client: Arc<Client>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(client: Arc<Client>, pool: Arc<PoolInner>) -> Self {
        Self { client, pool }
    }
}

impl Deref for PooledConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.client).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.client));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transport::{ChannelPeer, ChannelTransport, Transport};

    struct CountingFactory {
        dialed: Arc<AtomicUsize>,
        peers: Arc<Mutex<Vec<ChannelPeer>>>,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn connect(&self) -> GremlinResult<Client> {
            if self.fail {
                return Err(GremlinError::connection("dial refused"));
            }
            self.dialed.fetch_add(1, Ordering::SeqCst);
            let (transport, peer) = ChannelTransport::pair();
            self.peers.lock().push(peer);
            Client::builder(Arc::new(transport) as Arc<dyn Transport>)
                .connect()
                .await
        }
    }

    fn pool(max_active: usize, idle_timeout: Duration, fail: bool) -> (Pool, Arc<AtomicUsize>) {
        let dialed = Arc::new(AtomicUsize::new(0));
        let factory = CountingFactory {
            dialed: Arc::clone(&dialed),
            peers: Arc::new(Mutex::new(Vec::new())),
            fail,
        };
        let pool = Pool::new(
            factory,
            PoolConfig::new(max_active, idle_timeout),
            Metrics::noop(),
        )
        .unwrap();
        (pool, dialed)
    }

    type Transports = Arc<Mutex<Vec<Arc<ChannelTransport>>>>;

    /// Pool whose connections ping every 20ms; the transports stay reachable
    /// so tests can break them.
    fn keepalive_pool(close_on_dial: bool) -> (Pool, Transports) {
        let transports: Transports = Arc::new(Mutex::new(Vec::new()));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let transports = Arc::clone(&transports);
            move || {
                let transports = Arc::clone(&transports);
                let peers = Arc::clone(&peers);
                async move {
                    let (transport, peer) = ChannelTransport::pair();
                    let transport = Arc::new(transport);
                    transports.lock().push(Arc::clone(&transport));
                    peers.lock().push(peer);

                    let client = Client::builder(transport as Arc<dyn Transport>)
                        .ping_interval(Duration::from_millis(20))
                        .connect()
                        .await?;
                    if close_on_dial {
                        client.close().await?;
                    }
                    Ok::<_, GremlinError>(client)
                }
            }
        };
        let pool = Pool::new(
            factory,
            PoolConfig::new(1, Duration::ZERO),
            Metrics::noop(),
        )
        .unwrap();
        (pool, transports)
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = Pool::new(
            || async { Err::<Client, _>(GremlinError::connection("unused")) },
            PoolConfig::new(0, Duration::ZERO),
            Metrics::noop(),
        )
        .unwrap_err();
        assert!(matches!(err, GremlinError::Config { .. }));
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let (pool, dialed) = pool(2, Duration::ZERO, false);

        let conn = pool.lease().await.unwrap();
        assert_eq!(pool.active(), 1);
        drop(conn);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.idle(), 1);

        let _conn = pool.lease().await.unwrap();
        assert_eq!(dialed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let (pool, _) = pool(2, Duration::ZERO, false);

        let first = pool.lease().await.unwrap();
        let second = pool.lease().await.unwrap();
        let second_ptr: *const Client = &*second;
        drop(first);
        drop(second);

        let warm = pool.lease().await.unwrap();
        assert!(std::ptr::eq(&*warm, second_ptr));
    }

    #[tokio::test]
    async fn test_dial_failure_frees_slot() {
        let (pool, _) = pool(1, Duration::ZERO, true);

        assert!(pool.lease().await.is_err());
        assert_eq!(pool.active(), 0);
        assert!(pool.lease().await.is_err());
    }

    #[tokio::test]
    async fn test_purge_drops_unhealthy() {
        let (pool, dialed) = pool(1, Duration::ZERO, false);

        let conn = pool.lease().await.unwrap();
        conn.mark_errored();
        drop(conn);
        assert_eq!(pool.idle(), 1);

        pool.purge();
        assert_eq!(pool.idle(), 0);

        let _conn = pool.lease().await.unwrap();
        assert_eq!(dialed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_keepalive_is_purged() {
        let (pool, transports) = keepalive_pool(false);
        drop(pool.lease().await.unwrap());
        assert_eq!(pool.idle(), 1);

        transports.lock()[0].fail_writes(true);
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.inner.state.lock().idle[0].client.is_healthy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.purge();
        assert_eq!(pool.idle(), 0);
        let conn = pool.lease().await.unwrap();
        assert!(conn.is_healthy());
        assert_eq!(transports.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stream_dispatch_failure_marks_connection() {
        let (pool, _transports) = keepalive_pool(true);
        let (sink, _items) = tokio::sync::mpsc::channel(1);

        let err = pool
            .execute_async(Request::eval("g.V()"), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, GremlinError::NoConnection { .. }));
        assert_eq!(pool.active(), 0);
        assert!(pool.inner.state.lock().idle[0].client.has_errored());
    }

    #[tokio::test]
    async fn test_try_lease_does_not_wait() {
        let (pool, dialed) = pool(1, Duration::ZERO, false);

        let held = pool.try_lease().await.unwrap().unwrap();
        assert!(pool.try_lease().await.unwrap().is_none());
        drop(held);

        assert!(pool.try_lease().await.unwrap().is_some());
        assert_eq!(dialed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_leases() {
        let (pool, _) = pool(1, Duration::ZERO, false);
        drop(pool.lease().await.unwrap());

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle(), 0);
        assert!(matches!(pool.lease().await, Err(GremlinError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_lease() {
        let (pool, _) = pool(1, Duration::ZERO, false);
        let held = pool.lease().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.lease().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(GremlinError::PoolClosed)));
        drop(held);
        assert_eq!(pool.active(), 0);
    }
}
