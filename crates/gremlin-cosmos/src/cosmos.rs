//! Caller-facing driver.
//!
//! Wraps a [`Pool`] with automatic retries of requests the status policy
//! classifies as retryable, sleeping the server-suggested backoff (or the
//! configured default) between attempts.

use std::{collections::BTreeMap, fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::{
    auth::{CredentialProvider, StaticCredentials},
    client::{Client, ResponseSink},
    config::{ConnectionConfig, PoolConfig, RetryConfig},
    error::{GremlinError, GremlinResult},
    metrics::Metrics,
    pool::{ConnectionFactory, Pool},
    protocol::{Bindings, Request, Response},
    retry::retry_delay,
    transport::WebSocketTransport,
};

/// Dials WebSocket connections for the pool.
struct WebSocketFactory {
    config: ConnectionConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
    metrics: Metrics,
}

#[async_trait]
impl ConnectionFactory for WebSocketFactory {
    async fn connect(&self) -> GremlinResult<Client> {
        let transport = WebSocketTransport::new(self.config.clone())?;
        let mut builder = Client::builder(Arc::new(transport))
            .config(&self.config)
            .metrics(self.metrics.clone());
        if let Some(credentials) = &self.credentials {
            builder = builder.credentials(Arc::clone(credentials));
        }
        builder.connect().await
    }
}

/// Builder for [`Cosmos`].
pub struct CosmosBuilder {
    connection: ConnectionConfig,
    pool: PoolConfig,
    retry: RetryConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
    metrics: Option<Metrics>,
}

impl CosmosBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            credentials: None,
            metrics: None,
        }
    }

    /// Replace the connection settings; the URL given to the builder is kept
    /// unless the config carries one.
    #[must_use]
    pub fn connection_config(mut self, mut config: ConnectionConfig) -> Self {
        if config.url.is_empty() {
            config.url = std::mem::take(&mut self.connection.url);
        }
        self.connection = config;
        self
    }

    /// Pool settings.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Retry settings.
    #[must_use]
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Fixed username and password.
    #[must_use]
    pub fn static_credentials(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials(StaticCredentials::new(username, password))
    }

    /// Credential provider consulted on every authentication challenge.
    #[must_use]
    pub fn credentials<C>(mut self, credentials: C) -> Self
    where
        C: CredentialProvider + 'static,
    {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Metrics handle shared by the pool and its connections.
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and build the driver.
    ///
    /// No connection is opened until the first request.
    pub fn build(self) -> GremlinResult<Cosmos> {
        self.connection.validate().map_err(GremlinError::config)?;
        self.retry.validate().map_err(GremlinError::config)?;
        // Fail fast on a bad URL scheme.
        WebSocketTransport::new(self.connection.clone())?;

        let metrics = self.metrics.unwrap_or_default();
        let factory = WebSocketFactory {
            config: self.connection,
            credentials: self.credentials,
            metrics: metrics.clone(),
        };
        Cosmos::with_factory(factory, self.pool, self.retry, metrics)
    }
}

/// Gremlin driver for CosmosDB.
#[derive(Clone)]
pub struct Cosmos {
    pool: Pool,
    retry: RetryConfig,
    metrics: Metrics,
}

impl fmt::Debug for Cosmos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cosmos")
            .field("pool", &self.pool)
            .field("max_retries", &self.retry.max_retries)
            .finish()
    }
}

impl Cosmos {
    /// Start building a driver for a `ws://` or `wss://` endpoint.
    pub fn builder(url: impl Into<String>) -> CosmosBuilder {
        CosmosBuilder::new(url)
    }

    /// Build a driver over connections produced by a custom factory.
    pub fn with_factory<F>(
        factory: F,
        pool: PoolConfig,
        retry: RetryConfig,
        metrics: Metrics,
    ) -> GremlinResult<Self>
    where
        F: ConnectionFactory,
    {
        retry.validate().map_err(GremlinError::config)?;
        let pool = Pool::new(factory, pool, metrics.clone())?;
        Ok(Self {
            pool,
            retry,
            metrics,
        })
    }

    /// Run a query.
    pub async fn execute(&self, query: impl Into<String>) -> GremlinResult<Vec<Response>> {
        self.execute_request(Request::eval(query)).await
    }

    /// Run a parameterized query with traversal source rebindings.
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

    /// Run the query stored in a file.
    pub async fn execute_file(&self, path: impl AsRef<Path>) -> GremlinResult<Vec<Response>> {
        let query = tokio::fs::read_to_string(path.as_ref()).await?;
        self.execute(query).await
    }

    /// Send a prepared request, retrying it while the server asks for it.
    pub async fn execute_request(&self, request: Request) -> GremlinResult<Vec<Response>> {
        let started = Instant::now();
        let mut request = request;
        let mut attempt = 0u32;

        loop {
            match self.pool.execute_request(request.clone()).await {
                Ok(responses) => {
                    self.metrics.record_success(&responses, started.elapsed());
                    return Ok(responses);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = retry_delay(&self.retry, attempt, e.retry_after());
                    attempt += 1;
                    info!(
                        request_id = %request.id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying Gremlin request"
                    );
                    self.metrics.record_retry(backoff);
                    sleep(backoff).await;
                    request = request.reissue();
                }
                Err(e) => {
                    debug!(request_id = %request.id(), error = %e, "Gremlin request failed");
                    self.metrics.record_error(&e, started.elapsed());
                    return Err(e);
                }
            }
        }
    }

    /// Run a query and stream each envelope into `sink`.
    ///
    /// Returns once the request is dispatched; the sink is closed after the
    /// terminal envelope. Streaming requests are not retried.
    pub async fn execute_async(
        &self,
        query: impl Into<String>,
        sink: ResponseSink,
    ) -> GremlinResult<()> {
        self.pool.execute_async(Request::eval(query), sink).await
    }

    /// Health check: report whether a pooled connection is connected.
    ///
    /// Never waits on a saturated pool; while every connection is leased the
    /// driver counts as connected.
    pub async fn is_connected(&self) -> bool {
        match self.pool.try_lease().await {
            Ok(Some(connection)) => connection.is_connected(),
            Ok(None) => self.pool.active() > 0,
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        }
    }

    /// Close the pool; further requests fail with [`GremlinError::PoolClosed`].
    pub async fn stop(&self) {
        self.pool.close().await;
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The metrics handle.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
