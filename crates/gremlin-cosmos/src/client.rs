//! Request/response correlator over one transport connection.
//!
//! Every connection runs three background tasks:
//! - a write loop draining the bounded outbound queue into the transport
//! - a read loop decoding frames and routing them to pending requests
//! - a keepalive loop pinging the server on a fixed interval
//!
//! Authentication challenges (status 407) are answered in-band with an
//! authentication request carrying the same request id, so the original
//! caller receives the real result of its query.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, interval_at, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    auth::CredentialProvider,
    config::ConnectionConfig,
    error::{GremlinError, GremlinResult},
    metrics::Metrics,
    pending::{Delivery, PendingGuard, PendingStore},
    protocol::{
        Bindings, Request, RequestId, Response, decode_response, encode_request, status_code,
    },
    status,
    transport::{Frame, Transport},
};

/// Sink receiving the envelopes of a streaming request.
pub type ResponseSink = mpsc::Sender<GremlinResult<Response>>;

struct Outbound {
    id: RequestId,
    frame: Bytes,
}

struct Shared {
    transport: Arc<dyn Transport>,
    pending: PendingStore,
    outbound: mpsc::Sender<Outbound>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    shutdown: watch::Sender<bool>,
    metrics: Metrics,
    disposed: AtomicBool,
    errored: AtomicBool,
    reading: AtomicBool,
}

impl Shared {
    fn mark_errored(&self, error: &GremlinError) {
        self.errored.store(true, Ordering::SeqCst);
        self.metrics.record_connection_error(error);
    }

    fn ensure_usable(&self) -> GremlinResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(GremlinError::no_connection(Some(
                "connection is disposed".to_string(),
            )));
        }
        if !self.reading.load(Ordering::SeqCst) {
            return Err(GremlinError::no_connection(Some(
                "connection is closed".to_string(),
            )));
        }
        Ok(())
    }

    async fn enqueue(&self, id: RequestId, frame: Bytes) -> GremlinResult<()> {
        self.outbound
            .send(Outbound { id, frame })
            .await
            .map_err(|_| GremlinError::no_connection(Some("write loop stopped".to_string())))
    }
}

/// Builder for a [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    metrics: Option<Metrics>,
    ping_interval: Duration,
    write_queue_capacity: usize,
    max_pending_requests: usize,
}

impl ClientBuilder {
    /// Start from a transport and the default connection settings.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            transport,
            credentials: None,
            metrics: None,
            ping_interval: defaults.ping_interval,
            write_queue_capacity: defaults.write_queue_capacity,
            max_pending_requests: defaults.max_pending_requests,
        }
    }

    /// Take the keepalive and queue settings from a connection config.
    #[must_use]
    pub fn config(mut self, config: &ConnectionConfig) -> Self {
        self.ping_interval = config.ping_interval;
        self.write_queue_capacity = config.write_queue_capacity;
        self.max_pending_requests = config.max_pending_requests;
        self
    }

    /// Credentials used to answer authentication challenges.
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Metrics handle.
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Set the maximum number of requests awaiting a response.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Connect the transport and start the background loops.
    pub async fn connect(self) -> GremlinResult<Client> {
        if self.ping_interval.is_zero() {
            return Err(GremlinError::config("Ping interval must be > 0"));
        }
        if self.write_queue_capacity == 0 {
            return Err(GremlinError::config("Write queue capacity must be > 0"));
        }
        if self.max_pending_requests == 0 {
            return Err(GremlinError::config("Max pending requests must be > 0"));
        }

        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.write_queue_capacity);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport: self.transport,
            pending: PendingStore::new(self.max_pending_requests),
            outbound: outbound_tx,
            credentials: self.credentials,
            metrics: self.metrics.unwrap_or_default(),
            disposed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            reading: AtomicBool::new(true),
            shutdown,
        });

        tokio::spawn(write_loop(
            Arc::clone(&shared),
            outbound_rx,
            shared.shutdown.subscribe(),
        ));
        tokio::spawn(read_loop(Arc::clone(&shared), shared.shutdown.subscribe()));
        tokio::spawn(keepalive_loop(
            Arc::clone(&shared),
            self.ping_interval,
            shared.shutdown.subscribe(),
        ));

        debug!("Gremlin connection ready");
        Ok(Client { shared })
    }
}

/// Correlates requests and responses on one connection.
///
/// Requests may be issued concurrently; envelopes are routed by request id.
/// Dropping the client stops its background loops.
pub struct Client {
    shared: Arc<Shared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.shared.transport)
            .field("pending", &self.shared.pending.len())
            .field("disposed", &self.shared.disposed.load(Ordering::SeqCst))
            .field("errored", &self.shared.errored.load(Ordering::SeqCst))
            .finish()
    }
}

impl Client {
    /// Start building a client over a transport.
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    /// Run a query and wait for every envelope.
    pub async fn execute(&self, query: impl Into<String>) -> GremlinResult<Vec<Response>> {
        self.execute_request(Request::eval(query)).await
    }

    /// Run a parameterized query and wait for every envelope.
    pub async fn execute_with_bindings(
        &self,
        query: impl Into<String>,
        bindings: Bindings,
    ) -> GremlinResult<Vec<Response>> {
        self.execute_request(Request::eval(query).with_bindings(bindings))
            .await
    }

    /// Send a request and wait until its terminal envelope arrives.
    ///
    /// Returns the envelopes in arrival order, error statuses included;
    /// only transport failures are returned as errors. Dropping the future
    /// tears the request down; envelopes arriving later are discarded.
    pub async fn execute_request(&self, request: Request) -> GremlinResult<Vec<Response>> {
        let shared = &self.shared;
        shared.ensure_usable()?;

        let id = request.id();
        let frame = encode_request(&request)?;
        let rx = shared.pending.register_collect(id)?;
        let _guard = PendingGuard::new(&shared.pending, id);

        // The read loop may have stopped between the first check and registration.
        shared.ensure_usable()?;
        shared.enqueue(id, frame).await?;

        rx.await
            .map_err(|_| GremlinError::no_connection(Some("connection dropped".to_string())))?
    }

    /// Like [`execute_request`](Self::execute_request) with a deadline.
    pub async fn execute_timeout(
        &self,
        request: Request,
        deadline: Duration,
    ) -> GremlinResult<Vec<Response>> {
        let id = request.id();
        match timeout(deadline, self.execute_request(request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(request_id = %id, "Request timed out");
                Err(GremlinError::timeout(deadline))
            }
        }
    }

    /// Send a request and forward each envelope to `sink` as it arrives.
    ///
    /// A terminal error status is delivered as the last item, converted to
    /// [`GremlinError::Status`]. The sink is closed after the terminal item.
    /// Dropping the receiving end tears the request down.
    pub async fn execute_streaming(
        &self,
        request: Request,
        sink: ResponseSink,
    ) -> GremlinResult<()> {
        self.dispatch_stream(request, sink).await.map(drop)
    }

    pub(crate) async fn dispatch_stream(
        &self,
        request: Request,
        sink: ResponseSink,
    ) -> GremlinResult<JoinHandle<()>> {
        let shared = &self.shared;
        shared.ensure_usable()?;

        let id = request.id();
        let frame = encode_request(&request)?;
        let mut rx = shared.pending.register_stream(id)?;
        let mut guard = PendingGuard::new(&shared.pending, id);
        shared.ensure_usable()?;
        shared.enqueue(id, frame).await?;
        guard.disarm();

        let shared = Arc::clone(shared);
        Ok(tokio::spawn(async move {
            let _guard = PendingGuard::new(&shared.pending, id);

            while let Some(item) = rx.recv().await {
                let (item, terminal) = match item {
                    Ok(response) if response.is_partial() => (Ok(response), false),
                    Ok(response) if response.is_success() => (Ok(response), true),
                    Ok(response) => {
                        let retry = status::extract_retry_info(std::slice::from_ref(&response));
                        (Err(status::status_error(response, retry).into()), true)
                    }
                    Err(e) => (Err(e), true),
                };

                if sink.send(item).await.is_err() {
                    debug!(request_id = %id, "Streaming receiver dropped");
                    break;
                }
                if terminal {
                    break;
                }
            }
        }))
    }

    /// Close a server-side session.
    pub async fn close_session(&self, session: impl Into<String>) -> GremlinResult<Vec<Response>> {
        self.execute_request(Request::close_session(session)).await
    }

    /// Stop the background loops, close the transport and fail every
    /// request still waiting for a response.
    ///
    /// A second call fails with [`GremlinError::AlreadyClosed`].
    pub async fn close(&self) -> GremlinResult<()> {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return Err(GremlinError::AlreadyClosed);
        }

        shared.shutdown.send_replace(true);
        let result = match shared.transport.close().await {
            Err(GremlinError::AlreadyClosed) => Ok(()),
            other => other,
        };

        let failed = shared.pending.fail_all(|| {
            GremlinError::no_connection(Some("connection closed".to_string()))
        });
        if failed > 0 {
            info!(failed, "Closed connection with requests in flight");
        }
        result
    }

    /// Whether the transport is connected and the connection not disposed.
    pub fn is_connected(&self) -> bool {
        !self.shared.disposed.load(Ordering::SeqCst)
            && self.shared.reading.load(Ordering::SeqCst)
            && self.shared.transport.is_connected()
    }

    /// Whether a write or keepalive has failed on this connection.
    pub fn has_errored(&self) -> bool {
        self.shared.errored.load(Ordering::SeqCst)
    }

    /// Connected and free of errors.
    pub fn is_healthy(&self) -> bool {
        self.is_connected() && !self.has_errored()
    }

    /// Flag the connection as unusable so the pool replaces it.
    pub fn mark_errored(&self) {
        self.shared.errored.store(true, Ordering::SeqCst);
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = outbound.recv() => {
                let Some(Outbound { id, frame }) = next else {
                    break;
                };
                if let Err(e) = shared.transport.write(frame).await {
                    warn!(request_id = %id, error = %e, "Failed to write request");
                    shared.mark_errored(&e);
                    shared.pending.fail(&id, e);
                }
            }
        }
    }
    debug!("Write loop stopped");
}

async fn read_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break "connection closed".to_string(),
            frame = shared.transport.read() => frame,
        };

        match frame {
            Ok(Frame::Closed) => {
                debug!("Server closed the connection");
                shared.errored.store(true, Ordering::SeqCst);
                break "connection closed by server".to_string();
            }
            Ok(frame) => {
                if let Some(payload) = frame.payload() {
                    handle_payload(&shared, payload);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from connection");
                shared.mark_errored(&e);
                break e.to_string();
            }
        }
    };

    shared.reading.store(false, Ordering::SeqCst);
    let failed = shared
        .pending
        .fail_all(|| GremlinError::no_connection(Some(reason.clone())));
    debug!(failed, reason = %reason, "Read loop stopped");
}

fn handle_payload(shared: &Arc<Shared>, payload: &[u8]) {
    let response = match decode_response(payload) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Discarding undecodable frame");
            return;
        }
    };
    let id = response.request_id;

    if response.code() == status_code::AUTHENTICATE {
        match shared.pending.begin_auth(&id) {
            Some(true) => {
                debug!(request_id = %id, "Authentication challenge received");
                tokio::spawn(authenticate(Arc::clone(shared), id));
            }
            Some(false) => {
                shared.pending.fail(
                    &id,
                    GremlinError::auth("server challenged an already authenticated request"),
                );
            }
            None => debug!(request_id = %id, "Challenge for unknown request"),
        }
        return;
    }

    let code = response.code();
    if shared.pending.deliver(response) == Delivery::Unknown {
        debug!(request_id = %id, status = code, "Discarding response for unknown request");
    }
}

async fn authenticate(shared: Arc<Shared>, id: RequestId) {
    let result = async {
        let credentials = shared.credentials.as_ref().ok_or_else(|| {
            GremlinError::auth("server requested authentication but no credentials are configured")
        })?;
        let username = credentials.username().await?;
        let password = credentials.password().await?;
        let frame = encode_request(&Request::authenticate(id, &username, &password))?;
        shared.enqueue(id, frame).await
    }
    .await;

    if let Err(e) = result {
        warn!(request_id = %id, error = %e, "Authentication failed");
        shared.pending.fail(&id, e);
    }
}

async fn keepalive_loop(
    shared: Arc<Shared>,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.transport.ping().await {
                    warn!(error = %e, "Keepalive failed");
                    shared.mark_errored(&e);
                    break;
                }
                debug!(
                    pending = shared.pending.len(),
                    oldest_ms = shared.pending.oldest_age().map(|age| age.as_millis() as u64),
                    "Keepalive sent"
                );
            }
        }
    }
}
