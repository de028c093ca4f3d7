//! Driver metrics.
//!
//! The handle is built from a caller-supplied [`Meter`] and passed to the
//! pool and correlators at construction time. Registering instruments on
//! the process-wide meter provider is the host application's concern.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

use crate::{error::GremlinError, protocol::Response};

/// Shared metrics handle; cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

struct Inner {
    request_count: AtomicU64,
    error_count: AtomicU64,
    retry_count: AtomicU64,
    connection_error_count: AtomicU64,

    requests: Counter<u64>,
    errors: Counter<u64>,
    charge: Histogram<f64>,
    duration: Histogram<f64>,
    retry_after: Histogram<f64>,
    retries: Counter<u64>,
    pool_active: UpDownCounter<i64>,
    pool_idle: UpDownCounter<i64>,
    connection_errors: Counter<u64>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests", &self.request_count())
            .field("errors", &self.error_count())
            .field("retries", &self.retry_count())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Build instruments on the given meter.
    pub fn new(meter: &Meter) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                retry_count: AtomicU64::new(0),
                connection_error_count: AtomicU64::new(0),
                requests: meter
                    .u64_counter("gremlin.requests")
                    .with_description("Total number of Gremlin requests")
                    .build(),
                errors: meter
                    .u64_counter("gremlin.request.errors")
                    .with_description("Total number of failed Gremlin requests")
                    .build(),
                charge: meter
                    .f64_histogram("gremlin.request.charge")
                    .with_unit("RU")
                    .with_description("Request units charged per request")
                    .build(),
                duration: meter
                    .f64_histogram("gremlin.request.duration")
                    .with_unit("s")
                    .with_description("Gremlin request duration in seconds")
                    .build(),
                retry_after: meter
                    .f64_histogram("gremlin.retry.after")
                    .with_unit("s")
                    .with_description("Backoff applied before retrying a request")
                    .build(),
                retries: meter
                    .u64_counter("gremlin.retries")
                    .with_description("Total number of request retries")
                    .build(),
                pool_active: meter
                    .i64_up_down_counter("gremlin.pool.active")
                    .with_description("Connections currently leased")
                    .build(),
                pool_idle: meter
                    .i64_up_down_counter("gremlin.pool.idle")
                    .with_description("Connections currently idle")
                    .build(),
                connection_errors: meter
                    .u64_counter("gremlin.connection.errors")
                    .with_description("Transport failures on Gremlin connections")
                    .build(),
            }),
        }
    }

    /// Instruments on the global meter; no-op unless a provider is installed.
    pub fn noop() -> Self {
        Self::new(&global::meter("gremlin-cosmos"))
    }

    /// Record a completed request and the request units it consumed.
    pub(crate) fn record_success(&self, responses: &[Response], elapsed: Duration) {
        self.inner.request_count.fetch_add(1, Ordering::Relaxed);
        let status = responses.last().map_or(0, Response::code);
        let labels = [KeyValue::new("status", i64::from(status))];
        self.inner.requests.add(1, &labels);
        self.inner.duration.record(elapsed.as_secs_f64(), &labels);

        let charge: f64 = responses.iter().filter_map(Response::request_charge).sum();
        if charge > 0.0 {
            self.inner.charge.record(charge, &[]);
        }
    }

    /// Record a failed request.
    pub(crate) fn record_error(&self, error: &GremlinError, elapsed: Duration) {
        self.inner.request_count.fetch_add(1, Ordering::Relaxed);
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
        let status = error.as_status().map_or(0, |s| i64::from(s.code));
        self.inner
            .requests
            .add(1, &[KeyValue::new("status", status)]);
        self.inner
            .errors
            .add(1, &[KeyValue::new("kind", error.kind())]);
        self.inner
            .duration
            .record(elapsed.as_secs_f64(), &[KeyValue::new("status", status)]);
    }

    /// Record a retry and the backoff applied before it.
    pub(crate) fn record_retry(&self, backoff: Duration) {
        self.inner.retry_count.fetch_add(1, Ordering::Relaxed);
        self.inner.retries.add(1, &[]);
        self.inner.retry_after.record(backoff.as_secs_f64(), &[]);
    }

    pub(crate) fn record_connection_error(&self, error: &GremlinError) {
        self.inner
            .connection_error_count
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .connection_errors
            .add(1, &[KeyValue::new("kind", error.kind())]);
    }

    pub(crate) fn pool_active_delta(&self, delta: i64) {
        self.inner.pool_active.add(delta, &[]);
    }

    pub(crate) fn pool_idle_delta(&self, delta: i64) {
        self.inner.pool_idle.add(delta, &[]);
    }

    /// Requests completed, successfully or not.
    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::Relaxed)
    }

    /// Requests that failed.
    pub fn error_count(&self) -> u64 {
        self.inner.error_count.load(Ordering::Relaxed)
    }

    /// Retries performed.
    pub fn retry_count(&self) -> u64 {
        self.inner.retry_count.load(Ordering::Relaxed)
    }

    /// Transport failures observed.
    pub fn connection_error_count(&self) -> u64 {
        self.inner.connection_error_count.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::noop()
    }
}
