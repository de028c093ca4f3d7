//! Lock-free pending request state using `scc::HashMap`.
//!
//! One entry per in-flight request id. The read loop appends envelopes and
//! completes entries; the dispatching caller owns the receiving half of the
//! completion channel. Removing an entry is the only way to complete it, so
//! a terminal envelope can be drained at most once.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{GremlinError, GremlinResult},
    protocol::{RequestId, Response, status_code},
};

/// Completion channel of a synchronous request.
pub(crate) type CollectReceiver = oneshot::Receiver<GremlinResult<Vec<Response>>>;

/// Per-envelope channel of a streaming request.
pub(crate) type StreamReceiver = mpsc::UnboundedReceiver<GremlinResult<Response>>;

/// How envelopes reach the caller.
enum Waiter {
    /// Accumulate every envelope and hand the list over on completion.
    Collect {
        responses: Vec<Response>,
        tx: oneshot::Sender<GremlinResult<Vec<Response>>>,
    },
    /// Forward each envelope as it arrives; dropping the sender closes the stream.
    Stream {
        tx: mpsc::UnboundedSender<GremlinResult<Response>>,
    },
}

struct PendingRequest {
    waiter: Waiter,
    created_at: Instant,
    authenticated: bool,
}

/// Outcome of handing an envelope to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Appended or forwarded; more envelopes follow.
    Partial,
    /// Terminal envelope delivered, state torn down.
    Completed,
    /// No request is waiting on this id.
    Unknown,
}

/// Store of in-flight requests keyed by correlation id.
///
/// `reserved` counts entries plus registrations in progress; a slot is taken
/// before inserting and given back on every removal, so the capacity holds
/// under concurrent registration.
pub(crate) struct PendingStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
    reserved: AtomicUsize,
    capacity: usize,
}

impl PendingStore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            reserved: AtomicUsize::new(0),
            capacity,
        }
    }

    fn insert(&self, id: RequestId, waiter: Waiter) -> GremlinResult<()> {
        let capacity = self.capacity;
        if self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_err()
        {
            return Err(GremlinError::capacity_exceeded(format!(
                "{capacity} requests already awaiting a response"
            )));
        }

        let pending = PendingRequest {
            waiter,
            created_at: Instant::now(),
            authenticated: false,
        };

        // Insert returns Err if key already exists
        if self.requests.insert_sync(id, pending).is_err() {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            return Err(GremlinError::internal(format!(
                "request {id} is already pending"
            )));
        }
        Ok(())
    }

    /// Register a request whose envelopes are collected until completion.
    pub(crate) fn register_collect(&self, id: RequestId) -> GremlinResult<CollectReceiver> {
        let (tx, rx) = oneshot::channel();
        self.insert(
            id,
            Waiter::Collect {
                responses: Vec::new(),
                tx,
            },
        )?;
        Ok(rx)
    }

    /// Register a request whose envelopes are forwarded one by one.
    pub(crate) fn register_stream(&self, id: RequestId) -> GremlinResult<StreamReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id, Waiter::Stream { tx })?;
        Ok(rx)
    }

    /// Hand a decoded envelope to its waiter.
    pub(crate) fn deliver(&self, response: Response) -> Delivery {
        let id = response.request_id;

        if !status_code::is_terminal(response.code()) {
            let mut response = Some(response);
            let found = self.requests.update_sync(&id, |_, pending| {
                let Some(response) = response.take() else {
                    return;
                };
                match &mut pending.waiter {
                    Waiter::Collect { responses, .. } => responses.push(response),
                    Waiter::Stream { tx } => {
                        let _ = tx.send(Ok(response));
                    }
                }
            });
            return match found {
                Some(()) => Delivery::Partial,
                None => Delivery::Unknown,
            };
        }

        let Some(pending) = self.take(&id) else {
            return Delivery::Unknown;
        };
        match pending.waiter {
            Waiter::Collect { mut responses, tx } => {
                responses.push(response);
                let _ = tx.send(Ok(responses));
            }
            Waiter::Stream { tx } => {
                let _ = tx.send(Ok(response));
            }
        }
        Delivery::Completed
    }

    /// Record an authentication attempt for a challenged request.
    ///
    /// Returns `Some(true)` the first time, `Some(false)` if the request was
    /// already authenticated once and `None` if the id is unknown.
    pub(crate) fn begin_auth(&self, id: &RequestId) -> Option<bool> {
        self.requests.update_sync(id, |_, pending| {
            let first = !pending.authenticated;
            pending.authenticated = true;
            first
        })
    }

    /// Complete a request with an error.
    pub(crate) fn fail(&self, id: &RequestId, error: GremlinError) -> bool {
        let Some(pending) = self.take(id) else {
            return false;
        };
        match pending.waiter {
            Waiter::Collect { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Waiter::Stream { tx } => {
                let _ = tx.send(Err(error));
            }
        }
        true
    }

    /// Tear down a request without notifying its waiter.
    pub(crate) fn remove(&self, id: &RequestId) -> bool {
        self.take(id).is_some()
    }

    fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        let (_, pending) = self.requests.remove_sync(id)?;
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Some(pending)
    }

    /// Fail every pending request, e.g. when the connection goes away.
    pub(crate) fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> GremlinError,
    {
        let mut ids = Vec::new();
        self.requests.retain_sync(|id, _| {
            ids.push(*id);
            true
        });

        ids.iter()
            .filter(|id| self.fail(id, make_error()))
            .count()
    }

    /// Age of the oldest pending request.
    pub(crate) fn oldest_age(&self) -> Option<std::time::Duration> {
        let now = Instant::now();
        let mut oldest = None;
        self.requests.retain_sync(|_, pending| {
            let age = now.duration_since(pending.created_at);
            oldest = Some(oldest.map_or(age, |current: std::time::Duration| current.max(age)));
            true
        });
        oldest
    }

    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.requests.get_sync(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Removes a request's pending state if the dispatching future is dropped
/// before the request completes.
pub(crate) struct PendingGuard<'a> {
    store: &'a PendingStore,
    id: RequestId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(store: &'a PendingStore, id: RequestId) -> Self {
        Self {
            store,
            id,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.store.remove(&self.id) {
            tracing::debug!(request_id = %self.id, "Pending request cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::Map;

    use super::*;
    use crate::protocol::Status;

    fn envelope(id: RequestId, code: u16, data: &'static str) -> Response {
        Response {
            request_id: id,
            status: Status {
                code,
                ..Default::default()
            },
            data: Bytes::from_static(data.as_bytes()),
            meta: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_collect_partials_in_order() {
        let store = PendingStore::new(10);
        let id = RequestId::new();
        let rx = store.register_collect(id).unwrap();

        assert_eq!(
            store.deliver(envelope(id, status_code::PARTIAL_CONTENT, "[1]")),
            Delivery::Partial
        );
        assert_eq!(
            store.deliver(envelope(id, status_code::PARTIAL_CONTENT, "[2]")),
            Delivery::Partial
        );
        assert_eq!(
            store.deliver(envelope(id, status_code::SUCCESS, "[3]")),
            Delivery::Completed
        );

        let responses = rx.await.unwrap().unwrap();
        let data: Vec<_> = responses.iter().map(|r| r.data.clone()).collect();
        assert_eq!(data, vec!["[1]", "[2]", "[3]"]);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_second_terminal_is_unknown() {
        let store = PendingStore::new(10);
        let id = RequestId::new();
        let _rx = store.register_collect(id).unwrap();

        assert_eq!(
            store.deliver(envelope(id, status_code::SUCCESS, "[]")),
            Delivery::Completed
        );
        assert_eq!(
            store.deliver(envelope(id, status_code::SUCCESS, "[]")),
            Delivery::Unknown
        );
    }

    #[tokio::test]
    async fn test_stream_forwards_then_closes() {
        let store = PendingStore::new(10);
        let id = RequestId::new();
        let mut rx = store.register_stream(id).unwrap();

        store.deliver(envelope(id, status_code::PARTIAL_CONTENT, "[1]"));
        store.deliver(envelope(id, status_code::SUCCESS, "[2]"));

        assert_eq!(rx.recv().await.unwrap().unwrap().data, "[1]");
        assert_eq!(rx.recv().await.unwrap().unwrap().data, "[2]");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_capacity_limit() {
        let store = PendingStore::new(2);
        let _a = store.register_collect(RequestId::new()).unwrap();
        let _b = store.register_collect(RequestId::new()).unwrap();

        let err = store.register_collect(RequestId::new()).unwrap_err();
        assert!(matches!(err, GremlinError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_capacity_holds_under_concurrent_registration() {
        let store = std::sync::Arc::new(PendingStore::new(4));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.register_collect(RequestId::new()))
            })
            .collect();

        let receivers: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap().ok())
            .collect();
        assert_eq!(receivers.len(), 4);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_completion_frees_capacity() {
        let store = PendingStore::new(1);
        let id = RequestId::new();
        let rx = store.register_collect(id).unwrap();
        assert!(store.register_collect(RequestId::new()).is_err());

        store.deliver(envelope(id, status_code::SUCCESS, "[]"));
        rx.await.unwrap().unwrap();
        let _next = store.register_stream(RequestId::new()).unwrap();

        let duplicate = RequestId::new();
        let store = PendingStore::new(2);
        let _rx = store.register_collect(duplicate).unwrap();
        assert!(store.register_collect(duplicate).is_err());
        let _other = store.register_collect(RequestId::new()).unwrap();
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = PendingStore::new(10);
        let id = RequestId::new();
        let _rx = store.register_collect(id).unwrap();
        assert!(store.register_stream(id).is_err());
    }

    #[test]
    fn test_begin_auth_only_once() {
        let store = PendingStore::new(10);
        let id = RequestId::new();
        let _rx = store.register_collect(id).unwrap();

        assert_eq!(store.begin_auth(&id), Some(true));
        assert_eq!(store.begin_auth(&id), Some(false));
        assert_eq!(store.begin_auth(&RequestId::new()), None);
    }

    #[tokio::test]
    async fn test_fail_all_notifies_waiters() {
        let store = PendingStore::new(10);
        let a = store.register_collect(RequestId::new()).unwrap();
        let mut b = store.register_stream(RequestId::new()).unwrap();

        assert_eq!(store.fail_all(|| GremlinError::no_connection(None)), 2);

        assert!(matches!(
            a.await.unwrap(),
            Err(GremlinError::NoConnection { .. })
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            Err(GremlinError::NoConnection { .. })
        ));
        assert!(b.recv().await.is_none());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let store = PendingStore::new(10);
        let id = RequestId::new();
        let _rx = store.register_collect(id).unwrap();

        {
            let _guard = PendingGuard::new(&store, id);
        }
        assert!(!store.contains(&id));

        let id = RequestId::new();
        let _rx = store.register_collect(id).unwrap();
        {
            let mut guard = PendingGuard::new(&store, id);
            guard.disarm();
        }
        assert!(store.contains(&id));
    }
}
