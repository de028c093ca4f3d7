//! Shared fixtures: an in-memory Gremlin server over [`ChannelTransport`].

#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use gremlin_cosmos::{
    ChannelPeer, ChannelTransport, Client, ConnectionFactory, CredentialProvider, GremlinResult,
    Request, RequestId, Transport,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

/// Builds the replies for one request.
pub type Handler = Arc<dyn Fn(&Request) -> Vec<Value> + Send + Sync>;

/// A response frame body.
pub fn envelope(id: RequestId, code: u16, data: Value) -> Value {
    json!({
        "requestId": id.to_string(),
        "status": { "code": code, "message": "", "attributes": {} },
        "result": { "data": data, "meta": {} }
    })
}

/// A CosmosDB error frame: Gremlin code 500 elaborated with a vendor status.
pub fn cosmos_error(id: RequestId, cosmos_status: u16, retry_after: Option<&str>) -> Value {
    let mut attributes = json!({
        "x-ms-status-code": cosmos_status,
        "x-ms-activity-id": "5d7a6b0c-0000-0000-0000-000000000000",
    });
    if let Some(after) = retry_after {
        attributes["x-ms-retry-after-ms"] = json!(after);
    }
    json!({
        "requestId": id.to_string(),
        "status": { "code": 500, "message": "request failed", "attributes": attributes },
        "result": { "data": null, "meta": {} }
    })
}

/// Answers every eval with a single `[1]` envelope.
pub fn ok_handler() -> Handler {
    Arc::new(|request: &Request| vec![envelope(request.id(), 200, json!([1]))])
}

/// Answer requests on `peer` with `handler` until the client goes away.
pub fn serve(mut peer: ChannelPeer, handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(request)) = peer.recv_request().await {
            for reply in handler(&request) {
                if !peer.send_json(&reply) {
                    return;
                }
            }
        }
    })
}

struct Shared {
    handler: Handler,
    credentials: Option<Arc<dyn CredentialProvider>>,
    dialed: AtomicUsize,
    transports: Mutex<Vec<Arc<ChannelTransport>>>,
}

/// Connection factory backed by in-memory servers.
#[derive(Clone)]
pub struct ScriptedFactory {
    shared: Arc<Shared>,
}

impl ScriptedFactory {
    pub fn new(handler: Handler) -> Self {
        Self::build(handler, None)
    }

    pub fn with_credentials(handler: Handler, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::build(handler, Some(credentials))
    }

    fn build(handler: Handler, credentials: Option<Arc<dyn CredentialProvider>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler,
                credentials,
                dialed: AtomicUsize::new(0),
                transports: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connections opened so far.
    pub fn dialed(&self) -> usize {
        self.shared.dialed.load(Ordering::SeqCst)
    }

    /// Client side transport of the `index`th connection.
    pub fn transport(&self, index: usize) -> Arc<ChannelTransport> {
        Arc::clone(&self.shared.transports.lock()[index])
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(&self) -> GremlinResult<Client> {
        self.shared.dialed.fetch_add(1, Ordering::SeqCst);

        let (transport, peer) = ChannelTransport::pair();
        let transport = Arc::new(transport);
        self.shared.transports.lock().push(Arc::clone(&transport));
        serve(peer, Arc::clone(&self.shared.handler));

        let mut builder = Client::builder(transport as Arc<dyn Transport>);
        if let Some(credentials) = &self.shared.credentials {
            builder = builder.credentials(Arc::clone(credentials));
        }
        builder.connect().await
    }
}
