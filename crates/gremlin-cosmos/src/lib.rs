//! # Gremlin Cosmos
//!
//! Client driver for the Gremlin graph query protocol over WebSocket,
//! specialized for Azure CosmosDB.
//!
//! ## Features
//!
//! - **Request correlation**: many concurrent queries share one connection;
//!   responses are routed by request id, partial results included
//! - **Connection pooling**: bounded, LIFO reuse of warm connections with
//!   idle expiry and health-based eviction
//! - **In-band authentication**: SASL challenges are answered transparently
//!   with static, file-backed or closure-backed credentials
//! - **Retry policy**: CosmosDB sub-statuses are classified into fatal and
//!   retryable, honouring the server-suggested backoff
//! - **Observability**: `tracing` logs and OpenTelemetry metrics through an
//!   injected handle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gremlin_cosmos::{Cosmos, RetryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cosmos = Cosmos::builder("wss://account.gremlin.cosmos.azure.com:443/")
//!         .static_credentials("/dbs/graphdb/colls/people", "primary-key")
//!         .retry_config(RetryConfig::new(3))
//!         .build()?;
//!
//!     let responses = cosmos.execute("g.V().count()").await?;
//!     let count: Vec<u64> = responses[0].data_as()?;
//!     println!("vertices: {count:?}");
//!
//!     cosmos.stop().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod cosmos;
pub mod error;
pub mod metrics;
mod pending;
pub mod pool;
pub mod protocol;
mod retry;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use auth::{CredentialProvider, FileCredentials, FnCredentials, StaticCredentials};
pub use client::{Client, ClientBuilder, ResponseSink};
pub use config::{ConnectionConfig, PoolConfig, RetryConfig};
pub use cosmos::{Cosmos, CosmosBuilder};
pub use error::{GremlinError, GremlinResult, StatusError};
pub use metrics::Metrics;
pub use pool::{ConnectionFactory, Pool, PooledConnection};
pub use protocol::{Bindings, OpCode, Processor, Request, RequestId, Response, Status};
pub use status::RetryInfo;
pub use transport::{ChannelPeer, ChannelTransport, Frame, Transport, WebSocketTransport};
