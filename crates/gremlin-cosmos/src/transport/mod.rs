//! Core transport abstraction over one duplex frame connection.

mod channel;
mod websocket;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::{
    channel::{ChannelPeer, ChannelTransport},
    websocket::WebSocketTransport,
};
use crate::error::GremlinResult;

/// One inbound data frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Binary payload.
    Binary(Bytes),
    /// Text payload.
    Text(String),
    /// The peer closed the connection; no more frames follow.
    Closed,
}

impl Frame {
    /// Payload bytes of a data frame.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            Self::Text(text) => Some(text.as_bytes()),
            Self::Closed => None,
        }
    }
}

/// Duplex frame connection used by the correlator.
///
/// Exactly one task writes and exactly one task reads at a time; the
/// correlator serializes writes through its outbound queue.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Establish the connection.
    async fn connect(&self) -> GremlinResult<()>;

    /// Write one encoded request frame.
    async fn write(&self, frame: Bytes) -> GremlinResult<()>;

    /// Read the next data frame, skipping control frames.
    ///
    /// Returns [`Frame::Closed`] once the peer has gone away.
    async fn read(&self) -> GremlinResult<Frame>;

    /// Close the connection. A second call fails with
    /// [`GremlinError::AlreadyClosed`](crate::GremlinError::AlreadyClosed).
    async fn close(&self) -> GremlinResult<()>;

    /// Whether the connection is established and has not failed.
    fn is_connected(&self) -> bool;

    /// Send one keepalive frame. A failure clears the connected flag.
    async fn ping(&self) -> GremlinResult<()>;
}
