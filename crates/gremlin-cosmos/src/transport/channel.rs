use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};

use super::{Frame, Transport};
use crate::{
    error::{GremlinError, GremlinResult},
    protocol::{Request, decode_request},
};

/// In-memory transport connected to a [`ChannelPeer`].
///
/// Useful for driving the correlator and pool without a server.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    reject_writes: AtomicBool,
}

/// Server side of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelPeer {
    requests: mpsc::UnboundedReceiver<Bytes>,
    frames: Option<mpsc::UnboundedSender<Frame>>,
}

impl ChannelTransport {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (Self, ChannelPeer) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let transport = Self {
            outbound: request_tx,
            inbound: Mutex::new(frame_rx),
            connected: AtomicBool::new(false),
            closed,
            reject_writes: AtomicBool::new(false),
        };
        let peer = ChannelPeer {
            requests: request_rx,
            frames: Some(frame_tx),
        };
        (transport, peer)
    }

    /// Make every subsequent write (and ping) fail.
    pub fn fail_writes(&self, fail: bool) {
        self.reject_writes.store(fail, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn check_writable(&self) -> GremlinResult<()> {
        if self.is_closed() || !self.connected.load(Ordering::SeqCst) {
            return Err(GremlinError::no_connection(None));
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(GremlinError::connection("write rejected by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> GremlinResult<()> {
        if self.is_closed() {
            return Err(GremlinError::no_connection(Some(
                "transport is closed".to_string(),
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, frame: Bytes) -> GremlinResult<()> {
        self.check_writable()?;
        self.outbound.send(frame).map_err(|_| {
            self.connected.store(false, Ordering::SeqCst);
            GremlinError::connection("peer went away")
        })
    }

    async fn read(&self) -> GremlinResult<Frame> {
        let mut closed = self.closed.subscribe();
        let already_closed = *closed.borrow_and_update();
        if already_closed {
            return Ok(Frame::Closed);
        }
        let mut inbound = self.inbound.lock().await;

        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => Ok(frame),
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    Ok(Frame::Closed)
                }
            },
            _ = closed.changed() => Ok(Frame::Closed),
        }
    }

    async fn close(&self) -> GremlinResult<()> {
        if self.closed.send_replace(true) {
            return Err(GremlinError::AlreadyClosed);
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> GremlinResult<()> {
        self.check_writable()
    }
}

impl ChannelPeer {
    /// Next raw frame written by the client.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        self.requests.recv().await
    }

    /// Next request written by the client, decoded.
    pub async fn recv_request(&mut self) -> Option<GremlinResult<Request>> {
        let frame = self.requests.recv().await?;
        Some(decode_request(&frame))
    }

    /// Send a frame to the client. Returns false once the client is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.frames
            .as_ref()
            .is_some_and(|frames| frames.send(frame).is_ok())
    }

    /// Send a JSON response body as a binary frame.
    pub fn send_json(&self, body: &serde_json::Value) -> bool {
        match serde_json::to_vec(body) {
            Ok(bytes) => self.send(Frame::Binary(Bytes::from(bytes))),
            Err(_) => false,
        }
    }

    /// Drop the server side; the client reads [`Frame::Closed`].
    pub fn disconnect(&mut self) {
        self.frames = None;
    }
}
