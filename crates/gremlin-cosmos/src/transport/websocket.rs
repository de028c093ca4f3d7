use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{Message, protocol::WebSocketConfig},
};
use tracing::{debug, warn};
use url::Url;

use super::{Frame, Transport};
use crate::{
    config::ConnectionConfig,
    error::{GremlinError, GremlinResult},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport built on `tokio-tungstenite`.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: Url,
    config: ConnectionConfig,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport for `config.url`.
    ///
    /// Fails immediately on an invalid configuration or a URL whose scheme
    /// is not `ws` or `wss`; no connection is attempted.
    pub fn new(config: ConnectionConfig) -> GremlinResult<Self> {
        config.validate().map_err(GremlinError::config)?;

        let url = Url::parse(&config.url)
            .map_err(|e| GremlinError::invalid_url(&config.url, e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(GremlinError::invalid_url(
                &config.url,
                format!("scheme must be ws or wss, got {}", url.scheme()),
            ));
        }

        Ok(Self {
            url,
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .read_buffer_size(self.config.read_buffer_size)
            .write_buffer_size(self.config.write_buffer_size)
            .max_message_size(Some(self.config.max_message_size))
    }

    fn mark_failed(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> GremlinResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GremlinError::no_connection(Some(
                "transport is closed".to_string(),
            )));
        }

        debug!(url = %self.url, "Connecting to Gremlin server");
        let handshake = connect_async_with_config(self.url.as_str(), Some(self.ws_config()), true);
        let (stream, _response) = timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| GremlinError::timeout(self.config.handshake_timeout))?
            .map_err(|e| GremlinError::connection(format!("dial {}: {e}", self.url)))?;

        let (sink, stream) = stream.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);

        debug!(url = %self.url, "WebSocket connected");
        Ok(())
    }

    async fn write(&self, frame: Bytes) -> GremlinResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(GremlinError::no_connection(None));
        };

        let send = sink.send(Message::binary(frame));
        let result = match timeout(self.config.write_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GremlinError::from(e)),
            Err(_) => Err(GremlinError::timeout(self.config.write_timeout)),
        };
        if result.is_err() {
            self.mark_failed();
        }
        result
    }

    async fn read(&self) -> GremlinResult<Frame> {
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Err(GremlinError::no_connection(None));
        };

        loop {
            let next = match timeout(self.config.read_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    self.mark_failed();
                    return Err(GremlinError::timeout(self.config.read_timeout));
                }
            };

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(data)),
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed the connection");
                    self.mark_failed();
                    return Ok(Frame::Closed);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    self.mark_failed();
                    return Err(e.into());
                }
                None => {
                    self.mark_failed();
                    return Ok(Frame::Closed);
                }
            }
        }
    }

    async fn close(&self) -> GremlinResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GremlinError::AlreadyClosed);
        }
        self.mark_failed();

        // The reader is owned by the read loop; it observes the close frame.
        let Some(mut sink) = self.writer.lock().await.take() else {
            return Ok(());
        };
        match timeout(self.config.write_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error closing WebSocket"),
            Err(_) => warn!(url = %self.url, "Timed out closing WebSocket"),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> GremlinResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(GremlinError::no_connection(None));
        };

        let send = sink.send(Message::Ping(Bytes::new()));
        let result = match timeout(self.config.write_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GremlinError::from(e)),
            Err(_) => Err(GremlinError::timeout(self.config.write_timeout)),
        };
        if result.is_err() {
            self.mark_failed();
        }
        result
    }
}
