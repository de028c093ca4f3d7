//! Error handling for the Gremlin driver.

use std::{fmt, time::Duration};

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::{
    protocol::Response,
    status::{CosmosStatusInfo, RetryInfo},
};

/// The main result type used throughout the driver.
pub type GremlinResult<T> = Result<T, GremlinError>;

/// Error type for every driver operation.
#[derive(Error, Debug)]
pub enum GremlinError {
    /// Invalid configuration or construction arguments.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The host URL could not be parsed or uses a scheme other than `ws`/`wss`.
    #[error("Invalid host URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    /// Dialing, reading or writing the underlying connection failed.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The connection is disposed or was never established.
    #[error("No connection available{}", fmt_reason(.reason))]
    NoConnection { reason: Option<String> },

    /// Errors surfaced by the WebSocket implementation.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Local I/O failure (reading query files, credential files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation did not complete within its deadline.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// JSON serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A frame received from the server could not be decoded.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Authentication could not be performed.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// The server answered with a non-success status code.
    #[error(transparent)]
    Status(Box<StatusError>),

    /// The connection pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// `close` was called on an already-closed connection.
    #[error("Connection already closed")]
    AlreadyClosed,

    /// Too many requests are waiting for a response on one connection.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// Internal errors (should not happen in normal operation).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

impl GremlinError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a "no connection" error.
    pub fn no_connection(reason: Option<String>) -> Self {
        Self::NoConnection { reason }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a capacity exceeded error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for failures of the network path rather than of the query.
    ///
    /// Covers the "no connection" sentinel, wrapped lower-level network errors
    /// and server statuses that require a fresh connection.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::NoConnection { .. }
            | Self::Connection { .. }
            | Self::WebSocket(_)
            | Self::Io(_)
            | Self::Timeout { .. } => true,
            Self::Status(status) => status.retry.new_connection_required,
            _ => false,
        }
    }

    /// Returns true if the status policy classified this error as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Status(status) if status.retry.should_retry)
    }

    /// Server-suggested backoff carried by a retryable status error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status(status) if status.retry.should_retry => status.retry.retry_after,
            _ => None,
        }
    }

    /// Access the status details if this is a server status error.
    pub fn as_status(&self) -> Option<&StatusError> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Short label used for metrics.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } | Self::InvalidUrl { .. } => "config",
            Self::Connection { .. } | Self::NoConnection { .. } | Self::WebSocket(_) => {
                "connection"
            }
            Self::Io(_) => "io",
            Self::Timeout { .. } => "timeout",
            Self::Serialization(_) | Self::Decode { .. } => "decode",
            Self::Auth { .. } => "auth",
            Self::Status(_) => "status",
            Self::PoolClosed | Self::AlreadyClosed => "closed",
            Self::CapacityExceeded { .. } => "capacity",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<StatusError> for GremlinError {
    fn from(e: StatusError) -> Self {
        Self::Status(Box::new(e))
    }
}

/// A non-success status returned by the server.
///
/// For CosmosDB servers the generic Gremlin code is elaborated with the
/// vendor sub-status and the matching entry of the known-status table.
#[derive(Debug)]
pub struct StatusError {
    /// Gremlin status code of the offending envelope.
    pub code: u16,
    /// Status message sent by the server.
    pub message: String,
    /// `x-ms-status-code`, when the server is CosmosDB.
    pub cosmos_status: Option<u16>,
    /// `x-ms-substatus-code`, when present.
    pub sub_status: Option<u32>,
    /// `x-ms-activity-id`, when present.
    pub activity_id: Option<String>,
    /// Matching entry of the CosmosDB status table.
    pub info: Option<&'static CosmosStatusInfo>,
    /// Retry decision computed over every envelope of the query.
    pub retry: RetryInfo,
    /// The envelope that carried the error.
    pub response: Response,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server returned status {}", self.code)?;
        if let Some(cosmos) = self.cosmos_status {
            write!(f, " (cosmos {cosmos}")?;
            if let Some(sub) = self.sub_status {
                write!(f, "/{sub}")?;
            }
            write!(f, ")")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(info) = self.info {
            write!(f, " [{}]", info.description)?;
        }
        if let Some(activity) = &self.activity_id {
            write!(f, " activity_id={activity}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StatusError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = GremlinError::config("max_active must be > 0");
        assert!(matches!(err, GremlinError::Config { .. }));

        let err = GremlinError::timeout(Duration::from_secs(5));
        assert!(matches!(err, GremlinError::Timeout { .. }));

        let err = GremlinError::auth("no credentials");
        assert!(matches!(err, GremlinError::Auth { .. }));
    }

    #[test]
    fn test_network_predicate() {
        assert!(GremlinError::no_connection(None).is_network_error());
        assert!(GremlinError::connection("dial tcp: refused").is_network_error());
        assert!(GremlinError::timeout(Duration::from_secs(1)).is_network_error());
        assert!(
            GremlinError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            ))
            .is_network_error()
        );
        assert!(!GremlinError::config("bad").is_network_error());
        assert!(!GremlinError::PoolClosed.is_network_error());
    }

    #[test]
    fn test_no_connection_display() {
        assert_eq!(
            GremlinError::no_connection(None).to_string(),
            "No connection available"
        );
        assert_eq!(
            GremlinError::no_connection(Some("disposed".to_string())).to_string(),
            "No connection available: disposed"
        );
    }
}
