//! Core type definitions for the Gremlin wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for request-response correlation.
///
/// Gremlin servers require a UUID; a fresh random (v4) id is generated per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Operation carried by a request frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    /// Evaluate a Gremlin script.
    #[serde(rename = "eval")]
    Eval,
    /// Answer an authentication challenge.
    #[serde(rename = "authentication")]
    Authenticate,
    /// Close a server-side session.
    #[serde(rename = "close")]
    CloseSession,
}

/// Server-side processor a request is routed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processor {
    /// Sessionless evaluation.
    #[default]
    #[serde(rename = "")]
    Standard,
    /// Evaluation inside a named session.
    #[serde(rename = "session")]
    Session,
}

/// Gremlin response status codes.
pub mod status_code {
    /// The request completed and this is the final frame.
    pub const SUCCESS: u16 = 200;
    /// The request completed without a result.
    pub const NO_CONTENT: u16 = 204;
    /// More frames follow for the same request id.
    pub const PARTIAL_CONTENT: u16 = 206;
    /// The server challenges the client to authenticate.
    pub const AUTHENTICATE: u16 = 407;

    /// Success, no-content and partial-content are all non-error statuses.
    pub fn is_success(code: u16) -> bool {
        matches!(code, SUCCESS | NO_CONTENT | PARTIAL_CONTENT)
    }

    /// Whether the frame ends the request.
    pub fn is_terminal(code: u16) -> bool {
        code != PARTIAL_CONTENT
    }
}
