//! Outbound request frames.

use std::{collections::BTreeMap, time::Duration};

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::types::{OpCode, Processor, RequestId};

/// Named parameter bindings for a script.
pub type Bindings = BTreeMap<String, serde_json::Value>;

/// Script language sent with every evaluation.
pub const GREMLIN_LANGUAGE: &str = "gremlin-groovy";

/// A logical Gremlin request.
///
/// Built once by the caller-facing API and consumed by the write path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    request_id: RequestId,
    op: OpCode,
    processor: Processor,
    args: RequestArgs,
}

/// Arguments of a request frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gremlin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Bindings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebindings: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manage_transaction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_evaluation_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sasl: Option<String>,
}

impl Request {
    /// Build an evaluation request for a query string.
    pub fn eval(query: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            op: OpCode::Eval,
            processor: Processor::Standard,
            args: RequestArgs {
                gremlin: Some(query.into()),
                language: Some(GREMLIN_LANGUAGE.to_string()),
                ..Default::default()
            },
        }
    }

    /// Build the SASL PLAIN answer to an authentication challenge.
    ///
    /// The request id must be the id of the challenged request so the
    /// original waiter receives the eventual result.
    pub fn authenticate(request_id: RequestId, username: &str, password: &str) -> Self {
        let mut blob = Vec::with_capacity(username.len() + password.len() + 2);
        blob.push(0);
        blob.extend_from_slice(username.as_bytes());
        blob.push(0);
        blob.extend_from_slice(password.as_bytes());

        Self {
            request_id,
            op: OpCode::Authenticate,
            processor: Processor::Standard,
            args: RequestArgs {
                sasl: Some(base64::engine::general_purpose::STANDARD.encode(blob)),
                ..Default::default()
            },
        }
    }

    /// Build a request that closes a server-side session.
    pub fn close_session(session: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            op: OpCode::CloseSession,
            processor: Processor::Session,
            args: RequestArgs {
                session: Some(session.into()),
                ..Default::default()
            },
        }
    }

    /// Attach parameter bindings.
    #[must_use]
    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        if !bindings.is_empty() {
            self.args.bindings = Some(bindings);
        }
        self
    }

    /// Attach traversal source rebindings.
    #[must_use]
    pub fn with_rebindings(mut self, rebindings: BTreeMap<String, String>) -> Self {
        if !rebindings.is_empty() {
            self.args.rebindings = Some(rebindings);
        }
        self
    }

    /// Route the request to a named session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>, manage_transaction: bool) -> Self {
        self.processor = Processor::Session;
        self.args.session = Some(session.into());
        self.args.manage_transaction = Some(manage_transaction);
        self
    }

    /// Ask the server to return results in batches of `size`.
    #[must_use]
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.args.batch_size = Some(size);
        self
    }

    /// Override the server-side script evaluation timeout.
    #[must_use]
    pub fn with_evaluation_timeout(mut self, timeout: Duration) -> Self {
        self.args.script_evaluation_timeout =
            Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Copy of the request under a fresh correlation id, for retries.
    #[must_use]
    pub fn reissue(&self) -> Self {
        Self {
            request_id: RequestId::new(),
            ..self.clone()
        }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> RequestId {
        self.request_id
    }

    /// Operation of the request.
    pub fn op(&self) -> OpCode {
        self.op
    }

    /// Processor the request is routed to.
    pub fn processor(&self) -> Processor {
        self.processor
    }

    /// Query text, if this is an evaluation.
    pub fn query(&self) -> Option<&str> {
        self.args.gremlin.as_deref()
    }

    /// Request arguments.
    pub fn args(&self) -> &RequestArgs {
        &self.args
    }
}
