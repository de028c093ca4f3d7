//! Inbound response envelopes.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::types::{RequestId, status_code};
use crate::error::GremlinResult;

/// CosmosDB vendor attribute keys carried in `status.attributes`.
pub mod attributes {
    pub const STATUS_CODE: &str = "x-ms-status-code";
    pub const SUB_STATUS_CODE: &str = "x-ms-substatus-code";
    pub const RETRY_AFTER: &str = "x-ms-retry-after-ms";
    pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
    pub const TOTAL_REQUEST_CHARGE: &str = "x-ms-total-request-charge";
    pub const ACTIVITY_ID: &str = "x-ms-activity-id";
    pub const SERVER_TIME: &str = "x-ms-server-time-ms";
    pub const TOTAL_SERVER_TIME: &str = "x-ms-total-server-time-ms";
}

/// Status block of a response frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Status {
    /// Gremlin status code.
    pub code: u16,
    /// Human readable status message.
    pub message: String,
    /// Vendor metadata.
    pub attributes: Map<String, Value>,
}

/// One decoded response frame.
///
/// A request yields one or many envelopes; every envelope but the last
/// carries [`status_code::PARTIAL_CONTENT`].
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Correlation id of the originating request.
    pub request_id: RequestId,
    /// Status block.
    pub status: Status,
    /// Raw, uninterpreted `result.data` JSON.
    pub data: Bytes,
    /// `result.meta`.
    pub meta: Map<String, Value>,
}

impl Response {
    /// Gremlin status code of this envelope.
    pub fn code(&self) -> u16 {
        self.status.code
    }

    /// Whether the envelope is one of the success codes (200, 204, 206).
    pub fn is_success(&self) -> bool {
        status_code::is_success(self.status.code)
    }

    /// Whether more envelopes follow for the same request.
    pub fn is_partial(&self) -> bool {
        self.status.code == status_code::PARTIAL_CONTENT
    }

    /// Deserialize the raw `data` payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> GremlinResult<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Raw attribute lookup.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.status.attributes.get(key)
    }

    /// `x-ms-status-code`.
    pub fn cosmos_status(&self) -> Option<u16> {
        self.attr_u64(attributes::STATUS_CODE)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// `x-ms-substatus-code`.
    pub fn sub_status(&self) -> Option<u32> {
        self.attr_u64(attributes::SUB_STATUS_CODE)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// `x-ms-activity-id`.
    pub fn activity_id(&self) -> Option<&str> {
        self.attribute(attributes::ACTIVITY_ID)?.as_str()
    }

    /// Request units charged for this envelope.
    pub fn request_charge(&self) -> Option<f64> {
        self.attr_f64(attributes::REQUEST_CHARGE)
    }

    /// Request units charged for the whole request so far.
    pub fn total_request_charge(&self) -> Option<f64> {
        self.attr_f64(attributes::TOTAL_REQUEST_CHARGE)
    }

    /// Server-side processing time of this envelope.
    pub fn server_time(&self) -> Option<Duration> {
        self.attr_f64(attributes::SERVER_TIME)
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
    }

    /// Raw `x-ms-retry-after-ms` text.
    pub fn retry_after_raw(&self) -> Option<String> {
        match self.attribute(attributes::RETRY_AFTER)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn attr_u64(&self, key: &str) -> Option<u64> {
        match self.attribute(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn attr_f64(&self, key: &str) -> Option<f64> {
        match self.attribute(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}
