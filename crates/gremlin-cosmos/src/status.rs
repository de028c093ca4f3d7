//! Retry/status policy.
//!
//! Classifies the envelopes of one query into success, fatal or
//! retryable-with-backoff. CosmosDB places a richer status code and a
//! sub-status inside `status.attributes`; those are looked up in a static
//! table of known statuses.

use std::time::Duration;

use chrono::NaiveTime;

use crate::{
    error::{GremlinError, GremlinResult, StatusError},
    protocol::Response,
};

/// Policy entry for a known CosmosDB status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CosmosStatusInfo {
    /// `x-ms-status-code` (or the Gremlin code when no vendor code is sent).
    pub code: u16,
    /// `x-ms-substatus-code`; `None` matches any sub-status.
    pub sub_status: Option<u32>,
    /// Whether the query may be retried after backing off.
    pub retryable: bool,
    /// Whether the connection must be replaced before retrying.
    pub new_connection_required: bool,
    /// Human description.
    pub description: &'static str,
}

const fn entry(
    code: u16,
    sub_status: Option<u32>,
    retryable: bool,
    new_connection_required: bool,
    description: &'static str,
) -> CosmosStatusInfo {
    CosmosStatusInfo {
        code,
        sub_status,
        retryable,
        new_connection_required,
        description,
    }
}

static COSMOS_STATUS_TABLE: &[CosmosStatusInfo] = &[
    entry(400, None, false, false, "Bad request: the traversal or its arguments are invalid"),
    entry(401, None, false, false, "Unauthorized: the account key or resource token was rejected"),
    entry(403, None, false, false, "Forbidden: the account does not permit this operation"),
    entry(404, None, true, false, "Not found: concurrent delete or update of the same element"),
    entry(408, None, true, false, "Request timeout: the operation did not complete in time"),
    entry(409, None, false, false, "Conflict: an element with the same id already exists"),
    entry(410, None, true, true, "Gone: the partition moved and the connection is stale"),
    entry(412, None, true, false, "Precondition failed: concurrent update of the same element"),
    entry(413, None, false, false, "Request entity too large"),
    entry(429, None, true, false, "Too many requests: provisioned throughput exceeded"),
    entry(429, Some(3200), true, false, "Too many requests: request unit budget exhausted"),
    entry(449, None, true, false, "Retry with: transient write conflict"),
    entry(500, None, false, false, "Internal server error"),
    entry(503, None, true, true, "Service unavailable"),
    entry(1001, None, true, true, "Connection is being rebalanced, retry on a new connection"),
    entry(1002, None, true, true, "Server is restarting, retry on a new connection"),
    entry(1003, None, false, false, "Query exceeded the memory available to the server"),
    entry(1004, None, false, false, "Graph configuration is not valid"),
    entry(1007, None, true, false, "Concurrent writes on the same element conflicted"),
    entry(1008, None, true, true, "Server is overloaded, retry on a new connection"),
    entry(1009, None, true, false, "Operation did not complete in the allotted time"),
];

/// Find the policy entry for a status, preferring an exact sub-status match.
pub fn lookup(code: u16, sub_status: Option<u32>) -> Option<&'static CosmosStatusInfo> {
    let exact = sub_status.and_then(|sub| {
        COSMOS_STATUS_TABLE
            .iter()
            .find(|e| e.code == code && e.sub_status == Some(sub))
    });
    exact.or_else(|| {
        COSMOS_STATUS_TABLE
            .iter()
            .find(|e| e.code == code && e.sub_status.is_none())
    })
}

/// Policy entry for one envelope, keyed by the vendor code when present.
pub fn classify(response: &Response) -> Option<&'static CosmosStatusInfo> {
    let code = response.cosmos_status().unwrap_or(response.code());
    lookup(code, response.sub_status())
}

/// Retry decision for one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryInfo {
    /// At least one envelope carried a retryable error.
    pub should_retry: bool,
    /// Longest backoff suggested by any retryable envelope.
    pub retry_after: Option<Duration>,
    /// The last retryable envelope asked for a fresh connection.
    pub new_connection_required: bool,
}

/// First envelope whose status is not success, no-content or partial-content.
pub fn first_error(responses: &[Response]) -> Option<&Response> {
    responses.iter().find(|r| !r.is_success())
}

/// Scan every error envelope of a query for retry hints.
///
/// Keeps the policy entry of the last retryable envelope and the maximum
/// retry-after across all retryable envelopes.
pub fn extract_retry_info(responses: &[Response]) -> RetryInfo {
    let mut info = RetryInfo::default();

    for response in responses.iter().filter(|r| !r.is_success()) {
        let Some(entry) = classify(response) else {
            continue;
        };
        if !entry.retryable {
            continue;
        }

        info.should_retry = true;
        info.new_connection_required = entry.new_connection_required;

        if let Some(after) = response
            .retry_after_raw()
            .as_deref()
            .and_then(parse_retry_after)
        {
            info.retry_after = Some(info.retry_after.map_or(after, |current| current.max(after)));
        }
    }

    info
}

const RETRY_AFTER_FORMAT: &str = "%H:%M:%S%.f";

/// Parse `x-ms-retry-after-ms`.
///
/// CosmosDB sends a clock-duration text (`HH:MM:SS.fffffff`); it is read by
/// subtracting the zero time of the same format. Plain numbers are taken as
/// milliseconds. Values that do not fit a [`Duration`] are ignored.
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(ms) = text.parse::<f64>() {
        return Duration::try_from_secs_f64(ms / 1000.0).ok();
    }

    let parsed = NaiveTime::parse_from_str(text, RETRY_AFTER_FORMAT).ok()?;
    let zero = NaiveTime::parse_from_str("00:00:00.000", RETRY_AFTER_FORMAT).ok()?;
    (parsed - zero).to_std().ok()
}

/// Build the error for a failing envelope, elaborated with vendor details.
pub fn status_error(response: Response, retry: RetryInfo) -> StatusError {
    StatusError {
        code: response.code(),
        message: response.status.message.clone(),
        cosmos_status: response.cosmos_status(),
        sub_status: response.sub_status(),
        activity_id: response.activity_id().map(str::to_string),
        info: classify(&response),
        retry,
        response,
    }
}

/// Turn the envelopes of a query into a result.
///
/// Returns every envelope on success, otherwise the first error envelope
/// elaborated with the retry decision for the whole set.
pub fn into_result(mut responses: Vec<Response>) -> GremlinResult<Vec<Response>> {
    let Some(index) = responses.iter().position(|r| !r.is_success()) else {
        return Ok(responses);
    };

    let retry = extract_retry_info(&responses);
    let failed = responses.swap_remove(index);
    Err(GremlinError::from(status_error(failed, retry)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::protocol::{RequestId, Status};

    fn response(code: u16, attributes: Value) -> Response {
        let Value::Object(attributes) = attributes else {
            panic!("attributes must be an object");
        };
        Response {
            request_id: RequestId::new(),
            status: Status {
                code,
                message: format!("status {code}"),
                attributes,
            },
            data: Bytes::from_static(b"[]"),
            meta: Map::new(),
        }
    }

    #[test]
    fn test_parse_clock_duration() {
        assert_eq!(
            parse_retry_after("00:00:02.345"),
            Some(Duration::from_millis(2345))
        );
        assert_eq!(
            parse_retry_after("00:00:00.0250000"),
            Some(Duration::from_millis(25))
        );
        assert_eq!(parse_retry_after("00:01:00"), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after("150"), Some(Duration::from_millis(150)));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("NaN"), None);
    }

    #[test]
    fn test_out_of_range_retry_after_is_ignored() {
        assert_eq!(parse_retry_after("1e300"), None);
        assert_eq!(parse_retry_after("inf"), None);

        let responses = vec![response(
            500,
            json!({"x-ms-status-code": 429, "x-ms-retry-after-ms": 1e300}),
        )];
        let info = extract_retry_info(&responses);
        assert!(info.should_retry);
        assert_eq!(info.retry_after, None);
    }

    #[test]
    fn test_throttled_is_retryable() {
        let responses = vec![response(
            429,
            json!({"x-ms-retry-after-ms": "00:00:02.345"}),
        )];
        let info = extract_retry_info(&responses);

        assert!(info.should_retry);
        assert_eq!(info.retry_after, Some(Duration::from_millis(2345)));
        assert!(!info.new_connection_required);
    }

    #[test]
    fn test_unauthorized_is_fatal() {
        let responses = vec![response(401, json!({}))];
        let info = extract_retry_info(&responses);

        assert!(!info.should_retry);
        assert_eq!(info.retry_after, None);
    }

    #[test]
    fn test_vendor_code_overrides_gremlin_code() {
        let responses = vec![response(
            500,
            json!({
                "x-ms-status-code": 429,
                "x-ms-substatus-code": 3200,
                "x-ms-retry-after-ms": "00:00:00.500"
            }),
        )];

        let entry = classify(&responses[0]).unwrap();
        assert_eq!(entry.code, 429);
        assert_eq!(entry.sub_status, Some(3200));

        let info = extract_retry_info(&responses);
        assert!(info.should_retry);
        assert_eq!(info.retry_after, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_longest_backoff_wins() {
        let responses = vec![
            response(206, json!({})),
            response(
                500,
                json!({"x-ms-status-code": 429, "x-ms-retry-after-ms": "00:00:03.000"}),
            ),
            response(
                500,
                json!({"x-ms-status-code": 1001, "x-ms-retry-after-ms": "00:00:01.000"}),
            ),
        ];
        let info = extract_retry_info(&responses);

        assert!(info.should_retry);
        assert_eq!(info.retry_after, Some(Duration::from_secs(3)));
        // policy entry of the last retryable envelope
        assert!(info.new_connection_required);
    }

    #[test]
    fn test_lookup_falls_back_to_generic_entry() {
        let entry = lookup(429, Some(9999)).unwrap();
        assert_eq!(entry.sub_status, None);
        assert!(lookup(299, None).is_none());
    }

    #[test]
    fn test_first_error_skips_success_family() {
        let responses = vec![
            response(206, json!({})),
            response(204, json!({})),
            response(597, json!({})),
            response(500, json!({})),
        ];
        assert_eq!(first_error(&responses).map(Response::code), Some(597));
        assert!(first_error(&responses[..2]).is_none());
    }

    #[test]
    fn test_into_result_elaborates_error() {
        let ok = into_result(vec![response(206, json!({})), response(200, json!({}))]).unwrap();
        assert_eq!(ok.len(), 2);

        let err = into_result(vec![
            response(206, json!({})),
            response(
                500,
                json!({
                    "x-ms-status-code": 429,
                    "x-ms-activity-id": "a-1",
                    "x-ms-retry-after-ms": "00:00:01.500"
                }),
            ),
        ])
        .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        let status = err.as_status().unwrap();
        assert_eq!(status.code, 500);
        assert_eq!(status.cosmos_status, Some(429));
        assert_eq!(status.activity_id.as_deref(), Some("a-1"));
        assert!(err.to_string().contains("Too many requests"));
    }
}
