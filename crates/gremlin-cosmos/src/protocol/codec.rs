//! Wire codec for request and response frames.
//!
//! Request frames are a single length byte, the MIME type of the negotiated
//! serializer and the JSON body. Response frames are bare JSON.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{Map, Value, value::RawValue};

use super::{
    request::Request,
    response::{Response, Status},
    types::RequestId,
};
use crate::error::{GremlinError, GremlinResult};

/// MIME type prefixed to every request frame.
pub const MIME_TYPE: &str = "application/vnd.gremlin-v2.0+json";

/// Serialize a request into a binary frame.
pub fn encode_request(request: &Request) -> GremlinResult<Bytes> {
    let body = serde_json::to_vec(request)?;
    let mime = MIME_TYPE.as_bytes();
    let len = u8::try_from(mime.len())
        .map_err(|_| GremlinError::internal("MIME type longer than 255 bytes"))?;

    let mut frame = BytesMut::with_capacity(1 + mime.len() + body.len());
    frame.put_u8(len);
    frame.put_slice(mime);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Parse a request frame produced by [`encode_request`].
pub fn decode_request(frame: &[u8]) -> GremlinResult<Request> {
    let (&len, rest) = frame
        .split_first()
        .ok_or_else(|| GremlinError::decode("empty request frame"))?;
    let len = usize::from(len);
    if rest.len() < len {
        return Err(GremlinError::decode("request frame shorter than its header"));
    }
    let (mime, body) = rest.split_at(len);
    if mime != MIME_TYPE.as_bytes() {
        return Err(GremlinError::decode(format!(
            "unexpected MIME type {:?}",
            String::from_utf8_lossy(mime)
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse<'a> {
    request_id: Option<RequestId>,
    status: WireStatus,
    #[serde(borrow, default)]
    result: Option<WireResult<'a>>,
}

#[derive(Deserialize)]
struct WireStatus {
    code: u16,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attributes: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct WireResult<'a> {
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
    #[serde(default)]
    meta: Option<Map<String, Value>>,
}

/// Parse a response frame into an envelope.
pub fn decode_response(frame: &[u8]) -> GremlinResult<Response> {
    let wire: WireResponse<'_> = serde_json::from_slice(frame)
        .map_err(|e| GremlinError::decode(format!("malformed response frame: {e}")))?;

    let request_id = wire
        .request_id
        .ok_or_else(|| GremlinError::decode("response frame has no requestId"))?;

    let (data, meta) = match wire.result {
        Some(result) => (
            result
                .data
                .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
                .unwrap_or_else(|| Bytes::from_static(b"null")),
            result.meta.unwrap_or_default(),
        ),
        None => (Bytes::from_static(b"null"), Map::new()),
    };

    Ok(Response {
        request_id,
        status: Status {
            code: wire.status.code,
            message: wire.status.message.unwrap_or_default(),
            attributes: wire.status.attributes.unwrap_or_default(),
        },
        data,
        meta,
    })
}
