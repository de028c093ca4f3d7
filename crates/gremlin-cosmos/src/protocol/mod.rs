//! Gremlin request/response frames and their wire encoding.

pub mod codec;
mod request;
mod response;
mod types;

pub use codec::{MIME_TYPE, decode_request, decode_response, encode_request};
pub use request::{Bindings, GREMLIN_LANGUAGE, Request, RequestArgs};
pub use response::{Response, Status, attributes};
pub use types::{OpCode, Processor, RequestId, status_code};
