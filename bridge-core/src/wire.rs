//! Envelope encoding: page messages travel as JSON values on the page channel.

use serde::Deserialize;
use serde_json::Value;

use crate::protocol::{DAppRequest, DAppResponse, PageMessage};

/// Encode an envelope into the JSON value posted on the page channel.
pub fn encode_message(msg: &PageMessage) -> Result<Value, MessageEncodeError> {
    serde_json::to_value(msg).map_err(MessageEncodeError::Encode)
}

/// Build a correlated request envelope for `request`.
pub fn encode_request(request: &DAppRequest, req_id: &str) -> Result<Value, MessageEncodeError> {
    let payload = serde_json::to_value(request).map_err(MessageEncodeError::Encode)?;
    encode_message(&PageMessage::request(payload, Some(req_id.to_owned())))
}

/// Error encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum MessageEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decode an envelope from a value seen on the page channel.
/// Anything that is not `{ type, payload, reqId? }` is rejected.
pub fn decode_message(value: &Value) -> Result<PageMessage, MessageDecodeError> {
    if !value.is_object() {
        return Err(MessageDecodeError::NotAnEnvelope);
    }
    PageMessage::deserialize(value).map_err(MessageDecodeError::Decode)
}

/// Decode the payload of a correlated response envelope.
pub fn decode_response(payload: Value) -> Result<DAppResponse, MessageDecodeError> {
    serde_json::from_value(payload).map_err(MessageDecodeError::Decode)
}

/// Error decoding an envelope: not an object, or the wrong shape.
#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("not an envelope")]
    NotAnEnvelope,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
