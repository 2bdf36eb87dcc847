//! Validating parse step from a frame payload to a classified [`Message`].

use serde_json::{Map, Value};

use crate::lsp::error::{ProtocolError, ResponseError};
use crate::lsp::types::{
    Message, Notification, Request, RequestId, Response, ResponseOutcome, JSONRPC_VERSION,
};

/// Parse a full JSON payload (bytes) into a `Message`.
pub fn parse_message(payload: &[u8]) -> Result<Message, ProtocolError> {
    let text = String::from_utf8(payload.to_vec())?;
    parse_message_from_str(&text)
}

pub fn parse_message_from_str(s: &str) -> Result<Message, ProtocolError> {
    let json: Value = serde_json::from_str(s)?;
    classify(json)
}

/// Classify a decoded JSON value by shape.
///
/// A response has an `id` plus a `result` or `error` member; a notification has
/// a `method` and no `id`; a request has both. The result depends only on the
/// shape of `json`.
pub fn classify(json: Value) -> Result<Message, ProtocolError> {
    let Value::Object(mut object) = json else {
        return Err(ProtocolError::NotAnObject);
    };

    let jsonrpc = take_version(&mut object);
    let has_outcome = object.contains_key("result") || object.contains_key("error");

    match (object.remove("id"), object.remove("method")) {
        (Some(id), _) if has_outcome => {
            let id = parse_id(id)?;
            let outcome = match object.remove("error") {
                Some(error) => ResponseOutcome::Error(parse_error_member(error)),
                None => ResponseOutcome::Result(object.remove("result").unwrap_or(Value::Null)),
            };
            Ok(Message::Response(Response {
                jsonrpc,
                id,
                outcome,
            }))
        }
        (None, Some(Value::String(method))) => Ok(Message::Notification(Notification {
            jsonrpc,
            method,
            params: object.remove("params").unwrap_or(Value::Null),
        })),
        (Some(id), Some(Value::String(method))) => Ok(Message::Request(Request {
            jsonrpc,
            id: parse_id(id)?,
            method,
            params: object.remove("params").unwrap_or(Value::Null),
        })),
        (id, method) => {
            if let Some(id) = id {
                object.insert("id".to_string(), id);
            }
            if let Some(method) = method {
                object.insert("method".to_string(), method);
            }
            Err(ProtocolError::Unclassifiable(Value::Object(object)))
        }
    }
}

/// A malformed `error` member still answers its request, as an internal error
/// carrying the raw member in `data`.
fn parse_error_member(error: Value) -> ResponseError {
    match serde_json::from_value::<ResponseError>(error.clone()) {
        Ok(error) => error,
        Err(e) => ResponseError {
            data: Some(error),
            ..ResponseError::internal(format!("malformed error member: {}", e))
        },
    }
}

fn take_version(object: &mut Map<String, Value>) -> String {
    match object.remove("jsonrpc") {
        Some(Value::String(version)) => version,
        _ => JSONRPC_VERSION.to_string(),
    }
}

fn parse_id(id: Value) -> Result<RequestId, ProtocolError> {
    match id {
        Value::Number(n) => match n.as_i64() {
            Some(n) => Ok(RequestId::Number(n)),
            None => Err(ProtocolError::InvalidId(Value::Number(n))),
        },
        Value::String(s) => Ok(RequestId::String(s)),
        other => Err(ProtocolError::InvalidId(other)),
    }
}
