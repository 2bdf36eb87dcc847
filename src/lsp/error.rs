//! Error types for the LSP transport.
//!
//! Framing errors lose track of frame boundaries and end the connection.
//! Protocol errors concern a single message and are skipped by the
//! demultiplexer. Session operations report everything as [`TransportError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::lsp::types::RequestId;

/// JSON-RPC / LSP error codes used by the client.
pub struct ErrorCodes;

impl ErrorCodes {
    /// The requested method is not handled (JSON-RPC reserved).
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Internal JSON-RPC error (JSON-RPC reserved).
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Request failed but was syntactically correct (LSP 3.17).
    pub const REQUEST_FAILED: i64 = -32803;
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCodes::METHOD_NOT_FOUND,
            format!("method not found: {}", method),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCodes::INTERNAL_ERROR, message)
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCodes::REQUEST_FAILED, message)
    }
}

/// The byte stream does not carry a valid `Content-Length` header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("expected a Content-Length header, found {found:?}")]
    MissingHeader { found: String },

    #[error("invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("frame is not valid UTF-8 after byte {valid_up_to}")]
    InvalidUtf8 { valid_up_to: usize },
}

/// A complete frame whose payload is not a usable JSON-RPC message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message id must be a number or a string, got {0}")]
    InvalidId(Value),

    #[error("message is neither a request, a response nor a notification: {0}")]
    Unclassifiable(Value),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server returned an error: {0}")]
    Remote(ResponseError),

    #[error("no response for request {id} after {after:?}")]
    Timeout {
        id: RequestId,
        after: std::time::Duration,
    },

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
