//! LSP message transport: framing, demultiplexing and request correlation.

pub mod client;
pub mod codec;
pub mod console;
pub mod demux;
pub mod error;
pub mod handler;
pub mod message_parser;
pub mod promise_map;
pub mod queue;
pub mod stdio_transport;
pub mod types;

pub use client::{ClientConfig, LspClient};
pub use demux::{spawn_demuxer, FromServer, StreamDemuxer};
pub use error::{FramingError, ProtocolError, ResponseError, TransportError};
pub use queue::AsyncQueue;
pub use types::{Message, Notification, Request, RequestId, Response};
