//! Demultiplexer for the server's output stream.
//!
//! The demultiplexer drains raw byte chunks from its input queue, reassembles
//! frames, classifies each message and routes it:
//!
//! - responses resolve the matching entry in [`FromServer::responses`]
//! - notifications go to [`FromServer::notifications`]
//! - server-to-client requests go to [`FromServer::requests`]
//!
//! A message that cannot be parsed or classified is logged and skipped. A
//! framing error ends the connection: every pending request is failed and the
//! shared cancellation token is cancelled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::lsp::codec::FrameDecoder;
use crate::lsp::error::{FramingError, ResponseError};
use crate::lsp::message_parser::parse_message;
use crate::lsp::promise_map::{PromiseMap, SetOutcome};
use crate::lsp::queue::AsyncQueue;
use crate::lsp::types::{Message, Notification, Request, RequestId, Response, Sink};

const TARGET: &str = "demo_lsp_client::demux";

/// The three sinks the demultiplexer writes into.
#[derive(Default)]
pub struct FromServer {
    responses: PromiseMap<RequestId, Response>,
    notifications: AsyncQueue<Notification>,
    requests: AsyncQueue<Request>,
    protocol_errors: AtomicUsize,
}

impl FromServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> &PromiseMap<RequestId, Response> {
        &self.responses
    }

    pub fn notifications(&self) -> &AsyncQueue<Notification> {
        &self.notifications
    }

    pub fn requests(&self) -> &AsyncQueue<Request> {
        &self.requests
    }

    /// Number of frames skipped because they were not usable messages.
    pub fn protocol_errors(&self) -> usize {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Fail every request still waiting for a response and refuse new ones.
    pub fn fail_pending(&self, reason: &str) -> usize {
        self.responses.close(|id| {
            Response::error(
                id.clone(),
                ResponseError::internal(format!("connection closed: {}", reason)),
            )
        })
    }
}

pub struct StreamDemuxer {
    decoder: FrameDecoder,
    sinks: Arc<FromServer>,
}

impl StreamDemuxer {
    pub fn new(sinks: Arc<FromServer>) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            sinks,
        }
    }

    /// Feed one inbound chunk and route every frame it completes.
    ///
    /// Returns the number of frames completed. Only framing errors are
    /// returned; bad payloads are counted and skipped.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<usize, FramingError> {
        self.decoder.push(chunk);
        let mut frames = 0;
        while let Some(payload) = self.decoder.next_frame()? {
            frames += 1;
            match parse_message(&payload) {
                Ok(message) => {
                    self.route(message);
                }
                Err(e) => {
                    self.sinks.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(target: TARGET, "Skipping unusable message: {}", e);
                }
            }
        }
        Ok(frames)
    }

    /// Deliver a classified message to its sink.
    pub fn route(&self, message: Message) -> Sink {
        let sink = message.sink();
        match message {
            Message::Response(response) => {
                let id = response.id.clone();
                trace!(target: TARGET, "server -> client: response {}", id);
                match self.sinks.responses.set(id.clone(), response) {
                    SetOutcome::Delivered | SetOutcome::Stored => {}
                    SetOutcome::Rejected => {
                        warn!(
                            target: TARGET,
                            "Dropping response for request {} that is already answered or abandoned",
                            id
                        );
                    }
                }
            }
            Message::Notification(notification) => {
                trace!(
                    target: TARGET,
                    "server -> client: notification {}",
                    notification.method
                );
                self.sinks.notifications.enqueue(notification);
            }
            Message::Request(request) => {
                trace!(
                    target: TARGET,
                    "server -> client: request {} ({})",
                    request.id,
                    request.method
                );
                self.sinks.requests.enqueue(request);
            }
        }
        sink
    }

    /// Drain `input` until `cancel` fires or the stream breaks.
    ///
    /// On exit every pending request is failed. A framing error also cancels
    /// `cancel`, taking the rest of the session down with it.
    pub async fn run(mut self, input: Arc<AsyncQueue<Vec<u8>>>, cancel: CancellationToken) {
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Bytes that arrived before the cancellation are still routed.
                    match self.drain(&input) {
                        Ok(()) => break String::from("session cancelled"),
                        Err(e) => break e.to_string(),
                    }
                }
                chunk = input.dequeue() => {
                    if let Err(e) = self.ingest(&chunk) {
                        warn!(target: TARGET, "Framing error, closing connection: {}", e);
                        cancel.cancel();
                        break e.to_string();
                    }
                }
            }
        };

        let failed = self.sinks.fail_pending(&reason);
        debug!(
            target: TARGET,
            "Demultiplexer stopped ({}), failed {} pending request(s)",
            reason,
            failed
        );
    }

    fn drain(&mut self, input: &AsyncQueue<Vec<u8>>) -> Result<(), FramingError> {
        while let Some(chunk) = input.try_dequeue() {
            self.ingest(&chunk)?;
        }
        Ok(())
    }
}

/// Handle to a running demultiplexer task. Dropping it cancels the session.
pub struct DemuxTaskHandle {
    join_handle: JoinHandle<()>,
    _cancel_on_drop: DropGuard,
}

impl DemuxTaskHandle {
    /// Wait for the task to finish.
    pub async fn join(self) {
        let DemuxTaskHandle {
            join_handle,
            _cancel_on_drop,
        } = self;
        if let Err(e) = join_handle.await {
            warn!(target: TARGET, "Demultiplexer task failed: {}", e);
        }
    }
}

/// Spawn a demultiplexer draining `input` into `sinks`.
pub fn spawn_demuxer(
    input: Arc<AsyncQueue<Vec<u8>>>,
    sinks: Arc<FromServer>,
    cancel: CancellationToken,
) -> DemuxTaskHandle {
    let demuxer = StreamDemuxer::new(sinks);
    DemuxTaskHandle {
        _cancel_on_drop: cancel.clone().drop_guard(),
        join_handle: tokio::spawn(demuxer.run(input, cancel)),
    }
}
