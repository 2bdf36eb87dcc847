//! The client side of one LSP session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use lsp_types::notification::{Exit, Initialized, LogMessage, Notification as _};
use lsp_types::request::{Initialize, Request as _, Shutdown};
use lsp_types::{ClientCapabilities, ClientInfo, InitializeParams};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::lsp::codec;
use crate::lsp::console::Console;
use crate::lsp::demux::FromServer;
use crate::lsp::error::{ResponseError, TransportError, TransportResult};
use crate::lsp::handler::{NotificationHandler, RequestHandler};
use crate::lsp::queue::AsyncQueue;
use crate::lsp::types::{Notification, Request, RequestId, Response};

const TARGET: &str = "demo_lsp_client::client";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sent as `clientInfo.name` in `initialize`.
    pub client_name: String,
    /// How long `request` waits for a response. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            client_name: String::from("demo-language-client"),
            request_timeout: None,
        }
    }
}

pub struct LspClient {
    outbound: Arc<AsyncQueue<Vec<u8>>>,
    from_server: Arc<FromServer>,
    next_id: AtomicI64,
    config: ClientConfig,
    notification_handlers: HashMap<String, Arc<dyn NotificationHandler>>,
    request_handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl LspClient {
    /// Create a client writing frames to `outbound` and reading the sinks the
    /// demultiplexer fills. `window/logMessage` goes to stderr until another
    /// handler is registered for it.
    pub fn new(
        outbound: Arc<AsyncQueue<Vec<u8>>>,
        from_server: Arc<FromServer>,
        config: ClientConfig,
    ) -> Self {
        let mut client = LspClient {
            outbound,
            from_server,
            next_id: AtomicI64::new(1),
            config,
            notification_handlers: HashMap::new(),
            request_handlers: HashMap::new(),
        };
        client.on_notification(LogMessage::METHOD, Console::stderr());
        client
    }

    pub fn on_notification(
        &mut self,
        method: &str,
        handler: impl NotificationHandler + 'static,
    ) -> &mut Self {
        self.notification_handlers
            .insert(method.to_string(), Arc::new(handler));
        self
    }

    pub fn on_request(
        &mut self,
        method: &str,
        handler: impl RequestHandler + 'static,
    ) -> &mut Self {
        self.request_handlers
            .insert(method.to_string(), Arc::new(handler));
        self
    }

    /// Requests sent but not yet answered, plus answers not yet consumed.
    pub fn in_flight(&self) -> usize {
        self.from_server.responses().len()
    }

    /// Send a request and wait for its response.
    ///
    /// A response carrying an `error` member comes back as
    /// [`TransportError::Remote`].
    pub async fn request<P: Serialize>(&self, method: &str, params: P) -> TransportResult<Value> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let params = serde_json::to_value(params).map_err(TransportError::Serialize)?;
        self.send(&Request::new(id.clone(), method, params))?;

        let responses = self.from_server.responses();
        let response = match self.config.request_timeout {
            Some(after) => match tokio::time::timeout(after, responses.take(id.clone())).await {
                Ok(response) => response?,
                Err(_) => {
                    warn!(target: TARGET, "Request {} ({}) timed out", id, method);
                    return Err(TransportError::Timeout { id, after });
                }
            },
            None => responses.take(id.clone()).await?,
        };

        response.into_result().map_err(TransportError::Remote)
    }

    /// Send a notification. Nothing is awaited.
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> TransportResult<()> {
        let params = serde_json::to_value(params).map_err(TransportError::Serialize)?;
        self.send(&Notification::new(method, params))
    }

    /// Run the `initialize` / `initialized` handshake and return the server's
    /// `InitializeResult`.
    pub async fn initialize(&self) -> TransportResult<Value> {
        let params = InitializeParams {
            process_id: None,
            client_info: Some(ClientInfo {
                name: self.config.client_name.clone(),
                version: None,
            }),
            capabilities: ClientCapabilities::default(),
            ..InitializeParams::default()
        };

        let result = self.request(Initialize::METHOD, params).await?;
        self.notify(Initialized::METHOD, serde_json::json!({}))?;
        info!(target: TARGET, "Handshake complete");
        Ok(result)
    }

    /// Handshake, then forward server traffic until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> TransportResult<()> {
        self.initialize().await?;
        self.serve(cancel).await;
        Ok(())
    }

    /// Run the notification and request loops until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) {
        tokio::join!(
            self.process_notifications(&cancel),
            self.process_requests(&cancel)
        );
        debug!(target: TARGET, "Forwarding loops stopped");
    }

    /// `shutdown` request followed by the `exit` notification.
    pub async fn shutdown(&self) -> TransportResult<()> {
        self.request(Shutdown::METHOD, Value::Null).await?;
        self.notify(Exit::METHOD, Value::Null)
    }

    async fn process_notifications(&self, cancel: &CancellationToken) {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                notification = self.from_server.notifications().dequeue() => notification,
            };
            self.dispatch_notification(notification).await;
        }
    }

    async fn process_requests(&self, cancel: &CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.from_server.requests().dequeue() => request,
            };
            let response = self.dispatch_request(request).await;
            if let Err(e) = self.send(&response) {
                warn!(target: TARGET, "Failed to answer request {}: {}", response.id, e);
            }
        }
    }

    async fn dispatch_notification(&self, notification: Notification) {
        let Some(handler) = self.notification_handlers.get(&notification.method) else {
            debug!(
                target: TARGET,
                "No handler for notification {}, dropping",
                notification.method
            );
            return;
        };
        if let Err(e) = handler.handle(notification.params).await {
            warn!(
                target: TARGET,
                "Handler for {} failed: {:#}",
                notification.method,
                e
            );
        }
    }

    async fn dispatch_request(&self, request: Request) -> Response {
        match self.request_handlers.get(&request.method) {
            Some(handler) => match handler.handle(request.params).await {
                Ok(result) => Response::ok(request.id, result),
                Err(error) => Response::error(request.id, error),
            },
            None => {
                debug!(
                    target: TARGET,
                    "No handler for request {} ({})",
                    request.id,
                    request.method
                );
                Response::error(request.id, ResponseError::method_not_found(&request.method))
            }
        }
    }

    fn send(&self, message: &impl Serialize) -> TransportResult<()> {
        let payload = serde_json::to_string(message).map_err(TransportError::Serialize)?;
        trace!(target: TARGET, "client -> server: {}", payload);
        self.outbound.enqueue(codec::encode(&payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::codec::FrameDecoder;
    use crate::lsp::console::tests::SharedBuffer;
    use crate::lsp::error::ErrorCodes;
    use crate::lsp::message_parser::parse_message;
    use crate::lsp::promise_map::SetOutcome;
    use crate::lsp::types::Message;
    use serde_json::json;

    struct Harness {
        outbound: Arc<AsyncQueue<Vec<u8>>>,
        from_server: Arc<FromServer>,
        decoder: FrameDecoder,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                outbound: Arc::new(AsyncQueue::new()),
                from_server: Arc::new(FromServer::new()),
                decoder: FrameDecoder::new(),
            }
        }

        fn client(&self, config: ClientConfig) -> LspClient {
            LspClient::new(
                Arc::clone(&self.outbound),
                Arc::clone(&self.from_server),
                config,
            )
        }

        /// Next message the client wrote, waiting for it if necessary.
        async fn sent(&mut self) -> Message {
            loop {
                if let Some(payload) = self.decoder.next_frame().unwrap() {
                    return parse_message(&payload).unwrap();
                }
                let chunk = self.outbound.dequeue().await;
                self.decoder.push(&chunk);
            }
        }
    }

    #[tokio::test]
    async fn request_resolves_with_result() {
        let mut harness = Harness::new();
        let client = harness.client(ClientConfig::default());

        let (result, request) = tokio::join!(client.request("custom/ping", json!({"n": 1})), async {
            let Message::Request(request) = harness.sent().await else {
                panic!("expected a request");
            };
            harness
                .from_server
                .responses()
                .set(request.id.clone(), Response::ok(request.id.clone(), json!("pong")));
            request
        });

        assert_eq!(request.method, "custom/ping");
        assert_eq!(request.params, json!({"n": 1}));
        assert_eq!(result.unwrap(), json!("pong"));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_responses() {
        let mut harness = Harness::new();
        let client = harness.client(ClientConfig::default());

        let (a, b, ids) = tokio::join!(
            client.request("a", Value::Null),
            client.request("b", Value::Null),
            async {
                let mut seen = Vec::new();
                for _ in 0..2 {
                    let Message::Request(request) = harness.sent().await else {
                        panic!("expected a request");
                    };
                    seen.push((request.id, request.method));
                }
                // Answer in reverse order.
                for (id, method) in seen.iter().rev() {
                    harness
                        .from_server
                        .responses()
                        .set(id.clone(), Response::ok(id.clone(), json!(method)));
                }
                seen.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
            }
        );

        assert_ne!(ids[0], ids[1]);
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn remote_error_is_returned_to_caller() {
        let mut harness = Harness::new();
        let client = harness.client(ClientConfig::default());

        let (result, ()) = tokio::join!(client.request("custom/fail", Value::Null), async {
            let Message::Request(request) = harness.sent().await else {
                panic!("expected a request");
            };
            harness.from_server.responses().set(
                request.id.clone(),
                Response::error(request.id, ResponseError::request_failed("nope")),
            );
        });

        match result {
            Err(TransportError::Remote(error)) => {
                assert_eq!(error.code, ErrorCodes::REQUEST_FAILED);
                assert_eq!(error.message, "nope");
            }
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_times_out_and_retires_id() {
        let mut harness = Harness::new();
        let client = harness.client(ClientConfig {
            request_timeout: Some(Duration::from_millis(20)),
            ..ClientConfig::default()
        });

        let result = client.request("custom/slow", Value::Null).await;
        let Err(TransportError::Timeout { id, after }) = result else {
            panic!("expected a timeout, got {:?}", result);
        };
        assert_eq!(after, Duration::from_millis(20));

        let Message::Request(request) = harness.sent().await else {
            panic!("expected a request");
        };
        assert_eq!(request.id, id);
        assert!(harness.from_server.responses().is_retired(&id));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_request_does_not_linger() {
        let mut harness = Harness::new();
        let client = harness.client(ClientConfig::default());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), client.request("slow", Value::Null))
                .await;
        assert!(abandoned.is_err());
        let Message::Request(request) = harness.sent().await else {
            panic!("expected a request");
        };
        assert_eq!(client.in_flight(), 0);

        let outcome = harness
            .from_server
            .responses()
            .set(request.id.clone(), Response::ok(request.id, json!("too late")));
        assert_eq!(outcome, SetOutcome::Rejected);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn request_after_connection_closed_fails_immediately() {
        let harness = Harness::new();
        let client = harness.client(ClientConfig::default());
        harness.from_server.fail_pending("server exited");

        let result =
            tokio::time::timeout(Duration::from_secs(1), client.request("x", Value::Null)).await;
        assert!(matches!(result, Ok(Err(TransportError::ConnectionClosed))));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn initialize_handshake() {
        let mut harness = Harness::new();
        let client = harness.client(ClientConfig {
            client_name: String::from("test-client"),
            ..ClientConfig::default()
        });

        let (result, (initialize, initialized)) = tokio::join!(client.initialize(), async {
            let Message::Request(initialize) = harness.sent().await else {
                panic!("expected initialize");
            };
            harness.from_server.responses().set(
                initialize.id.clone(),
                Response::ok(initialize.id.clone(), json!({"capabilities": {}})),
            );
            let Message::Notification(initialized) = harness.sent().await else {
                panic!("expected initialized");
            };
            (initialize, initialized)
        });

        assert_eq!(result.unwrap(), json!({"capabilities": {}}));
        assert_eq!(initialize.method, "initialize");
        assert_eq!(initialize.params.get("rootUri"), Some(&Value::Null));
        assert_eq!(initialize.params.get("processId"), Some(&Value::Null));
        assert_eq!(initialize.params["clientInfo"]["name"], "test-client");
        assert_eq!(initialize.params["capabilities"], json!({}));
        assert_eq!(initialized.method, "initialized");
        assert_eq!(initialized.params, json!({}));
    }

    #[tokio::test]
    async fn serve_dispatches_notifications_and_answers_requests() {
        let mut harness = Harness::new();
        let console = SharedBuffer::default();
        let mut client = harness.client(ClientConfig::default());
        client
            .on_notification("window/logMessage", Console::new(console.clone()))
            .on_request(
                "workspace/configuration",
                |params: Value| -> Result<Value, ResponseError> {
                    Ok(json!([params["items"].as_array().map_or(0, |items| items.len())]))
                },
            );

        let sinks = Arc::clone(&harness.from_server);
        sinks.notifications().enqueue(Notification::new(
            "window/logMessage",
            json!({"type": 2, "message": "hello"}),
        ));
        sinks.notifications().enqueue(Notification::new("unknown/thing", Value::Null));
        sinks.requests().enqueue(Request::new(
            "cfg".into(),
            "workspace/configuration",
            json!({"items": [{}, {}]}),
        ));
        sinks
            .requests()
            .enqueue(Request::new(7.into(), "window/workDoneProgress/create", json!({})));

        let cancel = CancellationToken::new();
        let client = Arc::new(client);
        let serving = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            tokio::spawn(async move { client.serve(cancel).await })
        };

        let Message::Response(configured) = harness.sent().await else {
            panic!("expected a response");
        };
        assert_eq!(configured, Response::ok("cfg".into(), json!([2])));

        let Message::Response(unknown) = harness.sent().await else {
            panic!("expected a response");
        };
        assert_eq!(unknown.id, RequestId::Number(7));
        assert_eq!(
            unknown.into_result().unwrap_err().code,
            ErrorCodes::METHOD_NOT_FOUND
        );

        while sinks.notifications().len() > 0 || console.contents().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        serving.await.unwrap();
        assert_eq!(console.contents(), " [warn] hello\n");
    }
}
