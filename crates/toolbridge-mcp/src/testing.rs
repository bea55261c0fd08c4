//! Scripted transports for unit tests.

use crate::config::{HttpMode, ServerConfig, TransportKind};
use crate::error::{McpError, McpResult};
use crate::oauth::OAuthProvider;
use crate::protocol::{methods, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Transport, TransportEvent, TransportEvents, TransportFactory};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How the mock answers one request.
pub(crate) enum MockReply {
    /// Respond with this result.
    Result(Value),
    /// Respond with a JSON-RPC error object.
    RpcError(i64, String),
    /// Fail the `send` call itself.
    Fail(fn() -> McpError),
    /// Never respond.
    Silent,
}

type Responder = Arc<dyn Fn(&JsonRpcRequest) -> MockReply + Send + Sync>;

/// In-memory transport driven by a responder function.
pub(crate) struct MockTransport {
    responder: Responder,
    kind: TransportKind,
    start_error: Option<fn() -> McpError>,
    tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new(
        responder: impl Fn(&JsonRpcRequest) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            kind: TransportKind::Stdio,
            start_error: None,
            tx: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A well-behaved server that answers the handshake and nothing else.
    pub(crate) fn server() -> Self {
        Self::new(|req| match req.method.as_str() {
            methods::INITIALIZE => MockReply::Result(initialize_result()),
            _ => MockReply::Result(json!({})),
        })
    }

    pub(crate) fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Make `start` fail with this error.
    pub(crate) fn failing_start(mut self, error: fn() -> McpError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Push a server-originated message.
    pub(crate) fn emit(&self, message: JsonRpcMessage) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(TransportEvent::Message(message));
        }
    }

    /// Simulate the server going away.
    pub(crate) fn close_remotely(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(TransportEvent::Closed);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Methods of every request and notification sent, in order.
    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect()
    }

    /// Number of requests sent for `method`.
    pub(crate) fn request_count(&self, method: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.is_request() && m.method() == Some(method))
            .count()
    }

    /// Params of every notification sent for `method`.
    pub(crate) fn sent_notifications(&self, method: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Notification(n) if n.method == method => {
                    Some(n.params.clone().unwrap_or(Value::Null))
                }
                _ => None,
            })
            .collect()
    }

    /// Responses the client sent to server requests.
    pub(crate) fn sent_responses(&self) -> Vec<JsonRpcResponse> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Response(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> McpResult<TransportEvents> {
        if let Some(error) = self.start_error {
            return Err(error());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        self.sent.lock().unwrap().push(message.clone());

        let JsonRpcMessage::Request(request) = message else {
            return Ok(());
        };
        let response = match (self.responder)(request) {
            MockReply::Result(result) => JsonRpcResponse::success(request.id.clone(), result),
            MockReply::RpcError(code, text) => {
                JsonRpcResponse::failure(request.id.clone(), code, text)
            }
            MockReply::Fail(error) => return Err(error()),
            MockReply::Silent => return Ok(()),
        };
        self.emit(response.into());
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_remotely();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn finish_auth(&self, code: &str) -> McpResult<()> {
        if self.kind != TransportKind::Http {
            return Err(McpError::Unsupported(format!(
                "{} transport does not support authentication",
                self.kind
            )));
        }
        self.sent.lock().unwrap().push(
            crate::protocol::JsonRpcNotification::new("test/finish_auth", Some(json!({ "code": code })))
                .into(),
        );
        Ok(())
    }
}

/// Handshake result served by [`MockTransport::server`].
pub(crate) fn initialize_result() -> Value {
    json!({
        "protocolVersion": crate::protocol::PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": true } },
        "serverInfo": { "name": "mock", "version": "1.0.0" }
    })
}

type Builder = Arc<dyn Fn(&str, HttpMode) -> McpResult<Arc<MockTransport>> + Send + Sync>;

/// Factory that records every construction and hands out mock transports.
pub(crate) struct CountingFactory {
    builder: Builder,
    created: Mutex<Vec<(String, HttpMode)>>,
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    constructions: AtomicUsize,
}

impl CountingFactory {
    pub(crate) fn new(
        builder: impl Fn(&str, HttpMode) -> McpResult<Arc<MockTransport>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            builder: Arc::new(builder),
            created: Mutex::new(Vec::new()),
            transports: Mutex::new(HashMap::new()),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Every server gets a fresh [`MockTransport::server`].
    pub(crate) fn servers() -> Self {
        Self::new(|_, _| Ok(Arc::new(MockTransport::server())))
    }

    pub(crate) fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Dialects requested, in order.
    pub(crate) fn modes(&self) -> Vec<HttpMode> {
        self.created.lock().unwrap().iter().map(|(_, m)| *m).collect()
    }

    /// Most recent transport built for `server`.
    pub(crate) fn transport(&self, server: &str) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[server].clone()
    }
}

#[async_trait]
impl TransportFactory for CountingFactory {
    async fn create(
        &self,
        server: &str,
        _config: &ServerConfig,
        mode: HttpMode,
        _oauth: Option<Arc<OAuthProvider>>,
    ) -> McpResult<Arc<dyn Transport>> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push((server.to_string(), mode));
        let transport = (self.builder)(server, mode)?;
        self.transports
            .lock()
            .unwrap()
            .insert(server.to_string(), transport.clone());
        Ok(transport)
    }
}
