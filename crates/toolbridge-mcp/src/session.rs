//! JSON-RPC session over a started transport.
//!
//! Correlates outgoing requests with responses through a pending map keyed by
//! request id, and dispatches everything else the server sends.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    methods, ClientInfo, InitializeParams, InitializeResult, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<McpResult<Value>>>>>;

/// Called when the server announces that its tool list changed.
pub type ToolsChangedHook = Arc<dyn Fn() + Send + Sync>;

/// One live protocol session with a server.
pub struct McpSession {
    server: String,
    transport: Arc<dyn Transport>,
    pending: Pending,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl McpSession {
    /// Take ownership of a started transport's events and begin dispatching.
    pub fn new(
        server: &str,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        on_tools_changed: Option<ToolsChangedHook>,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let dispatcher = tokio::spawn(dispatch(
            server.to_string(),
            transport.clone(),
            pending.clone(),
            open.clone(),
            on_tools_changed,
            events,
        ));

        Self {
            server: server.to_string(),
            transport,
            pending,
            next_id: AtomicU64::new(1),
            open,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        }
    }

    /// Whether the underlying transport is still usable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The transport this session runs on.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Perform the `initialize` / `initialized` handshake.
    pub async fn initialize(
        &self,
        client_info: ClientInfo,
        timeout: Duration,
    ) -> McpResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::new(client_info))?;
        let result = self
            .request(methods::INITIALIZE, Some(params), timeout, None)
            .await?;
        let result: InitializeResult = serde_json::from_value(result).map_err(|e| {
            McpError::protocol_error(format!("Invalid initialize result: {e}"))
        })?;

        self.notify(methods::INITIALIZED, None).await?;

        debug!(
            server = %self.server,
            remote = %result.server_info.name,
            protocol = %result.protocol_version,
            "Handshake complete"
        );
        Ok(result)
    }

    /// Send a request and wait for its result.
    ///
    /// On timeout or cancellation the pending entry is evicted, the server is
    /// told via `notifications/cancelled`, and a late response is discarded.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> McpResult<Value> {
        if !self.is_open() {
            return Err(McpError::transport("connection closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        // The dispatcher may have drained the map between the check and the insert.
        if !self.is_open() {
            self.pending.lock().await.remove(&id);
            return Err(McpError::transport("connection closed"));
        }

        trace!(server = %self.server, id, method = %method, "Sending request");
        let message: JsonRpcMessage = JsonRpcRequest::new(id, method, params).into();

        let exchange = async {
            self.transport.send(&message).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(McpError::transport("connection closed before response")),
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = tokio::time::timeout(timeout, exchange) => match outcome {
                Ok(result) => {
                    if result.is_err() {
                        self.pending.lock().await.remove(&id);
                    }
                    result
                }
                Err(_) => {
                    self.abandon(id, "timeout").await;
                    Err(McpError::timeout(
                        &self.server,
                        None,
                        format!("{method} timed out after {}ms", timeout.as_millis()),
                    ))
                }
            },
            _ = cancelled => {
                self.abandon(id, "cancelled by client").await;
                Err(McpError::timeout(&self.server, None, format!("{method} was cancelled")))
            }
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let message: JsonRpcMessage = JsonRpcNotification::new(method, params).into();
        self.transport.send(&message).await
    }

    /// Number of requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Close the transport and reject every pending request.
    pub async fn close(&self) -> McpResult<()> {
        self.open.store(false, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
        let result = self.transport.close().await;
        reject_all(&self.server, &self.pending).await;
        result
    }

    async fn abandon(&self, id: u64, reason: &str) {
        if self.pending.lock().await.remove(&id).is_none() {
            return;
        }
        debug!(server = %self.server, id, reason = %reason, "Abandoning request");
        let params = json!({ "requestId": id, "reason": reason });
        if let Err(e) = self.notify(methods::CANCELLED, Some(params)).await {
            debug!(server = %self.server, error = %e, "Failed to send cancellation");
        }
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }
}

async fn reject_all(server: &str, pending: &Pending) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    if !drained.is_empty() {
        debug!(server = %server, count = drained.len(), "Rejecting pending requests");
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(McpError::transport("connection closed")));
    }
}

async fn dispatch(
    server: String,
    transport: Arc<dyn Transport>,
    pending: Pending,
    open: Arc<AtomicBool>,
    on_tools_changed: Option<ToolsChangedHook>,
    mut events: TransportEvents,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(JsonRpcMessage::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    debug!(server = %server, id = %response.id, "Response with foreign id");
                    continue;
                };
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response.into_result());
                    }
                    None => debug!(server = %server, id, "Discarding response for unknown or abandoned request"),
                }
            }
            TransportEvent::Message(JsonRpcMessage::Notification(notification)) => {
                match notification.method.as_str() {
                    methods::TOOLS_LIST_CHANGED => {
                        info!(server = %server, "Tool list changed");
                        if let Some(hook) = &on_tools_changed {
                            hook();
                        }
                    }
                    methods::PROGRESS => {
                        debug!(server = %server, params = ?notification.params, "Progress");
                    }
                    methods::CANCELLED => {
                        debug!(server = %server, params = ?notification.params, "Server cancelled request");
                    }
                    other => trace!(server = %server, method = %other, "Ignoring notification"),
                }
            }
            TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                let reply = if request.method == methods::PING {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    debug!(server = %server, method = %request.method, "Rejecting server request");
                    JsonRpcResponse::failure(
                        request.id,
                        METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    )
                };
                if let Err(e) = transport.send(&reply.into()).await {
                    debug!(server = %server, error = %e, "Failed to answer server request");
                }
            }
            TransportEvent::Error(e) => {
                warn!(server = %server, error = %e, "Transport error");
            }
            TransportEvent::Closed => break,
        }
    }

    open.store(false, Ordering::SeqCst);
    info!(server = %server, "Connection closed");
    reject_all(&server, &pending).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockReply, MockTransport};
    use std::sync::atomic::AtomicUsize;

    const SHORT: Duration = Duration::from_millis(200);
    const LONG: Duration = Duration::from_secs(5);

    async fn session(transport: Arc<MockTransport>) -> McpSession {
        let events = transport.start().await.unwrap();
        McpSession::new("test", transport, events, None)
    }

    #[tokio::test]
    async fn test_request_resolves() {
        let transport = Arc::new(MockTransport::server());
        let session = session(transport.clone()).await;

        let result = session.initialize(ClientInfo::default(), LONG).await.unwrap();
        assert_eq!(result.server_info.name, "mock");
        assert_eq!(
            transport.sent_methods(),
            vec!["initialize", "notifications/initialized"]
        );
        assert_eq!(session.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let transport = Arc::new(MockTransport::new(|req| {
            MockReply::Result(json!({ "echo": req.params.clone() }))
        }));
        let session = session(transport).await;

        let (a, b) = tokio::join!(
            session.request("a", Some(json!(1)), LONG, None),
            session.request("b", Some(json!(2)), LONG, None),
        );
        assert_eq!(a.unwrap()["echo"], 1);
        assert_eq!(b.unwrap()["echo"], 2);
    }

    #[tokio::test]
    async fn test_rpc_error_is_structured() {
        let transport = Arc::new(MockTransport::new(|_| {
            MockReply::RpcError(METHOD_NOT_FOUND, "Method not found".to_string())
        }));
        let session = session(transport).await;

        let err = session.request("prompts/list", None, LONG, None).await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(METHOD_NOT_FOUND));
        assert!(err.is_method_not_found());
    }

    #[tokio::test]
    async fn test_send_failure_clears_pending() {
        let transport = Arc::new(MockTransport::new(|_| {
            MockReply::Fail(|| McpError::transport("broken pipe"))
        }));
        let session = session(transport).await;

        assert!(session.request("x", None, LONG, None).await.is_err());
        assert_eq!(session.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_evicts_and_notifies() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::Silent));
        let session = session(transport.clone()).await;

        let err = session.request("slow", None, SHORT, None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.pending_requests().await, 0);

        let cancelled = transport.sent_notifications(methods::CANCELLED);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0]["requestId"], 1);
        assert_eq!(cancelled[0]["reason"], "timeout");

        // A late response for the abandoned id is discarded.
        transport.emit(JsonRpcResponse::success(crate::protocol::RequestId::Number(1), json!({})).into());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_open());
        assert_eq!(session.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::Silent));
        let session = session(transport.clone()).await;
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = session.request("slow", None, LONG, Some(&token)).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(session.pending_requests().await, 0);
        assert_eq!(transport.sent_notifications(methods::CANCELLED).len(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_rejects_pending() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::Silent));
        let session = Arc::new(session(transport.clone()).await);

        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.request("slow", None, LONG, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close_remotely();

        let err = tokio::time::timeout(LONG, waiting).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
        assert!(!session.is_open());
        assert!(session.request("again", None, LONG, None).await.is_err());
    }

    #[tokio::test]
    async fn test_request_racing_close_is_not_stranded() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::Silent));
        let session = Arc::new(session(transport).await);

        // Hold the map so the request stalls between its open check and its insert.
        let guard = session.pending.lock().await;
        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.request("slow", None, LONG, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.open.store(false, Ordering::SeqCst);
        drop(guard);

        let err = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
        assert_eq!(session.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_local_close_rejects_pending() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::Silent));
        let session = Arc::new(session(transport.clone()).await);

        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.request("slow", None, LONG, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await.unwrap();

        assert!(tokio::time::timeout(LONG, waiting).await.unwrap().unwrap().is_err());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let transport = Arc::new(MockTransport::server());
        let _session = session(transport.clone()).await;

        transport.emit(JsonRpcRequest::new(41, "ping", None).into());
        transport.emit(JsonRpcRequest::new(42, "sampling/createMessage", None).into());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let replies = transport.sent_responses();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].result, Some(json!({})));
        assert_eq!(replies[1].error.as_ref().map(|e| e.code), Some(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_list_changed_invokes_hook() {
        let transport = Arc::new(MockTransport::server());
        let events = transport.start().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook: ToolsChangedHook = {
            let calls = calls.clone();
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _session = McpSession::new("test", transport.clone(), events, Some(hook));

        transport.emit(JsonRpcNotification::new(methods::PROGRESS, Some(json!({"progress": 1}))).into());
        transport.emit(JsonRpcNotification::new(methods::TOOLS_LIST_CHANGED, None).into());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
