//! Streamable HTTP transport.
//!
//! Every outgoing message is one POST. The reply body is either plain JSON
//! (a message or a batch), an event stream carrying messages, or empty with
//! `202 Accepted`. The server may assign a session id, which is echoed on
//! every later request and released with `DELETE` on close.

use super::event_stream::SseDecoder;
use super::{exchange_timeout, http_error, Transport, TransportEvent, TransportEvents};
use crate::config::TransportKind;
use crate::error::{McpError, McpResult};
use crate::oauth::OAuthProvider;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

/// Session header assigned by the server.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// MCP transport over streamable HTTP.
pub struct StreamableHttpTransport {
    server: String,
    url: Url,
    headers: HeaderMap,
    oauth: Option<Arc<OAuthProvider>>,
    client: Client,
    request_timeout: Duration,
    session_id: RwLock<Option<String>>,
    events: std::sync::Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    /// Create a transport for `url`. Nothing is sent until the first message.
    pub fn new(
        server: &str,
        url: Url,
        headers: HashMap<String, String>,
        oauth: Option<Arc<OAuthProvider>>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| McpError::transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            server: server.to_string(),
            url,
            headers: header_map(&headers)?,
            oauth,
            client,
            request_timeout,
            session_id: RwLock::new(None),
            events: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    fn sender(&self) -> McpResult<mpsc::UnboundedSender<TransportEvent>> {
        self.events
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| McpError::transport("transport is not started"))
    }

    async fn build_request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url.clone())
            .headers(self.headers.clone());

        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, id);
        }
        if let Some(oauth) = &self.oauth {
            if let Some(token) = oauth.access_token().await {
                req = req.bearer_auth(token);
            }
        }
        req
    }

    fn spawn_stream_reader(&self, response: reqwest::Response, tx: mpsc::UnboundedSender<TransportEvent>) {
        let server = self.server.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                let (events, done) = match chunk {
                    Some(Ok(bytes)) => (decoder.push(&bytes), false),
                    Some(Err(e)) => {
                        let _ = tx.send(TransportEvent::Error(McpError::Request(e)));
                        return;
                    }
                    None => (decoder.finish().into_iter().collect(), true),
                };

                for event in events.iter().filter(|e| e.event == "message") {
                    forward_payload(&server, &event.data, &tx);
                }
                if done {
                    trace!(server = %server, "Response stream ended");
                    return;
                }
            }
        });
    }
}

pub(super) fn forward_payload(server: &str, payload: &str, tx: &mpsc::UnboundedSender<TransportEvent>) {
    match JsonRpcMessage::parse_batch(payload) {
        Ok(messages) => {
            for message in messages {
                let _ = tx.send(TransportEvent::Message(message));
            }
        }
        Err(e) => {
            debug!(server = %server, error = %e, "Dropping malformed message");
            let _ = tx.send(TransportEvent::Error(e));
        }
    }
}

pub(super) fn header_map(headers: &HashMap<String, String>) -> McpResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| McpError::transport(format!("invalid header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::transport(format!("invalid value for header {key}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> McpResult<TransportEvents> {
        let mut guard = self
            .events
            .lock()
            .map_err(|_| McpError::transport("transport state poisoned"))?;
        if guard.is_some() {
            return Err(McpError::transport("streamable HTTP transport already started"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        debug!(server = %self.server, url = %self.url, "Started streamable HTTP transport");
        Ok(rx)
    }

    async fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        let tx = self.sender()?;
        let body = serde_json::to_vec(message)?;

        trace!(server = %self.server, method = ?message.method(), "POST message");

        let mut req = self
            .build_request(reqwest::Method::POST)
            .await
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(timeout) = exchange_timeout(message, self.request_timeout) {
            req = req.timeout(timeout);
        }
        let response = req.send().await?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session_id.write().await;
            if session.as_deref() != Some(id) {
                debug!(server = %self.server, session = %id, "Received MCP session id");
                *session = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(response).await);
        }
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            self.spawn_stream_reader(response, tx);
            return Ok(());
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(());
        }
        match JsonRpcMessage::parse_batch(&text) {
            Ok(messages) => {
                for message in messages {
                    let _ = tx.send(TransportEvent::Message(message));
                }
                Ok(())
            }
            Err(e) => Err(McpError::protocol_error(format!("Invalid JSON response: {e}"))),
        }
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();

        if self.session_id.read().await.is_some() {
            let req = self
                .build_request(reqwest::Method::DELETE)
                .await
                .timeout(self.request_timeout);
            match req.send().await {
                Ok(response) if !response.status().is_success() => {
                    // 405 means the server does not allow clients to end sessions.
                    debug!(server = %self.server, status = %response.status(), "Session termination refused");
                }
                Ok(_) => {}
                Err(e) => warn!(server = %self.server, error = %e, "Failed to terminate MCP session"),
            }
        }

        if let Ok(mut guard) = self.events.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(TransportEvent::Closed);
            }
        }

        debug!(server = %self.server, "Closed streamable HTTP transport");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn finish_auth(&self, code: &str) -> McpResult<()> {
        let oauth = self.oauth.as_ref().ok_or_else(|| {
            McpError::authentication(&self.server, "server has no OAuth configuration")
        })?;
        oauth.finish_authorization(code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthSettings;
    use crate::oauth::{InMemoryOAuthStorage, OAuthTokens};
    use crate::protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> StreamableHttpTransport {
        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        StreamableHttpTransport::new("remote", url, HashMap::new(), None, Duration::from_secs(5)).unwrap()
    }

    fn request(id: u64) -> JsonRpcMessage {
        JsonRpcRequest::new(id, "tools/list", None).into()
    }

    async fn next_message(rx: &mut TransportEvents) -> JsonRpcMessage {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(TransportEvent::Message(m))) => return m,
                Ok(Some(_)) => continue,
                other => panic!("no message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_requires_start() {
        let server = MockServer::start().await;
        let t = transport(&server);
        assert!(t.send(&request(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_json_response_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-1")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})),
            )
            .mount(&server)
            .await;

        let t = transport(&server);
        let mut rx = t.start().await.unwrap();
        t.send(&request(1)).await.unwrap();

        match next_message(&mut rx).await {
            JsonRpcMessage::Response(r) => assert_eq!(r.id, RequestId::Number(1)),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(t.session_id().await.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_session_id_is_echoed_and_released() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("mcp-session-id", "sess-2"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-2")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "sess-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(&server);
        let mut rx = t.start().await.unwrap();
        t.send(&request(1)).await.unwrap();
        next_message(&mut rx).await;

        let note: JsonRpcMessage = JsonRpcNotification::new("notifications/initialized", None).into();
        t.send(&note).await.unwrap();
        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_stream_response() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"progress\":1}}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n",
            "\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let t = transport(&server);
        let mut rx = t.start().await.unwrap();
        t.send(&request(3)).await.unwrap();

        assert_eq!(next_message(&mut rx).await.method(), Some("notifications/progress"));
        match next_message(&mut rx).await {
            JsonRpcMessage::Response(r) => assert_eq!(r.result, Some(json!({"ok": true}))),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"jsonrpc": "2.0", "id": 1, "result": {}},
                {"jsonrpc": "2.0", "id": 2, "result": {}},
            ])))
            .mount(&server)
            .await;

        let t = transport(&server);
        let mut rx = t.start().await.unwrap();
        t.send(&request(1)).await.unwrap();
        next_message(&mut rx).await;
        next_message(&mut rx).await;
    }

    #[tokio::test]
    async fn test_http_status_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let t = transport(&server);
        let _rx = t.start().await.unwrap();
        let err = t.send(&request(1)).await.unwrap_err();
        assert_eq!(err.http_status(), Some(405));
    }

    #[tokio::test]
    async fn test_slow_request_outlives_transport_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(400))
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let t = StreamableHttpTransport::new("remote", url, HashMap::new(), None, Duration::from_millis(100))
            .unwrap();
        let mut rx = t.start().await.unwrap();

        t.send(&request(1)).await.unwrap();
        next_message(&mut rx).await;

        let note: JsonRpcMessage = JsonRpcNotification::new("notifications/initialized", None).into();
        let err = t.send(&note).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_bearer_token_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let oauth = Arc::new(OAuthProvider::new(
            "remote",
            url.clone(),
            OAuthSettings::default(),
            Arc::new(InMemoryOAuthStorage::new()),
            false,
        ));
        oauth
            .save_tokens(OAuthTokens {
                access_token: "tok".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: None,
                expires_in: None,
                scope: None,
            })
            .await;

        let t = StreamableHttpTransport::new("remote", url, HashMap::new(), Some(oauth), Duration::from_secs(5))
            .unwrap();
        let _rx = t.start().await.unwrap();
        let note: JsonRpcMessage = JsonRpcNotification::new("notifications/initialized", None).into();
        t.send(&note).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "k"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("X-Api-Key".to_string(), "k".to_string());
        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let t = StreamableHttpTransport::new("remote", url, headers, None, Duration::from_secs(5)).unwrap();
        let _rx = t.start().await.unwrap();
        let note: JsonRpcMessage = JsonRpcNotification::new("notifications/initialized", None).into();
        t.send(&note).await.unwrap();
    }

    #[test]
    fn test_invalid_header_name() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        assert!(header_map(&headers).is_err());
    }

    #[tokio::test]
    async fn test_finish_auth_without_oauth() {
        let server = MockServer::start().await;
        let err = transport(&server).finish_auth("code").await.unwrap_err();
        assert!(err.is_authentication());
    }
}
