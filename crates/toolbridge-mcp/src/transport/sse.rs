//! Legacy HTTP+SSE transport.
//!
//! A long-lived GET receives server messages as `message` events. The first
//! `endpoint` event names the URL that client messages are POSTed to.

use super::event_stream::SseDecoder;
use super::streamable::{forward_payload, header_map};
use super::{exchange_timeout, http_error, Transport, TransportEvent, TransportEvents};
use crate::config::TransportKind;
use crate::error::{McpError, McpResult};
use crate::oauth::OAuthProvider;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

/// MCP transport over HTTP with server-sent events.
pub struct SseTransport {
    server: String,
    url: Url,
    headers: HeaderMap,
    oauth: Option<Arc<OAuthProvider>>,
    client: Client,
    request_timeout: Duration,
    endpoint: RwLock<Option<Url>>,
    events: std::sync::Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    cancel: CancellationToken,
}

impl SseTransport {
    /// Create a transport for `url`. The event stream is opened by `start`.
    pub fn new(
        server: &str,
        url: Url,
        headers: HashMap<String, String>,
        oauth: Option<Arc<OAuthProvider>>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        // No total timeout: the GET stream stays open for the session.
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
            endpoint: RwLock::new(None),
            events: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// POST endpoint announced by the server, once started.
    pub async fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().await.clone()
    }

    async fn authorize(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(oauth) = &self.oauth {
            if let Some(token) = oauth.access_token().await {
                req = req.bearer_auth(token);
            }
        }
        req
    }

    fn spawn_reader(
        &self,
        response: reqwest::Response,
        tx: mpsc::UnboundedSender<TransportEvent>,
        endpoint_tx: oneshot::Sender<McpResult<Url>>,
    ) {
        let server = self.server.clone();
        let base = self.url.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut endpoint_tx = Some(endpoint_tx);

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let (events, done) = match chunk {
                    Some(Ok(bytes)) => (decoder.push(&bytes), false),
                    Some(Err(e)) => {
                        let _ = tx.send(TransportEvent::Error(McpError::Request(e)));
                        (Vec::new(), true)
                    }
                    None => (decoder.finish().into_iter().collect(), true),
                };

                for event in events {
                    match event.event.as_str() {
                        "endpoint" => {
                            let resolved = resolve_endpoint(&base, &event.data);
                            match endpoint_tx.take() {
                                Some(sender) => {
                                    let _ = sender.send(resolved);
                                }
                                None => debug!(server = %server, "Ignoring repeated endpoint event"),
                            }
                        }
                        "message" => forward_payload(&server, &event.data, &tx),
                        other => trace!(server = %server, event = %other, "Ignoring event"),
                    }
                }
                if done {
                    break;
                }
            }

            if let Some(sender) = endpoint_tx.take() {
                let _ = sender.send(Err(McpError::transport(
                    "event stream ended before the endpoint event",
                )));
            }
            debug!(server = %server, "SSE stream closed");
            let _ = tx.send(TransportEvent::Closed);
        });
    }
}

/// Resolve the announced POST endpoint; it must share the server's origin.
fn resolve_endpoint(base: &Url, data: &str) -> McpResult<Url> {
    let endpoint = base
        .join(data.trim())
        .map_err(|e| McpError::protocol_error(format!("invalid endpoint {data}: {e}")))?;
    if endpoint.origin() != base.origin() {
        return Err(McpError::protocol_error(format!(
            "endpoint origin {} does not match server origin {}",
            endpoint.origin().ascii_serialization(),
            base.origin().ascii_serialization()
        )));
    }
    Ok(endpoint)
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> McpResult<TransportEvents> {
        if self.events.lock().map(|g| g.is_some()).unwrap_or(true) {
            return Err(McpError::transport("SSE transport already started"));
        }

        debug!(server = %self.server, url = %self.url, "Opening SSE stream");
        let req = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream");
        let response = self.authorize(req).await.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(response).await);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        self.spawn_reader(response, tx.clone(), endpoint_tx);

        let endpoint = match tokio::time::timeout(self.request_timeout, endpoint_rx).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(e))) => {
                self.cancel.cancel();
                return Err(e);
            }
            Ok(Err(_)) => {
                self.cancel.cancel();
                return Err(McpError::transport("event stream reader exited"));
            }
            Err(_) => {
                self.cancel.cancel();
                return Err(McpError::timeout(
                    &self.server,
                    None,
                    format!("no endpoint event within {:?}", self.request_timeout),
                ));
            }
        };

        debug!(server = %self.server, endpoint = %endpoint, "Received SSE endpoint");
        *self.endpoint.write().await = Some(endpoint);
        if let Ok(mut guard) = self.events.lock() {
            *guard = Some(tx);
        }
        Ok(rx)
    }

    async fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        let endpoint = self
            .endpoint()
            .await
            .ok_or_else(|| McpError::transport("transport is not started"))?;
        let body = serde_json::to_vec(message)?;

        trace!(server = %self.server, method = ?message.method(), "POST message");

        let mut req = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(timeout) = exchange_timeout(message, self.request_timeout) {
            req = req.timeout(timeout);
        }
        let response = self.authorize(req).await.send().await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        *self.endpoint.write().await = None;
        match self.events.lock() {
            Ok(mut guard) => {
                if let Some(tx) = guard.take() {
                    let _ = tx.send(TransportEvent::Closed);
                }
            }
            Err(_) => warn!(server = %self.server, "SSE transport state poisoned"),
        }
        debug!(server = %self.server, "Closed SSE transport");
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
