//! OAuth support for MCP remote servers.
//!
//! Implements OAuth 2.0 authorization code flow with PKCE: metadata
//! discovery, dynamic client registration, code exchange and refresh. State
//! is persisted through [`OAuthStorage`], keyed by server.

use crate::config::OAuthSettings;
use crate::error::{McpError, McpResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// OAuth callback port.
pub const OAUTH_CALLBACK_PORT: u16 = 19876;

/// OAuth callback path.
pub const OAUTH_CALLBACK_PATH: &str = "/mcp/oauth/callback";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: u64 = 60;

/// Token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Client information, from dynamic registration or configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

/// Tokens as persisted, with an absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp when the access token expires.
    pub expires_at: Option<u64>,
    pub scope: Option<String>,
}

impl StoredTokens {
    fn from_response(tokens: OAuthTokens) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|exp| unix_now() + exp),
            scope: tokens.scope,
        }
    }

    /// Whether the access token can still be used.
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > unix_now() + EXPIRY_MARGIN_SECS,
            None => true,
        }
    }
}

/// Persistence for per-server OAuth state.
#[async_trait]
pub trait OAuthStorage: Send + Sync {
    async fn client_information(&self, server: &str) -> Option<OAuthClientInformation>;
    async fn save_client_information(&self, server: &str, info: OAuthClientInformation);
    async fn tokens(&self, server: &str) -> Option<StoredTokens>;
    async fn save_tokens(&self, server: &str, tokens: StoredTokens);
    async fn code_verifier(&self, server: &str) -> Option<String>;
    async fn save_code_verifier(&self, server: &str, verifier: String);
    async fn clear_code_verifier(&self, server: &str);
}

#[derive(Debug, Clone, Default)]
struct ServerAuthState {
    client_info: Option<OAuthClientInformation>,
    tokens: Option<StoredTokens>,
    code_verifier: Option<String>,
}

/// Process-local storage. State is lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryOAuthStorage {
    servers: RwLock<HashMap<String, ServerAuthState>>,
}

impl InMemoryOAuthStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStorage for InMemoryOAuthStorage {
    async fn client_information(&self, server: &str) -> Option<OAuthClientInformation> {
        self.servers.read().await.get(server)?.client_info.clone()
    }

    async fn save_client_information(&self, server: &str, info: OAuthClientInformation) {
        self.servers
            .write()
            .await
            .entry(server.to_string())
            .or_default()
            .client_info = Some(info);
    }

    async fn tokens(&self, server: &str) -> Option<StoredTokens> {
        self.servers.read().await.get(server)?.tokens.clone()
    }

    async fn save_tokens(&self, server: &str, tokens: StoredTokens) {
        self.servers
            .write()
            .await
            .entry(server.to_string())
            .or_default()
            .tokens = Some(tokens);
    }

    async fn code_verifier(&self, server: &str) -> Option<String> {
        self.servers.read().await.get(server)?.code_verifier.clone()
    }

    async fn save_code_verifier(&self, server: &str, verifier: String) {
        self.servers
            .write()
            .await
            .entry(server.to_string())
            .or_default()
            .code_verifier = Some(verifier);
    }

    async fn clear_code_verifier(&self, server: &str) {
        if let Some(state) = self.servers.write().await.get_mut(server) {
            state.code_verifier = None;
        }
    }
}

/// Authorization server endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

impl AuthServerMetadata {
    /// Conventional endpoints on the server origin.
    fn fallback(server_url: &Url) -> Self {
        let origin = server_url.origin().ascii_serialization();
        Self {
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
        }
    }
}

/// OAuth provider for one MCP server.
pub struct OAuthProvider {
    server: String,
    server_url: Url,
    settings: OAuthSettings,
    storage: Arc<dyn OAuthStorage>,
    interactive: bool,
    http: reqwest::Client,
    metadata: RwLock<Option<AuthServerMetadata>>,
    last_authorization_url: RwLock<Option<String>>,
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("server", &self.server)
            .field("server_url", &self.server_url.as_str())
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

impl OAuthProvider {
    /// Create a provider backed by `storage`.
    ///
    /// When `interactive` is false, authorization URLs are logged instead of
    /// opened in a browser.
    pub fn new(
        server: impl Into<String>,
        server_url: Url,
        settings: OAuthSettings,
        storage: Arc<dyn OAuthStorage>,
        interactive: bool,
    ) -> Self {
        Self {
            server: server.into(),
            server_url,
            settings,
            storage,
            interactive,
            http: reqwest::Client::new(),
            metadata: RwLock::new(None),
            last_authorization_url: RwLock::new(None),
        }
    }

    /// Server key this provider authenticates.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Configured redirect URL, or the local callback default.
    pub fn redirect_url(&self) -> String {
        self.settings
            .redirect_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{OAUTH_CALLBACK_PORT}{OAUTH_CALLBACK_PATH}"))
    }

    /// Client metadata for dynamic registration.
    pub fn client_metadata(&self) -> serde_json::Value {
        let auth_method = if self.settings.client_secret.is_some() {
            "client_secret_post"
        } else {
            "none"
        };
        let mut metadata = serde_json::json!({
            "redirect_uris": [self.redirect_url()],
            "client_name": "Toolbridge",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": auth_method,
        });
        if let Some(scope) = &self.settings.scope {
            metadata["scope"] = serde_json::json!(scope);
        }
        metadata
    }

    /// Pre-registered client information, else whatever storage holds.
    pub async fn client_information(&self) -> Option<OAuthClientInformation> {
        if let Some(client_id) = &self.settings.client_id {
            return Some(OAuthClientInformation {
                client_id: client_id.clone(),
                client_secret: self.settings.client_secret.clone(),
                client_id_issued_at: None,
                client_secret_expires_at: None,
            });
        }

        let info = self.storage.client_information(&self.server).await?;
        if let Some(expires_at) = info.client_secret_expires_at {
            // Zero means the secret never expires.
            if expires_at != 0 && expires_at < unix_now() {
                info!(server = %self.server, "Registered client secret expired");
                return None;
            }
        }
        Some(info)
    }

    pub async fn save_client_information(&self, info: OAuthClientInformation) {
        self.storage.save_client_information(&self.server, info).await;
        info!(server = %self.server, "Saved dynamically registered client");
    }

    pub async fn tokens(&self) -> Option<StoredTokens> {
        self.storage.tokens(&self.server).await
    }

    pub async fn save_tokens(&self, tokens: OAuthTokens) {
        self.storage
            .save_tokens(&self.server, StoredTokens::from_response(tokens))
            .await;
        info!(server = %self.server, "Saved OAuth tokens");
    }

    pub async fn save_code_verifier(&self, verifier: String) {
        self.storage.save_code_verifier(&self.server, verifier).await;
    }

    /// PKCE verifier saved by the current flow.
    pub async fn code_verifier(&self) -> McpResult<String> {
        self.storage.code_verifier(&self.server).await.ok_or_else(|| {
            McpError::authentication(&self.server, "no code verifier saved for this authorization flow")
        })
    }

    /// Authorization URL from the most recent redirect, if any.
    pub async fn last_authorization_url(&self) -> Option<String> {
        self.last_authorization_url.read().await.clone()
    }

    /// Send the user to `url` to authorize.
    ///
    /// Headless providers only surface the URL; the flow is finished later
    /// with the code the user brings back.
    pub async fn redirect_to_authorization(&self, url: &str) {
        *self.last_authorization_url.write().await = Some(url.to_string());

        if self.interactive {
            match open::that(url) {
                Ok(()) => {
                    info!(server = %self.server, "Opened browser for authorization");
                    return;
                }
                Err(e) => {
                    warn!(server = %self.server, error = %e, "Failed to open browser");
                }
            }
        }

        warn!(
            server = %self.server,
            url = %url,
            "Authorization required: open the URL, then complete authentication with the returned code"
        );
    }

    /// Bearer token for outgoing requests, refreshing an expired one when possible.
    pub async fn access_token(&self) -> Option<String> {
        let tokens = self.tokens().await?;
        if tokens.is_valid() {
            return Some(tokens.access_token);
        }

        let refresh_token = tokens.refresh_token?;
        match self.refresh(&refresh_token).await {
            Ok(access_token) => Some(access_token),
            Err(e) => {
                warn!(server = %self.server, error = %e, "Token refresh failed");
                None
            }
        }
    }

    /// Start the authorization flow and redirect the user.
    ///
    /// Registers a client first when none is known. Returns the authorization URL.
    pub async fn begin_authorization(&self) -> McpResult<String> {
        let metadata = self.metadata().await;

        let client = match self.client_information().await {
            Some(info) => info,
            None => {
                let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
                    McpError::authentication(
                        &self.server,
                        "no client id configured and the server does not support dynamic registration",
                    )
                })?;
                let info = register_client(&self.http, endpoint, &self.client_metadata())
                    .await
                    .map_err(|e| self.auth_error("client registration failed", e))?;
                self.save_client_information(info.clone()).await;
                info
            }
        };

        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        self.save_code_verifier(verifier).await;

        let url = build_auth_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            &self.redirect_url(),
            self.settings.scope.as_deref(),
            &generate_state(),
            &challenge,
        );
        self.redirect_to_authorization(&url).await;
        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    pub async fn finish_authorization(&self, code: &str) -> McpResult<()> {
        let metadata = self.metadata().await;
        let client = self.client_information().await.ok_or_else(|| {
            McpError::authentication(&self.server, "no client information; start authorization first")
        })?;
        let verifier = self.code_verifier().await?;

        let tokens = exchange_code(
            &self.http,
            &metadata.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            code,
            &self.redirect_url(),
            &verifier,
        )
        .await
        .map_err(|e| self.auth_error("token exchange failed", e))?;

        self.save_tokens(tokens).await;
        self.storage.clear_code_verifier(&self.server).await;
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> McpResult<String> {
        let metadata = self.metadata().await;
        let client = self.client_information().await.ok_or_else(|| {
            McpError::authentication(&self.server, "no client information for token refresh")
        })?;

        let mut tokens = refresh_tokens(
            &self.http,
            &metadata.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            refresh_token,
        )
        .await?;

        // Servers may omit the refresh token when it is unchanged.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        let access_token = tokens.access_token.clone();
        self.save_tokens(tokens).await;
        debug!(server = %self.server, "Refreshed OAuth tokens");
        Ok(access_token)
    }

    async fn metadata(&self) -> AuthServerMetadata {
        if let Some(metadata) = self.metadata.read().await.clone() {
            return metadata;
        }
        let metadata = match discover_metadata(&self.http, &self.server_url).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(server = %self.server, error = %e, "Metadata discovery failed, using default endpoints");
                AuthServerMetadata::fallback(&self.server_url)
            }
        };
        *self.metadata.write().await = Some(metadata.clone());
        metadata
    }

    fn auth_error(&self, message: &str, cause: McpError) -> McpError {
        McpError::Authentication {
            server: self.server.clone(),
            message: format!("{message}: {cause}"),
            source: Some(Box::new(cause)),
        }
    }
}

/// Generate PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Generate the S256 code challenge for a verifier.
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate OAuth state parameter.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Build authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

/// Fetch `/.well-known/oauth-authorization-server` from the server origin.
pub async fn discover_metadata(
    http: &reqwest::Client,
    server_url: &Url,
) -> McpResult<AuthServerMetadata> {
    let url = server_url
        .join("/.well-known/oauth-authorization-server")
        .map_err(|e| McpError::protocol_error(format!("invalid metadata url: {e}")))?;

    let response = http
        .get(url)
        .header("MCP-Protocol-Version", crate::protocol::PROTOCOL_VERSION)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(crate::transport::http_error(response).await);
    }
    Ok(response.json().await?)
}

/// Dynamic client registration.
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    metadata: &serde_json::Value,
) -> McpResult<OAuthClientInformation> {
    let response = http.post(registration_endpoint).json(metadata).send().await?;
    if !response.status().is_success() {
        return Err(crate::transport::http_error(response).await);
    }
    Ok(response.json().await?)
}

/// Exchange authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> McpResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params).await
}

/// Refresh tokens using refresh token.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> McpResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params).await
}

async fn token_request(
    http: &reqwest::Client,
    token_endpoint: &str,
    params: &[(&str, &str)],
) -> McpResult<OAuthTokens> {
    let response = http.post(token_endpoint).form(params).send().await?;
    if !response.status().is_success() {
        return Err(crate::transport::http_error(response).await);
    }
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| McpError::protocol_error(format!("Invalid token response: {e}")))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
